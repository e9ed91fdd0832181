//! In-process stand-in for the upstream token and data endpoints.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use chrono::NaiveDate;

use crate::fetcher::UpstreamFetcher;
use crate::types::MemberRecord;
use crate::upstream::{Credentials, RateLimiter, Secret, TokenBroker};

pub const ROSTER_CSV: &str = "\
CUSTID,DRIVER,LOCATION,IRATING,STARTS,WINS,CLASS
100,Driver One,US,1620,40,3,A 4.99
200,Driver Two,GB,1480,12,0,B 3.10
300,Driver Three,DE,2210,88,14,A 4.50
";

pub struct MockState {
    pub logins: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub data_calls: AtomicUsize,
    pub link_calls: AtomicUsize,
    pub expires_in: AtomicU64,
    pub issue_refresh_token: AtomicBool,
    pub fail_refresh: AtomicBool,
    pub fail_login: AtomicBool,
    pub token_delay_ms: AtomicU64,
    /// Data requests still to be answered with 401.
    pub unauthorized_remaining: AtomicUsize,
    /// Non-zero forces this status on the data endpoint.
    pub data_status: AtomicU16,
    pub serve_link: AtomicBool,
    pub roster_csv: Mutex<String>,
    issued: AtomicU64,
    base_url: OnceLock<String>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            logins: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            data_calls: AtomicUsize::new(0),
            link_calls: AtomicUsize::new(0),
            expires_in: AtomicU64::new(3600),
            issue_refresh_token: AtomicBool::new(true),
            fail_refresh: AtomicBool::new(false),
            fail_login: AtomicBool::new(false),
            token_delay_ms: AtomicU64::new(0),
            unauthorized_remaining: AtomicUsize::new(0),
            data_status: AtomicU16::new(0),
            serve_link: AtomicBool::new(false),
            roster_csv: Mutex::new(ROSTER_CSV.to_string()),
            issued: AtomicU64::new(0),
            base_url: OnceLock::new(),
        }
    }
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
    client: reqwest::Client,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/token", post(token))
            .route("/data/:category", get(data))
            .route("/csv/:category", get(csv_link))
            .route("/ping", get(|| async { "pong" }))
            .with_state(Arc::clone(&state));

        let addr = serve(app).await;
        let _ = state.base_url.set(format!("http://{addr}"));

        Self {
            addr,
            state,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn data_url_template(&self) -> String {
        format!("http://{}/data/{{category}}", self.addr)
    }

    pub fn client(&self) -> reqwest::Client {
        self.client.clone()
    }

    pub fn set_roster(&self, csv: &str) {
        *self.state.roster_csv.lock().unwrap() = csv.to_string();
    }

    pub fn credentials() -> Credentials {
        Credentials {
            username: "driver@example.com".to_string(),
            password: Secret::new("hunter2"),
            client_id: "ar-pwlimited".to_string(),
            client_secret: Secret::new("client-secret"),
            scope: "iracing.auth".to_string(),
        }
    }

    pub fn broker(&self, safety_margin: Duration) -> TokenBroker {
        TokenBroker::new(self.client(), self.url("/token"), Self::credentials(), safety_margin)
    }

    pub fn fetcher(&self) -> UpstreamFetcher {
        UpstreamFetcher::new(
            self.client(),
            Arc::new(self.broker(Duration::from_secs(60))),
            Arc::new(RateLimiter::new(600, 10)),
            self.data_url_template(),
        )
    }
}

/// Binds `app` on an ephemeral local port and serves it in the background.
pub async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Raw TCP server that promises a 1000 byte CSV body, sends a few bytes and
/// hangs up, so every response fails while its body is being read.
pub async fn truncated_body_server() -> SocketAddr {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/csv\r\nContent-Length: 1000\r\n\r\nCUSTID,DRI",
                )
                .await;
            let _ = socket.shutdown().await;
        }
    });
    addr
}

async fn token(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let delay = state.token_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    match form.get("grant_type").map(String::as_str) {
        Some("password_limited") => {
            state.logins.fetch_add(1, Ordering::SeqCst);
            let valid = form.get("username").map(String::as_str) == Some("driver@example.com")
                && form.get("password").map(String::as_str) == Some("hunter2")
                && form.get("client_secret").map(String::as_str) == Some("client-secret");
            if state.fail_login.load(Ordering::SeqCst) || !valid {
                return (StatusCode::UNAUTHORIZED, "invalid credentials").into_response();
            }
        }
        Some("refresh_token") => {
            state.refreshes.fetch_add(1, Ordering::SeqCst);
            if state.fail_refresh.load(Ordering::SeqCst) || !form.contains_key("refresh_token") {
                return (StatusCode::BAD_REQUEST, "invalid_grant").into_response();
            }
        }
        _ => return (StatusCode::BAD_REQUEST, "unsupported_grant_type").into_response(),
    }

    let n = state.issued.fetch_add(1, Ordering::SeqCst) + 1;
    let refresh_token = state
        .issue_refresh_token
        .load(Ordering::SeqCst)
        .then(|| format!("refresh-{n}"));
    Json(serde_json::json!({
        "access_token": format!("access-{n}"),
        "refresh_token": refresh_token,
        "expires_in": state.expires_in.load(Ordering::SeqCst),
    }))
    .into_response()
}

async fn data(
    State(state): State<Arc<MockState>>,
    Path(category): Path<String>,
    headers: HeaderMap,
) -> Response {
    state.data_calls.fetch_add(1, Ordering::SeqCst);

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !bearer.starts_with("Bearer access-") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if state
        .unauthorized_remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let forced = state.data_status.load(Ordering::SeqCst);
    if forced != 0 {
        let status = StatusCode::from_u16(forced).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, "forced failure").into_response();
    }

    if state.serve_link.load(Ordering::SeqCst) {
        let base = state.base_url.get().cloned().unwrap_or_default();
        return Json(serde_json::json!({ "link": format!("{base}/csv/{category}") })).into_response();
    }

    let body = state.roster_csv.lock().unwrap().clone();
    ([(header::CONTENT_TYPE, "text/csv")], body).into_response()
}

async fn csv_link(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    state.link_calls.fetch_add(1, Ordering::SeqCst);
    if headers.contains_key(header::AUTHORIZATION) {
        return (StatusCode::BAD_REQUEST, "signed links reject bearer tokens").into_response();
    }
    let body = state.roster_csv.lock().unwrap().clone();
    ([(header::CONTENT_TYPE, "text/csv")], body).into_response()
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn record(member_id: i64, value: i64) -> MemberRecord {
    MemberRecord {
        member_id,
        display_name: format!("Driver {member_id}"),
        location: "US".to_string(),
        value,
        starts: Some(10),
        wins: Some(1),
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}
