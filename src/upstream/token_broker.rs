//! Owns the upstream OAuth session.
//!
//! The cached token lives behind one async mutex that is held across the
//! network exchange, so concurrent callers that find a stale token queue up
//! behind a single refresh/login and then reuse its result. The expiry of
//! the installed token is also published outside that mutex so state reads
//! never wait on a renewal in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as SyncMutex;
use std::time::Duration;

use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_TOKEN_LIFETIME_SECS;
use crate::error::{AppError, Result};

// ---------------------------------------------------------------------------
// Secrets and credentials
// ---------------------------------------------------------------------------

/// String that never shows up in logs or debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "***")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "***")
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Secret,
    pub client_id: String,
    pub client_secret: Secret,
    pub scope: String,
}

// ---------------------------------------------------------------------------
// Token state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TokenSet {
    access_token: Secret,
    refresh_token: Option<Secret>,
    expires_at: Instant,
}

impl TokenSet {
    fn is_expiring(&self, margin: Duration, now: Instant) -> bool {
        now + margin >= self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerState {
    Unauthenticated,
    Authenticated,
    /// Holding a token inside the safety margin; the next call renews it.
    Expiring,
}

#[derive(Debug, Default)]
struct Session {
    token: Option<TokenSet>,
    /// Bumped on every successful exchange.
    generation: u64,
}

/// A request carrying a bearer token, tagged with the session generation it
/// was authorized under.
pub struct AuthorizedRequest {
    pub request: RequestBuilder,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy)]
enum Grant {
    Password,
    Refresh,
}

impl std::fmt::Display for Grant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Grant::Password => write!(f, "password_limited"),
            Grant::Refresh => write!(f, "refresh_token"),
        }
    }
}

// ---------------------------------------------------------------------------
// TokenBroker
// ---------------------------------------------------------------------------

pub struct TokenBroker {
    http: reqwest::Client,
    token_url: String,
    credentials: Credentials,
    safety_margin: Duration,
    session: Mutex<Session>,
    /// Expiry of the installed token. Only touched while `session` is held,
    /// never held across an await.
    published: SyncMutex<Option<Instant>>,
    /// Token endpoint calls made, successful or not.
    exchanges: AtomicU64,
}

impl TokenBroker {
    pub fn new(
        http: reqwest::Client,
        token_url: impl Into<String>,
        credentials: Credentials,
        safety_margin: Duration,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            credentials,
            safety_margin,
            session: Mutex::new(Session::default()),
            published: SyncMutex::new(None),
            exchanges: AtomicU64::new(0),
        }
    }

    /// Decorates `request` with a valid access token, renewing first when the
    /// cached one is missing or inside the safety margin.
    pub async fn authorize(&self, request: RequestBuilder) -> Result<AuthorizedRequest> {
        let mut session = self.session.lock().await;
        let stale = session
            .token
            .as_ref()
            .map_or(true, |t| t.is_expiring(self.safety_margin, Instant::now()));
        if stale {
            self.ensure_valid(&mut session).await?;
        }

        let token = session
            .token
            .as_ref()
            .ok_or_else(|| AppError::Auth("no access token after renewal".to_string()))?;
        Ok(AuthorizedRequest {
            request: request.bearer_auth(token.access_token.expose()),
            generation: session.generation,
        })
    }

    /// Called after upstream answered 401 to a request authorized under
    /// `rejected_generation`. Runs one refresh-or-login cycle unless another
    /// caller already replaced that token.
    pub async fn on_unauthorized(&self, rejected_generation: u64) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.generation != rejected_generation && session.token.is_some() {
            debug!(
                rejected_generation,
                current_generation = session.generation,
                "Token already renewed by a concurrent caller"
            );
            return Ok(());
        }
        warn!("Upstream rejected the access token; re-authenticating");
        self.ensure_valid(&mut session).await
    }

    /// Answers from the published expiry, so it does not queue behind a
    /// renewal holding the session lock.
    pub fn state(&self) -> BrokerState {
        let expires_at = *self.published.lock().unwrap_or_else(|e| e.into_inner());
        match expires_at {
            None => BrokerState::Unauthenticated,
            Some(at) if Instant::now() + self.safety_margin >= at => BrokerState::Expiring,
            Some(_) => BrokerState::Authenticated,
        }
    }

    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }

    /// Refresh when a refresh token is held, otherwise (or if the refresh
    /// fails) fall back to a full login. Caller holds the session lock.
    async fn ensure_valid(&self, session: &mut Session) -> Result<()> {
        let refresh_token = session
            .token
            .as_ref()
            .and_then(|t| t.refresh_token.clone());

        if let Some(refresh_token) = refresh_token {
            match self.exchange(Grant::Refresh, Some(&refresh_token)).await {
                Ok(mut token) => {
                    if token.refresh_token.is_none() {
                        token.refresh_token = Some(refresh_token);
                    }
                    self.install(session, token);
                    info!(generation = session.generation, "Refreshed upstream access token");
                    return Ok(());
                }
                Err(e) => warn!("Token refresh failed, falling back to login: {e}"),
            }
        }

        match self.exchange(Grant::Password, None).await {
            Ok(token) => {
                self.install(session, token);
                info!(generation = session.generation, "Obtained new upstream access token");
                Ok(())
            }
            Err(e) => {
                session.token = None;
                self.publish(None);
                error!("Upstream login failed: {e}");
                Err(e)
            }
        }
    }

    fn install(&self, session: &mut Session, token: TokenSet) {
        self.publish(Some(token.expires_at));
        session.token = Some(token);
        session.generation += 1;
    }

    fn publish(&self, expires_at: Option<Instant>) {
        *self.published.lock().unwrap_or_else(|e| e.into_inner()) = expires_at;
    }

    async fn exchange(&self, grant: Grant, refresh_token: Option<&Secret>) -> Result<TokenSet> {
        self.exchanges.fetch_add(1, Ordering::Relaxed);

        let creds = &self.credentials;
        let grant_type = grant.to_string();
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", grant_type.as_str()),
            ("client_id", creds.client_id.as_str()),
            ("client_secret", creds.client_secret.expose()),
            ("scope", creds.scope.as_str()),
        ];
        match grant {
            Grant::Password => {
                form.push(("username", creds.username.as_str()));
                form.push(("password", creds.password.expose()));
            }
            Grant::Refresh => {
                let token = refresh_token
                    .ok_or_else(|| AppError::Auth("refresh grant without a refresh token".to_string()))?;
                form.push(("refresh_token", token.expose()));
            }
        }

        let resp = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AppError::Auth(format!("{grant} exchange failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::Auth(format!("{grant} exchange returned {status}")));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AppError::Auth(format!("malformed {grant} response: {e}")))?;
        if body.access_token.is_empty() {
            return Err(AppError::Auth(format!("{grant} response carried no access token")));
        }

        let lifetime = Duration::from_secs(body.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS));
        Ok(TokenSet {
            access_token: Secret::new(body.access_token),
            refresh_token: body.refresh_token.filter(|t| !t.is_empty()).map(Secret::new),
            expires_at: Instant::now() + lifetime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockUpstream;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    #[test]
    fn secrets_are_redacted() {
        let creds = Credentials {
            username: "driver@example.com".to_string(),
            password: Secret::new("hunter2"),
            client_id: "ar-pwlimited".to_string(),
            client_secret: Secret::new("s3cr3t"),
            scope: "iracing.auth".to_string(),
        };
        let printed = format!("{creds:?}");
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("s3cr3t"));
        assert!(printed.contains("driver@example.com"));
    }

    #[tokio::test]
    async fn first_authorize_logs_in_and_caches() {
        let upstream = MockUpstream::start().await;
        let broker = upstream.broker(Duration::from_secs(60));
        assert_eq!(broker.state(), BrokerState::Unauthenticated);

        broker.authorize(upstream.client().get(upstream.url("/ping"))).await.unwrap();
        broker.authorize(upstream.client().get(upstream.url("/ping"))).await.unwrap();

        assert_eq!(upstream.state.logins.load(Ordering::SeqCst), 1);
        assert_eq!(broker.exchange_count(), 1);
        assert_eq!(broker.state(), BrokerState::Authenticated);
    }

    #[tokio::test]
    async fn near_expiry_token_is_refreshed_not_relogged() {
        let upstream = MockUpstream::start().await;
        // every token lands inside the 60s margin
        upstream.state.expires_in.store(30, Ordering::SeqCst);
        let broker = upstream.broker(Duration::from_secs(60));

        broker.authorize(upstream.client().get(upstream.url("/ping"))).await.unwrap();
        assert_eq!(broker.state(), BrokerState::Expiring);
        broker.authorize(upstream.client().get(upstream.url("/ping"))).await.unwrap();

        assert_eq!(upstream.state.logins.load(Ordering::SeqCst), 1);
        assert_eq!(upstream.state.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_falls_back_to_login() {
        let upstream = MockUpstream::start().await;
        upstream.state.expires_in.store(30, Ordering::SeqCst);
        upstream.state.fail_refresh.store(true, Ordering::SeqCst);
        let broker = upstream.broker(Duration::from_secs(60));

        broker.authorize(upstream.client().get(upstream.url("/ping"))).await.unwrap();
        broker.authorize(upstream.client().get(upstream.url("/ping"))).await.unwrap();

        assert_eq!(upstream.state.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(upstream.state.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_refresh_token_renews_through_login() {
        let upstream = MockUpstream::start().await;
        upstream.state.expires_in.store(30, Ordering::SeqCst);
        upstream.state.issue_refresh_token.store(false, Ordering::SeqCst);
        let broker = upstream.broker(Duration::from_secs(60));

        broker.authorize(upstream.client().get(upstream.url("/ping"))).await.unwrap();
        broker.authorize(upstream.client().get(upstream.url("/ping"))).await.unwrap();

        assert_eq!(upstream.state.refreshes.load(Ordering::SeqCst), 0);
        assert_eq!(upstream.state.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn login_failure_surfaces_auth_error_and_stays_unauthenticated() {
        let upstream = MockUpstream::start().await;
        upstream.state.fail_login.store(true, Ordering::SeqCst);
        let broker = upstream.broker(Duration::from_secs(60));

        let err = broker
            .authorize(upstream.client().get(upstream.url("/ping")))
            .await
            .err()
            .expect("login should fail");
        assert!(matches!(err, AppError::Auth(_)), "{err}");
        assert_eq!(broker.state(), BrokerState::Unauthenticated);
    }

    #[tokio::test]
    async fn concurrent_stale_authorizations_share_one_exchange() {
        let upstream = MockUpstream::start().await;
        upstream.state.token_delay_ms.store(100, Ordering::SeqCst);
        let broker = Arc::new(upstream.broker(Duration::from_secs(60)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let broker = Arc::clone(&broker);
                let request = upstream.client().get(upstream.url("/ping"));
                tokio::spawn(async move { broker.authorize(request).await.map(|a| a.generation) })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 1);
        }

        assert_eq!(broker.exchange_count(), 1);
        assert_eq!(upstream.state.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn state_answers_while_login_is_in_flight() {
        let upstream = MockUpstream::start().await;
        upstream.state.token_delay_ms.store(300, Ordering::SeqCst);
        let broker = Arc::new(upstream.broker(Duration::from_secs(60)));

        let pending = {
            let broker = Arc::clone(&broker);
            let request = upstream.client().get(upstream.url("/ping"));
            tokio::spawn(async move { broker.authorize(request).await.map(|a| a.generation) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the login task holds the session lock right now
        assert!(!pending.is_finished());
        assert_eq!(broker.state(), BrokerState::Unauthenticated);

        assert_eq!(pending.await.unwrap().unwrap(), 1);
        assert_eq!(broker.state(), BrokerState::Authenticated);
    }

    #[tokio::test]
    async fn unauthorized_for_stale_generation_is_a_no_op() {
        let upstream = MockUpstream::start().await;
        let broker = upstream.broker(Duration::from_secs(60));

        let first = broker.authorize(upstream.client().get(upstream.url("/ping"))).await.unwrap();
        broker.on_unauthorized(first.generation).await.unwrap();
        assert_eq!(broker.exchange_count(), 2);

        // a second caller rejected under the old generation does not renew again
        broker.on_unauthorized(first.generation).await.unwrap();
        assert_eq!(broker.exchange_count(), 2);
    }
}
