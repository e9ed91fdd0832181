use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::api::health::{HealthSnapshot, HealthState};
use crate::archive::{ArchiveReport, Archiver};
use crate::config::Config;
use crate::db::models::MemberSearchPage;
use crate::db::MemberDirectory;
use crate::error::AppError;
use crate::query::latest::{latest_member, latest_members};
use crate::query::{DeltaEngine, DeltaWindow, GrowersQuery, GrowthRanker};
use crate::snapshots::SnapshotStore;
use crate::types::{Category, DeltaResult, GrowthRanking, HistoryPoint, LatestMembers, MemberSnapshot};
use crate::upstream::{BrokerState, TokenBroker};

const ADMIN_SECRET_HEADER: &str = "x-admin-secret";
const DEFAULT_GROWERS_DAYS: i64 = 30;
const DEFAULT_DELTA_DAYS: i64 = 1;

#[derive(Clone)]
pub struct ApiState {
    pub cfg: Arc<Config>,
    pub store: Arc<SnapshotStore>,
    pub deltas: Arc<DeltaEngine>,
    pub growers: Arc<GrowthRanker>,
    pub archiver: Arc<Archiver>,
    pub directory: MemberDirectory,
    pub health: Arc<HealthState>,
    pub broker: Arc<TokenBroker>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/admin/run-fetch", post(run_fetch))
        .route("/admin/sync-members", post(sync_members))
        .route("/members/search", get(search_members))
        .route("/members/latest", get(get_latest_members))
        .route("/members/:id/latest", get(get_member_latest))
        .route("/members/:id/history", get(get_member_history))
        .route("/members/:id/delta", get(get_member_delta))
        .route("/leaders/growers", get(get_growers))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CategoryQuery {
    pub category: Option<String>,
}

#[derive(Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Deserialize)]
pub struct LatestMembersQuery {
    pub cust_ids: String,
    pub category: Option<String>,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub category: Option<String>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

#[derive(Deserialize)]
pub struct DeltaQuery {
    pub category: Option<String>,
    pub days: Option<i64>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

#[derive(Deserialize)]
pub struct GrowersParams {
    pub category: Option<String>,
    pub days: Option<i64>,
    pub limit: Option<usize>,
    pub min_current_value: Option<i64>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub auth: BrokerState,
    pub token_exchanges: u64,
    pub categories: Vec<Category>,
    pub fetches: HealthSnapshot,
}

#[derive(Serialize)]
pub struct SyncResponse {
    pub upserted: usize,
    pub total: i64,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub member_id: i64,
    pub category: Category,
    pub points: Vec<HistoryPoint>,
}

#[derive(Serialize)]
pub struct DeltaResponse {
    pub category: Category,
    #[serde(flatten)]
    pub delta: DeltaResult,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        auth: state.broker.state(),
        token_exchanges: state.broker.exchange_count(),
        categories: state.cfg.categories.clone(),
        fetches: state.health.snapshot(),
    })
}

async fn run_fetch(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Query<CategoryQuery>,
) -> Result<Json<ArchiveReport>, AppError> {
    require_admin(&state.cfg, &headers)?;
    let category = match params.category.as_deref() {
        Some(raw) => Some(state.cfg.resolve_category(Some(raw))?),
        None => None,
    };
    let report = state.archiver.fetch_and_archive(category.as_ref()).await?;
    Ok(Json(report))
}

async fn sync_members(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<SyncResponse>, AppError> {
    require_admin(&state.cfg, &headers)?;
    let upserted = state
        .directory
        .sync_from_snapshots(&state.store, &state.cfg.categories, state.cfg.today())
        .await?;
    let total = state.directory.count().await?;
    Ok(Json(SyncResponse { upserted, total }))
}

async fn search_members(
    State(state): State<ApiState>,
    Query(params): Query<SearchQuery>,
) -> Result<Json<MemberSearchPage>, AppError> {
    let page = state
        .directory
        .search(&params.q, params.limit, params.offset.unwrap_or(0))
        .await?;
    Ok(Json(page))
}

async fn get_latest_members(
    State(state): State<ApiState>,
    Query(params): Query<LatestMembersQuery>,
) -> Result<Json<LatestMembers>, AppError> {
    let category = state.cfg.resolve_category(params.category.as_deref())?;
    let ids = parse_member_ids(&params.cust_ids)?;
    let latest = latest_members(&state.store, &category, &ids, state.cfg.today()).await?;
    Ok(Json(latest))
}

async fn get_member_latest(
    State(state): State<ApiState>,
    Path(member_id): Path<i64>,
    Query(params): Query<CategoryQuery>,
) -> Result<Json<MemberSnapshot>, AppError> {
    let category = state.cfg.resolve_category(params.category.as_deref())?;
    let latest = latest_member(&state.store, &category, member_id, state.cfg.today()).await?;
    Ok(Json(latest))
}

async fn get_member_history(
    State(state): State<ApiState>,
    Path(member_id): Path<i64>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, AppError> {
    let category = state.cfg.resolve_category(params.category.as_deref())?;
    let points = state
        .deltas
        .history(&category, member_id, params.start, params.end)
        .await?;
    Ok(Json(HistoryResponse {
        member_id,
        category,
        points,
    }))
}

async fn get_member_delta(
    State(state): State<ApiState>,
    Path(member_id): Path<i64>,
    Query(params): Query<DeltaQuery>,
) -> Result<Json<DeltaResponse>, AppError> {
    let category = state.cfg.resolve_category(params.category.as_deref())?;
    let today = state.cfg.today();
    let window = delta_window(&params, today)?;
    let delta = state.deltas.delta(&category, member_id, window, today).await?;
    Ok(Json(DeltaResponse { category, delta }))
}

async fn get_growers(
    State(state): State<ApiState>,
    Query(params): Query<GrowersParams>,
) -> Result<Json<GrowthRanking>, AppError> {
    let category = state.cfg.resolve_category(params.category.as_deref())?;
    let limit = params.limit.unwrap_or(state.cfg.growers_default_limit);
    if limit > state.cfg.growers_max_limit {
        return Err(AppError::InvalidRange(format!(
            "limit must be at most {}",
            state.cfg.growers_max_limit
        )));
    }
    let query = GrowersQuery {
        category,
        window_days: params.days.unwrap_or(DEFAULT_GROWERS_DAYS),
        limit,
        min_current_value: params.min_current_value,
    };
    let ranking = state
        .growers
        .top_growers(&query, state.cfg.today(), Utc::now())
        .await?;
    Ok(Json(ranking))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Admin routes are open when no secret is configured.
fn require_admin(cfg: &Config, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = cfg.admin_secret.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get(ADMIN_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    if provided != Some(expected) {
        return Err(AppError::Unauthorized);
    }
    Ok(())
}

fn parse_member_ids(raw: &str) -> Result<Vec<i64>, AppError> {
    let ids = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>().map_err(|_| {
                AppError::InvalidQuery(format!("invalid member id '{s}', expected comma-separated integers"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if ids.is_empty() {
        return Err(AppError::InvalidQuery(
            "cust_ids must be a non-empty comma-separated list of integers".to_string(),
        ));
    }
    Ok(ids)
}

/// `days` alone is relative to the latest snapshot. Explicit dates select a
/// range; a missing start falls back to `days` (or one day) before the end.
fn delta_window(params: &DeltaQuery, today: NaiveDate) -> Result<DeltaWindow, AppError> {
    if params.start.is_none() && params.end.is_none() {
        return Ok(DeltaWindow::Days(params.days.unwrap_or(DEFAULT_DELTA_DAYS)));
    }
    let end = params.end.unwrap_or(today);
    let start = match params.start {
        Some(start) => start,
        None => {
            let days = params.days.unwrap_or(DEFAULT_DELTA_DAYS);
            if days <= 0 {
                return Err(AppError::InvalidRange(format!("window must be positive, got {days} days")));
            }
            end.checked_sub_days(Days::new(days as u64))
                .ok_or_else(|| AppError::InvalidRange(format!("{days} days before {end} is out of range")))?
        }
    };
    Ok(DeltaWindow::Range { start, end })
}
