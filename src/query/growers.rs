use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::debug;

use crate::error::{AppError, Result};
use crate::query::window::{resolve_window, validate_days, ResolvedWindow};
use crate::snapshots::SnapshotStore;
use crate::state::{RankingCache, RankingKey};
use crate::types::{Category, DeltaResult, GrowthRanking, MemberRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrowersQuery {
    pub category: Category,
    pub window_days: i64,
    pub limit: usize,
    /// Drop members whose end value is below this.
    pub min_current_value: Option<i64>,
}

pub struct GrowthRanker {
    store: Arc<SnapshotStore>,
    cache: Arc<RankingCache>,
}

impl GrowthRanker {
    pub fn new(store: Arc<SnapshotStore>, cache: Arc<RankingCache>) -> Self {
        Self { store, cache }
    }

    pub fn cache(&self) -> &Arc<RankingCache> {
        &self.cache
    }

    pub async fn top_growers(
        &self,
        query: &GrowersQuery,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<GrowthRanking> {
        validate_days(query.window_days)?;
        if query.limit == 0 {
            return Err(AppError::InvalidRange("limit must be positive".to_string()));
        }

        let dates = self.store.dates_through(&query.category, today).await?;
        let window = resolve_window(&dates, query.window_days).ok_or_else(|| {
            AppError::not_found(&query.category, format!("any date through {today}"))
        })?;

        let key = RankingKey {
            category: query.category.clone(),
            start: window.start,
            end: window.end,
            limit: query.limit,
            min_current_value: query.min_current_value,
        };
        if let Some(hit) = self.cache.get(&key, now) {
            debug!(category = %query.category, "Growers served from cache");
            return Ok(hit);
        }

        let start = self.store.read(&query.category, window.start).await?;
        let end = self.store.read(&query.category, window.end).await?;
        let results = rank(window, &start.records, &end.records, query.limit, query.min_current_value);

        let ranking = GrowthRanking {
            category: query.category.clone(),
            start_date_used: window.start,
            end_date_used: window.end,
            snapshot_age_days: window.age_days(),
            min_current_value: query.min_current_value,
            results,
        };
        self.cache.insert(key, ranking.clone(), now);
        Ok(ranking)
    }
}

/// Members present in both snapshots with a rated end value, best growth
/// first. A member whose change is out of `i64` range is left out. Ties go to the higher end value, then the lower member id.
pub fn rank(
    window: ResolvedWindow,
    start: &[MemberRecord],
    end: &[MemberRecord],
    limit: usize,
    min_current_value: Option<i64>,
) -> Vec<DeltaResult> {
    let start_by_id: HashMap<i64, &MemberRecord> = start.iter().map(|r| (r.member_id, r)).collect();

    let mut results: Vec<DeltaResult> = end
        .iter()
        .filter(|r| !r.is_unrated())
        .filter(|r| min_current_value.map_or(true, |floor| r.value >= floor))
        .filter_map(|r| {
            let s = start_by_id.get(&r.member_id)?;
            DeltaResult::between(window.start, s, window.end, r)
                .inspect_err(|e| debug!("Leaving member {} out of the ranking: {e}", r.member_id))
                .ok()
        })
        .collect();

    results.sort_by(|a, b| {
        b.delta
            .cmp(&a.delta)
            .then(b.end_value.cmp(&a.end_value))
            .then(a.member_id.cmp(&b.member_id))
    });
    results.truncate(limit);
    results
}
