use std::sync::Arc;

use chrono::NaiveDate;
use futures_util::{stream, StreamExt, TryStreamExt};

use crate::error::{AppError, Result};
use crate::query::window::{resolve_range, resolve_window, validate_days, ResolvedWindow};
use crate::snapshots::SnapshotStore;
use crate::types::{Category, DeltaResult, HistoryPoint, Side};

/// Snapshot files read concurrently while building a history.
const HISTORY_READ_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaWindow {
    /// Latest snapshot against the one `n` days earlier.
    Days(i64),
    Range { start: NaiveDate, end: NaiveDate },
}

/// Read-only member queries over archived snapshots.
pub struct DeltaEngine {
    store: Arc<SnapshotStore>,
}

impl DeltaEngine {
    pub fn new(store: Arc<SnapshotStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        category: &Category,
        window: DeltaWindow,
        today: NaiveDate,
    ) -> Result<ResolvedWindow> {
        let dates = self.store.dates_through(category, today).await?;
        let resolved = match window {
            DeltaWindow::Days(days) => {
                validate_days(days)?;
                resolve_window(&dates, days)
            }
            DeltaWindow::Range { start, end } => resolve_range(&dates, start, end)?,
        };
        resolved.ok_or_else(|| AppError::not_found(category, format!("any date through {today}")))
    }

    /// Change in a member's value across the resolved window. The end side
    /// is checked first, so a member missing everywhere reports `end`.
    pub async fn delta(
        &self,
        category: &Category,
        member_id: i64,
        window: DeltaWindow,
        today: NaiveDate,
    ) -> Result<DeltaResult> {
        let resolved = self.resolve(category, window, today).await?;

        let end = self
            .store
            .read_member(category, resolved.end, member_id)
            .await?
            .ok_or(AppError::MemberNotFound {
                member_id,
                side: Side::End,
                date: resolved.end,
            })?;
        if end.is_unrated() {
            return Err(AppError::MemberUnrated {
                member_id,
                date: resolved.end,
            });
        }

        let start = self
            .store
            .read_member(category, resolved.start, member_id)
            .await?
            .ok_or(AppError::MemberNotFound {
                member_id,
                side: Side::Start,
                date: resolved.start,
            })?;

        DeltaResult::between(resolved.start, &start, resolved.end, &end)
    }

    /// Every snapshot between `start` and `end` inclusive that lists the
    /// member, ordered by date. Open bounds cover all archived dates.
    pub async fn history(
        &self,
        category: &Category,
        member_id: i64,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<HistoryPoint>> {
        if let (Some(s), Some(e)) = (start, end) {
            if e < s {
                return Err(AppError::InvalidRange(format!("end {e} is before start {s}")));
            }
        }

        let dates: Vec<NaiveDate> = self
            .store
            .list_dates(category)
            .await?
            .into_iter()
            .filter(|d| start.map_or(true, |s| *d >= s) && end.map_or(true, |e| *d <= e))
            .collect();

        let points: Vec<Option<HistoryPoint>> = stream::iter(dates)
            .map(|date| async move {
                let record = self.store.read_member(category, date, member_id).await?;
                Ok::<_, AppError>(record.map(|record| HistoryPoint {
                    snapshot_date: date,
                    record,
                }))
            })
            .buffered(HISTORY_READ_CONCURRENCY)
            .try_collect()
            .await?;

        Ok(points.into_iter().flatten().collect())
    }
}
