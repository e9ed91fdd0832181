use chrono::{Days, NaiveDate};

use crate::error::{AppError, Result};

/// Start and end snapshot dates chosen for a delta or ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolvedWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ResolvedWindow {
    pub fn age_days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

pub fn validate_days(days: i64) -> Result<u64> {
    if days <= 0 {
        return Err(AppError::InvalidRange(format!("window must be positive, got {days} days")));
    }
    Ok(days as u64)
}

/// `dates` must be ascending. End is the latest date; start is the latest
/// date at least `days` before it, or the earliest date when history is
/// shorter than the window.
pub fn resolve_window(dates: &[NaiveDate], days: i64) -> Option<ResolvedWindow> {
    let days = validate_days(days).ok()?;
    let end = *dates.last()?;
    let target = end.checked_sub_days(Days::new(days));
    let start = target
        .and_then(|t| latest_on_or_before(dates, t))
        .unwrap_or(dates[0]);
    Some(ResolvedWindow { start, end })
}

/// Window over explicit dates. `None` when no snapshot exists on or before
/// `end`.
pub fn resolve_range(dates: &[NaiveDate], start: NaiveDate, end: NaiveDate) -> Result<Option<ResolvedWindow>> {
    if end < start {
        return Err(AppError::InvalidRange(format!("end {end} is before start {start}")));
    }
    let Some(end_used) = latest_on_or_before(dates, end) else {
        return Ok(None);
    };
    let start_used = latest_on_or_before(dates, start).unwrap_or(dates[0]);
    Ok(Some(ResolvedWindow {
        start: start_used,
        end: end_used,
    }))
}

fn latest_on_or_before(dates: &[NaiveDate], target: NaiveDate) -> Option<NaiveDate> {
    let idx = dates.partition_point(|d| *d <= target);
    idx.checked_sub(1).map(|i| dates[i])
}
