use std::sync::Arc;

use chrono::{DateTime, Days, FixedOffset, NaiveTime, TimeZone, Utc};
use tracing::{error, info, warn};

use crate::archive::Archiver;

/// Runs one fetch-and-archive cycle per day at a fixed local time. A failed
/// cycle is logged and left for the next day.
pub struct DailyScheduler {
    archiver: Arc<Archiver>,
    at: NaiveTime,
    offset: FixedOffset,
}

impl DailyScheduler {
    pub fn new(archiver: Arc<Archiver>, hour: u32, minute: u32, offset: FixedOffset) -> Self {
        let at = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
        Self { archiver, at, offset }
    }

    pub async fn run(self) {
        info!(at = %self.at, offset = %self.offset, "Daily scheduler started");
        loop {
            let now = Utc::now();
            let next = next_run_after(now, self.at, self.offset);
            let wait = (next - now).to_std().unwrap_or_default();
            info!(next_run = %next, "Next scheduled fetch");
            tokio::time::sleep(wait).await;

            match self.archiver.fetch_and_archive(None).await {
                Ok(report) if report.is_success() => {
                    info!(date = %report.snapshot_date, categories = report.counts.len(), "Scheduled fetch complete");
                }
                Ok(report) => {
                    warn!(
                        date = %report.snapshot_date,
                        failed = report.failures.len(),
                        stored = report.counts.len(),
                        "Scheduled fetch finished with failures"
                    );
                }
                Err(e) => error!("Scheduled fetch failed: {e}"),
            }
        }
    }
}

/// First `at` local time strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>, at: NaiveTime, offset: FixedOffset) -> DateTime<Utc> {
    let local = now.with_timezone(&offset);
    let mut day = local.date_naive();
    if local.time() >= at {
        day = day.checked_add_days(Days::new(1)).unwrap_or(day);
    }
    offset
        .from_local_datetime(&day.and_time(at))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now)
}
