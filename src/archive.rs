use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{error, info};

use crate::api::health::HealthState;
use crate::error::{AppError, Result};
use crate::fetcher::UpstreamFetcher;
use crate::snapshots::SnapshotStore;
use crate::state::RankingCache;
use crate::types::Category;

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    pub snapshot_date: NaiveDate,
    /// Rows stored per category.
    pub counts: BTreeMap<Category, usize>,
    pub failures: BTreeMap<Category, String>,
}

impl ArchiveReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Fetch-then-store cycle shared by the scheduler, the CLI and the admin
/// endpoint.
pub struct Archiver {
    fetcher: Arc<UpstreamFetcher>,
    store: Arc<SnapshotStore>,
    cache: Arc<RankingCache>,
    health: Arc<HealthState>,
    categories: Vec<Category>,
    offset: FixedOffset,
}

impl Archiver {
    pub fn new(
        fetcher: Arc<UpstreamFetcher>,
        store: Arc<SnapshotStore>,
        cache: Arc<RankingCache>,
        health: Arc<HealthState>,
        categories: Vec<Category>,
        offset: FixedOffset,
    ) -> Self {
        Self {
            fetcher,
            store,
            cache,
            health,
            categories,
            offset,
        }
    }

    /// Archives one configured category, or all of them concurrently, under
    /// today's date in the configured offset.
    pub async fn fetch_and_archive(&self, category: Option<&Category>) -> Result<ArchiveReport> {
        let today = Utc::now().with_timezone(&self.offset).date_naive();
        self.fetch_and_archive_on(category, today).await
    }

    pub async fn fetch_and_archive_on(
        &self,
        category: Option<&Category>,
        date: NaiveDate,
    ) -> Result<ArchiveReport> {
        let targets: Vec<&Category> = match category {
            Some(c) if !self.categories.contains(c) => {
                return Err(AppError::UnknownCategory(c.to_string()));
            }
            Some(c) => vec![c],
            None => self.categories.iter().collect(),
        };

        let outcomes = join_all(targets.iter().map(|c| self.archive_category(c, date))).await;

        let mut report = ArchiveReport {
            snapshot_date: date,
            counts: BTreeMap::new(),
            failures: BTreeMap::new(),
        };
        for (category, outcome) in targets.into_iter().zip(outcomes) {
            let now = Utc::now().timestamp();
            match outcome {
                Ok(rows) => {
                    self.health.record_success(now);
                    report.counts.insert(category.clone(), rows);
                }
                Err(e) => {
                    error!(category = %category, date = %date, "Fetch and archive failed: {e}");
                    self.health.record_failure(now);
                    report.failures.insert(category.clone(), e.to_string());
                }
            }
        }
        Ok(report)
    }

    async fn archive_category(&self, category: &Category, date: NaiveDate) -> Result<usize> {
        info!(category = %category, date = %date, "Starting fetch");
        let roster = self.fetcher.fetch_category(category).await?;
        let rows = roster.records.len();
        self.store.write(category, date, &roster.records).await?;
        self.cache.invalidate(category);
        info!(category = %category, rows, skipped = roster.stats.skipped, "Completed fetch");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{date, MockUpstream};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn categories() -> Vec<Category> {
        vec![
            Category::parse("sports_car").unwrap(),
            Category::parse("formula_car").unwrap(),
        ]
    }

    fn archiver(upstream: &MockUpstream) -> (TempDir, Arc<SnapshotStore>, Archiver) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SnapshotStore::new(dir.path()));
        let offset = FixedOffset::east_opt(0).unwrap();
        let archiver = Archiver::new(
            Arc::new(upstream.fetcher()),
            Arc::clone(&store),
            Arc::new(RankingCache::new(offset)),
            Arc::new(HealthState::new()),
            categories(),
            offset,
        );
        (dir, store, archiver)
    }

    #[tokio::test]
    async fn archives_every_configured_category() {
        let upstream = MockUpstream::start().await;
        let (_dir, store, archiver) = archiver(&upstream);

        let report = archiver.fetch_and_archive_on(None, date(2024, 1, 31)).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.counts.len(), 2);
        assert!(report.counts.values().all(|rows| *rows == 3));

        for category in categories() {
            let snapshot = store.read(&category, date(2024, 1, 31)).await.unwrap();
            assert_eq!(snapshot.records.len(), 3);
        }
        // concurrent categories share one login
        assert_eq!(upstream.state.logins.load(Ordering::SeqCst), 1);
        assert_eq!(archiver.health.snapshot().fetches_ok, 2);
    }

    #[tokio::test]
    async fn single_category_and_unknown_category() {
        let upstream = MockUpstream::start().await;
        let (_dir, store, archiver) = archiver(&upstream);
        let formula = Category::parse("formula_car").unwrap();

        let report = archiver
            .fetch_and_archive_on(Some(&formula), date(2024, 1, 31))
            .await
            .unwrap();
        assert_eq!(report.counts.keys().collect::<Vec<_>>(), vec![&formula]);
        assert!(store.list_dates(&Category::parse("sports_car").unwrap()).await.unwrap().is_empty());

        let oval = Category::parse("oval").unwrap();
        assert!(matches!(
            archiver.fetch_and_archive_on(Some(&oval), date(2024, 1, 31)).await,
            Err(AppError::UnknownCategory(_))
        ));
    }

    #[tokio::test]
    async fn failures_are_reported_and_nothing_is_written() {
        let upstream = MockUpstream::start().await;
        upstream.state.data_status.store(500, Ordering::SeqCst);
        let (_dir, store, archiver) = archiver(&upstream);

        let report = archiver.fetch_and_archive_on(None, date(2024, 1, 31)).await.unwrap();
        assert!(report.counts.is_empty());
        assert_eq!(report.failures.len(), 2);
        assert!(store.list_dates(&categories()[0]).await.unwrap().is_empty());
        assert_eq!(archiver.health.snapshot().fetches_failed, 2);
    }
}
