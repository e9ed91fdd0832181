use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::snapshots::codec;
use crate::types::{Category, MemberRecord, Snapshot};

const SNAPSHOT_EXT: &str = "csv";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Distinguishes temp files of concurrent writers in one process.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// One CSV per (category, date) at `<root>/<category>/<YYYY-MM-DD>.csv`.
///
/// Writes go to a hidden temp file in the same directory and are renamed
/// into place, so readers only ever see complete snapshots. The last
/// completed writer for an identity wins.
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, category: &Category, date: NaiveDate) -> PathBuf {
        self.category_dir(category)
            .join(format!("{}.{SNAPSHOT_EXT}", date.format(DATE_FORMAT)))
    }

    fn category_dir(&self, category: &Category) -> PathBuf {
        self.root.join(category.as_str())
    }

    /// Replaces the snapshot for (category, date) with `records`.
    pub async fn write(
        &self,
        category: &Category,
        date: NaiveDate,
        records: &[MemberRecord],
    ) -> Result<PathBuf> {
        let bytes = codec::encode(records)?;
        let dir = self.category_dir(category);
        let path = self.path_for(category, date);

        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&dir, &target, &bytes)).await??;

        info!(
            category = %category,
            date = %date,
            rows = records.len(),
            "Stored snapshot at {}",
            path.display()
        );
        Ok(path)
    }

    pub async fn read(&self, category: &Category, date: NaiveDate) -> Result<Snapshot> {
        let path = self.path_for(category, date);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::not_found(category, date));
            }
            Err(e) => return Err(e.into()),
        };

        let (records, stats) = tokio::task::spawn_blocking(move || codec::decode(&bytes)).await??;
        if stats.skipped > 0 {
            warn!(
                category = %category,
                date = %date,
                skipped = stats.skipped,
                "Snapshot contains rows that could not be decoded"
            );
        }

        Ok(Snapshot {
            category: category.clone(),
            date,
            records,
        })
    }

    /// One member's record from a snapshot, `None` if the member is absent.
    pub async fn read_member(
        &self,
        category: &Category,
        date: NaiveDate,
        member_id: i64,
    ) -> Result<Option<MemberRecord>> {
        let snapshot = self.read(category, date).await?;
        Ok(snapshot.records.into_iter().find(|r| r.member_id == member_id))
    }

    /// Dates with a snapshot for `category`, ascending.
    pub async fn list_dates(&self, category: &Category) -> Result<Vec<NaiveDate>> {
        let dir = self.category_dir(category);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut dates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match parse_snapshot_name(name) {
                Some(date) => dates.push(date),
                None => debug!(category = %category, "Ignoring non-snapshot file {name}"),
            }
        }
        dates.sort_unstable();
        dates.dedup();
        Ok(dates)
    }

    /// Dates with a snapshot on or before `today`, ascending.
    pub async fn dates_through(&self, category: &Category, today: NaiveDate) -> Result<Vec<NaiveDate>> {
        let mut dates = self.list_dates(category).await?;
        dates.retain(|d| *d <= today);
        Ok(dates)
    }

    /// Snapshot with the greatest date on or before `today`.
    pub async fn latest(&self, category: &Category, today: NaiveDate) -> Result<Snapshot> {
        let dates = self.dates_through(category, today).await?;
        let Some(&date) = dates.last() else {
            return Err(AppError::not_found(category, format!("any date through {today}")));
        };
        self.read(category, date).await
    }
}

/// `2024-01-31.csv` → 2024-01-31. Hidden temp files and anything else → None.
fn parse_snapshot_name(name: &str) -> Option<NaiveDate> {
    if name.starts_with('.') {
        return None;
    }
    let stem = name.strip_suffix(SNAPSHOT_EXT)?.strip_suffix('.')?;
    NaiveDate::parse_from_str(stem, DATE_FORMAT).ok()
}

fn write_atomically(dir: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;

    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("snapshot");
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = dir.join(format!(".{file_name}.{}.{seq}.tmp", std::process::id()));

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, target)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
