use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::config::MIN_SEARCH_TERM_LEN;
use crate::db::models::{MemberRow, MemberSearchPage};
use crate::error::{AppError, Result};
use crate::snapshots::SnapshotStore;
use crate::types::{Category, MemberRecord};

pub const SEARCH_DEFAULT_LIMIT: u32 = 20;
pub const SEARCH_MAX_LIMIT: u32 = 100;

/// Member names and locations gathered from the latest snapshots, searchable
/// by name. Snapshot files stay the source of truth for values.
#[derive(Clone)]
pub struct MemberDirectory {
    pool: SqlitePool,
}

impl MemberDirectory {
    pub async fn connect(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Member directory ready at {db_path}");
        Ok(Self { pool })
    }

    /// Single-connection in-memory database; every connection of a
    /// `:memory:` pool would otherwise see its own empty database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Upserts every member of each category's latest snapshot. Returns the
    /// number of distinct members written.
    pub async fn sync_from_snapshots(
        &self,
        store: &SnapshotStore,
        categories: &[Category],
        today: NaiveDate,
    ) -> Result<usize> {
        let mut records = Vec::new();
        for category in categories {
            match store.latest(category, today).await {
                Ok(snapshot) => records.extend(snapshot.records),
                Err(AppError::NotFound { .. }) => {
                    debug!(category = %category, "No snapshot to sync members from");
                }
                Err(e) => return Err(e),
            }
        }
        let written = self.upsert_members(&records).await?;
        info!(members = written, categories = categories.len(), "Member directory synced");
        Ok(written)
    }

    /// Blank names or locations never replace stored ones. When an id
    /// appears more than once the last non-blank value wins.
    pub async fn upsert_members(&self, records: &[MemberRecord]) -> Result<usize> {
        let mut merged: BTreeMap<i64, (Option<&str>, Option<&str>)> = BTreeMap::new();
        for r in records {
            let name = non_blank(&r.display_name);
            let location = non_blank(&r.location);
            let entry = merged.entry(r.member_id).or_insert((None, None));
            entry.0 = name.or(entry.0);
            entry.1 = location.or(entry.1);
        }
        if merged.is_empty() {
            return Ok(0);
        }

        let updated_at = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for (member_id, (name, location)) in &merged {
            sqlx::query(
                r#"
                INSERT INTO members (member_id, display_name, location, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (member_id) DO UPDATE SET
                    display_name = COALESCE(excluded.display_name, members.display_name),
                    location     = COALESCE(excluded.location, members.location),
                    updated_at   = excluded.updated_at
                "#,
            )
            .bind(member_id)
            .bind(name)
            .bind(location)
            .bind(&updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(merged.len())
    }

    /// Case-insensitive substring search on display name, ordered by name.
    pub async fn search(&self, term: &str, limit: Option<u32>, offset: u32) -> Result<MemberSearchPage> {
        let query = term.trim();
        if query.chars().count() < MIN_SEARCH_TERM_LEN {
            return Err(AppError::InvalidQuery(format!(
                "search term must be at least {MIN_SEARCH_TERM_LEN} characters"
            )));
        }
        let limit = limit.unwrap_or(SEARCH_DEFAULT_LIMIT);
        if limit == 0 || limit > SEARCH_MAX_LIMIT {
            return Err(AppError::InvalidQuery(format!(
                "limit must be between 1 and {SEARCH_MAX_LIMIT}"
            )));
        }

        let pattern = format!("%{}%", escape_like(query));
        let results = sqlx::query_as::<_, MemberRow>(
            r#"
            SELECT member_id, display_name, location, updated_at
            FROM members
            WHERE display_name LIKE ? ESCAPE '\'
            ORDER BY display_name COLLATE NOCASE, member_id
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(pattern)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        Ok(MemberSearchPage {
            query: query.to_string(),
            limit,
            offset,
            results,
        })
    }

    #[cfg(test)]
    pub async fn get(&self, member_id: i64) -> Result<Option<MemberRow>> {
        let row = sqlx::query_as::<_, MemberRow>(
            "SELECT member_id, display_name, location, updated_at FROM members WHERE member_id = ?",
        )
        .bind(member_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM members")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn non_blank(s: &str) -> Option<&str> {
    let t = s.trim();
    (!t.is_empty()).then_some(t)
}

fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
