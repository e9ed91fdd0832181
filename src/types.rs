use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::{PROVISIONAL_START_VALUE, UNRATED_VALUE};
use crate::error::{AppError, Result};

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// Provider-defined grouping that partitions snapshots (e.g. `sports_car`).
///
/// Doubles as a directory name under the snapshot root, so only lowercase
/// ASCII letters, digits and `_`/`-` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Category(String);

impl Category {
    pub fn parse(raw: &str) -> Result<Self> {
        let name = raw.trim();
        let valid = !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
        if !valid {
            return Err(AppError::UnknownCategory(raw.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Category {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Category::parse(&value)
    }
}

impl From<Category> for String {
    fn from(value: Category) -> Self {
        value.0
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Snapshot rows
// ---------------------------------------------------------------------------

/// One member row as published upstream. Values are kept verbatim; `-1` in
/// `value` means the member is unrated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub member_id: i64,
    pub display_name: String,
    pub location: String,
    pub value: i64,
    pub starts: Option<i64>,
    pub wins: Option<i64>,
}

impl MemberRecord {
    pub fn is_unrated(&self) -> bool {
        self.value == UNRATED_VALUE
    }
}

/// Full roster for one category as of one calendar date.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub category: Category,
    pub date: NaiveDate,
    pub records: Vec<MemberRecord>,
}

impl Snapshot {
    pub fn find(&self, member_id: i64) -> Option<&MemberRecord> {
        self.records.iter().find(|r| r.member_id == member_id)
    }
}

/// Which boundary of a window a lookup failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Start,
    End,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Start => write!(f, "start"),
            Side::End => write!(f, "end"),
        }
    }
}

// ---------------------------------------------------------------------------
// Query results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaResult {
    pub member_id: i64,
    pub display_name: String,
    pub location: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub start_value: i64,
    pub end_value: i64,
    pub delta: i64,
    /// `None` when the start value is zero.
    pub percent_change: Option<f64>,
    pub starts: Option<i64>,
    pub wins: Option<i64>,
}

impl DeltaResult {
    /// Callers must have rejected an unrated `end` already. An unrated
    /// `start` counts from the provisional starting value. Values whose
    /// difference does not fit an `i64` are a `Parse` error.
    pub fn between(
        start_date: NaiveDate,
        start: &MemberRecord,
        end_date: NaiveDate,
        end: &MemberRecord,
    ) -> Result<Self> {
        let start_value = if start.is_unrated() {
            PROVISIONAL_START_VALUE
        } else {
            start.value
        };
        let delta = end.value.checked_sub(start_value).ok_or_else(|| {
            AppError::Parse(format!(
                "rating change for member {} from {start_value} to {} is out of range",
                end.member_id, end.value
            ))
        })?;
        let percent_change = if start_value == 0 {
            None
        } else {
            Some(delta as f64 / start_value as f64 * 100.0)
        };

        Ok(Self {
            member_id: end.member_id,
            display_name: end.display_name.clone(),
            location: end.location.clone(),
            start_date,
            end_date,
            start_value,
            end_value: end.value,
            delta,
            percent_change,
            starts: end.starts,
            wins: end.wins,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub snapshot_date: NaiveDate,
    #[serde(flatten)]
    pub record: MemberRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrowthRanking {
    pub category: Category,
    pub start_date_used: NaiveDate,
    pub end_date_used: NaiveDate,
    pub snapshot_age_days: i64,
    pub min_current_value: Option<i64>,
    pub results: Vec<DeltaResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberSnapshot {
    pub category: Category,
    pub snapshot_date: NaiveDate,
    #[serde(flatten)]
    pub record: MemberRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestMembers {
    pub category: Category,
    pub snapshot_date: NaiveDate,
    pub results: Vec<MemberRecord>,
    pub missing: Vec<i64>,
}
