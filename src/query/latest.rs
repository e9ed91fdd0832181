use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;

use crate::error::{AppError, Result};
use crate::snapshots::SnapshotStore;
use crate::types::{Category, LatestMembers, MemberSnapshot, Side};

/// A member's record in the most recent snapshot on or before `today`.
pub async fn latest_member(
    store: &SnapshotStore,
    category: &Category,
    member_id: i64,
    today: NaiveDate,
) -> Result<MemberSnapshot> {
    let snapshot = store.latest(category, today).await?;
    let record = snapshot
        .find(member_id)
        .cloned()
        .ok_or(AppError::MemberNotFound {
            member_id,
            side: Side::End,
            date: snapshot.date,
        })?;
    Ok(MemberSnapshot {
        category: category.clone(),
        snapshot_date: snapshot.date,
        record,
    })
}

/// Records for several members from one latest snapshot. Results follow the
/// order of `member_ids`; duplicates are collapsed.
pub async fn latest_members(
    store: &SnapshotStore,
    category: &Category,
    member_ids: &[i64],
    today: NaiveDate,
) -> Result<LatestMembers> {
    let snapshot = store.latest(category, today).await?;
    let by_id: HashMap<i64, usize> = snapshot
        .records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.member_id, i))
        .collect();

    let mut seen = HashSet::new();
    let mut results = Vec::new();
    let mut missing = Vec::new();
    for &id in member_ids {
        if !seen.insert(id) {
            continue;
        }
        match by_id.get(&id) {
            Some(&i) => results.push(snapshot.records[i].clone()),
            None => missing.push(id),
        }
    }

    Ok(LatestMembers {
        category: category.clone(),
        snapshot_date: snapshot.date,
        results,
        missing,
    })
}
