use chrono::{DateTime, Days, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::config::{RANKING_CACHE_EXPIRY_HOUR, RANKING_CACHE_EXPIRY_MINUTE};
use crate::types::{Category, GrowthRanking};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RankingKey {
    pub category: Category,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub limit: usize,
    pub min_current_value: Option<i64>,
}

struct CachedRanking {
    ranking: GrowthRanking,
    expires_at: DateTime<Utc>,
}

/// Growers results keyed by the resolved window. Entries live until the
/// next daily cutoff and are dropped whenever their category is rewritten.
pub struct RankingCache {
    offset: FixedOffset,
    entries: DashMap<RankingKey, CachedRanking>,
}

impl RankingCache {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            offset,
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &RankingKey, now: DateTime<Utc>) -> Option<GrowthRanking> {
        let hit = self.entries.get(key).and_then(|entry| {
            (entry.expires_at > now).then(|| entry.ranking.clone())
        });
        if hit.is_none() {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        hit
    }

    pub fn insert(&self, key: RankingKey, ranking: GrowthRanking, now: DateTime<Utc>) {
        let expires_at = next_expiry(now, self.offset);
        self.entries.insert(key, CachedRanking { ranking, expires_at });
    }

    pub fn invalidate(&self, category: &Category) {
        let before = self.entries.len();
        self.entries.retain(|key, _| &key.category != category);
        let dropped = before.saturating_sub(self.entries.len());
        if dropped > 0 {
            debug!(category = %category, dropped, "Invalidated cached rankings");
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// 23:55 local on the current day, or the next day once that has passed.
pub fn next_expiry(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let local = now.with_timezone(&offset);
    let cutoff = NaiveTime::from_hms_opt(RANKING_CACHE_EXPIRY_HOUR, RANKING_CACHE_EXPIRY_MINUTE, 0)
        .unwrap_or(NaiveTime::MIN);
    let mut day = local.date_naive();
    if local.time() >= cutoff {
        day = day.checked_add_days(Days::new(1)).unwrap_or(day);
    }
    offset
        .from_local_datetime(&day.and_time(cutoff))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::date;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn ranking(category: &Category) -> GrowthRanking {
        GrowthRanking {
            category: category.clone(),
            start_date_used: date(2024, 1, 1),
            end_date_used: date(2024, 1, 31),
            snapshot_age_days: 30,
            min_current_value: None,
            results: Vec::new(),
        }
    }

    fn key(category: &Category) -> RankingKey {
        RankingKey {
            category: category.clone(),
            start: date(2024, 1, 1),
            end: date(2024, 1, 31),
            limit: 20,
            min_current_value: None,
        }
    }

    #[test]
    fn expiry_is_same_day_cutoff_or_next() {
        let utc0 = FixedOffset::east_opt(0).unwrap();
        assert_eq!(next_expiry(utc(2024, 1, 31, 10, 0), utc0), utc(2024, 1, 31, 23, 55));
        assert_eq!(next_expiry(utc(2024, 1, 31, 23, 55), utc0), utc(2024, 2, 1, 23, 55));

        // 23:00 UTC is already 01:00 the next day at +02:00
        let plus2 = FixedOffset::east_opt(2 * 3600).unwrap();
        assert_eq!(next_expiry(utc(2024, 1, 31, 23, 0), plus2), utc(2024, 2, 1, 21, 55));
    }

    #[test]
    fn entries_expire_at_cutoff() {
        let cache = RankingCache::new(FixedOffset::east_opt(0).unwrap());
        let cat = Category::parse("sports_car").unwrap();
        cache.insert(key(&cat), ranking(&cat), utc(2024, 1, 31, 12, 0));

        assert!(cache.get(&key(&cat), utc(2024, 1, 31, 23, 54)).is_some());
        assert!(cache.get(&key(&cat), utc(2024, 1, 31, 23, 55)).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn invalidate_only_touches_one_category() {
        let cache = RankingCache::new(FixedOffset::east_opt(0).unwrap());
        let sports = Category::parse("sports_car").unwrap();
        let formula = Category::parse("formula_car").unwrap();
        let now = utc(2024, 1, 31, 12, 0);
        cache.insert(key(&sports), ranking(&sports), now);
        cache.insert(key(&formula), ranking(&formula), now);

        cache.invalidate(&sports);
        assert!(cache.get(&key(&sports), now).is_none());
        assert!(cache.get(&key(&formula), now).is_some());
    }
}
