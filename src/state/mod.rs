pub mod ranking_cache;

pub use ranking_cache::{RankingCache, RankingKey};
