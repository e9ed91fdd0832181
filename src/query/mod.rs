pub mod delta;
pub mod growers;
pub mod latest;
pub mod window;

pub use delta::{DeltaEngine, DeltaWindow};
pub use growers::{GrowersQuery, GrowthRanker};
