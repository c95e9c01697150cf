//! Event-time tumbling windows
//!
//! - [`types`]: window keys and bounds
//! - [`assigner`]: maps event times onto the tumbling grid
//! - [`accumulator`]: per-window aggregation state and its lifecycle
//! - [`aggregator`]: the shared, lock-striped accumulator arena

pub mod accumulator;
pub mod aggregator;
pub mod assigner;
pub mod types;

pub use accumulator::{WindowAccumulator, WindowState};
pub use aggregator::{PendingWindow, WindowAggregator};
pub use assigner::TumblingWindowAssigner;
pub use types::{WindowBounds, WindowKey};
