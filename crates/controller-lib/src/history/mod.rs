//! Windowed metrics history
//!
//! Keeps a bounded, per-stage history of raw samples and merges each window
//! into a composite sample once every stage has warmed up.

mod composite;
mod window;

pub use composite::combine;
pub use window::{MetricsStore, StageWindow};
