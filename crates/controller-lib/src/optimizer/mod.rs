//! Allocation optimizer
//!
//! Projects end-to-end latency for candidate allocations over a queueing
//! network snapshot and searches for:
//! - the smallest allocation meeting the latency target (the minimal map)
//! - the best allocation within the executor budget (the applied map)

mod projection;
mod search;


pub use projection::{Projector, StageEstimate};
pub use search::{AllocStatus, Optimizer, OptimizerOutcome, SearchStep, StepReason};
