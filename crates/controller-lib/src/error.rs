//! Error types for the allocation engine

use thiserror::Error;

/// Errors surfaced by the allocation engine
///
/// Warm-up deficiency and infeasibility are not errors: they are reported
/// through [`crate::Evaluation`] and [`crate::AllocStatus`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AllocError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("unsupported topology: {0}")]
    UnsupportedTopology(String),

    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    #[error("metrics window for '{stage}' is not warm ({collected}/{required} samples)")]
    NotWarm {
        stage: String,
        collected: usize,
        required: usize,
    },

    #[error("no executor count supplied for stage '{0}'")]
    MissingAllocation(String),

    #[error("current allocation uses {used} executors but the budget is {budget}")]
    OverBudget { used: u32, budget: u32 },
}

pub type Result<T> = std::result::Result<T, AllocError>;
