//! Allocation engine for elastic stream-processing pipelines
//!
//! This crate provides the core functionality for:
//! - Windowed aggregation of per-stage runtime samples
//! - Queueing-network modeling of the pipeline
//! - Executor allocation search under a latency target and capacity budget
//! - The control loop, health checks and observability

pub mod config;
pub mod control;
pub mod decision;
pub mod engine;
pub mod error;
pub mod health;
pub mod history;
pub mod models;
pub mod network;
pub mod observability;
pub mod optimizer;
pub mod topology;

pub use config::AllocConfig;
pub use control::{
    Actuator, AllocationState, ControlConfig, ControlLoop, DecisionMaker, DecisionPolicy,
    TickOutcome,
};
pub use decision::{AllocationDecision, DecisionAssembler, DecisionContext};
pub use engine::{AllocEngine, Evaluation};
pub use error::{AllocError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ControllerMetrics, StructuredLogger};
pub use optimizer::AllocStatus;
pub use topology::{Topology, TopologySpec};
