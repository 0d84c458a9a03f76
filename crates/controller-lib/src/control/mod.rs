//! Control loop and decision policies
//!
//! The engine only proposes; a [`DecisionMaker`] chooses which of the
//! decision's maps to act on and an [`Actuator`] applies it to the pipeline.

mod r#loop;

pub use r#loop::{AllocationState, ControlConfig, ControlLoop, TickOutcome};

use crate::decision::AllocationDecision;
use crate::models::AllocationMap;
use serde::{Deserialize, Serialize};

pub use async_trait::async_trait;

/// Turns a decision into a proposed allocation change
pub trait DecisionMaker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Proposed allocation, `None` for no change
    fn make(&self, decision: &AllocationDecision, current: &AllocationMap) -> Option<AllocationMap>;
}

/// Applies an allocation to the running pipeline
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn apply(&self, allocation: &AllocationMap) -> anyhow::Result<()>;
}

/// Which map the controller acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPolicy {
    /// Use the spare budget: act on the applied map
    #[default]
    BestEffort,
    /// Act on the minimal map when one exists
    Minimal,
}

pub fn decision_maker_for(policy: DecisionPolicy) -> Box<dyn DecisionMaker> {
    match policy {
        DecisionPolicy::BestEffort => Box::new(BestEffortDecisionMaker),
        DecisionPolicy::Minimal => Box::new(MinimalDecisionMaker),
    }
}

/// Proposes the applied map whenever it differs from the current one
#[derive(Debug, Clone, Copy, Default)]
pub struct BestEffortDecisionMaker;

impl DecisionMaker for BestEffortDecisionMaker {
    fn name(&self) -> &'static str {
        "best_effort"
    }

    fn make(
        &self,
        decision: &AllocationDecision,
        current: &AllocationMap,
    ) -> Option<AllocationMap> {
        decision.changes(current).then(|| decision.applied.clone())
    }
}

/// Proposes the minimal map, falling back to the applied map when infeasible
#[derive(Debug, Clone, Copy, Default)]
pub struct MinimalDecisionMaker;

impl DecisionMaker for MinimalDecisionMaker {
    fn name(&self) -> &'static str {
        "minimal"
    }

    fn make(
        &self,
        decision: &AllocationDecision,
        current: &AllocationMap,
    ) -> Option<AllocationMap> {
        let target = decision.minimal.as_ref().unwrap_or(&decision.applied);
        (target != current).then(|| target.clone())
    }
}
