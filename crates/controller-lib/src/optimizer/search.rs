//! Greedy bottleneck search
//!
//! Every step produces a new candidate map with one more executor on the
//! most latency-limiting stage. Candidates are never mutated in place, so the
//! sequence of steps can be replayed and inspected.

use super::projection::{Projector, StageEstimate};
use crate::config::{AllocConfig, LatencyBaseline, MinimalSeed, NoDataPolicy};
use crate::error::{AllocError, Result};
use crate::models::{total_executors, AllocationMap};
use crate::network::{model_for, QueueingNetwork, WaitingTimeModel};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// Optimizer verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocStatus {
    /// Target reachable; a minimal allocation was computed
    Ok,
    /// The current allocation already meets the target
    OkAlreadyMet,
    /// Target unreachable within the budget
    Infeasible,
}

impl AllocStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocStatus::Ok => "OK",
            AllocStatus::OkAlreadyMet => "OK_ALREADY_MET",
            AllocStatus::Infeasible => "INFEASIBLE",
        }
    }
}

impl std::fmt::Display for AllocStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage received an executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepReason {
    /// Stage reported no processed units
    NoDataBoost,
    /// Stage utilization at or above 1
    Unstable,
    /// Largest projected latency reduction
    Marginal,
}

/// One executor added during the applied-allocation walk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchStep {
    pub stage: String,
    pub reason: StepReason,
    /// Processing-stage executors after the step
    pub total: u32,
    /// Projected end-to-end latency after the step
    pub projected_ms: f64,
}

/// Result of one optimization
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerOutcome {
    pub status: AllocStatus,
    /// Processing stages only; `None` when infeasible
    pub minimal: Option<AllocationMap>,
    /// Processing stages only
    pub applied: AllocationMap,
    pub projected_current_ms: f64,
    pub projected_minimal_ms: Option<f64>,
    pub projected_applied_ms: f64,
    pub current_estimates: BTreeMap<String, StageEstimate>,
    pub applied_estimates: BTreeMap<String, StageEstimate>,
    pub steps: Vec<SearchStep>,
    /// Stages given an executor without data to justify it
    pub boosted: BTreeSet<String>,
}

#[derive(Debug)]
struct Candidate {
    stage: String,
    reason: StepReason,
    e2e_gain_ms: f64,
    local_gain_ms: f64,
}

impl Candidate {
    fn forced(stage: &str, reason: StepReason) -> Self {
        Self {
            stage: stage.to_string(),
            reason,
            e2e_gain_ms: f64::INFINITY,
            local_gain_ms: f64::INFINITY,
        }
    }
}

/// Allocation optimizer
#[derive(Debug)]
pub struct Optimizer {
    model: Box<dyn WaitingTimeModel>,
    baseline: LatencyBaseline,
    seed: MinimalSeed,
    no_data_policy: NoDataPolicy,
    min_improvement_ms: f64,
}

impl Optimizer {
    pub fn new(config: &AllocConfig) -> Self {
        Self {
            model: model_for(config.waiting_model),
            baseline: config.latency_baseline,
            seed: config.minimal_seed,
            no_data_policy: config.no_data_policy,
            min_improvement_ms: config.min_improvement_ms,
        }
    }

    /// Replace the waiting-time model
    pub fn with_model(mut self, model: Box<dyn WaitingTimeModel>) -> Self {
        self.model = model;
        self
    }

    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    /// Search for the minimal and the applied allocation
    ///
    /// `current` may include the source stage; it is ignored. Only processing
    /// stages count against `max_available`.
    pub fn optimize(
        &self,
        network: &QueueingNetwork,
        source_latency_ms: f64,
        target_latency_ms: f64,
        current: &AllocationMap,
        max_available: u32,
    ) -> Result<OptimizerOutcome> {
        let mut seed = AllocationMap::new();
        for id in network.stages.keys() {
            let executors = current
                .get(id)
                .copied()
                .ok_or_else(|| AllocError::MissingAllocation(id.clone()))?;
            seed.insert(id.clone(), executors);
        }
        let used = total_executors(&seed);
        if used > max_available {
            return Err(AllocError::OverBudget {
                used,
                budget: max_available,
            });
        }

        let projector = Projector::new(
            network,
            self.model.as_ref(),
            self.baseline,
            source_latency_ms,
        )
        .calibrated_against(&seed);
        let projected_current_ms = projector.end_to_end_ms(&seed);
        let already_met = projected_current_ms <= target_latency_ms;

        let minimal = match (already_met, self.seed) {
            (true, MinimalSeed::Current) => Some(seed.clone()),
            (true, MinimalSeed::StabilityFloor) => {
                let floor = stability_floor(network, &seed);
                match self.minimal_walk(&projector, floor, target_latency_ms, max_available) {
                    Some(found) if total_executors(&found) <= used => Some(found),
                    _ => Some(seed.clone()),
                }
            }
            (false, MinimalSeed::Current) => {
                self.minimal_walk(&projector, seed.clone(), target_latency_ms, max_available)
            }
            (false, MinimalSeed::StabilityFloor) => self.minimal_walk(
                &projector,
                stability_floor(network, &seed),
                target_latency_ms,
                max_available,
            ),
        };

        let status = if already_met {
            AllocStatus::OkAlreadyMet
        } else if minimal.is_some() {
            AllocStatus::Ok
        } else {
            AllocStatus::Infeasible
        };

        let (applied, steps, boosted) =
            self.applied_walk(&projector, seed.clone(), target_latency_ms, max_available);

        debug!(
            status = %status,
            current_ms = projected_current_ms,
            applied_ms = projector.end_to_end_ms(&applied),
            steps = steps.len(),
            model = self.model.name(),
            "Optimization finished"
        );

        Ok(OptimizerOutcome {
            status,
            projected_minimal_ms: minimal.as_ref().map(|m| projector.end_to_end_ms(m)),
            projected_applied_ms: projector.end_to_end_ms(&applied),
            projected_current_ms,
            current_estimates: projector.estimates(&seed),
            applied_estimates: projector.estimates(&applied),
            minimal,
            applied,
            steps,
            boosted,
        })
    }

    /// Grow `allocation` until it meets the target, or give up at the budget
    fn minimal_walk(
        &self,
        projector: &Projector<'_>,
        mut allocation: AllocationMap,
        target_latency_ms: f64,
        budget: u32,
    ) -> Option<AllocationMap> {
        loop {
            let total = total_executors(&allocation);
            if total > budget {
                return None;
            }
            if projector.end_to_end_ms(&allocation) <= target_latency_ms {
                return Some(allocation);
            }
            if total == budget {
                return None;
            }
            let candidate = self.next_step(projector, &allocation, None)?;
            allocation = incremented(&allocation, &candidate.stage);
        }
    }

    /// Spend the budget on the current allocation until returns diminish
    fn applied_walk(
        &self,
        projector: &Projector<'_>,
        mut allocation: AllocationMap,
        target_latency_ms: f64,
        budget: u32,
    ) -> (AllocationMap, Vec<SearchStep>, BTreeSet<String>) {
        let mut steps = Vec::new();
        let mut boosted = BTreeSet::new();

        while total_executors(&allocation) < budget {
            let boost = (self.no_data_policy == NoDataPolicy::Boost).then_some(&boosted);
            let Some(candidate) = self.next_step(projector, &allocation, boost) else {
                break;
            };
            if candidate.reason == StepReason::Marginal
                && candidate.local_gain_ms < self.min_improvement_ms
            {
                let unmet = projector.end_to_end_ms(&allocation) > target_latency_ms;
                if !(unmet && candidate.e2e_gain_ms > 0.0) {
                    trace!(
                        stage = %candidate.stage,
                        gain_ms = candidate.local_gain_ms,
                        "Stopping on diminishing returns"
                    );
                    break;
                }
            }
            if candidate.reason == StepReason::NoDataBoost {
                boosted.insert(candidate.stage.clone());
            }
            allocation = incremented(&allocation, &candidate.stage);
            let step = SearchStep {
                stage: candidate.stage,
                reason: candidate.reason,
                total: total_executors(&allocation),
                projected_ms: projector.end_to_end_ms(&allocation),
            };
            trace!(
                stage = %step.stage,
                reason = ?step.reason,
                total = step.total,
                projected_ms = step.projected_ms,
                "Search step"
            );
            steps.push(step);
        }
        (allocation, steps, boosted)
    }

    /// Pick the stage that should receive the next executor
    ///
    /// Order: the unstable stage with the highest utilization, then unboosted
    /// no-data stages (only when `boosted` is given), then the stage with the
    /// largest end-to-end gain (local gain breaks ties). Equal candidates go
    /// to the smallest stage id.
    fn next_step(
        &self,
        projector: &Projector<'_>,
        allocation: &AllocationMap,
        boosted: Option<&BTreeSet<String>>,
    ) -> Option<Candidate> {
        let network = projector.network();
        let estimates = projector.estimates(allocation);
        let mut worst: Option<(&str, f64)> = None;
        for (id, estimate) in &estimates {
            if !estimate.has_data || estimate.stable {
                continue;
            }
            let load = estimate.utilization.unwrap_or(f64::INFINITY);
            if worst.map_or(true, |(_, max)| load > max) {
                worst = Some((id.as_str(), load));
            }
        }
        if let Some((id, _)) = worst {
            return Some(Candidate::forced(id, StepReason::Unstable));
        }

        if let Some(boosted) = boosted {
            if let Some(id) = network.no_data_stages().find(|id| !boosted.contains(*id)) {
                return Some(Candidate::forced(id, StepReason::NoDataBoost));
            }
        }

        let base_ms = projector.end_to_end_ms(allocation);
        let mut best: Option<Candidate> = None;
        for (id, estimate) in &estimates {
            let (Some(node), Some(sojourn)) = (network.stages.get(id), estimate.sojourn_ms) else {
                continue;
            };
            let grown = incremented(allocation, id);
            let e2e_gain_ms = base_ms - projector.end_to_end_ms(&grown);
            let local_gain_ms = projector
                .estimate(node, estimate.executors.saturating_add(1))
                .sojourn_ms
                .map_or(0.0, |next| sojourn - next);

            let better = match &best {
                None => true,
                Some(b) => {
                    e2e_gain_ms > b.e2e_gain_ms
                        || (e2e_gain_ms == b.e2e_gain_ms && local_gain_ms > b.local_gain_ms)
                }
            };
            if better {
                best = Some(Candidate {
                    stage: id.clone(),
                    reason: StepReason::Marginal,
                    e2e_gain_ms,
                    local_gain_ms,
                });
            }
        }
        best.filter(|c| c.e2e_gain_ms > 0.0 || c.local_gain_ms > 0.0)
    }
}

/// Smallest stable count per measured stage; stages without data keep their count
fn stability_floor(network: &QueueingNetwork, current: &AllocationMap) -> AllocationMap {
    network
        .stages
        .iter()
        .map(|(id, node)| {
            let executors = match node.min_stable_executors() {
                Some(floor) => floor.max(1),
                None => current.get(id).copied().unwrap_or(node.executors),
            };
            (id.clone(), executors)
        })
        .collect()
}

fn incremented(allocation: &AllocationMap, stage: &str) -> AllocationMap {
    let mut next = allocation.clone();
    *next.entry(stage.to_string()).or_insert(0) += 1;
    next
}
