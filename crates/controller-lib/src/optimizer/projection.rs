//! Latency projection for candidate allocations

use crate::config::LatencyBaseline;
use crate::models::AllocationMap;
use crate::network::{utilization, QueueingNetwork, ServiceNode, WaitingTimeModel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Projected behaviour of one stage at a given executor count
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageEstimate {
    pub executors: u32,
    /// Per-executor utilization; `None` for a stage without data
    pub utilization: Option<f64>,
    pub waiting_ms: Option<f64>,
    pub service_ms: Option<f64>,
    /// Waiting plus service time; `None` when unstable or without data
    pub sojourn_ms: Option<f64>,
    pub stable: bool,
    pub has_data: bool,
}

impl StageEstimate {
    fn no_data(executors: u32) -> Self {
        Self {
            executors,
            utilization: None,
            waiting_ms: None,
            service_ms: None,
            sojourn_ms: None,
            stable: true,
            has_data: false,
        }
    }
}

/// Evaluates candidate allocations against a fixed network snapshot
pub struct Projector<'a> {
    network: &'a QueueingNetwork,
    model: &'a dyn WaitingTimeModel,
    baseline: LatencyBaseline,
    source_latency_ms: f64,
    calibration: f64,
}

impl<'a> Projector<'a> {
    pub fn new(
        network: &'a QueueingNetwork,
        model: &'a dyn WaitingTimeModel,
        baseline: LatencyBaseline,
        source_latency_ms: f64,
    ) -> Self {
        Self {
            network,
            model,
            baseline,
            source_latency_ms,
            calibration: 1.0,
        }
    }

    /// Fix the calibration factor so that `current` projects to the realized latency
    ///
    /// Only affects [`LatencyBaseline::Calibrated`]. The factor stays 1 when
    /// either side of the ratio is unusable.
    pub fn calibrated_against(mut self, current: &AllocationMap) -> Self {
        if self.baseline == LatencyBaseline::Calibrated {
            let modeled = self.path_latency_ms(current);
            if modeled.is_finite() && modeled > 0.0 && self.source_latency_ms > 0.0 {
                self.calibration = self.source_latency_ms / modeled;
            }
        }
        self
    }

    pub fn network(&self) -> &QueueingNetwork {
        self.network
    }

    pub fn calibration(&self) -> f64 {
        self.calibration
    }

    /// Estimate one stage at `executors`
    pub fn estimate(&self, node: &ServiceNode, executors: u32) -> StageEstimate {
        let Some(mu) = node.mu else {
            return StageEstimate::no_data(executors);
        };
        let lambda = node.arrival_rate_for(self.network.source.leave_rate);
        let rho = utilization(lambda, mu, executors);
        let service_ms = 1000.0 / mu;
        let waiting_ms = if rho < 1.0 {
            self.model
                .waiting_secs(lambda, mu, executors, node.arrival_scv, node.service.scv())
                .map(|secs| secs * 1000.0)
        } else {
            None
        };
        StageEstimate {
            executors,
            utilization: Some(rho),
            waiting_ms,
            service_ms: Some(service_ms),
            sojourn_ms: waiting_ms.map(|w| w + service_ms),
            stable: waiting_ms.is_some(),
            has_data: true,
        }
    }

    /// Estimate a stage by id under `allocation`
    pub fn stage(&self, id: &str, allocation: &AllocationMap) -> Option<StageEstimate> {
        let node = self.network.stages.get(id)?;
        Some(self.estimate(node, executors_in(allocation, node)))
    }

    /// Every stage of the network under `allocation`
    pub fn estimates(&self, allocation: &AllocationMap) -> BTreeMap<String, StageEstimate> {
        self.network
            .stages
            .iter()
            .map(|(id, node)| {
                let executors = executors_in(allocation, node);
                (id.clone(), self.estimate(node, executors))
            })
            .collect()
    }

    /// Modeled latency of the slowest source-to-leaf path
    ///
    /// Stages without data contribute nothing. Infinite if any stage on any
    /// path is unstable.
    pub fn path_latency_ms(&self, allocation: &AllocationMap) -> f64 {
        let mut worst: f64 = 0.0;
        for path in &self.network.paths {
            let mut total = 0.0;
            for id in path {
                let Some(estimate) = self.stage(id, allocation) else {
                    continue;
                };
                if !estimate.stable {
                    return f64::INFINITY;
                }
                total += estimate.sojourn_ms.unwrap_or(0.0);
            }
            worst = worst.max(total);
        }
        worst
    }

    /// Projected end-to-end latency of completed units under `allocation`
    pub fn end_to_end_ms(&self, allocation: &AllocationMap) -> f64 {
        let path = self.path_latency_ms(allocation);
        if !path.is_finite() {
            return f64::INFINITY;
        }
        match self.baseline {
            LatencyBaseline::Additive => self.source_latency_ms + path,
            LatencyBaseline::Calibrated => path * self.calibration,
        }
    }
}

fn executors_in(allocation: &AllocationMap, node: &ServiceNode) -> u32 {
    allocation.get(&node.id).copied().unwrap_or(node.executors)
}
