//! Decision assembly
//!
//! Overlays the optimizer's processing-stage maps onto the full pipeline
//! allocation and packages the diagnostics an operator needs to audit the
//! decision.

use crate::models::{total_executors, AllocationMap};
use crate::network::{QueueingNetwork, ServiceNode, SourceNode};
use crate::optimizer::{AllocStatus, OptimizerOutcome, SearchStep, StageEstimate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Latency figures behind a decision; unstable projections are `None`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub realized_ms: f64,
    pub target_ms: f64,
    pub projected_current_ms: Option<f64>,
    pub projected_minimal_ms: Option<f64>,
    pub projected_applied_ms: Option<f64>,
}

/// Per-stage view of current and applied behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostics {
    pub current_executors: u32,
    pub minimal_executors: Option<u32>,
    pub applied_executors: u32,
    pub utilization: Option<f64>,
    pub applied_utilization: Option<f64>,
    pub sojourn_ms: Option<f64>,
    pub applied_sojourn_ms: Option<f64>,
    pub stable: bool,
    pub no_data: bool,
    pub boosted: bool,
    pub send_queue_normal: bool,
    pub recv_queue_normal: bool,
}

/// Diagnostic context attached to every decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionContext {
    pub latency: LatencySummary,
    pub stages: BTreeMap<String, StageDiagnostics>,
    pub source: SourceNode,
    pub network: BTreeMap<String, ServiceNode>,
    pub waiting_model: String,
    pub steps: Vec<SearchStep>,
    pub max_available_executors: u32,
}

/// Output of one warm evaluation
///
/// Both maps cover the whole pipeline, source included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationDecision {
    pub status: AllocStatus,
    pub minimal: Option<AllocationMap>,
    pub applied: AllocationMap,
    pub context: DecisionContext,
    pub decided_at: i64,
}

impl AllocationDecision {
    /// True when the applied map differs from `current`
    pub fn changes(&self, current: &AllocationMap) -> bool {
        &self.applied != current
    }
}

/// Builds [`AllocationDecision`]s from optimizer output
#[derive(Debug, Clone)]
pub struct DecisionAssembler {
    target_latency_ms: f64,
    max_available: u32,
}

impl DecisionAssembler {
    pub fn new(target_latency_ms: f64, max_available: u32) -> Self {
        Self {
            target_latency_ms,
            max_available,
        }
    }

    pub fn assemble(
        &self,
        current: &AllocationMap,
        network: QueueingNetwork,
        outcome: OptimizerOutcome,
        waiting_model: &str,
    ) -> AllocationDecision {
        let applied = overlay(current, &outcome.applied);
        let minimal = outcome.minimal.as_ref().map(|m| overlay(current, m));

        for map in std::iter::once(&applied).chain(minimal.iter()) {
            debug_assert!(
                network.stages.keys().all(|id| map.contains_key(id)),
                "allocation is missing a processing stage"
            );
            debug_assert_eq!(
                map.get(&network.source.id),
                current.get(&network.source.id),
                "source allocation must pass through unchanged"
            );
            debug_assert!(
                processing_total(map, &network) <= self.max_available,
                "allocation exceeds the executor budget"
            );
        }

        let mut stages = BTreeMap::new();
        for (id, node) in &network.stages {
            let now = outcome.current_estimates.get(id);
            let then = outcome.applied_estimates.get(id);
            stages.insert(
                id.clone(),
                StageDiagnostics {
                    current_executors: current.get(id).copied().unwrap_or(node.executors),
                    minimal_executors: minimal.as_ref().and_then(|m| m.get(id).copied()),
                    applied_executors: applied.get(id).copied().unwrap_or(node.executors),
                    utilization: now.and_then(|e| e.utilization),
                    applied_utilization: then.and_then(|e| e.utilization),
                    sojourn_ms: now.and_then(|e| e.sojourn_ms),
                    applied_sojourn_ms: then.and_then(|e| e.sojourn_ms),
                    stable: now.map_or(true, |e: &StageEstimate| e.stable),
                    no_data: !node.has_data(),
                    boosted: outcome.boosted.contains(id),
                    send_queue_normal: node.send_queue_normal,
                    recv_queue_normal: node.recv_queue_normal,
                },
            );
        }

        let latency = LatencySummary {
            realized_ms: network.source.realized_latency_ms,
            target_ms: self.target_latency_ms,
            projected_current_ms: finite(outcome.projected_current_ms),
            projected_minimal_ms: outcome.projected_minimal_ms.and_then(finite),
            projected_applied_ms: finite(outcome.projected_applied_ms),
        };

        AllocationDecision {
            status: outcome.status,
            minimal,
            applied,
            context: DecisionContext {
                latency,
                stages,
                source: network.source,
                network: network.stages,
                waiting_model: waiting_model.to_string(),
                steps: outcome.steps,
                max_available_executors: self.max_available,
            },
            decided_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Copy of `current` with every entry of `changes` written over it
fn overlay(current: &AllocationMap, changes: &AllocationMap) -> AllocationMap {
    let mut merged = current.clone();
    for (id, executors) in changes {
        merged.insert(id.clone(), *executors);
    }
    merged
}

fn processing_total(map: &AllocationMap, network: &QueueingNetwork) -> u32 {
    let only_processing: AllocationMap = map
        .iter()
        .filter(|(id, _)| network.stages.contains_key(*id))
        .map(|(id, n)| (id.clone(), *n))
        .collect();
    total_executors(&only_processing)
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocConfig;
    use crate::network::ServiceVariability;
    use crate::optimizer::Optimizer;

    fn network() -> QueueingNetwork {
        let source = SourceNode {
            id: "spout".to_string(),
            executors: 3,
            realized_latency_ms: 12.0,
            completed_count: 500,
            duration_ms: 5000,
            leave_rate: 100.0,
            external_arrival_rate: 100.0,
            completion_rate: 100.0,
            emit_scv: 1.0,
        };
        let mut stages = BTreeMap::new();
        for (id, mu) in [("a", Some(150.0)), ("b", None)] {
            stages.insert(
                id.to_string(),
                ServiceNode {
                    id: id.to_string(),
                    executors: 1,
                    lambda: 100.0,
                    mu,
                    rho: mu.map(|mu| 100.0 / mu),
                    mean_service_ms: mu.map_or(0.0, |mu| 1000.0 / mu),
                    service: ServiceVariability::Exponential,
                    arrival_scv: 1.0,
                    io_ratio: Some(1.0),
                    processed_count: if mu.is_some() { 500 } else { 0 },
                    process_rate: 0.0,
                    send_queue_normal: true,
                    recv_queue_normal: id == "a",
                },
            );
        }
        QueueingNetwork {
            source,
            stages,
            paths: vec![vec!["a".to_string(), "b".to_string()]],
        }
    }

    fn current() -> AllocationMap {
        [("spout", 3), ("a", 1), ("b", 1)]
            .into_iter()
            .map(|(id, n)| (id.to_string(), n))
            .collect()
    }

    fn decide(target_ms: f64) -> AllocationDecision {
        let network = network();
        let outcome = Optimizer::new(&AllocConfig::default())
            .optimize(&network, 12.0, target_ms, &current(), 4)
            .unwrap();
        DecisionAssembler::new(target_ms, 4).assemble(&current(), network, outcome, "split_queue")
    }

    #[test]
    fn test_source_preserved_in_both_maps() {
        let decision = decide(50.0);
        assert_eq!(decision.applied["spout"], 3);
        assert_eq!(decision.minimal.as_ref().unwrap()["spout"], 3);
        assert_eq!(decision.applied.len(), 3);
        assert!(decision.changes(&current()));
    }

    #[test]
    fn test_minimal_omitted_when_infeasible() {
        let decision = decide(1.0);
        assert_eq!(decision.status, AllocStatus::Infeasible);
        assert!(decision.minimal.is_none());
        assert!(decision.context.latency.projected_minimal_ms.is_none());
        assert!(decision.context.stages["a"].minimal_executors.is_none());
    }

    #[test]
    fn test_context_carries_diagnostics() {
        let decision = decide(50.0);
        let context = &decision.context;
        assert_eq!(context.latency.realized_ms, 12.0);
        assert_eq!(context.latency.target_ms, 50.0);
        assert_eq!(context.waiting_model, "split_queue");
        assert_eq!(context.source.id, "spout");
        assert_eq!(context.network.len(), 2);
        assert_eq!(context.max_available_executors, 4);

        let a = &context.stages["a"];
        assert!((a.utilization.unwrap() - 100.0 / 150.0).abs() < 1e-9);
        assert!(a.applied_utilization.unwrap() < a.utilization.unwrap());
        assert!(a.stable);
        assert!(!a.no_data);

        let b = &context.stages["b"];
        assert!(b.no_data);
        assert!(b.boosted);
        assert!(b.utilization.is_none());
        assert!(!b.recv_queue_normal);
        assert_eq!(b.applied_executors, 2);
    }

    #[test]
    fn test_overlay_keeps_untouched_entries() {
        let merged = overlay(&current(), &[("a".to_string(), 4)].into_iter().collect());
        assert_eq!(merged["a"], 4);
        assert_eq!(merged["b"], 1);
        assert_eq!(merged["spout"], 3);
    }

    #[test]
    fn test_decision_serializes_status_codes() {
        let decision = decide(50.0);
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["status"], "OK_ALREADY_MET");
        assert_eq!(json["applied"]["spout"], 3);
    }
}
