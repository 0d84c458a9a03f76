//! Allocation engine
//!
//! Ties the metrics store, network builder, optimizer and assembler into one
//! evaluation per control tick. Evaluations must be serialized by the caller;
//! only sample ingestion may run concurrently.

use crate::config::AllocConfig;
use crate::decision::{AllocationDecision, DecisionAssembler};
use crate::error::{AllocError, Result};
use crate::history::MetricsStore;
use crate::models::{AllocationMap, CompositeSample};
use crate::network::NetworkBuilder;
use crate::optimizer::Optimizer;
use crate::topology::Topology;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info_span};

/// Result of one evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// The metrics window has not warmed up since the last reset
    InsufficientHistory { collected: usize, required: usize },
    Decided(Box<AllocationDecision>),
}

impl Evaluation {
    pub fn status_label(&self) -> &'static str {
        match self {
            Evaluation::InsufficientHistory { .. } => "INSUFFICIENT_HISTORY",
            Evaluation::Decided(decision) => decision.status.as_str(),
        }
    }

    pub fn decision(&self) -> Option<&AllocationDecision> {
        match self {
            Evaluation::Decided(decision) => Some(decision),
            Evaluation::InsufficientHistory { .. } => None,
        }
    }
}

/// Queueing-network allocation engine for one pipeline
#[derive(Debug)]
pub struct AllocEngine {
    topology: Topology,
    config: AllocConfig,
    store: Arc<MetricsStore>,
    optimizer: Optimizer,
}

impl AllocEngine {
    /// Validate `config` and create an engine tracking every stage of `topology`
    pub fn new(topology: Topology, config: AllocConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(MetricsStore::new(
            topology.all_stages(),
            config.window_size,
            config.warmup_ignore,
        ));
        let optimizer = Optimizer::new(&config);
        Ok(Self {
            topology,
            config,
            store,
            optimizer,
        })
    }

    /// Replace the optimizer, e.g. to plug in another waiting-time model
    pub fn with_optimizer(mut self, optimizer: Optimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Shared handle for the sample ingestion path
    pub fn store(&self) -> Arc<MetricsStore> {
        Arc::clone(&self.store)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn config(&self) -> &AllocConfig {
        &self.config
    }

    /// Name of the waiting-time model projections use
    pub fn waiting_model(&self) -> &'static str {
        self.optimizer.model_name()
    }

    /// Run one evaluation against `current`
    ///
    /// `max_available` bounds the executors of processing stages; the
    /// source's executors are not counted.
    pub fn evaluate(&self, current: &AllocationMap, max_available: u32) -> Result<Evaluation> {
        let span = info_span!(
            "evaluate",
            stages = self.topology.stage_count(),
            max_available
        );
        let _guard = span.enter();

        if !self.store.is_warm() {
            return Ok(self.insufficient());
        }

        let mut composites: BTreeMap<String, CompositeSample> = BTreeMap::new();
        for stage in self.topology.all_stages() {
            match self.store.combine(stage) {
                Ok(composite) => {
                    composites.insert(stage.to_string(), composite);
                }
                // A reset landed between the warm check and the combine
                Err(AllocError::NotWarm { .. }) => return Ok(self.insufficient()),
                Err(e) => return Err(e),
            }
        }

        let network =
            NetworkBuilder::new(&self.topology, &self.config).build(&composites, current)?;
        let outcome = self.optimizer.optimize(
            &network,
            network.source.realized_latency_ms,
            self.config.target_latency_ms,
            current,
            max_available,
        )?;
        debug!(
            status = %outcome.status,
            boosted = outcome.boosted.len(),
            "Optimizer outcome"
        );

        let decision = DecisionAssembler::new(self.config.target_latency_ms, max_available)
            .assemble(current, network, outcome, self.optimizer.model_name());
        Ok(Evaluation::Decided(Box::new(decision)))
    }

    /// Notification hook: the caller committed a new allocation
    ///
    /// Clears all history so the next decision only sees post-change metrics.
    pub fn allocation_changed(&self) {
        self.store.reset();
    }

    fn insufficient(&self) -> Evaluation {
        let collected = self.store.collected();
        let required = self.store.required();
        debug!(collected, required, "Metrics window not warm");
        Evaluation::InsufficientHistory {
            collected,
            required,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LatencyStats, QueueStats, RawSample};
    use crate::optimizer::AllocStatus;

    fn raw(arrival: f64, departure: f64, latency_ms: f64, count: u64) -> RawSample {
        RawSample {
            arrival_rate_per_sec: arrival,
            departure_rate_per_sec: departure,
            send_queue: QueueStats {
                avg_length: 0.5,
                arrival_rate_per_sec: departure,
                interarrival_scv: 1.0,
            },
            recv_queue: QueueStats {
                avg_length: 2.0,
                arrival_rate_per_sec: arrival,
                interarrival_scv: 1.0,
            },
            latency: LatencyStats {
                avg_ms: latency_ms,
                scv: 1.0,
                count,
            },
            duration_ms: 10_000,
        }
    }

    fn engine(window_size: usize) -> AllocEngine {
        let topology = Topology::chain("spout", &["a"]).unwrap();
        let config = AllocConfig {
            window_size,
            target_latency_ms: 50.0,
            ..Default::default()
        };
        AllocEngine::new(topology, config).unwrap()
    }

    fn feed(engine: &AllocEngine) {
        let store = engine.store();
        // Source: 200/s per executor leaving, halved for acks -> 100/s
        store.put("spout", raw(100.0, 200.0, 10.0, 1000)).unwrap();
        // Stage: 100/s arriving at one executor, 6.67ms service
        store
            .put("a", raw(100.0, 100.0, 1000.0 / 150.0, 1000))
            .unwrap();
    }

    fn current() -> AllocationMap {
        [("spout".to_string(), 1), ("a".to_string(), 1)]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_cold_engine_declines() {
        let engine = engine(2);
        feed(&engine);
        let evaluation = engine.evaluate(&current(), 4).unwrap();
        assert_eq!(
            evaluation,
            Evaluation::InsufficientHistory {
                collected: 1,
                required: 2
            }
        );
        assert_eq!(evaluation.status_label(), "INSUFFICIENT_HISTORY");
        assert!(evaluation.decision().is_none());
    }

    #[test]
    fn test_warm_engine_decides() {
        let engine = engine(2);
        feed(&engine);
        feed(&engine);
        let evaluation = engine.evaluate(&current(), 4).unwrap();
        let decision = evaluation.decision().unwrap();
        // 10ms realized at the source + 20ms at the stage
        assert_eq!(decision.status, AllocStatus::OkAlreadyMet);
        assert!((decision.context.latency.projected_current_ms.unwrap() - 30.0).abs() < 1e-6);
        assert_eq!(decision.applied["spout"], 1);
        assert_eq!(decision.applied["a"], 4);
        assert_eq!(decision.minimal.as_ref().unwrap()["a"], 1);
    }

    #[test]
    fn test_allocation_change_restarts_warmup() {
        let engine = engine(1);
        feed(&engine);
        assert!(engine.evaluate(&current(), 4).unwrap().decision().is_some());

        engine.allocation_changed();
        assert!(matches!(
            engine.evaluate(&current(), 4).unwrap(),
            Evaluation::InsufficientHistory { collected: 0, .. }
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let topology = Topology::chain("spout", &["a"]).unwrap();
        let config = AllocConfig {
            window_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            AllocEngine::new(topology, config),
            Err(AllocError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_allocation_is_an_error() {
        let engine = engine(1);
        feed(&engine);
        let partial: AllocationMap = [("spout".to_string(), 1)].into_iter().collect();
        assert_eq!(
            engine.evaluate(&partial, 4).unwrap_err(),
            AllocError::MissingAllocation("a".to_string())
        );
    }
}
