//! Queueing network construction
//!
//! Turns the composite samples of one evaluation into a source node and one
//! service node per processing stage. Nodes are rebuilt from scratch every
//! evaluation and handed to the optimizer by value.

mod waiting;

pub use waiting::{erlang_c, model_for, utilization, PooledQueue, SplitQueue, WaitingTimeModel};

use crate::config::{AllocConfig, ServiceVariabilityMode};
use crate::error::{AllocError, Result};
use crate::models::{AllocationMap, CompositeSample};
use crate::topology::{Topology, TopologyShape};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Model of the single source stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceNode {
    pub id: String,
    pub executors: u32,
    /// Average completed end-to-end latency observed over the window
    pub realized_latency_ms: f64,
    pub completed_count: u64,
    pub duration_ms: u64,
    /// Rate at which units leave the source into the network
    pub leave_rate: f64,
    /// External arrival rate into the source's receive queue
    pub external_arrival_rate: f64,
    /// Completed units per second, corrected for metric sub-sampling
    pub completion_rate: f64,
    /// SCV of the source's emission inter-arrival times
    pub emit_scv: f64,
}

/// Service-time variability class of a stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceVariability {
    Exponential,
    General { scv: f64 },
}

impl ServiceVariability {
    pub fn scv(&self) -> f64 {
        match self {
            ServiceVariability::Exponential => 1.0,
            ServiceVariability::General { scv } => *scv,
        }
    }
}

/// Model of one processing stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub id: String,
    /// Executor count the metrics were gathered under
    pub executors: u32,
    /// Total arrival rate into the stage (per second)
    pub lambda: f64,
    /// Per-executor service rate; `None` when the stage processed nothing
    pub mu: Option<f64>,
    /// Offered load `lambda / mu`, in executors; `None` with `mu`
    pub rho: Option<f64>,
    pub mean_service_ms: f64,
    pub service: ServiceVariability,
    /// SCV of inter-arrival times at the stage's receive queue
    pub arrival_scv: f64,
    /// `lambda` relative to the source leave rate; `None` when the source emitted nothing
    pub io_ratio: Option<f64>,
    pub processed_count: u64,
    /// Processed units per second, corrected for metric sub-sampling
    pub process_rate: f64,
    pub send_queue_normal: bool,
    pub recv_queue_normal: bool,
}

impl ServiceNode {
    /// False when the window holds no processed units and `mu` is unknown
    pub fn has_data(&self) -> bool {
        self.mu.is_some()
    }

    /// Arrival rate projected for a given source leave rate
    pub fn arrival_rate_for(&self, source_leave_rate: f64) -> f64 {
        match self.io_ratio {
            Some(ratio) if source_leave_rate.is_finite() && source_leave_rate >= 0.0 => {
                ratio * source_leave_rate
            }
            _ => self.lambda,
        }
    }

    /// Per-executor utilization at `executors`; `None` without data
    pub fn utilization(&self, executors: u32) -> Option<f64> {
        self.mu.map(|mu| utilization(self.lambda, mu, executors))
    }

    /// Smallest executor count keeping the stage stable
    pub fn min_stable_executors(&self) -> Option<u32> {
        self.rho.map(|rho| (rho.floor() as u32).saturating_add(1))
    }
}

/// Source node, service nodes and the paths between them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueingNetwork {
    pub source: SourceNode,
    pub stages: BTreeMap<String, ServiceNode>,
    pub paths: Vec<Vec<String>>,
}

impl QueueingNetwork {
    /// Stages flagged for having processed nothing during the window
    pub fn no_data_stages(&self) -> impl Iterator<Item = &str> {
        self.stages
            .values()
            .filter(|node| !node.has_data())
            .map(|node| node.id.as_str())
    }
}

/// Builds a [`QueueingNetwork`] from composite samples
pub struct NetworkBuilder<'a> {
    topology: &'a Topology,
    config: &'a AllocConfig,
}

impl<'a> NetworkBuilder<'a> {
    pub fn new(topology: &'a Topology, config: &'a AllocConfig) -> Self {
        Self { topology, config }
    }

    pub fn build(
        &self,
        composites: &BTreeMap<String, CompositeSample>,
        current: &AllocationMap,
    ) -> Result<QueueingNetwork> {
        match self.topology.shape() {
            TopologyShape::SingleSource => self.build_single_source(composites, current),
        }
    }

    fn build_single_source(
        &self,
        composites: &BTreeMap<String, CompositeSample>,
        current: &AllocationMap,
    ) -> Result<QueueingNetwork> {
        let source_id = self.topology.source();
        let source = self.source_node(
            source_id,
            composite_for(composites, source_id)?,
            executors_for(current, source_id)?,
        );

        let mut stages = BTreeMap::new();
        for id in self.topology.processing_stages() {
            let node = self.service_node(
                id,
                composite_for(composites, id)?,
                executors_for(current, id)?,
                source.leave_rate,
            );
            stages.insert(id.to_string(), node);
        }

        Ok(QueueingNetwork {
            source,
            stages,
            paths: self.topology.paths().to_vec(),
        })
    }

    fn source_node(&self, id: &str, sample: &CompositeSample, executors: u32) -> SourceNode {
        let n = executors as f64;
        let leave_rate = sample.departure_rate_per_sec * n / self.config.ack_factor;
        let completion_rate = self.corrected_rate(sample.latency.count, n, sample.duration_secs());

        debug!(
            stage = %id,
            executors,
            completed = sample.latency.count,
            duration_secs = sample.duration_secs(),
            window = sample.sample_count,
            completion_rate,
            "Source window"
        );
        debug!(
            stage = %id,
            send_queue_len = sample.send_queue.avg_length,
            recv_queue_len = sample.recv_queue.avg_length,
            complete_latency_ms = sample.latency.avg_ms,
            leave_rate,
            emit_scv = sample.send_queue.interarrival_scv,
            "Source model"
        );

        SourceNode {
            id: id.to_string(),
            executors,
            realized_latency_ms: sample.latency.avg_ms,
            completed_count: sample.latency.count,
            duration_ms: sample.duration_ms,
            leave_rate,
            external_arrival_rate: sample.arrival_rate_per_sec * n,
            completion_rate,
            emit_scv: sample.send_queue.interarrival_scv,
        }
    }

    fn service_node(
        &self,
        id: &str,
        sample: &CompositeSample,
        executors: u32,
        source_leave_rate: f64,
    ) -> ServiceNode {
        let n = executors as f64;
        let lambda = sample.arrival_rate_per_sec * n;
        let mean_service_ms = sample.latency.avg_ms;
        let measured =
            sample.latency.count > 0 && mean_service_ms.is_finite() && mean_service_ms > 0.0;

        let mu = measured.then(|| 1000.0 / mean_service_ms);
        let rho = mu.map(|mu| lambda / mu);
        if !measured {
            warn!(
                stage = %id,
                executors,
                arrival_rate = lambda,
                "Stage processed no units in the window; service rate unknown"
            );
        }

        let service = match self.config.service_variability {
            ServiceVariabilityMode::Measured
                if sample.latency.count >= 2 && sample.latency.scv.is_finite() =>
            {
                ServiceVariability::General {
                    scv: sample.latency.scv.max(0.0),
                }
            }
            _ => ServiceVariability::Exponential,
        };

        let recv = &sample.recv_queue;
        let arrival_scv = if recv.arrival_rate_per_sec > 0.0 && recv.interarrival_scv.is_finite() {
            recv.interarrival_scv.max(0.0)
        } else {
            1.0
        };

        let io_ratio = (source_leave_rate > 0.0).then(|| lambda / source_leave_rate);
        let process_rate = self.corrected_rate(sample.latency.count, n, sample.duration_secs());

        debug!(
            stage = %id,
            executors,
            processed = sample.latency.count,
            duration_secs = sample.duration_secs(),
            window = sample.sample_count,
            process_rate,
            "Stage window"
        );
        debug!(
            stage = %id,
            lambda,
            mu = ?mu,
            rho = ?rho,
            service_ms = mean_service_ms,
            service_scv = service.scv(),
            arrival_scv,
            io_ratio = ?io_ratio,
            "Stage model"
        );

        ServiceNode {
            id: id.to_string(),
            executors,
            lambda,
            mu,
            rho,
            mean_service_ms,
            service,
            arrival_scv,
            io_ratio,
            processed_count: sample.latency.count,
            process_rate,
            send_queue_normal: sample.send_queue.avg_length < self.config.send_queue_threshold,
            recv_queue_normal: sample.recv_queue.avg_length < self.config.recv_queue_threshold(),
        }
    }

    fn corrected_rate(&self, count: u64, executors: f64, duration_secs: f64) -> f64 {
        if duration_secs <= 0.0 {
            return 0.0;
        }
        count as f64 * executors / (duration_secs * self.config.sample_rate)
    }
}

fn composite_for<'c>(
    composites: &'c BTreeMap<String, CompositeSample>,
    stage: &str,
) -> Result<&'c CompositeSample> {
    composites
        .get(stage)
        .ok_or_else(|| AllocError::UnknownStage(stage.to_string()))
}

fn executors_for(current: &AllocationMap, stage: &str) -> Result<u32> {
    current
        .get(stage)
        .copied()
        .ok_or_else(|| AllocError::MissingAllocation(stage.to_string()))
}
