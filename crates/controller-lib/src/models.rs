//! Core data models for the allocation engine

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stage identifier -> executor count
pub type AllocationMap = BTreeMap<String, u32>;

/// Total executors held by an allocation
pub fn total_executors(allocation: &AllocationMap) -> u32 {
    allocation.values().sum()
}

/// Statistics for one side (send or receive) of an executor queue
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Time-averaged queue length
    pub avg_length: f64,
    /// Arrival rate measured from inter-arrival times (per executor, per second)
    pub arrival_rate_per_sec: f64,
    /// Squared coefficient of variation of inter-arrival times
    pub interarrival_scv: f64,
}

/// Latency distribution summary
///
/// For the source stage this is the completed end-to-end latency, for
/// processing stages it is the per-unit processing time.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    pub avg_ms: f64,
    #[serde(default)]
    pub scv: f64,
    pub count: u64,
}

/// One aggregated sample for a stage, collected once per collection tick
///
/// Rates are per-executor averages over the sample duration.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RawSample {
    pub arrival_rate_per_sec: f64,
    pub departure_rate_per_sec: f64,
    #[serde(default)]
    pub send_queue: QueueStats,
    #[serde(default)]
    pub recv_queue: QueueStats,
    pub latency: LatencyStats,
    pub duration_ms: u64,
}

/// Horizontal combination of a stage's windowed samples
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CompositeSample {
    pub arrival_rate_per_sec: f64,
    pub departure_rate_per_sec: f64,
    pub send_queue: QueueStats,
    pub recv_queue: QueueStats,
    pub latency: LatencyStats,
    pub duration_ms: u64,
    /// Number of raw samples merged into this composite
    pub sample_count: usize,
}

impl CompositeSample {
    pub fn duration_secs(&self) -> f64 {
        self.duration_ms as f64 / 1000.0
    }
}
