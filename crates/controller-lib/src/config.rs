//! Allocation engine configuration

use crate::error::{AllocError, Result};
use serde::{Deserialize, Serialize};

/// Waiting-time approximation used to project per-stage queueing delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitingModelKind {
    /// Each executor is an independent G/G/1 queue fed an equal share of the load
    #[default]
    SplitQueue,
    /// The whole stage is a single G/G/k queue (Allen-Cunneen over Erlang C)
    PooledQueue,
}

/// How the service-time variability of a stage is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceVariabilityMode {
    /// General service with the measured SCV when enough units were processed
    #[default]
    Measured,
    /// Always assume exponential service times
    Exponential,
}

/// How the source's realized latency enters the end-to-end projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyBaseline {
    /// Realized source latency plus the modeled path latency
    #[default]
    Additive,
    /// Modeled path latency scaled by realized / modeled at the current allocation
    Calibrated,
}

/// Where the minimal-allocation search starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinimalSeed {
    /// The current allocation; the minimal map never shrinks a stage
    #[default]
    Current,
    /// The smallest stable count per measured stage; may shrink over-provisioned stages
    StabilityFloor,
}

/// Treatment of stages that processed nothing during the window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoDataPolicy {
    /// Give the stage one extra executor in the applied allocation once no
    /// measured stage is unstable
    #[default]
    Boost,
    /// Carry the stage's current count unchanged
    Hold,
}

/// Allocation engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocConfig {
    /// Number of samples kept per stage
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Samples that may be missing from a full window before it counts as warm
    #[serde(default)]
    pub warmup_ignore: usize,

    /// End-to-end latency objective in milliseconds
    #[serde(default = "default_target_latency_ms")]
    pub target_latency_ms: f64,

    /// Average send-queue length above which a stage is reported as backed up
    #[serde(default = "default_send_queue_threshold")]
    pub send_queue_threshold: f64,

    /// Fraction of the receive buffer above which a stage is reported as backed up
    #[serde(default = "default_recv_queue_threshold_ratio")]
    pub recv_queue_threshold_ratio: f64,

    /// Receive buffer capacity of an executor
    #[serde(default = "default_max_recv_queue_size")]
    pub max_recv_queue_size: u32,

    /// Fraction of units the metrics pipeline samples
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    /// Divisor applied to the source departure rate for acknowledgment traffic
    #[serde(default = "default_ack_factor")]
    pub ack_factor: f64,

    #[serde(default)]
    pub waiting_model: WaitingModelKind,

    #[serde(default)]
    pub service_variability: ServiceVariabilityMode,

    #[serde(default)]
    pub latency_baseline: LatencyBaseline,

    #[serde(default)]
    pub minimal_seed: MinimalSeed,

    #[serde(default)]
    pub no_data_policy: NoDataPolicy,

    /// Smallest per-step latency gain worth another executor in the applied allocation
    #[serde(default = "default_min_improvement_ms")]
    pub min_improvement_ms: f64,
}

fn default_window_size() -> usize {
    3
}

fn default_target_latency_ms() -> f64 {
    5000.0
}

fn default_send_queue_threshold() -> f64 {
    5.0
}

fn default_recv_queue_threshold_ratio() -> f64 {
    0.6
}

fn default_max_recv_queue_size() -> u32 {
    1024
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_ack_factor() -> f64 {
    2.0
}

fn default_min_improvement_ms() -> f64 {
    0.5
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            warmup_ignore: 0,
            target_latency_ms: default_target_latency_ms(),
            send_queue_threshold: default_send_queue_threshold(),
            recv_queue_threshold_ratio: default_recv_queue_threshold_ratio(),
            max_recv_queue_size: default_max_recv_queue_size(),
            sample_rate: default_sample_rate(),
            ack_factor: default_ack_factor(),
            waiting_model: WaitingModelKind::default(),
            service_variability: ServiceVariabilityMode::default(),
            latency_baseline: LatencyBaseline::default(),
            minimal_seed: MinimalSeed::default(),
            no_data_policy: NoDataPolicy::default(),
            min_improvement_ms: default_min_improvement_ms(),
        }
    }
}

impl AllocConfig {
    /// Samples each stage needs since the last reset before the window is warm
    pub fn required_samples(&self) -> usize {
        self.window_size.saturating_sub(self.warmup_ignore)
    }

    /// Receive-queue length above which a stage is reported as backed up
    pub fn recv_queue_threshold(&self) -> f64 {
        self.recv_queue_threshold_ratio * self.max_recv_queue_size as f64
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(AllocError::InvalidConfig(
                "window_size must be at least 1".to_string(),
            ));
        }
        if self.warmup_ignore >= self.window_size {
            return Err(AllocError::InvalidConfig(format!(
                "warmup_ignore ({}) must be smaller than window_size ({})",
                self.warmup_ignore, self.window_size
            )));
        }
        if !(self.target_latency_ms.is_finite() && self.target_latency_ms > 0.0) {
            return Err(AllocError::InvalidConfig(format!(
                "target_latency_ms must be positive, got {}",
                self.target_latency_ms
            )));
        }
        if !(self.sample_rate > 0.0 && self.sample_rate <= 1.0) {
            return Err(AllocError::InvalidConfig(format!(
                "sample_rate must be in (0, 1], got {}",
                self.sample_rate
            )));
        }
        if !(self.ack_factor.is_finite() && self.ack_factor > 0.0) {
            return Err(AllocError::InvalidConfig(format!(
                "ack_factor must be positive, got {}",
                self.ack_factor
            )));
        }
        if !(self.recv_queue_threshold_ratio > 0.0 && self.recv_queue_threshold_ratio <= 1.0) {
            return Err(AllocError::InvalidConfig(format!(
                "recv_queue_threshold_ratio must be in (0, 1], got {}",
                self.recv_queue_threshold_ratio
            )));
        }
        if !(self.send_queue_threshold >= 0.0) {
            return Err(AllocError::InvalidConfig(format!(
                "send_queue_threshold must not be negative, got {}",
                self.send_queue_threshold
            )));
        }
        if !(self.min_improvement_ms >= 0.0) {
            return Err(AllocError::InvalidConfig(format!(
                "min_improvement_ms must not be negative, got {}",
                self.min_improvement_ms
            )));
        }
        Ok(())
    }
}
