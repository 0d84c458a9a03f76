//! Observability for the controller
//!
//! Provides:
//! - Prometheus metrics (evaluation latency, decisions by status, projected latency, ingestion)
//! - Structured logging of controller events with tracing

use crate::decision::AllocationDecision;
use crate::models::AllocationMap;
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Evaluation latency buckets in seconds; evaluations are pure in-memory work
const EVALUATION_BUCKETS: &[f64] = &[
    0.00001, 0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.05, 0.1,
];

static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

struct ControllerMetricsInner {
    evaluation_latency_seconds: Histogram,
    evaluations: IntCounterVec,
    evaluation_errors: IntCounter,
    projected_latency_ms: GaugeVec,
    allocated_executors: IntGauge,
    history_resets: IntCounter,
    samples_ingested: IntCounter,
    stale_samples_dropped: IntCounter,
    stages_tracked: IntGauge,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            evaluation_latency_seconds: register_histogram!(
                "drs_controller_evaluation_latency_seconds",
                "Time spent on one allocation evaluation",
                EVALUATION_BUCKETS.to_vec()
            )
            .expect("Failed to register evaluation_latency_seconds"),

            evaluations: register_int_counter_vec!(
                "drs_controller_evaluations_total",
                "Evaluations by outcome status",
                &["status"]
            )
            .expect("Failed to register evaluations"),

            evaluation_errors: register_int_counter!(
                "drs_controller_evaluation_errors_total",
                "Evaluations that failed with an error"
            )
            .expect("Failed to register evaluation_errors"),

            projected_latency_ms: register_gauge_vec!(
                "drs_controller_projected_latency_ms",
                "Projected end-to-end latency of the last decision",
                &["allocation"]
            )
            .expect("Failed to register projected_latency_ms"),

            allocated_executors: register_int_gauge!(
                "drs_controller_allocated_executors",
                "Executors held by processing stages in the current allocation"
            )
            .expect("Failed to register allocated_executors"),

            history_resets: register_int_counter!(
                "drs_controller_history_resets_total",
                "Metric history resets after committed allocation changes"
            )
            .expect("Failed to register history_resets"),

            samples_ingested: register_int_counter!(
                "drs_controller_samples_ingested_total",
                "Stage samples accepted into the metrics window"
            )
            .expect("Failed to register samples_ingested"),

            stale_samples_dropped: register_int_counter!(
                "drs_controller_stale_samples_dropped_total",
                "Samples dropped because they predate the last allocation change"
            )
            .expect("Failed to register stale_samples_dropped"),

            stages_tracked: register_int_gauge!(
                "drs_controller_stages_tracked",
                "Stages tracked by the metrics store"
            )
            .expect("Failed to register stages_tracked"),
        }
    }
}

/// Handle to the process-wide controller metrics
#[derive(Clone)]
pub struct ControllerMetrics {
    _private: (),
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    /// Create a handle, registering the metrics on first use
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControllerMetricsInner {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new)
    }

    pub fn observe_evaluation_latency(&self, duration_secs: f64) {
        self.inner()
            .evaluation_latency_seconds
            .observe(duration_secs);
    }

    /// Count an evaluation under its status label
    pub fn inc_evaluation(&self, status: &str) {
        self.inner().evaluations.with_label_values(&[status]).inc();
    }

    pub fn evaluation_count(&self, status: &str) -> u64 {
        self.inner().evaluations.with_label_values(&[status]).get()
    }

    pub fn inc_evaluation_errors(&self) {
        self.inner().evaluation_errors.inc();
    }

    /// Publish the projections of a decision; unstable projections are cleared to -1
    pub fn set_projected_latency(&self, decision: &AllocationDecision) {
        let latency = &decision.context.latency;
        for (label, value) in [
            ("current", latency.projected_current_ms),
            ("minimal", latency.projected_minimal_ms),
            ("applied", latency.projected_applied_ms),
        ] {
            self.inner()
                .projected_latency_ms
                .with_label_values(&[label])
                .set(value.unwrap_or(-1.0));
        }
    }

    pub fn set_allocated_executors(&self, count: i64) {
        self.inner().allocated_executors.set(count);
    }

    pub fn inc_history_resets(&self) {
        self.inner().history_resets.inc();
    }

    pub fn add_samples_ingested(&self, count: u64) {
        self.inner().samples_ingested.inc_by(count);
    }

    pub fn add_stale_samples_dropped(&self, count: u64) {
        self.inner().stale_samples_dropped.inc_by(count);
    }

    pub fn set_stages_tracked(&self, count: i64) {
        self.inner().stages_tracked.set(count);
    }
}

/// Structured logger for controller events
#[derive(Clone)]
pub struct StructuredLogger {
    controller_id: String,
}

impl StructuredLogger {
    pub fn new(controller_id: impl Into<String>) -> Self {
        Self {
            controller_id: controller_id.into(),
        }
    }

    pub fn log_startup(&self, version: &str, stages: usize, waiting_model: &str) {
        info!(
            event = "controller_started",
            controller = %self.controller_id,
            controller_version = %version,
            stages = stages,
            waiting_model = %waiting_model,
            "Allocation controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            controller = %self.controller_id,
            reason = %reason,
            "Allocation controller shutting down"
        );
    }

    /// Log an emitted decision; infeasible decisions are logged as warnings
    pub fn log_decision(&self, tick: u64, decision: &AllocationDecision) {
        let latency = &decision.context.latency;
        let applied = format_allocation(&decision.applied);
        let minimal = decision.minimal.as_ref().map(format_allocation);
        if decision.status == crate::optimizer::AllocStatus::Infeasible {
            warn!(
                event = "decision_emitted",
                controller = %self.controller_id,
                tick = tick,
                status = %decision.status,
                realized_ms = latency.realized_ms,
                target_ms = latency.target_ms,
                projected_applied_ms = ?latency.projected_applied_ms,
                applied = %applied,
                "Latency target unreachable within budget, applying best effort"
            );
        } else {
            info!(
                event = "decision_emitted",
                controller = %self.controller_id,
                tick = tick,
                status = %decision.status,
                realized_ms = latency.realized_ms,
                target_ms = latency.target_ms,
                projected_current_ms = ?latency.projected_current_ms,
                projected_minimal_ms = ?latency.projected_minimal_ms,
                projected_applied_ms = ?latency.projected_applied_ms,
                minimal = ?minimal,
                applied = %applied,
                "Allocation decision emitted"
            );
        }
    }

    pub fn log_insufficient_history(&self, tick: u64, collected: usize, required: usize) {
        info!(
            event = "insufficient_history",
            controller = %self.controller_id,
            tick = tick,
            collected = collected,
            required = required,
            "Metrics window still warming up"
        );
    }

    pub fn log_allocation_committed(&self, allocation: &AllocationMap, epoch: u64) {
        info!(
            event = "allocation_committed",
            controller = %self.controller_id,
            allocation = %format_allocation(allocation),
            epoch = epoch,
            "Allocation committed, metric history reset"
        );
    }

    pub fn log_no_data_stage(&self, stage: &str, executors: u32) {
        warn!(
            event = "no_data_stage",
            controller = %self.controller_id,
            stage = %stage,
            executors = executors,
            "Stage processed nothing in the window"
        );
    }
}

/// `a=2,b=3` rendering for log fields
pub fn format_allocation(allocation: &AllocationMap) -> String {
    allocation
        .iter()
        .map(|(id, n)| format!("{}={}", id, n))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_metrics_creation() {
        let metrics = ControllerMetrics::new();
        metrics.observe_evaluation_latency(0.0002);
        metrics.inc_evaluation_errors();
        metrics.set_allocated_executors(6);
        metrics.inc_history_resets();
        metrics.add_samples_ingested(3);
        metrics.add_stale_samples_dropped(1);
        metrics.set_stages_tracked(4);

        let before = metrics.evaluation_count("TEST_STATUS");
        metrics.inc_evaluation("TEST_STATUS");
        assert_eq!(metrics.evaluation_count("TEST_STATUS"), before + 1);
    }

    #[test]
    fn test_format_allocation() {
        let allocation: AllocationMap = [("b".to_string(), 3), ("a".to_string(), 2)]
            .into_iter()
            .collect();
        assert_eq!(format_allocation(&allocation), "a=2,b=3");
        assert_eq!(format_allocation(&AllocationMap::new()), "");
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("drs-test");
        assert_eq!(logger.controller_id, "drs-test");
        logger.log_insufficient_history(1, 0, 3);
    }
}
