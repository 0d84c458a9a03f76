//! Allocation control loop
//!
//! Evaluates the engine once per tick, hands the decision to the decision
//! maker and, when an actuator is attached, applies and commits the result.

use super::{Actuator, DecisionMaker};
use crate::decision::AllocationDecision;
use crate::engine::{AllocEngine, Evaluation};
use crate::error::{AllocError, Result};
use crate::health::{components, HealthRegistry};
use crate::models::{total_executors, AllocationMap};
use crate::observability::{ControllerMetrics, StructuredLogger};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

/// Current allocation of the pipeline, serialized against evaluation
///
/// Evaluation and commits take the same lock, so a commit's history reset
/// can never interleave with an evaluation in flight.
#[derive(Debug)]
pub struct AllocationState {
    engine: Arc<AllocEngine>,
    current: Mutex<AllocationMap>,
    max_available: u32,
}

impl AllocationState {
    pub fn new(
        engine: Arc<AllocEngine>,
        initial: AllocationMap,
        max_available: u32,
    ) -> Result<Self> {
        validate_allocation(&engine, &initial, max_available)?;
        Ok(Self {
            engine,
            current: Mutex::new(initial),
            max_available,
        })
    }

    pub fn engine(&self) -> &Arc<AllocEngine> {
        &self.engine
    }

    pub fn max_available(&self) -> u32 {
        self.max_available
    }

    pub async fn current(&self) -> AllocationMap {
        self.current.lock().await.clone()
    }

    /// Evaluate the engine against the current allocation
    pub async fn evaluate(&self) -> Result<(AllocationMap, Evaluation)> {
        let current = self.current.lock().await;
        let evaluation = self.engine.evaluate(&current, self.max_available)?;
        Ok((current.clone(), evaluation))
    }

    /// Record an allocation the pipeline now runs with
    ///
    /// Returns `Ok(false)` for a no-op commit, which leaves the metric history
    /// alone. A changed allocation resets the history before the lock is released.
    pub async fn commit(&self, allocation: AllocationMap) -> Result<bool> {
        validate_allocation(&self.engine, &allocation, self.max_available)?;
        let mut current = self.current.lock().await;
        if *current == allocation {
            return Ok(false);
        }
        *current = allocation;
        self.engine.allocation_changed();
        Ok(true)
    }

    /// Executors held by processing stages
    pub fn processing_total(&self, allocation: &AllocationMap) -> u32 {
        processing_total(&self.engine, allocation)
    }
}

fn processing_total(engine: &AllocEngine, allocation: &AllocationMap) -> u32 {
    let topology = engine.topology();
    let processing: AllocationMap = allocation
        .iter()
        .filter(|(id, _)| topology.is_processing(id))
        .map(|(id, n)| (id.clone(), *n))
        .collect();
    total_executors(&processing)
}

/// Reject maps that miss a stage, name an unknown one or exceed the budget
fn validate_allocation(
    engine: &AllocEngine,
    allocation: &AllocationMap,
    budget: u32,
) -> Result<()> {
    let topology = engine.topology();
    if let Some(stage) = topology
        .all_stages()
        .find(|id| !allocation.contains_key(*id))
    {
        return Err(AllocError::MissingAllocation(stage.to_string()));
    }
    if let Some(stage) = allocation.keys().find(|id| !topology.contains(id)) {
        return Err(AllocError::UnknownStage(stage.clone()));
    }
    let used = processing_total(engine, allocation);
    if used > budget {
        return Err(AllocError::OverBudget { used, budget });
    }
    Ok(())
}

/// Control loop settings
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub tick_interval: Duration,
    /// Capacity of the outcome channel
    pub channel_size: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            channel_size: 16,
        }
    }
}

/// What happened during one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickOutcome {
    pub tick: u64,
    /// Optimizer status, `INSUFFICIENT_HISTORY` or `ERROR`
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<AllocationDecision>,
    /// Change chosen by the decision maker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal: Option<AllocationMap>,
    /// True when the proposal was applied and committed
    pub actuated: bool,
    pub collected: usize,
    pub required: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub evaluated_at: i64,
}

impl TickOutcome {
    fn new(tick: u64, status: impl Into<String>, required: usize) -> Self {
        Self {
            tick,
            status: status.into(),
            decision: None,
            proposal: None,
            actuated: false,
            collected: 0,
            required,
            error: None,
            evaluated_at: chrono::Utc::now().timestamp(),
        }
    }
}

pub struct ControlLoop {
    state: Arc<AllocationState>,
    decision_maker: Box<dyn DecisionMaker>,
    actuator: Option<Arc<dyn Actuator>>,
    health: Option<HealthRegistry>,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
    config: ControlConfig,
    outcome_tx: mpsc::Sender<TickOutcome>,
    tick: u64,
}

impl ControlLoop {
    pub fn new(
        state: Arc<AllocationState>,
        decision_maker: Box<dyn DecisionMaker>,
        logger: StructuredLogger,
        config: ControlConfig,
    ) -> (Self, mpsc::Receiver<TickOutcome>) {
        let (outcome_tx, outcome_rx) = mpsc::channel(config.channel_size.max(1));
        let control_loop = Self {
            state,
            decision_maker,
            actuator: None,
            health: None,
            metrics: ControllerMetrics::new(),
            logger,
            config,
            outcome_tx,
            tick: 0,
        };
        (control_loop, outcome_rx)
    }

    /// Apply and commit proposals through `actuator`
    pub fn with_actuator(mut self, actuator: Arc<dyn Actuator>) -> Self {
        self.actuator = Some(actuator);
        self
    }

    /// Report engine and loop health to `health`
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Tick until `shutdown` fires
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.tick_interval.as_secs_f64(),
            decision_maker = self.decision_maker.name(),
            actuated = self.actuator.is_some(),
            "Starting allocation control loop"
        );
        if let Some(health) = &self.health {
            health.set_healthy(components::CONTROL_LOOP).await;
        }

        let mut ticker = interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.tick().await;
                    match self.outcome_tx.try_send(outcome) {
                        Ok(()) => {}
                        Err(TrySendError::Full(outcome)) => {
                            warn!(
                                tick = outcome.tick,
                                "Outcome channel full, dropping tick outcome"
                            );
                        }
                        Err(TrySendError::Closed(_)) => {
                            debug!("No receiver for tick outcome");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!(ticks = self.tick, "Shutting down allocation control loop");
                    break;
                }
            }
        }

        if let Some(health) = &self.health {
            health
                .set_unhealthy(components::CONTROL_LOOP, "control loop stopped")
                .await;
        }
    }

    /// Run a single evaluation cycle
    pub async fn tick(&mut self) -> TickOutcome {
        self.tick += 1;
        let tick = self.tick;
        let required = self.state.engine().config().required_samples();

        let start = Instant::now();
        let result = self.state.evaluate().await;
        self.metrics
            .observe_evaluation_latency(start.elapsed().as_secs_f64());

        match result {
            Err(e) => {
                self.metrics.inc_evaluation_errors();
                warn!(tick, error = %e, "Evaluation failed");
                self.set_engine_health(Some(&e)).await;
                let mut outcome = TickOutcome::new(tick, "ERROR", required);
                outcome.error = Some(e.to_string());
                outcome
            }
            Ok((_, Evaluation::InsufficientHistory { collected, required })) => {
                self.metrics.inc_evaluation("INSUFFICIENT_HISTORY");
                self.logger
                    .log_insufficient_history(tick, collected, required);
                self.set_engine_health(None).await;
                let mut outcome = TickOutcome::new(tick, "INSUFFICIENT_HISTORY", required);
                outcome.collected = collected;
                outcome
            }
            Ok((current, Evaluation::Decided(decision))) => {
                self.set_engine_health(None).await;
                self.handle_decision(tick, required, current, *decision)
                    .await
            }
        }
    }

    async fn handle_decision(
        &self,
        tick: u64,
        required: usize,
        current: AllocationMap,
        decision: AllocationDecision,
    ) -> TickOutcome {
        self.metrics.inc_evaluation(decision.status.as_str());
        self.metrics.set_projected_latency(&decision);
        self.logger.log_decision(tick, &decision);
        for (id, stage) in &decision.context.stages {
            if stage.no_data {
                self.logger.log_no_data_stage(id, stage.current_executors);
            }
        }

        let mut outcome = TickOutcome::new(tick, decision.status.as_str(), required);
        outcome.collected = required;
        outcome.proposal = self.decision_maker.make(&decision, &current);

        if let (Some(proposal), Some(actuator)) = (&outcome.proposal, &self.actuator) {
            match self.actuate(actuator.as_ref(), proposal).await {
                Ok(()) => outcome.actuated = true,
                Err(e) => {
                    warn!(tick, error = %e, "Failed to apply allocation");
                    outcome.error = Some(format!("{:#}", e));
                }
            }
        }

        outcome.decision = Some(decision);
        outcome
    }

    async fn actuate(
        &self,
        actuator: &dyn Actuator,
        proposal: &AllocationMap,
    ) -> anyhow::Result<()> {
        actuator.apply(proposal).await?;
        if self.state.commit(proposal.clone()).await? {
            self.metrics.inc_history_resets();
            self.metrics
                .set_allocated_executors(self.state.processing_total(proposal) as i64);
            self.logger
                .log_allocation_committed(proposal, self.state.engine().store().epoch());
        }
        Ok(())
    }

    async fn set_engine_health(&self, error: Option<&AllocError>) {
        let Some(health) = &self.health else {
            return;
        };
        match error {
            Some(e) => {
                health
                    .set_degraded(components::ENGINE, format!("evaluation failed: {}", e))
                    .await
            }
            None => health.set_healthy(components::ENGINE).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocConfig;
    use crate::control::{async_trait, BestEffortDecisionMaker, MinimalDecisionMaker};
    use crate::health::ComponentStatus;
    use crate::models::{LatencyStats, QueueStats, RawSample};
    use crate::topology::Topology;
    use std::sync::Mutex as StdMutex;

    /// Records every allocation it is asked to apply
    #[derive(Default)]
    struct RecordingActuator {
        applied: StdMutex<Vec<AllocationMap>>,
        fail: bool,
    }

    #[async_trait]
    impl Actuator for RecordingActuator {
        async fn apply(&self, allocation: &AllocationMap) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("rebalance rejected");
            }
            self.applied.lock().unwrap().push(allocation.clone());
            Ok(())
        }
    }

    fn raw(arrival: f64, departure: f64, latency_ms: f64) -> RawSample {
        RawSample {
            arrival_rate_per_sec: arrival,
            departure_rate_per_sec: departure,
            send_queue: QueueStats::default(),
            recv_queue: QueueStats {
                avg_length: 1.0,
                arrival_rate_per_sec: arrival,
                interarrival_scv: 1.0,
            },
            latency: LatencyStats {
                avg_ms: latency_ms,
                scv: 1.0,
                count: 1000,
            },
            duration_ms: 10_000,
        }
    }

    fn state() -> Arc<AllocationState> {
        let topology = Topology::chain("spout", &["a"]).unwrap();
        let config = AllocConfig {
            window_size: 1,
            target_latency_ms: 50.0,
            ..Default::default()
        };
        let engine = Arc::new(AllocEngine::new(topology, config).unwrap());
        let initial = [("spout".to_string(), 1), ("a".to_string(), 1)]
            .into_iter()
            .collect();
        Arc::new(AllocationState::new(engine, initial, 4).unwrap())
    }

    fn feed(state: &AllocationState) {
        let store = state.engine().store();
        store.put("spout", raw(100.0, 200.0, 10.0)).unwrap();
        store.put("a", raw(100.0, 100.0, 1000.0 / 150.0)).unwrap();
    }

    fn control_loop(state: Arc<AllocationState>) -> (ControlLoop, mpsc::Receiver<TickOutcome>) {
        ControlLoop::new(
            state,
            Box::new(BestEffortDecisionMaker),
            StructuredLogger::new("test"),
            ControlConfig {
                tick_interval: Duration::from_millis(10),
                channel_size: 4,
            },
        )
    }

    #[tokio::test]
    async fn test_cold_tick_reports_insufficient_history() {
        let (mut control, _rx) = control_loop(state());
        let outcome = control.tick().await;
        assert_eq!(outcome.tick, 1);
        assert_eq!(outcome.status, "INSUFFICIENT_HISTORY");
        assert_eq!(outcome.collected, 0);
        assert_eq!(outcome.required, 1);
        assert!(outcome.decision.is_none());
    }

    #[tokio::test]
    async fn test_tick_without_actuator_only_proposes() {
        let state = state();
        feed(&state);
        let (mut control, _rx) = control_loop(state.clone());
        let outcome = control.tick().await;

        assert_eq!(outcome.status, "OK_ALREADY_MET");
        assert_eq!(outcome.proposal.as_ref().unwrap()["a"], 4);
        assert!(!outcome.actuated);
        assert_eq!(state.current().await["a"], 1);
        assert_eq!(state.engine().store().epoch(), 0);
    }

    #[tokio::test]
    async fn test_actuated_tick_commits_and_resets() {
        let state = state();
        feed(&state);
        let actuator = Arc::new(RecordingActuator::default());
        let health = HealthRegistry::new();
        let (control, _rx) = control_loop(state.clone());
        let mut control = control
            .with_actuator(actuator.clone())
            .with_health(health.clone());

        let outcome = control.tick().await;
        assert!(outcome.actuated);
        assert_eq!(actuator.applied.lock().unwrap().len(), 1);
        assert_eq!(state.current().await["a"], 4);
        assert_eq!(state.engine().store().epoch(), 1);
        assert_eq!(
            health.status(components::ENGINE).await,
            Some(ComponentStatus::Healthy)
        );

        // History was reset by the commit
        let outcome = control.tick().await;
        assert_eq!(outcome.status, "INSUFFICIENT_HISTORY");
    }

    #[tokio::test]
    async fn test_failed_actuation_keeps_allocation() {
        let state = state();
        feed(&state);
        let actuator = Arc::new(RecordingActuator {
            fail: true,
            ..Default::default()
        });
        let (control, _rx) = control_loop(state.clone());
        let mut control = control.with_actuator(actuator);

        let outcome = control.tick().await;
        assert!(!outcome.actuated);
        assert!(outcome.error.unwrap().contains("rebalance rejected"));
        assert_eq!(state.current().await["a"], 1);
        assert_eq!(state.engine().store().epoch(), 0);
    }

    #[tokio::test]
    async fn test_minimal_policy_proposes_nothing_when_met() {
        let state = state();
        feed(&state);
        let (mut control, _rx) = ControlLoop::new(
            state,
            Box::new(MinimalDecisionMaker),
            StructuredLogger::new("test"),
            ControlConfig::default(),
        );
        let outcome = control.tick().await;
        assert_eq!(outcome.status, "OK_ALREADY_MET");
        assert!(outcome.proposal.is_none());
    }

    #[tokio::test]
    async fn test_noop_commit_keeps_history() {
        let state = state();
        feed(&state);
        let current = state.current().await;
        assert!(!state.commit(current).await.unwrap());
        assert_eq!(state.engine().store().epoch(), 0);
        assert!(state.engine().store().is_warm());
    }

    #[tokio::test]
    async fn test_commit_validation() {
        let state = state();
        let missing: AllocationMap = [("a".to_string(), 2)].into_iter().collect();
        assert_eq!(
            state.commit(missing).await.unwrap_err(),
            AllocError::MissingAllocation("spout".to_string())
        );

        let unknown: AllocationMap = [("spout", 1), ("a", 1), ("ghost", 1)]
            .into_iter()
            .map(|(id, n)| (id.to_string(), n))
            .collect();
        assert!(matches!(
            state.commit(unknown).await,
            Err(AllocError::UnknownStage(_))
        ));

        // The source does not count against the budget
        let wide: AllocationMap = [("spout".to_string(), 9), ("a".to_string(), 4)]
            .into_iter()
            .collect();
        assert!(tokio_test::assert_ok!(state.commit(wide).await));
        let over: AllocationMap = [("spout".to_string(), 1), ("a".to_string(), 5)]
            .into_iter()
            .collect();
        assert_eq!(
            state.commit(over).await.unwrap_err(),
            AllocError::OverBudget { used: 5, budget: 4 }
        );
    }

    #[tokio::test]
    async fn test_run_emits_outcomes_until_shutdown() {
        let state = state();
        feed(&state);
        let health = HealthRegistry::new();
        let (control, mut rx) = control_loop(state);
        let control = control.with_health(health.clone());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(control.run(shutdown_rx));
        let first = rx.recv().await.unwrap();
        assert_eq!(first.tick, 1);
        assert_eq!(first.status, "OK_ALREADY_MET");

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(
            health.status(components::CONTROL_LOOP).await,
            Some(ComponentStatus::Unhealthy)
        );
    }
}
