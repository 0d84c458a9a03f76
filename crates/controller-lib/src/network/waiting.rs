//! Waiting-time approximations for general arrival and service processes
//!
//! Both models use the Allen-Cunneen correction: the exponential waiting
//! time is scaled by `(Ca² + Cs²) / 2`, which is exactly 1 when arrivals are
//! Poisson and service is exponential.

use crate::config::WaitingModelKind;

/// Projects the mean time a unit spends queued at a stage
pub trait WaitingTimeModel: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Mean queueing delay in seconds for a stage with total arrival rate
    /// `lambda`, per-executor service rate `mu` and `executors` workers.
    ///
    /// Returns `None` when the stage would be unstable (utilization >= 1).
    fn waiting_secs(
        &self,
        lambda: f64,
        mu: f64,
        executors: u32,
        ca2: f64,
        cs2: f64,
    ) -> Option<f64>;
}

/// Build the configured model
pub fn model_for(kind: WaitingModelKind) -> Box<dyn WaitingTimeModel> {
    match kind {
        WaitingModelKind::SplitQueue => Box::new(SplitQueue),
        WaitingModelKind::PooledQueue => Box::new(PooledQueue),
    }
}

/// Per-executor utilization, infinite when there is load but no capacity
pub fn utilization(lambda: f64, mu: f64, executors: u32) -> f64 {
    if lambda <= 0.0 {
        return 0.0;
    }
    if executors == 0 || mu <= 0.0 {
        return f64::INFINITY;
    }
    lambda / (executors as f64 * mu)
}

fn variability_factor(ca2: f64, cs2: f64) -> f64 {
    (ca2.max(0.0) + cs2.max(0.0)) / 2.0
}

/// Each executor modeled as an independent G/G/1 queue fed `lambda / k`
#[derive(Debug, Clone, Copy, Default)]
pub struct SplitQueue;

impl WaitingTimeModel for SplitQueue {
    fn name(&self) -> &'static str {
        "split_queue"
    }

    fn waiting_secs(
        &self,
        lambda: f64,
        mu: f64,
        executors: u32,
        ca2: f64,
        cs2: f64,
    ) -> Option<f64> {
        let rho = utilization(lambda, mu, executors);
        if rho >= 1.0 {
            return None;
        }
        if lambda <= 0.0 {
            return Some(0.0);
        }
        Some(variability_factor(ca2, cs2) * (rho / (1.0 - rho)) / mu)
    }
}

/// The stage modeled as one G/G/k queue over all executors
#[derive(Debug, Clone, Copy, Default)]
pub struct PooledQueue;

impl WaitingTimeModel for PooledQueue {
    fn name(&self) -> &'static str {
        "pooled_queue"
    }

    fn waiting_secs(
        &self,
        lambda: f64,
        mu: f64,
        executors: u32,
        ca2: f64,
        cs2: f64,
    ) -> Option<f64> {
        let rho = utilization(lambda, mu, executors);
        if rho >= 1.0 {
            return None;
        }
        if lambda <= 0.0 {
            return Some(0.0);
        }
        let wait_mmk = erlang_c(executors, lambda / mu) / (executors as f64 * mu - lambda);
        Some(variability_factor(ca2, cs2) * wait_mmk)
    }
}

/// Probability that an arrival has to wait in an M/M/k queue with offered load `a`
///
/// Computed through the Erlang B recursion, which stays stable for large `k`.
pub fn erlang_c(servers: u32, offered_load: f64) -> f64 {
    if servers == 0 {
        return 1.0;
    }
    let mut blocking = 1.0;
    for n in 1..=servers {
        blocking = offered_load * blocking / (n as f64 + offered_load * blocking);
    }
    let rho = offered_load / servers as f64;
    if rho >= 1.0 {
        return 1.0;
    }
    blocking / (1.0 - rho * (1.0 - blocking))
}
