//! Per-stage bounded sample history
//!
//! Samples may be ingested from a collection path running concurrently with
//! evaluation. Each stage window sits behind its own map shard lock, and an
//! epoch counter lets producers drop samples gathered before the last reset.

use super::composite;
use crate::error::{AllocError, Result};
use crate::models::{CompositeSample, RawSample};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Bounded FIFO of samples for one stage
#[derive(Debug, Clone)]
pub struct StageWindow {
    samples: VecDeque<RawSample>,
    capacity: usize,
    /// Samples accepted since the last reset, including evicted ones
    received: usize,
}

impl StageWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            received: 0,
        }
    }

    /// Append a sample, evicting the oldest when full
    pub fn push(&mut self, sample: RawSample) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.received += 1;
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.received = 0;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn received(&self) -> usize {
        self.received
    }

    /// Samples in insertion order, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &RawSample> {
        self.samples.iter()
    }
}

/// Windowed metrics store covering every stage of a topology
#[derive(Debug)]
pub struct MetricsStore {
    windows: DashMap<String, StageWindow>,
    window_size: usize,
    required: usize,
    epoch: AtomicU64,
}

impl MetricsStore {
    /// Create a store tracking `stages`
    ///
    /// A stage is warm once it has received `window_size - warmup_ignore`
    /// samples since the last reset.
    pub fn new<'a>(
        stages: impl IntoIterator<Item = &'a str>,
        window_size: usize,
        warmup_ignore: usize,
    ) -> Self {
        let windows = DashMap::new();
        for stage in stages {
            windows.insert(stage.to_string(), StageWindow::new(window_size));
        }
        Self {
            windows,
            window_size,
            required: window_size.saturating_sub(warmup_ignore),
            epoch: AtomicU64::new(0),
        }
    }

    /// Record a sample for `stage`
    pub fn put(&self, stage: &str, sample: RawSample) -> Result<()> {
        let mut window = self
            .windows
            .get_mut(stage)
            .ok_or_else(|| AllocError::UnknownStage(stage.to_string()))?;
        window.push(sample);
        Ok(())
    }

    /// Record a sample only if it was gathered in the current epoch
    ///
    /// Returns `Ok(false)` when the sample predates the last reset and was
    /// dropped. The epoch is checked while the stage's window is locked, and
    /// [`reset`](Self::reset) advances the epoch before clearing windows, so
    /// a stale sample can never survive a reset.
    pub fn put_for_epoch(&self, epoch: u64, stage: &str, sample: RawSample) -> Result<bool> {
        let mut window = self
            .windows
            .get_mut(stage)
            .ok_or_else(|| AllocError::UnknownStage(stage.to_string()))?;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(stage = %stage, epoch, "Dropping sample from a previous allocation");
            return Ok(false);
        }
        window.push(sample);
        Ok(true)
    }

    /// Current epoch; producers read it before sampling
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// True once every tracked stage has enough samples since the last reset
    pub fn is_warm(&self) -> bool {
        let required = self.required;
        !self.windows.is_empty() && self.windows.iter().all(|w| w.received() >= required)
    }

    /// Smallest per-stage sample count since the last reset
    pub fn collected(&self) -> usize {
        self.windows
            .iter()
            .map(|w| w.received().min(self.required))
            .min()
            .unwrap_or(0)
    }

    /// Samples each stage needs before the store is warm
    pub fn required(&self) -> usize {
        self.required
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Number of samples currently held for `stage`
    pub fn len(&self, stage: &str) -> Option<usize> {
        self.windows.get(stage).map(|w| w.len())
    }

    pub fn stage_count(&self) -> usize {
        self.windows.len()
    }

    /// Combine the window of `stage` into one composite sample
    ///
    /// Fails with [`AllocError::NotWarm`] while any tracked stage is still
    /// warming up; callers are expected to check [`is_warm`](Self::is_warm) first.
    pub fn combine(&self, stage: &str) -> Result<CompositeSample> {
        if !self.windows.contains_key(stage) {
            return Err(AllocError::UnknownStage(stage.to_string()));
        }
        let not_warm = |collected| AllocError::NotWarm {
            stage: stage.to_string(),
            collected,
            required: self.required,
        };
        // No shard guard may be held while the whole map is scanned
        if !self.is_warm() {
            return Err(not_warm(self.collected()));
        }
        let window = self
            .windows
            .get(stage)
            .ok_or_else(|| AllocError::UnknownStage(stage.to_string()))?;
        if window.received() < self.required {
            return Err(not_warm(window.received()));
        }
        Ok(composite::combine(window.iter()))
    }

    /// Drop every stage's history and restart warm-up
    pub fn reset(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        for mut window in self.windows.iter_mut() {
            window.clear();
        }
        debug!(epoch, "Metrics history reset");
    }
}
