//! Horizontal combination of windowed samples
//!
//! Samples carry per-executor rates and averages. Combining them re-derives
//! the underlying totals (units = rate x duration, latency sum = avg x count,
//! second moment = avg^2 x (1 + scv)) and recomputes rates, averages and
//! SCVs from those totals instead of averaging averages.

use crate::models::{CompositeSample, LatencyStats, QueueStats, RawSample};

/// Merge a window of samples into a single composite
pub fn combine<'a>(samples: impl IntoIterator<Item = &'a RawSample>) -> CompositeSample {
    let mut duration_ms = 0u64;
    let mut sample_count = 0usize;
    let mut arrivals = 0.0;
    let mut departures = 0.0;
    let mut send = QueueAccumulator::default();
    let mut recv = QueueAccumulator::default();
    let mut latency = LatencyAccumulator::default();

    for sample in samples {
        let secs = sample.duration_ms as f64 / 1000.0;
        duration_ms += sample.duration_ms;
        sample_count += 1;
        arrivals += sample.arrival_rate_per_sec * secs;
        departures += sample.departure_rate_per_sec * secs;
        send.add(&sample.send_queue, secs);
        recv.add(&sample.recv_queue, secs);
        latency.add(&sample.latency);
    }

    let total_secs = duration_ms as f64 / 1000.0;
    CompositeSample {
        arrival_rate_per_sec: per_second(arrivals, total_secs),
        departure_rate_per_sec: per_second(departures, total_secs),
        send_queue: send.finish(total_secs),
        recv_queue: recv.finish(total_secs),
        latency: latency.finish(),
        duration_ms,
        sample_count,
    }
}

fn per_second(units: f64, secs: f64) -> f64 {
    if secs > 0.0 {
        units / secs
    } else {
        0.0
    }
}

/// Recover an SCV from first and second moments
fn scv_from_moments(mean: f64, second_moment: f64) -> f64 {
    if mean > 0.0 {
        (second_moment / (mean * mean) - 1.0).max(0.0)
    } else {
        0.0
    }
}

#[derive(Debug, Default)]
struct QueueAccumulator {
    length_secs: f64,
    arrivals: f64,
    /// Sum over arrivals of inter-arrival time
    gap_sum: f64,
    /// Sum over arrivals of squared inter-arrival time
    gap_sq_sum: f64,
}

impl QueueAccumulator {
    fn add(&mut self, queue: &QueueStats, secs: f64) {
        self.length_secs += queue.avg_length * secs;
        let rate = queue.arrival_rate_per_sec;
        if rate > 0.0 && secs > 0.0 {
            let n = rate * secs;
            let gap = 1.0 / rate;
            let scv = if queue.interarrival_scv.is_finite() {
                queue.interarrival_scv.max(0.0)
            } else {
                0.0
            };
            self.arrivals += n;
            self.gap_sum += n * gap;
            self.gap_sq_sum += n * gap * gap * (1.0 + scv);
        }
    }

    fn finish(&self, total_secs: f64) -> QueueStats {
        let (mean_gap, second) = if self.arrivals > 0.0 {
            (self.gap_sum / self.arrivals, self.gap_sq_sum / self.arrivals)
        } else {
            (0.0, 0.0)
        };
        QueueStats {
            avg_length: per_second(self.length_secs, total_secs),
            arrival_rate_per_sec: per_second(self.arrivals, total_secs),
            interarrival_scv: scv_from_moments(mean_gap, second),
        }
    }
}

#[derive(Debug, Default)]
struct LatencyAccumulator {
    count: u64,
    sum_ms: f64,
    sum_sq_ms: f64,
}

impl LatencyAccumulator {
    fn add(&mut self, latency: &LatencyStats) {
        if latency.count == 0 || !latency.avg_ms.is_finite() {
            return;
        }
        let n = latency.count as f64;
        let scv = if latency.scv.is_finite() {
            latency.scv.max(0.0)
        } else {
            0.0
        };
        self.count += latency.count;
        self.sum_ms += n * latency.avg_ms;
        self.sum_sq_ms += n * latency.avg_ms * latency.avg_ms * (1.0 + scv);
    }

    fn finish(&self) -> LatencyStats {
        if self.count == 0 {
            return LatencyStats::default();
        }
        let n = self.count as f64;
        let avg_ms = self.sum_ms / n;
        LatencyStats {
            avg_ms,
            scv: scv_from_moments(avg_ms, self.sum_sq_ms / n),
            count: self.count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rate: f64, avg_ms: f64, count: u64, duration_ms: u64) -> RawSample {
        RawSample {
            arrival_rate_per_sec: rate,
            departure_rate_per_sec: rate,
            send_queue: QueueStats {
                avg_length: 1.0,
                arrival_rate_per_sec: rate,
                interarrival_scv: 1.0,
            },
            recv_queue: QueueStats {
                avg_length: 2.0,
                arrival_rate_per_sec: rate,
                interarrival_scv: 1.0,
            },
            latency: LatencyStats {
                avg_ms,
                scv: 1.0,
                count,
            },
            duration_ms,
        }
    }

    #[test]
    fn test_counts_and_durations_sum() {
        let samples = vec![
            sample(10.0, 5.0, 100, 10_000),
            sample(20.0, 7.0, 250, 12_000),
            sample(5.0, 3.0, 0, 8_000),
        ];
        let composite = combine(&samples);
        assert_eq!(composite.latency.count, 350);
        assert_eq!(composite.duration_ms, 30_000);
        assert_eq!(composite.sample_count, 3);
    }

    #[test]
    fn test_rates_weighted_by_duration() {
        // 10/s for 10s and 30/s for 30s -> 1000 units over 40s = 25/s
        let samples = vec![sample(10.0, 5.0, 100, 10_000), sample(30.0, 5.0, 900, 30_000)];
        let composite = combine(&samples);
        assert!((composite.arrival_rate_per_sec - 25.0).abs() < 1e-9);
        assert!((composite.recv_queue.arrival_rate_per_sec - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_latency_weighted_by_count() {
        // 100 units at 2ms and 300 units at 6ms -> mean 5ms, not the naive 4ms
        let samples = vec![sample(10.0, 2.0, 100, 10_000), sample(10.0, 6.0, 300, 10_000)];
        let composite = combine(&samples);
        assert!((composite.latency.avg_ms - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_scv_recombined_from_moments() {
        // Two deterministic populations with different means gain variance when merged
        let mut a = sample(10.0, 2.0, 100, 10_000);
        let mut b = sample(10.0, 6.0, 100, 10_000);
        a.latency.scv = 0.0;
        b.latency.scv = 0.0;
        let composite = combine(&[a, b]);
        // mean 4, E[x^2] = (4 + 36) / 2 = 20, scv = 20/16 - 1 = 0.25
        assert!((composite.latency.scv - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_identical_samples_preserve_statistics() {
        let samples = vec![sample(12.0, 4.0, 120, 10_000); 4];
        let composite = combine(&samples);
        assert!((composite.arrival_rate_per_sec - 12.0).abs() < 1e-9);
        assert!((composite.latency.avg_ms - 4.0).abs() < 1e-9);
        assert!((composite.latency.scv - 1.0).abs() < 1e-9);
        assert!((composite.recv_queue.interarrival_scv - 1.0).abs() < 1e-9);
        assert!((composite.recv_queue.avg_length - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_window() {
        let composite = combine(std::iter::empty());
        assert_eq!(composite.duration_ms, 0);
        assert_eq!(composite.latency.count, 0);
        assert_eq!(composite.arrival_rate_per_sec, 0.0);
    }
}
