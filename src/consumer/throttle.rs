//! Adaptive backpressure for one consumer.

use std::collections::VecDeque;
use std::time::Duration;

// Rolling window of the most recent listener latencies. The percentile
// estimate covers exactly these samples; older ones age out as new
// invocations complete.
const LATENCY_WINDOW: usize = 128;

/// Additive-increase/decrease controller over the number of deliveries a
/// consumer keeps simultaneously unacknowledged, within
/// `[1, execution_rate]`.
///
/// Operates purely on observed local latency; it protects this consumer's
/// own resources, not the cluster.
pub struct DeliveryThrottle {
    ceiling: usize,
    rate: usize,
    window: VecDeque<Duration>,
}

impl DeliveryThrottle {
    pub fn new(ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        DeliveryThrottle {
            ceiling,
            rate: ceiling,
            window: VecDeque::with_capacity(LATENCY_WINDOW),
        }
    }

    /// Deliveries this consumer is currently willing to keep in flight.
    pub fn rate(&self) -> usize {
        self.rate
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Record one completed invocation and return how many deliveries'
    /// worth of credit to request next:
    /// - slower than the window's p99: rate drops by one (floor 1); one
    ///   credit only at the floor, so the consumer is never starved.
    /// - faster than the window's p50 while below the ceiling: rate grows
    ///   by one and two credits are requested.
    /// - otherwise: steady state, one credit.
    ///
    /// The sample is judged against the preceding window, then added.
    pub fn record(&mut self, latency: Duration) -> usize {
        let credit = match self.thresholds() {
            Some((_, p99)) if latency > p99 => {
                if self.rate > 1 {
                    self.rate -= 1;
                    0
                } else {
                    1
                }
            }
            Some((p50, _)) if latency < p50 && self.rate < self.ceiling => {
                self.rate += 1;
                2
            }
            _ => 1,
        };

        if self.window.len() == LATENCY_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(latency);
        credit
    }

    fn thresholds(&self) -> Option<(Duration, Duration)> {
        if self.window.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.window.iter().copied().collect();
        sorted.sort_unstable();
        Some((percentile(&sorted, 0.50), percentile(&sorted, 0.99)))
    }
}

fn percentile(sorted: &[Duration], quantile: f64) -> Duration {
    let index = ((sorted.len() - 1) as f64 * quantile).round() as usize;
    sorted[index]
}
