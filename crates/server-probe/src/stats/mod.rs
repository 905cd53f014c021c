// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-server latency and loss statistics.
//!
//! [`PingStats`] owns a streaming quantile estimator and derives the values
//! the ranking uses: a smoothed round-trip time, the rounded ping shown to the
//! user, and a separate sort value that only moves under a hysteresis rule so
//! the list does not reshuffle on every bit of jitter.

mod quantile;

pub use quantile::{QuantileEstimator, DEFAULT_PROBABILITIES, QUANTILE_COUNT};

/// Thresholds controlling when the sort value follows the measured ping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HysteresisConfig {
    /// Samples required before an established sort value may move.
    pub min_samples: u32,
    /// Smallest deviation (microseconds) that moves the sort value.
    pub min_grace_us: f64,
    /// Deviation (microseconds) per millisecond of current sort value.
    pub grace_factor: f64,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            min_samples: 10,
            min_grace_us: 5000.0,
            grace_factor: 50.0,
        }
    }
}

/// Liveness counters and latency estimate for one server.
#[derive(Debug, Clone, PartialEq)]
pub struct PingStats {
    estimator: QuantileEstimator,
    smoothed_rtt_us: f64,
    ping_ms: u32,
    sort_ping_ms: Option<u32>,
    sent: u32,
    received: u32,
}

impl Default for PingStats {
    fn default() -> Self {
        Self {
            estimator: QuantileEstimator::default(),
            smoothed_rtt_us: 0.0,
            ping_ms: 0,
            sort_ping_ms: None,
            sent: 0,
            received: 0,
        }
    }
}

impl PingStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of these statistics for a new record, with the sort value pinned
    /// to the current ping.
    #[must_use]
    pub fn carried_over(&self) -> Self {
        let mut copy = self.clone();
        copy.sort_ping_ms = (copy.received > 0).then_some(copy.ping_ms);
        copy
    }

    /// Reinitialise in place.
    pub fn reset(&mut self) {
        self.estimator.reset();
        self.smoothed_rtt_us = 0.0;
        self.ping_ms = 0;
        self.sort_ping_ms = None;
        self.sent = 0;
        self.received = 0;
    }

    /// Count one transmitted probe.
    pub fn record_sent(&mut self) {
        self.sent = self.sent.saturating_add(1);
    }

    /// Absorb a round-trip sample in microseconds.
    ///
    /// Returns `true` when the rounded ping changed.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "round-trip times are far below 2^52 microseconds and never negative"
    )]
    pub fn add_sample(&mut self, rtt_us: u64, hysteresis: &HysteresisConfig) -> bool {
        let sample = rtt_us.max(1) as f64;
        self.estimator.push(sample);

        let lowest = self.estimator.quantiles()[0];
        self.smoothed_rtt_us = if lowest > 0.0 { lowest } else { sample };
        self.received = u32::try_from(self.estimator.count()).unwrap_or(u32::MAX);

        let ping = (self.smoothed_rtt_us / 1000.0).round() as u32;
        let changed = ping != self.ping_ms;
        self.ping_ms = ping;

        // A sort value of 0 ranks as unmeasured, so it is reseeded like an unset one.
        match self.sort_ping_ms.filter(|sort| *sort > 0) {
            None => self.sort_ping_ms = Some(ping),
            Some(current) => {
                let current_us = 1000.0 * f64::from(current);
                let grace = hysteresis
                    .min_grace_us
                    .max(hysteresis.grace_factor * f64::from(current));
                let deviation = (current_us - self.smoothed_rtt_us).abs();

                if self.received >= hysteresis.min_samples && deviation >= grace {
                    self.sort_ping_ms = Some(ping);
                }
            }
        }

        changed
    }

    /// Probes transmitted.
    #[must_use]
    pub fn sent(&self) -> u32 {
        self.sent
    }

    /// Replies matched, equal to the samples absorbed.
    #[must_use]
    pub fn received(&self) -> u32 {
        self.received
    }

    /// Probes without a matched reply.
    #[must_use]
    pub fn lost(&self) -> u32 {
        self.sent - self.received.min(self.sent)
    }

    /// Packet loss in percent, defined once something was sent.
    #[must_use]
    pub fn packet_loss(&self) -> Option<f64> {
        (self.sent > 0).then(|| f64::from(self.lost()) * 100.0 / f64::from(self.sent))
    }

    /// Smoothed round-trip time in microseconds (75th percentile estimate).
    #[must_use]
    pub fn smoothed_rtt_us(&self) -> f64 {
        self.smoothed_rtt_us
    }

    /// Smoothed round-trip time rounded to milliseconds.
    #[must_use]
    pub fn ping_ms(&self) -> u32 {
        self.ping_ms
    }

    /// Value used for ordering; `None` until the first sample.
    #[must_use]
    pub fn sort_ping_ms(&self) -> Option<u32> {
        self.sort_ping_ms
    }

    /// Whether at least one reply has been absorbed.
    #[must_use]
    pub fn has_latency(&self) -> bool {
        self.received > 0
    }

    /// Estimate of the `index`-th tracked percentile in milliseconds.
    #[must_use]
    pub fn percentile_ms(&self, index: usize) -> Option<f64> {
        if !self.has_latency() {
            return None;
        }
        self.estimator.quantile(index).map(|us| us / 1000.0)
    }

    /// The underlying estimator.
    #[must_use]
    pub fn estimator(&self) -> &QuantileEstimator {
        &self.estimator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(stats: &mut PingStats, samples_ms: &[u64]) {
        let hysteresis = HysteresisConfig::default();
        for ms in samples_ms {
            stats.record_sent();
            stats.add_sample(ms * 1000, &hysteresis);
        }
    }

    #[test]
    fn test_first_sample_sets_everything() {
        let mut stats = PingStats::new();
        feed(&mut stats, &[42]);

        assert_eq!(stats.received(), 1);
        assert_eq!(stats.ping_ms(), 42);
        assert_eq!(stats.sort_ping_ms(), Some(42));
        assert!((stats.smoothed_rtt_us() - 42_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_sort_value_is_reseeded() {
        let hysteresis = HysteresisConfig::default();
        let mut stats = PingStats::new();

        stats.record_sent();
        stats.add_sample(300, &hysteresis);
        assert_eq!(stats.sort_ping_ms(), Some(0));

        for _ in 0..20 {
            stats.record_sent();
            stats.add_sample(3_000, &hysteresis);
        }
        // Reseeded from the second sample's 2.3 ms estimate, then held.
        assert_eq!(stats.sort_ping_ms(), Some(2));
        assert!(stats.has_latency());
    }

    #[test]
    fn test_sort_value_holds_during_warmup() {
        let mut stats = PingStats::new();
        let samples: Vec<u64> = (0..9).map(|i| if i % 2 == 0 { 20 } else { 400 }).collect();

        let hysteresis = HysteresisConfig::default();
        for ms in samples {
            stats.record_sent();
            stats.add_sample(ms * 1000, &hysteresis);
            assert_eq!(stats.sort_ping_ms(), Some(20));
        }
        assert_eq!(stats.received(), 9);
    }

    #[test]
    fn test_sort_value_follows_sustained_shift() {
        let mut stats = PingStats::new();
        let warmup: Vec<u64> = (0..9).map(|i| if i % 2 == 0 { 20 } else { 400 }).collect();
        feed(&mut stats, &warmup);
        feed(&mut stats, &[400; 60]);

        let sort = stats.sort_ping_ms().unwrap();
        assert!(sort > 20, "sort value stuck at {sort}");
    }

    #[test]
    fn test_small_jitter_does_not_move_sort_value() {
        let mut stats = PingStats::new();
        feed(&mut stats, &[50; 20]);
        feed(&mut stats, &[52, 51, 52, 53, 52, 51, 52, 52, 53, 52]);

        assert_eq!(stats.sort_ping_ms(), Some(50));
        assert!(stats.ping_ms() >= 50);
    }

    #[test]
    fn test_add_sample_reports_ping_change() {
        let hysteresis = HysteresisConfig::default();
        let mut stats = PingStats::new();

        assert!(stats.add_sample(30_000, &hysteresis));
        assert!(!stats.add_sample(30_000, &hysteresis));
    }

    #[test]
    fn test_packet_loss() {
        let mut stats = PingStats::new();
        assert_eq!(stats.packet_loss(), None);

        for _ in 0..4 {
            stats.record_sent();
        }
        stats.add_sample(10_000, &HysteresisConfig::default());

        assert_eq!(stats.lost(), 3);
        assert_eq!(stats.packet_loss(), Some(75.0));
        assert!(stats.received() <= stats.sent());
    }

    #[test]
    fn test_percentiles_need_a_sample() {
        let mut stats = PingStats::new();
        assert_eq!(stats.percentile_ms(1), None);

        feed(&mut stats, &[10, 20, 30]);
        let p80 = stats.percentile_ms(1).unwrap();
        let p95 = stats.percentile_ms(2).unwrap();
        assert!(p80 <= p95);
        assert_eq!(stats.percentile_ms(3), None);
    }

    #[test]
    fn test_reset() {
        let mut stats = PingStats::new();
        feed(&mut stats, &[10, 20, 30]);
        stats.reset();

        assert_eq!(stats, PingStats::new());
    }

    #[test]
    fn test_carried_over_pins_sort_value() {
        let mut stats = PingStats::new();
        feed(&mut stats, &[10; 5]);
        feed(&mut stats, &[90; 5]);

        let copy = stats.carried_over();
        assert_eq!(copy.sort_ping_ms(), Some(stats.ping_ms()));
        assert_eq!(copy.received(), stats.received());
        assert_eq!(PingStats::new().carried_over().sort_ping_ms(), None);
    }
}
