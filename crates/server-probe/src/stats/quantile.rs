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

//! Streaming quantile estimation with the extended P² algorithm.
//!
//! Tracks several quantiles of a stream using `2 * N + 3` markers whose
//! heights are adjusted with piecewise-parabolic interpolation. Memory use is
//! fixed regardless of how many samples are absorbed.

/// Number of quantiles tracked.
pub const QUANTILE_COUNT: usize = 3;

const MARKERS: usize = 2 * QUANTILE_COUNT + 3;

/// Percentiles tracked by default: 75th, 80th and 95th.
pub const DEFAULT_PROBABILITIES: [f64; QUANTILE_COUNT] = [0.75, 0.80, 0.95];

/// Online estimator for [`QUANTILE_COUNT`] quantiles.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantileEstimator {
    probabilities: [f64; QUANTILE_COUNT],
    heights: [f64; MARKERS],
    positions: [f64; MARKERS],
    desired: [f64; MARKERS],
    increments: [f64; MARKERS],
    count: u64,
}

impl Default for QuantileEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_PROBABILITIES)
    }
}

impl QuantileEstimator {
    /// Create an estimator for the given probabilities (each in `(0, 1)`).
    #[must_use]
    pub fn new(mut probabilities: [f64; QUANTILE_COUNT]) -> Self {
        probabilities.sort_by(f64::total_cmp);

        let mut increments = [0.0; MARKERS];
        increments[MARKERS - 1] = 1.0;
        for (i, p) in probabilities.iter().enumerate() {
            increments[2 * i + 2] = *p;
        }
        for i in (1..MARKERS - 1).step_by(2) {
            increments[i] = 0.5 * (increments[i - 1] + increments[i + 1]);
        }

        let mut estimator = Self {
            probabilities,
            heights: [0.0; MARKERS],
            positions: [0.0; MARKERS],
            desired: [0.0; MARKERS],
            increments,
            count: 0,
        };
        estimator.reset();
        estimator
    }

    /// Forget every sample, keeping the configured probabilities.
    pub fn reset(&mut self) {
        self.count = 0;
        self.heights = [0.0; MARKERS];
        for i in 0..MARKERS {
            self.positions[i] = (i + 1) as f64;
            self.desired[i] = 1.0 + (MARKERS - 1) as f64 * self.increments[i];
        }
    }

    /// Number of samples absorbed.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Probabilities tracked, in ascending order.
    #[must_use]
    pub fn probabilities(&self) -> [f64; QUANTILE_COUNT] {
        self.probabilities
    }

    /// Absorb one sample.
    pub fn push(&mut self, sample: f64) {
        self.count += 1;

        // Warm-up: keep the first samples verbatim until every marker has one.
        if self.count <= MARKERS as u64 {
            let slot = (self.count - 1) as usize;
            self.heights[slot] = sample;
            if slot == MARKERS - 1 {
                self.heights.sort_by(f64::total_cmp);
            }
            return;
        }

        let cell = if sample < self.heights[0] {
            self.heights[0] = sample;
            0
        } else if sample >= self.heights[MARKERS - 1] {
            self.heights[MARKERS - 1] = sample;
            MARKERS - 2
        } else {
            let mut k = 0;
            while sample >= self.heights[k + 1] {
                k += 1;
            }
            k
        };

        for position in &mut self.positions[cell + 1..] {
            *position += 1.0;
        }
        for (desired, increment) in self.desired.iter_mut().zip(self.increments) {
            *desired += increment;
        }

        for i in 1..MARKERS - 1 {
            let drift = self.desired[i] - self.positions[i];
            let ahead = self.positions[i + 1] - self.positions[i];
            let behind = self.positions[i - 1] - self.positions[i];

            if (drift >= 1.0 && ahead > 1.0) || (drift <= -1.0 && behind < -1.0) {
                let step = drift.signum();
                let candidate = self.parabolic(i, step);
                self.heights[i] =
                    if self.heights[i - 1] < candidate && candidate < self.heights[i + 1] {
                        candidate
                    } else {
                        self.linear(i, step)
                    };
                self.positions[i] += step;
            }
        }
    }

    /// Current estimates, in the same order as [`Self::probabilities`].
    ///
    /// Before the markers are initialised the estimates are interpolated from
    /// the sorted warm-up samples. With no samples every estimate is zero.
    #[must_use]
    pub fn quantiles(&self) -> [f64; QUANTILE_COUNT] {
        let mut result = [0.0; QUANTILE_COUNT];

        if self.count >= MARKERS as u64 {
            for (i, value) in result.iter_mut().enumerate() {
                *value = self.heights[2 * i + 2];
            }
            return result;
        }

        let seen = self.count as usize;
        if seen == 0 {
            return result;
        }

        let mut sorted = self.heights;
        sorted[..seen].sort_by(f64::total_cmp);
        for (value, p) in result.iter_mut().zip(self.probabilities) {
            *value = interpolate(&sorted[..seen], p);
        }
        result
    }

    /// Estimate for the `index`-th tracked probability.
    #[must_use]
    pub fn quantile(&self, index: usize) -> Option<f64> {
        self.quantiles().get(index).copied()
    }

    fn parabolic(&self, i: usize, step: f64) -> f64 {
        let q = &self.heights;
        let n = &self.positions;

        q[i] + step / (n[i + 1] - n[i - 1])
            * ((n[i] - n[i - 1] + step) * (q[i + 1] - q[i]) / (n[i + 1] - n[i])
                + (n[i + 1] - n[i] - step) * (q[i] - q[i - 1]) / (n[i] - n[i - 1]))
    }

    fn linear(&self, i: usize, step: f64) -> f64 {
        let j = if step > 0.0 { i + 1 } else { i - 1 };
        self.heights[i]
            + step * (self.heights[j] - self.heights[i]) / (self.positions[j] - self.positions[i])
    }
}

/// Linear interpolation at rank `1 + (len - 1) * p` of a sorted slice.
fn interpolate(sorted: &[f64], p: f64) -> f64 {
    let rank = p * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - rank.floor();
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn assert_ordered(estimator: &QuantileEstimator) {
        let q = estimator.quantiles();
        assert!(
            q[0] <= q[1] && q[1] <= q[2],
            "quantiles out of order after {} samples: {q:?}",
            estimator.count()
        );
    }

    #[test]
    fn test_empty_estimator_is_zero() {
        let estimator = QuantileEstimator::default();
        assert_eq!(estimator.count(), 0);
        assert_eq!(estimator.quantiles(), [0.0; QUANTILE_COUNT]);
    }

    #[test]
    fn test_single_sample() {
        let mut estimator = QuantileEstimator::default();
        estimator.push(20_000.0);
        assert_eq!(estimator.quantiles(), [20_000.0; QUANTILE_COUNT]);
    }

    #[test]
    fn test_quantiles_ordered_for_random_streams() {
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut estimator = QuantileEstimator::default();
            for _ in 0..500 {
                let sample = if rng.gen_bool(0.1) {
                    rng.gen_range(100_000.0..900_000.0)
                } else {
                    rng.gen_range(5_000.0..60_000.0)
                };
                estimator.push(sample);
                assert_ordered(&estimator);
            }
        }
    }

    #[test]
    fn test_quantiles_ordered_for_alternating_stream() {
        let mut estimator = QuantileEstimator::default();
        for i in 0..200 {
            estimator.push(if i % 2 == 0 { 20_000.0 } else { 400_000.0 });
            assert_ordered(&estimator);
        }
    }

    #[test]
    fn test_converges_on_uniform_stream() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut estimator = QuantileEstimator::default();
        for _ in 0..20_000 {
            estimator.push(rng.gen_range(0.0..1000.0));
        }

        let q = estimator.quantiles();
        assert!((q[0] - 750.0).abs() < 25.0, "p75 = {}", q[0]);
        assert!((q[1] - 800.0).abs() < 25.0, "p80 = {}", q[1]);
        assert!((q[2] - 950.0).abs() < 25.0, "p95 = {}", q[2]);
    }

    #[test]
    fn test_constant_stream() {
        let mut estimator = QuantileEstimator::default();
        for _ in 0..50 {
            estimator.push(12_000.0);
        }
        assert_eq!(estimator.quantiles(), [12_000.0; QUANTILE_COUNT]);
    }

    #[test]
    fn test_reset_in_place() {
        let mut estimator = QuantileEstimator::new([0.95, 0.5, 0.75]);
        for i in 0..30 {
            estimator.push(f64::from(i));
        }
        estimator.reset();

        assert_eq!(estimator.count(), 0);
        assert_eq!(estimator.quantiles(), [0.0; QUANTILE_COUNT]);
        assert_eq!(estimator.probabilities(), [0.5, 0.75, 0.95]);
        assert_eq!(estimator, QuantileEstimator::new([0.5, 0.75, 0.95]));
    }
}
