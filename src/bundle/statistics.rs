//! Running statistics and the residual cumulative distribution.

use serde::{Deserialize, Serialize};

/// Accumulates count, sum, sum of squares and extrema of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Statistics {
    count: usize,
    sum: f64,
    sum_squares: f64,
    minimum: Option<f64>,
    maximum: Option<f64>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_squares += value * value;
        self.minimum = Some(self.minimum.map_or(value, |m| m.min(value)));
        self.maximum = Some(self.maximum.map_or(value, |m| m.max(value)));
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn sum_squares(&self) -> f64 {
        self.sum_squares
    }

    /// Root mean square, zero for an empty sample.
    pub fn rms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum_squares / self.count as f64).sqrt()
        }
    }

    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn minimum(&self) -> Option<f64> {
        self.minimum
    }

    pub fn maximum(&self) -> Option<f64> {
        self.maximum
    }
}

impl FromIterator<f64> for Statistics {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut stats = Statistics::new();
        for value in iter {
            stats.add(value);
        }
        stats
    }
}

/// Empirical cumulative distribution of a sample.
///
/// `value(p)` linearly interpolates between order statistics, so
/// `value(0) == min()` and `value(1) == max()`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CumulativeDistribution {
    sorted: Vec<f64>,
}

impl CumulativeDistribution {
    /// Build from a sample; non-finite values are dropped.
    pub fn new(values: impl IntoIterator<Item = f64>) -> Self {
        let mut sorted: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        sorted.sort_by(f64::total_cmp);
        Self { sorted }
    }

    pub fn count(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn min(&self) -> Option<f64> {
        self.sorted.first().copied()
    }

    pub fn max(&self) -> Option<f64> {
        self.sorted.last().copied()
    }

    /// Value below which a fraction `probability` of the sample lies.
    pub fn value(&self, probability: f64) -> Option<f64> {
        let n = self.sorted.len();
        if n == 0 {
            return None;
        }
        let position = probability.clamp(0.0, 1.0) * (n - 1) as f64;
        let lower = position.floor() as usize;
        let upper = (lower + 1).min(n - 1);
        let fraction = position - lower as f64;
        Some(self.sorted[lower] + fraction * (self.sorted[upper] - self.sorted[lower]))
    }

    /// Fraction of the sample at or below `value`.
    pub fn cumulative_probability(&self, value: f64) -> Option<f64> {
        if self.sorted.is_empty() {
            return None;
        }
        let at_or_below = self.sorted.partition_point(|v| *v <= value);
        Some(at_or_below as f64 / self.sorted.len() as f64)
    }
}
