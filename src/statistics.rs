use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Streaming min/max/mean/standard deviation (Welford's method)
///
/// Keeps no samples. `stddev()` is the population deviation (divisor n)
/// and is NaN until two samples have been seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsAccumulator {
    count: u64,
    mean: f64,
    /// Sum of squared deviations from the running mean
    m2: f64,
    min: f64,
    max: f64,
    initialized: bool,
}

impl StatisticsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, sample: f64) {
        self.count += 1;
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        // second factor uses the updated mean
        self.m2 += delta * (sample - self.mean);

        if !self.initialized {
            self.min = sample;
            self.max = sample;
            self.initialized = true;
        } else {
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        }
    }

    /// Record a duration in nanoseconds
    pub fn update_duration(&mut self, sample: Duration) {
        self.update(sample.as_nanos() as f64);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> Option<f64> {
        self.initialized.then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        self.initialized.then_some(self.max)
    }

    pub fn mean(&self) -> Option<f64> {
        self.initialized.then_some(self.mean)
    }

    pub fn stddev(&self) -> f64 {
        if self.count < 2 {
            return f64::NAN;
        }
        (self.m2 / self.count as f64).sqrt()
    }

    /// stddev / mean as a percentage; NaN when undefined
    pub fn coefficient_of_variation(&self) -> f64 {
        match self.mean() {
            Some(mean) if mean != 0.0 => self.stddev() / mean * 100.0,
            _ => f64::NAN,
        }
    }
}
