//! Amplitude-threshold anomaly counter with a dual-threshold health flag.

use crate::config::MonitorConfig;

/// Number of samples whose magnitude exceeds `threshold`.
#[must_use]
pub fn count_anomalies(samples: &[f32], threshold: f32) -> usize {
    samples.iter().filter(|v| v.abs() > threshold).count()
}

/// Hysteresis state of one device.
///
/// Entering the unhealthy state needs a count above `enter_threshold`;
/// leaving it needs a count below `exit_threshold`. Counts in between never
/// change the flag.
#[derive(Debug, Clone)]
pub struct SignalMonitor {
    cfg: MonitorConfig,
    unhealthy: bool,
    last_count: usize,
}

impl SignalMonitor {
    /// A healthy monitor with the given thresholds.
    #[must_use]
    pub const fn new(cfg: MonitorConfig) -> Self {
        Self {
            cfg,
            unhealthy: false,
            last_count: 0,
        }
    }

    /// Current health flag (`true` while in maintenance).
    #[must_use]
    pub const fn is_unhealthy(&self) -> bool {
        self.unhealthy
    }

    /// Anomaly count of the most recent chunk.
    #[must_use]
    pub const fn last_count(&self) -> usize {
        self.last_count
    }

    /// Counts anomalies in `samples` and updates the flag.
    ///
    /// Returns the new flag only when it changed.
    pub fn observe(&mut self, samples: &[f32]) -> Option<bool> {
        let count = count_anomalies(samples, self.cfg.amplitude_threshold);
        self.apply_count(count)
    }

    /// Updates the flag from an already computed anomaly count.
    pub fn apply_count(&mut self, count: usize) -> Option<bool> {
        self.last_count = count;
        if !self.unhealthy && count > self.cfg.enter_threshold {
            self.unhealthy = true;
            Some(true)
        } else if self.unhealthy && count < self.cfg.exit_threshold {
            self.unhealthy = false;
            Some(false)
        } else {
            None
        }
    }
}

impl Default for SignalMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}
