//! # Baseline Tracker Module
//!
//! Maintains a rolling baseline per glitch channel and decides whether a
//! sample deviates enough to count as a glitch.
//!
//! ## Update strategy
//!
//! The baseline is updated exponentially:
//!
//! `baseline = (value + baseline · n) / (n + 1)`
//!
//! where `n` grows with each sample up to the configured sample count, so
//! early samples converge quickly and the steady-state behaves like an
//! N-sample average. While a channel is glitched the baseline is held
//! constant, unless auto-reset is configured, in which case it snaps to the
//! glitching value. (An N-sample ring average would recover faster after a
//! glitch; the exponential form is the one this implementation commits to.)
//!
//! ## Deviation test
//!
//! - threshold `t > 0`: glitch if `|value − baseline| > t`
//! - threshold `t < 0`: glitch if `|value − baseline| > |t| · |baseline|`
//! - threshold `t == 0`: glitch detection disabled for the channel
//!
//! ## Usage
//!
//! ```
//! use glitch_logger::capture::baseline::BaselineTracker;
//!
//! let mut tracker = BaselineTracker::new(0.5, 8, false);
//! tracker.update(10.0, false);
//!
//! assert!(!tracker.exceeds(10.2)); // within threshold
//! assert!(tracker.exceeds(11.0));  // more than 0.5 away
//! ```

/// Rolling baseline state for one glitch channel.
#[derive(Debug, Clone)]
pub struct BaselineTracker {
    /// Deviation threshold: absolute if positive, fractional if negative,
    /// disabled sentinel if zero.
    threshold: f64,
    /// Effective averaging depth for the exponential update.
    samples: usize,
    /// Snap the baseline to the glitching value instead of holding it.
    auto_reset: bool,
    baseline: f64,
    seen: usize,
}

impl BaselineTracker {
    /// Creates a tracker with the given threshold, averaging depth, and
    /// auto-reset policy.
    ///
    /// # Arguments
    ///
    /// * `threshold` - Deviation threshold (>0 absolute, <0 fractional, 0 disabled)
    /// * `samples` - Averaging depth; clamped to at least 1
    /// * `auto_reset` - Snap the baseline to the glitching value on fire
    #[must_use]
    pub fn new(threshold: f64, samples: usize, auto_reset: bool) -> Self {
        Self {
            threshold,
            samples: samples.max(1),
            auto_reset,
            baseline: 0.0,
            seen: 0,
        }
    }

    /// Current baseline value. Zero until the first update.
    #[must_use]
    pub fn baseline(&self) -> f64 {
        self.baseline
    }

    /// Whether the threshold disables glitch detection entirely.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.threshold == 0.0
    }

    /// Absolute deviation of `value` from the current baseline.
    #[must_use]
    pub fn deviation(&self, value: f64) -> f64 {
        (value - self.baseline).abs()
    }

    /// Whether `value` deviates from the baseline beyond the threshold.
    ///
    /// Always false before the first update and when the threshold is the
    /// zero disabled sentinel.
    #[must_use]
    pub fn exceeds(&self, value: f64) -> bool {
        if self.threshold == 0.0 || self.seen == 0 {
            return false;
        }

        let deviation = self.deviation(value);
        if self.threshold > 0.0 {
            deviation > self.threshold
        } else {
            deviation > self.threshold.abs() * self.baseline.abs()
        }
    }

    /// Folds a new sample into the baseline.
    ///
    /// `glitched` marks samples that fired (or sit inside an unserviced
    /// glitch window): those hold the baseline constant, or snap it to the
    /// sample when auto-reset is configured. The first sample always seeds
    /// the baseline directly.
    pub fn update(&mut self, value: f64, glitched: bool) {
        if self.seen == 0 {
            self.baseline = value;
        } else if !glitched {
            let n = self.seen.min(self.samples) as f64;
            self.baseline = (value + self.baseline * n) / (n + 1.0);
        } else if self.auto_reset {
            self.baseline = value;
        }
        self.seen = self.seen.saturating_add(1);
    }
}
