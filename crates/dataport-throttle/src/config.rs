//! Rate controller configuration and presets.

use std::time::Duration;

/// The service's per-user concurrency cap. The controller never admits
/// more than this many batches regardless of preset.
pub const SERVICE_USER_CAP: usize = 52;

/// Named tunings for the rate controller.
///
/// The ceiling factor `F` bounds aggregate execution time: with an
/// average batch duration of `D` seconds, a cap of `F / D` keeps the
/// sustained execution-time spend near `F` milliseconds per wall-clock
/// second, which is what the service's aggregate budget meters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatePreset {
    /// Production, delete-heavy and long-running jobs.
    Conservative,
    /// Mixed create/update workloads. The default.
    Balanced,
    /// Development and closely monitored jobs.
    Aggressive,
}

impl RatePreset {
    fn ceiling_factor(&self) -> f64 {
        match self {
            RatePreset::Conservative => 140.0,
            RatePreset::Balanced => 200.0,
            RatePreset::Aggressive => 320.0,
        }
    }

    fn slow_batch_threshold(&self) -> Duration {
        match self {
            RatePreset::Conservative => Duration::from_millis(6000),
            RatePreset::Balanced => Duration::from_millis(8000),
            RatePreset::Aggressive => Duration::from_millis(11000),
        }
    }
}

/// Validated configuration for [`RateController`].
///
/// [`RateController`]: crate::RateController
#[derive(Debug, Clone)]
pub struct RateConfig {
    /// Ceiling factor `F` in the execution-time ceiling `F / D`.
    pub(crate) ceiling_factor: f64,
    /// Average batch duration at which the execution-time ceiling engages.
    pub(crate) slow_batch_threshold: Duration,
    /// Weight of the newest sample in the duration average.
    pub(crate) smoothing: f64,
    /// Hard ceiling on parallelism.
    pub(crate) hard_ceiling: usize,
    /// Multiplier applied to the current parallelism on throttle.
    pub(crate) decrease_factor: f64,
    /// Consecutive successes required before an increase.
    pub(crate) successes_per_increase: u32,
    /// Minimum time between two increases.
    pub(crate) min_increase_interval: Duration,
    /// Retry-after above which the controller signals fail-fast.
    pub(crate) max_retry_after: Duration,
}

impl Default for RateConfig {
    fn default() -> Self {
        RateConfig::preset(RatePreset::Balanced)
    }
}

impl RateConfig {
    /// A configuration from a named preset, with standard secondary
    /// tunings.
    pub fn preset(preset: RatePreset) -> Self {
        Self {
            ceiling_factor: preset.ceiling_factor(),
            slow_batch_threshold: preset.slow_batch_threshold(),
            smoothing: 0.3,
            hard_ceiling: SERVICE_USER_CAP,
            decrease_factor: 0.5,
            successes_per_increase: 3,
            min_increase_interval: Duration::from_secs(2),
            max_retry_after: Duration::from_secs(300),
        }
    }

    pub fn builder() -> RateConfigBuilder {
        RateConfigBuilder::new()
    }

    pub fn ceiling_factor(&self) -> f64 {
        self.ceiling_factor
    }

    pub fn slow_batch_threshold(&self) -> Duration {
        self.slow_batch_threshold
    }

    pub fn hard_ceiling(&self) -> usize {
        self.hard_ceiling
    }

    pub fn max_retry_after(&self) -> Duration {
        self.max_retry_after
    }
}

/// Builder for [`RateConfig`].
#[derive(Debug, Clone)]
pub struct RateConfigBuilder {
    config: RateConfig,
}

impl Default for RateConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RateConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RateConfig::default(),
        }
    }

    /// Starts from a named preset.
    pub fn preset(mut self, preset: RatePreset) -> Self {
        let keep = self.config.clone();
        self.config = RateConfig::preset(preset);
        self.config.smoothing = keep.smoothing;
        self.config.successes_per_increase = keep.successes_per_increase;
        self.config.min_increase_interval = keep.min_increase_interval;
        self.config.max_retry_after = keep.max_retry_after;
        self
    }

    /// Sets the ceiling factor `F`.
    pub fn ceiling_factor(mut self, factor: f64) -> Self {
        self.config.ceiling_factor = factor;
        self
    }

    /// Sets the slow-batch threshold.
    pub fn slow_batch_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_batch_threshold = threshold;
        self
    }

    /// Sets the duration-average smoothing weight.
    pub fn smoothing(mut self, smoothing: f64) -> Self {
        self.config.smoothing = smoothing;
        self
    }

    /// Sets the hard parallelism ceiling. Clamped to the service cap.
    pub fn hard_ceiling(mut self, ceiling: usize) -> Self {
        self.config.hard_ceiling = ceiling.clamp(1, SERVICE_USER_CAP);
        self
    }

    /// Sets the multiplicative decrease factor applied on throttle.
    pub fn decrease_factor(mut self, factor: f64) -> Self {
        self.config.decrease_factor = factor;
        self
    }

    /// Sets the consecutive successes required per increase.
    pub fn successes_per_increase(mut self, successes: u32) -> Self {
        self.config.successes_per_increase = successes.max(1);
        self
    }

    /// Sets the minimum interval between increases.
    pub fn min_increase_interval(mut self, interval: Duration) -> Self {
        self.config.min_increase_interval = interval;
        self
    }

    /// Sets the retry-after tolerance beyond which the controller
    /// signals fail-fast.
    pub fn max_retry_after(mut self, tolerance: Duration) -> Self {
        self.config.max_retry_after = tolerance;
        self
    }

    pub fn build(self) -> RateConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_values() {
        let conservative = RateConfig::preset(RatePreset::Conservative);
        assert_eq!(conservative.ceiling_factor, 140.0);
        assert_eq!(conservative.slow_batch_threshold, Duration::from_millis(6000));

        let balanced = RateConfig::preset(RatePreset::Balanced);
        assert_eq!(balanced.ceiling_factor, 200.0);
        assert_eq!(balanced.slow_batch_threshold, Duration::from_millis(8000));

        let aggressive = RateConfig::preset(RatePreset::Aggressive);
        assert_eq!(aggressive.ceiling_factor, 320.0);
        assert_eq!(aggressive.slow_batch_threshold, Duration::from_millis(11000));
    }

    #[test]
    fn default_is_balanced() {
        let config = RateConfig::default();
        assert_eq!(config.ceiling_factor, 200.0);
        assert_eq!(config.hard_ceiling, SERVICE_USER_CAP);
        assert!((config.smoothing - 0.3).abs() < f64::EPSILON);
        assert!((config.decrease_factor - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn builder_keeps_secondary_tunings_across_preset() {
        let config = RateConfig::builder()
            .successes_per_increase(7)
            .preset(RatePreset::Aggressive)
            .build();
        assert_eq!(config.successes_per_increase, 7);
        assert_eq!(config.ceiling_factor, 320.0);
    }

    #[test]
    fn hard_ceiling_clamped_to_service_cap() {
        let config = RateConfig::builder().hard_ceiling(500).build();
        assert_eq!(config.hard_ceiling, SERVICE_USER_CAP);
        let config = RateConfig::builder().hard_ceiling(0).build();
        assert_eq!(config.hard_ceiling, 1);
    }
}
