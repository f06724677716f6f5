//! Pool configuration.

use crate::error::PoolError;
use crate::strategy::SelectionStrategy;
use std::time::Duration;

/// Validated options for [`ConnectionPool`].
///
/// [`ConnectionPool`]: crate::ConnectionPool
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Maximum wait for a handle before `PoolExhausted`.
    pub(crate) acquire_timeout: Duration,
    /// Idle handles older than this are evicted by background validation.
    pub(crate) max_idle_time: Duration,
    /// Handles older than this are never handed out again.
    pub(crate) max_lifetime: Duration,
    /// Cadence of the background validation pass.
    pub(crate) validation_interval: Duration,
    /// Source selection strategy.
    pub(crate) strategy: SelectionStrategy,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(30),
            max_idle_time: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(3600),
            validation_interval: Duration::from_secs(30),
            strategy: SelectionStrategy::ThrottleAware,
        }
    }
}

impl PoolOptions {
    pub fn builder() -> PoolOptionsBuilder {
        PoolOptionsBuilder::new()
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    pub(crate) fn validate(&self) -> Result<(), PoolError> {
        if self.acquire_timeout.is_zero() {
            return Err(PoolError::Configuration(
                "acquire_timeout must be positive".into(),
            ));
        }
        if self.max_lifetime < self.max_idle_time {
            return Err(PoolError::Configuration(
                "max_lifetime must be at least max_idle_time".into(),
            ));
        }
        if self.validation_interval.is_zero() {
            return Err(PoolError::Configuration(
                "validation_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`PoolOptions`].
#[derive(Debug, Clone, Default)]
pub struct PoolOptionsBuilder {
    options: PoolOptions,
}

impl PoolOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum wait for a handle. Default: 30 s.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.options.acquire_timeout = timeout;
        self
    }

    /// Idle eviction age. Default: 10 min.
    pub fn max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.options.max_idle_time = max_idle_time;
        self
    }

    /// Total handle lifetime. Default: 60 min.
    pub fn max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.options.max_lifetime = max_lifetime;
        self
    }

    /// Background validation cadence. Default: 30 s.
    pub fn validation_interval(mut self, interval: Duration) -> Self {
        self.options.validation_interval = interval;
        self
    }

    /// Source selection strategy. Default: throttle-aware.
    pub fn strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.options.strategy = strategy;
        self
    }

    pub fn build(self) -> Result<PoolOptions, PoolError> {
        self.options.validate()?;
        Ok(self.options)
    }
}
