//! Adaptive rate controller.
//!
//! Maintains the number of concurrently admitted batches `P`. `P` starts
//! at 1 and ramps up on sustained success, bounded by the smallest of
//! three ceilings: the service's hard per-user cap, a transient ceiling
//! set by the most recent throttle event, and an execution-time ceiling
//! derived from the smoothed batch duration once batches are slow enough
//! to matter.

use crate::config::RateConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// The controller's lifecycle state for one bulk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Growing toward the effective cap.
    Ramp,
    /// The execution-time ceiling is engaged (batches are slow).
    CeilingApplied,
    /// Cooling off after a throttle event.
    Backoff,
    /// Retry-after exceeded tolerance; the operation should abort.
    FailFast,
}

const STATE_RAMP: u8 = 0;
const STATE_CEILING: u8 = 1;
const STATE_BACKOFF: u8 = 2;
const STATE_FAIL_FAST: u8 = 3;

/// What the caller should do after reporting a throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleVerdict {
    /// Sleep for the retry-after, then resubmit the batch.
    Backoff(Duration),
    /// The retry-after exceeds tolerance; abort the operation.
    FailFast(Duration),
}

/// Thread-safe adaptive parallelism controller.
///
/// State resets between bulk operations via [`RateController::reset`].
pub struct RateController {
    config: RateConfig,
    current: AtomicUsize,
    /// Smoothed batch duration in milliseconds, stored as f64 bits.
    /// Zero means no sample yet.
    ema_ms_bits: AtomicU64,
    consecutive_successes: AtomicU32,
    throttle_ceiling: AtomicUsize,
    state: AtomicU8,
    last_increase: Mutex<Instant>,
    backoff_until: Mutex<Option<Instant>>,
}

impl RateController {
    pub fn new(config: RateConfig) -> Self {
        let hard = config.hard_ceiling;
        Self {
            config,
            current: AtomicUsize::new(1),
            ema_ms_bits: AtomicU64::new(0),
            consecutive_successes: AtomicU32::new(0),
            throttle_ceiling: AtomicUsize::new(hard),
            state: AtomicU8::new(STATE_RAMP),
            last_increase: Mutex::new(Instant::now()),
            backoff_until: Mutex::new(None),
        }
    }

    /// The current parallelism `P`.
    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// The controller's lifecycle state.
    pub fn state(&self) -> ControllerState {
        match self.state.load(Ordering::Acquire) {
            STATE_CEILING => ControllerState::CeilingApplied,
            STATE_BACKOFF => ControllerState::Backoff,
            STATE_FAIL_FAST => ControllerState::FailFast,
            _ => ControllerState::Ramp,
        }
    }

    /// The smoothed batch duration, when at least one batch completed.
    pub fn average_batch(&self) -> Option<Duration> {
        let bits = self.ema_ms_bits.load(Ordering::Acquire);
        if bits == 0 {
            None
        } else {
            Some(Duration::from_secs_f64(f64::from_bits(bits) / 1000.0))
        }
    }

    /// The smallest active ceiling.
    pub fn effective_cap(&self) -> usize {
        let mut cap = self
            .config
            .hard_ceiling
            .min(self.throttle_ceiling.load(Ordering::Acquire));
        let ema_ms = f64::from_bits(self.ema_ms_bits.load(Ordering::Acquire));
        if ema_ms >= self.config.slow_batch_threshold.as_millis() as f64 {
            let execution_ceiling =
                (self.config.ceiling_factor / (ema_ms / 1000.0)).floor() as usize;
            cap = cap.min(execution_ceiling);
        }
        cap.max(1)
    }

    /// Reports a completed batch.
    ///
    /// Updates the duration average, may re-enter `Ramp` after a cooled
    /// backoff, and increments `P` once enough consecutive successes
    /// have accumulated and the inter-increase interval has passed.
    pub fn record_success(&self, elapsed: Duration) {
        let ema_ms = self.update_average(elapsed.as_secs_f64() * 1000.0);

        // Leave backoff once the cooldown has elapsed.
        if self.state.load(Ordering::Acquire) == STATE_BACKOFF {
            let cooled = self
                .backoff_until
                .lock()
                .map(|until| Instant::now() >= until)
                .unwrap_or(true);
            if cooled {
                let _ = self.state.compare_exchange(
                    STATE_BACKOFF,
                    STATE_RAMP,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }

        if ema_ms >= self.config.slow_batch_threshold.as_millis() as f64 {
            let _ = self.state.compare_exchange(
                STATE_RAMP,
                STATE_CEILING,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }

        let cap = self.effective_cap();

        // A dropped execution-time ceiling pulls P down immediately.
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                (p > cap).then_some(cap)
            });

        let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
        if successes < self.config.successes_per_increase {
            return;
        }

        let mut last_increase = self.last_increase.lock();
        if last_increase.elapsed() < self.config.min_increase_interval {
            return;
        }
        let increased = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                (p < cap).then_some(p + 1)
            })
            .is_ok();
        if increased {
            *last_increase = Instant::now();
            self.consecutive_successes.store(0, Ordering::Release);
            tracing::debug!(parallelism = self.current(), cap, "parallelism increased");
            #[cfg(feature = "metrics")]
            metrics::gauge!("dataport_rate_parallelism").set(self.current() as f64);
        }
    }

    /// Reports a throttle response with its effective retry-after.
    ///
    /// Multiplicatively decreases `P`, pins the throttle ceiling at the
    /// new value, and tells the caller whether to back off or abort.
    pub fn record_throttle(&self, retry_after: Duration) -> ThrottleVerdict {
        self.consecutive_successes.store(0, Ordering::Release);

        let previous = self.current.load(Ordering::Acquire);
        let decreased = ((previous as f64 * self.config.decrease_factor).floor() as usize).max(1);
        self.current.store(decreased, Ordering::Release);
        self.throttle_ceiling.store(decreased, Ordering::Release);

        tracing::warn!(
            previous,
            parallelism = decreased,
            ?retry_after,
            "throttled; parallelism decreased"
        );
        #[cfg(feature = "metrics")]
        metrics::gauge!("dataport_rate_parallelism").set(decreased as f64);

        if retry_after > self.config.max_retry_after {
            self.state.store(STATE_FAIL_FAST, Ordering::Release);
            return ThrottleVerdict::FailFast(retry_after);
        }
        *self.backoff_until.lock() = Some(Instant::now() + retry_after);
        self.state.store(STATE_BACKOFF, Ordering::Release);
        ThrottleVerdict::Backoff(retry_after)
    }

    /// Resets all state for a new bulk operation.
    pub fn reset(&self) {
        self.current.store(1, Ordering::Release);
        self.ema_ms_bits.store(0, Ordering::Release);
        self.consecutive_successes.store(0, Ordering::Release);
        self.throttle_ceiling
            .store(self.config.hard_ceiling, Ordering::Release);
        self.state.store(STATE_RAMP, Ordering::Release);
        *self.last_increase.lock() = Instant::now();
        *self.backoff_until.lock() = None;
    }

    pub fn config(&self) -> &RateConfig {
        &self.config
    }

    fn update_average(&self, sample_ms: f64) -> f64 {
        loop {
            let bits = self.ema_ms_bits.load(Ordering::Acquire);
            let next = if bits == 0 {
                sample_ms
            } else {
                let current = f64::from_bits(bits);
                self.config.smoothing * sample_ms + (1.0 - self.config.smoothing) * current
            };
            if self
                .ema_ms_bits
                .compare_exchange_weak(bits, next.to_bits(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return next;
            }
        }
    }
}

impl std::fmt::Debug for RateController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateController")
            .field("current", &self.current())
            .field("state", &self.state())
            .field("average_batch", &self.average_batch())
            .finish()
    }
}
