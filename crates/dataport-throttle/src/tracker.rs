//! Per-source throttle state.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cooldown window for one source.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleState {
    /// When the throttle response was observed.
    pub throttled_at: Instant,
    /// Earliest time new requests are considered safe.
    pub expires_at: Instant,
    /// The effective retry-after that produced `expires_at`.
    pub retry_after: Duration,
}

/// Tracks, per source name, the earliest time new requests are safe.
///
/// Never fails: unknown sources read as not throttled. Reads do not
/// block writes; entries are pruned once expired past a grace window.
#[derive(Debug)]
pub struct ThrottleTracker {
    entries: DashMap<String, ThrottleState>,
    default_retry_after: Duration,
    grace: Duration,
    events: AtomicU64,
}

impl Default for ThrottleTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(300))
    }
}

impl ThrottleTracker {
    /// `default_retry_after` substitutes for a missing server hint;
    /// expired entries older than `grace` are dropped by [`prune`].
    ///
    /// [`prune`]: ThrottleTracker::prune
    pub fn new(default_retry_after: Duration, grace: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_retry_after,
            grace,
            events: AtomicU64::new(0),
        }
    }

    /// Records a throttle response for `source`. Returns the effective
    /// retry-after.
    pub fn record(&self, source: &str, retry_after: Option<Duration>) -> Duration {
        let retry_after = retry_after.unwrap_or(self.default_retry_after);
        let now = Instant::now();
        self.entries.insert(
            source.to_string(),
            ThrottleState {
                throttled_at: now,
                expires_at: now + retry_after,
                retry_after,
            },
        );
        self.events.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(source, ?retry_after, "source throttled");
        #[cfg(feature = "metrics")]
        metrics::counter!("dataport_throttle_events_total", "source" => source.to_string())
            .increment(1);
        retry_after
    }

    /// Whether `source` is inside its cooldown window.
    pub fn is_throttled(&self, source: &str) -> bool {
        self.entries
            .get(source)
            .map(|state| Instant::now() < state.expires_at)
            .unwrap_or(false)
    }

    /// The current state for `source`, if any was recorded.
    pub fn state(&self, source: &str) -> Option<ThrottleState> {
        self.entries.get(source).map(|state| *state)
    }

    /// The subset of `names` that is not throttled.
    pub fn available<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        names
            .into_iter()
            .filter(|name| !self.is_throttled(name))
            .collect()
    }

    /// The soonest `expires_at` among the throttled subset of `names`.
    pub fn soonest_expiry<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Option<Instant> {
        let now = Instant::now();
        names
            .into_iter()
            .filter_map(|name| self.entries.get(name).map(|state| state.expires_at))
            .filter(|expires_at| *expires_at > now)
            .min()
    }

    /// Drops entries expired longer than the grace window ago.
    pub fn prune(&self) {
        let now = Instant::now();
        let grace = self.grace;
        self.entries
            .retain(|_, state| now < state.expires_at + grace);
    }

    /// Total throttle responses recorded.
    pub fn throttle_events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// Number of tracked sources (throttled or cooling off).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
