//! Structured progress event stream.
//!
//! All long-running operations report through one event shape. Producers
//! emit on a throttled cadence (at most once per 100 records, plus every
//! phase boundary); consumers register listeners. The engine never picks
//! a renderer: a console UI, a JSON-lines stream or a test probe all
//! attach the same way.

use crate::error::ErrorReport;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Records between two successive progress emissions for one (phase, entity).
const EMIT_EVERY: u64 = 100;

/// The phase an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Analyzing,
    Exporting,
    Importing,
    Deferred,
    ManyToMany,
    Complete,
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Analyzing => "analyzing",
            Phase::Exporting => "exporting",
            Phase::Importing => "importing",
            Phase::Deferred => "deferred",
            Phase::ManyToMany => "m2m",
            Phase::Complete => "complete",
            Phase::Error => "error",
        };
        f.write_str(name)
    }
}

/// One event on the progress stream.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    /// Phase the producer is in.
    pub phase: Phase,
    /// Entity logical name, when scoped to one entity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    /// Field logical name, for deferred-field updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Relationship name, for many-to-many work.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
    /// Tier index within the execution plan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<usize>,
    /// Units completed so far.
    pub current: u64,
    /// Total units, when known up front.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// Observed records per second, when measured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rps: Option<f64>,
    /// Free-form message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error payload for `Phase::Error` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl ProgressEvent {
    /// Creates an event for a phase with a completion counter.
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            entity: None,
            field: None,
            relationship: None,
            tier: None,
            current: 0,
            total: None,
            rps: None,
            message: None,
            error: None,
        }
    }

    /// Creates an `error` event wrapping a report.
    pub fn error(report: ErrorReport) -> Self {
        let mut event = Self::new(Phase::Error);
        event.entity = report.entity.clone();
        event.error = Some(report);
        event
    }

    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_relationship(mut self, relationship: impl Into<String>) -> Self {
        self.relationship = Some(relationship.into());
        self
    }

    pub fn with_tier(mut self, tier: usize) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_counts(mut self, current: u64, total: Option<u64>) -> Self {
        self.current = current;
        self.total = total;
        self
    }

    pub fn with_rps(mut self, rps: f64) -> Self {
        self.rps = Some(rps);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Receives progress events.
pub trait ProgressListener: Send + Sync {
    /// Called for every emitted event.
    fn on_event(&self, event: &ProgressEvent);
}

/// A function-based listener.
pub struct FnProgressListener<F>
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    f: F,
}

impl<F> FnProgressListener<F>
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ProgressListener for FnProgressListener<F>
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        (self.f)(event)
    }
}

/// A collection of listeners.
///
/// Emission is panic-isolated: a listener that panics is logged and the
/// remaining listeners still receive the event.
#[derive(Clone, Default)]
pub struct ProgressListeners {
    listeners: Vec<Arc<dyn ProgressListener>>,
}

impl ProgressListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener.
    pub fn add<L>(&mut self, listener: L)
    where
        L: ProgressListener + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Emits an event to all listeners.
    pub fn emit(&self, event: &ProgressEvent) {
        for (index, listener) in self.listeners.iter().enumerate() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_event(event);
            }));
            if result.is_err() {
                tracing::warn!(
                    listener_index = index,
                    phase = %event.phase,
                    "progress listener panicked"
                );
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

/// A listener that forwards events to `tracing` at info level.
pub struct TracingListener;

impl ProgressListener for TracingListener {
    fn on_event(&self, event: &ProgressEvent) {
        tracing::info!(
            phase = %event.phase,
            entity = event.entity.as_deref(),
            current = event.current,
            total = event.total,
            message = event.message.as_deref(),
            "progress"
        );
    }
}

/// A listener that writes one JSON object per event to a writer.
pub struct JsonLinesListener<W: std::io::Write + Send> {
    writer: parking_lot::Mutex<W>,
}

impl<W: std::io::Write + Send> JsonLinesListener<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: parking_lot::Mutex::new(writer),
        }
    }
}

impl<W: std::io::Write + Send> ProgressListener for JsonLinesListener<W> {
    fn on_event(&self, event: &ProgressEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let mut writer = self.writer.lock();
            let _ = writeln!(writer, "{line}");
        }
    }
}

/// Shared reporting handle with a per-(phase, entity) emission cadence.
///
/// [`ProgressReporter::record`] only reaches the listeners once every
/// [`EMIT_EVERY`] records; [`ProgressReporter::emit`] always goes through
/// and is what phase boundaries use.
#[derive(Clone)]
pub struct ProgressReporter {
    listeners: Arc<ProgressListeners>,
    counters: Arc<DashMap<(Phase, String), u64>>,
}

impl ProgressReporter {
    pub fn new(listeners: ProgressListeners) -> Self {
        Self {
            listeners: Arc::new(listeners),
            counters: Arc::new(DashMap::new()),
        }
    }

    /// A reporter with no listeners, for tests and defaults.
    pub fn disabled() -> Self {
        Self::new(ProgressListeners::new())
    }

    /// Emits an event unconditionally.
    pub fn emit(&self, event: ProgressEvent) {
        self.listeners.emit(&event);
    }

    /// Emits an error event unconditionally.
    pub fn emit_error(&self, report: ErrorReport) {
        self.listeners.emit(&ProgressEvent::error(report));
    }

    /// Records `count` completed units against (phase, entity) and emits
    /// when a cadence boundary is crossed.
    ///
    /// `total` and `rps` are passed through when an emission happens.
    pub fn record(
        &self,
        phase: Phase,
        entity: &str,
        count: u64,
        total: Option<u64>,
        rps: Option<f64>,
    ) {
        let key = (phase, entity.to_string());
        let mut entry = self.counters.entry(key).or_insert(0);
        let before = *entry;
        *entry += count;
        let after = *entry;
        drop(entry);

        if before / EMIT_EVERY != after / EMIT_EVERY || total == Some(after) {
            let mut event = ProgressEvent::new(phase)
                .with_entity(entity)
                .with_counts(after, total);
            if let Some(rps) = rps {
                event = event.with_rps(rps);
            }
            self.listeners.emit(&event);
        }
    }

    /// Clears the cadence counters, typically between phases.
    pub fn reset_cadence(&self) {
        self.counters.clear();
    }
}
