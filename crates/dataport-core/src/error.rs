//! The unified error type for migration operations.
//!
//! Every dataport crate defines its own narrow error enum close to the
//! code that produces it; all of them convert into [`MigrationError`] so
//! callers compose subsystems without writing conversion boilerplate.
//! The `From` implementations live in the producing crates to avoid
//! circular dependencies.

use serde::Serialize;
use std::time::Duration;

/// Unified error for migration operations.
///
/// Variants map one-to-one onto the engine's error taxonomy. Use
/// [`MigrationError::kind`] when routing errors into the progress stream
/// and [`MigrationError::is_retryable`] when deciding whether a caller
/// may usefully try again.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MigrationError {
    /// Input shape is malformed; raised before any I/O.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Run options are missing or contradictory.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A source could not produce a seed client, or cloning the seed failed.
    #[error("connection failed for source '{source_name}': {reason}")]
    ConnectionFailed {
        /// Source name the failure is attributed to.
        source_name: String,
        /// Underlying reason, as reported by the transport.
        reason: String,
    },

    /// No pooled client became available within the acquire timeout.
    #[error("connection pool exhausted after waiting {waited:?}")]
    PoolExhausted {
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// The service rejected the call under a protection limit.
    #[error("service protection on '{source_name}' (code {code}), retry after {retry_after:?}")]
    ServiceProtection {
        /// Source name that was throttled.
        source_name: String,
        /// Server error code (request-rate, execution-time or concurrency).
        code: i32,
        /// Server-provided or default cooldown.
        retry_after: Duration,
    },

    /// A transient race in the service's lazy bulk infrastructure.
    #[error("transient service race: {0}")]
    TransientRace(String),

    /// A referenced target entity, field or record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Fields present in the archive are missing from the target.
    #[error("schema mismatch for entity '{entity}': target is missing {fields:?}")]
    SchemaMismatch {
        /// Entity whose target metadata is incomplete.
        entity: String,
        /// Field logical names absent on the target.
        fields: Vec<String>,
    },

    /// Reserved for the SQL-path collaborator; never produced by the core.
    #[error("operation blocked: {0}")]
    DmlBlocked(String),

    /// Cancellation or an unrecoverable server fault.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl MigrationError {
    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::Validation(_) => ErrorKind::Validation,
            MigrationError::Configuration(_) => ErrorKind::Configuration,
            MigrationError::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            MigrationError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            MigrationError::ServiceProtection { .. } => ErrorKind::ServiceProtection,
            MigrationError::TransientRace(_) => ErrorKind::TransientRace,
            MigrationError::NotFound(_) => ErrorKind::NotFound,
            MigrationError::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            MigrationError::DmlBlocked(_) => ErrorKind::DmlBlocked,
            MigrationError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether a caller may retry the failed operation.
    ///
    /// Pool exhaustion and transient races are retryable; protection
    /// faults are handled inside the executor and only surface here when
    /// the retry-after exceeded the configured tolerance.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MigrationError::PoolExhausted { .. } | MigrationError::TransientRace(_)
        )
    }

    /// Returns `true` for errors raised before any I/O happened.
    pub fn is_pre_flight(&self) -> bool {
        matches!(
            self,
            MigrationError::Validation(_) | MigrationError::Configuration(_)
        )
    }

    /// Converts this error into a report suitable for the progress stream.
    pub fn to_report(&self) -> ErrorReport {
        let (source, entity, code) = match self {
            MigrationError::ConnectionFailed { source_name, .. } => {
                (Some(source_name.clone()), None, None)
            }
            MigrationError::ServiceProtection {
                source_name, code, ..
            } => (Some(source_name.clone()), None, Some(*code)),
            MigrationError::SchemaMismatch { entity, .. } => (None, Some(entity.clone()), None),
            _ => (None, None, None),
        };
        ErrorReport {
            kind: self.kind(),
            source,
            entity,
            record_index: None,
            code,
            message: self.to_string(),
        }
    }
}

/// The kinds in the error taxonomy, independent of payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Configuration,
    ConnectionFailed,
    PoolExhausted,
    ServiceProtection,
    TransientRace,
    NotFound,
    SchemaMismatch,
    DmlBlocked,
    Fatal,
}

/// A flattened error record carried by `error` progress events.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    /// Taxonomy kind.
    pub kind: ErrorKind,
    /// Source name, when the error is attributable to one connection source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Entity logical name, when the error is scoped to one entity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    /// Index of the offending record in the original input collection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_index: Option<usize>,
    /// Server error code, when one was reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    /// Human-readable message.
    pub message: String,
}

impl ErrorReport {
    /// Creates a report with just a kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            source: None,
            entity: None,
            record_index: None,
            code: None,
            message: message.into(),
        }
    }

    /// Scopes the report to an entity.
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    /// Scopes the report to a record index.
    pub fn with_record_index(mut self, index: usize) -> Self {
        self.record_index = Some(index);
        self
    }

    /// Attaches a server error code.
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }
}
