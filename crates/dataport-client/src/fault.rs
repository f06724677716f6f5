//! Service fault model.
//!
//! The target service reports failures with numeric error codes. Three
//! codes are reserved for service protection (request rate, aggregate
//! execution time, concurrency); they carry a retry-after hint. One
//! documented transient fault stems from the service's lazy per-table
//! bulk infrastructure racing its own type creation on freshly created
//! tables; it is recognized by message shape.

use std::time::Duration;

/// Well-known service error codes.
pub mod codes {
    /// Number of requests exceeded the per-user limit.
    pub const REQUEST_RATE: i32 = -2147015902;
    /// Combined execution time exceeded the per-user limit.
    pub const EXECUTION_TIME: i32 = -2147015903;
    /// Concurrent request count exceeded the per-user limit.
    pub const CONCURRENCY: i32 = -2147015898;
    /// The referenced record does not exist.
    pub const OBJECT_NOT_FOUND: i32 = -2147220969;
    /// A record with the same identifier already exists.
    pub const DUPLICATE_RECORD: i32 = -2147220937;
}

/// Marker present in the transient lazy-TVP race fault message.
const TVP_RACE_MARKER: &str = "because it is referenced";

/// A fault returned by the service for a whole call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("service fault {code}: {message}")]
pub struct ServiceFault {
    pub code: i32,
    pub message: String,
    /// Cooldown hint attached to protection faults. The server may omit
    /// it; callers substitute a configured default.
    pub retry_after: Option<Duration>,
}

impl ServiceFault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    /// A protection fault with a retry-after hint.
    pub fn throttle(code: i32, retry_after: Duration) -> Self {
        Self {
            code,
            message: format!("service protection limit reached (code {code})"),
            retry_after: Some(retry_after),
        }
    }

    /// The transient lazy-TVP race fault for `entity`.
    pub fn transient_race(entity: &str) -> Self {
        Self {
            code: -2147220970,
            message: format!(
                "Could not drop type '{entity}_TVPType' {TVP_RACE_MARKER} by an active operation"
            ),
            retry_after: None,
        }
    }

    /// Whether this fault is a service-protection throttle.
    pub fn is_protection(&self) -> bool {
        matches!(
            self.code,
            codes::REQUEST_RATE | codes::EXECUTION_TIME | codes::CONCURRENCY
        )
    }

    /// Whether this fault is the transient lazy-TVP race.
    pub fn is_transient_race(&self) -> bool {
        self.message.contains(TVP_RACE_MARKER)
    }
}
