//! Connection pooling for the dataport migration engine.
//!
//! Many logical workers multiplex onto a small set of authenticated
//! "seed" clients. Each [`ConnectionSource`] supplies one seed; the
//! [`ConnectionPool`] clones seeds into pooled handles, hands them out
//! under per-source and global capacity bounds, and validates idle
//! handles in the background. Source selection is throttle-aware by
//! default, reading the shared
//! [`ThrottleTracker`](dataport_throttle::ThrottleTracker).
//!
//! Callers acquire inside the innermost loop, never hold a handle
//! across parallel work items, and rely on drop to return the handle.

pub mod config;
pub mod error;
pub mod pool;
pub mod source;
pub mod strategy;

pub use config::{PoolOptions, PoolOptionsBuilder};
pub use error::PoolError;
pub use pool::{ConnectionPool, PoolStats, PooledHandle, SourceStats};
pub use source::{ConnectionSource, ConnectionStringSource, PreAuthenticatedSource, SeedFactory};
pub use strategy::SelectionStrategy;
