//! Bulk operation executor.
//!
//! Splits large create/update/upsert/delete requests into batches of at
//! most 1000 records, runs them through the connection pool under the
//! adaptive rate controller's admission gate, and retries the two
//! recoverable fault classes: service-protection throttles (sleep for
//! the hinted retry-after, resubmit) and the transient lazy-TVP race on
//! freshly created tables (bounded backoff ladder on the same source).

pub mod executor;
pub mod options;
pub mod result;

pub use executor::BulkExecutor;
pub use options::{BulkOptions, BulkOptionsBuilder};
pub use result::{BulkResult, RecordError};
