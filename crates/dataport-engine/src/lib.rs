//! The dataport migration engine.
//!
//! Ties the subsystems together with explicit, constructor-wired
//! ownership: the [`MigrationEngine`] owns the connection pool, the
//! throttle tracker, the rate controller and the bulk executor; the
//! import phases receive them by reference through the
//! [`ImportContext`]. There is no global registry.
//!
//! An import runs four ordered phases over one shared context:
//! target-field validation, tiered entity writes, deferred-field
//! updates, then many-to-many associations. Export is a simpler
//! consumer of the same pool: a parallel per-entity paged scan into a
//! portable archive.

pub mod context;
pub mod engine;
pub mod export;
pub mod import;
pub mod phases;

pub use context::{ImportContext, ImportMode, ImportOptions, ImportOptionsBuilder};
pub use engine::{MigrationEngine, MigrationEngineBuilder};
pub use export::{ExportSummary, Exporter};
pub use import::{ImportSummary, Importer, RunStatus};
pub use phases::{PhaseProcessor, PhaseResult};
