//! The phase pipeline contract.
//!
//! Each import phase implements [`PhaseProcessor`] over the shared
//! [`ImportContext`]; the importer runs them in a fixed order and stops
//! at the first phase that does not succeed. Already-committed effects
//! remain in the target; the engine never rolls back.

mod associations;
mod deferred;
mod entities;
mod validate;

pub use associations::ManyToManyPhase;
pub use deferred::DeferredFieldsPhase;
pub use entities::EntityPhase;
pub use validate::TargetValidationPhase;

use crate::context::ImportContext;
use async_trait::async_trait;
use dataport_bulk::RecordError;
use dataport_client::{codes, ServiceFault};
use dataport_core::error::{ErrorKind, ErrorReport, MigrationError};
use std::time::Duration;

/// Outcome of one phase.
#[derive(Debug, Clone, Default)]
pub struct PhaseResult {
    /// Whether the pipeline may continue into the next phase.
    pub success: bool,
    /// Units examined (records, entities or association targets,
    /// depending on the phase).
    pub processed: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub duration: Duration,
    pub errors: Vec<ErrorReport>,
}

impl PhaseResult {
    pub(crate) fn succeeded() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }
}

/// One step of the import pipeline.
#[async_trait]
pub trait PhaseProcessor: Send + Sync {
    /// Stable name used in logs and summaries.
    fn name(&self) -> &'static str;

    /// Runs the phase to completion over the shared context.
    ///
    /// `Err` aborts the pipeline (operation-wide failure); a returned
    /// result with `success == false` stops it after recording.
    async fn process(&self, ctx: &ImportContext) -> Result<PhaseResult, MigrationError>;
}

/// Maps a whole-call service fault onto the error taxonomy.
pub(crate) fn fault_to_error(context: &str, fault: &ServiceFault) -> MigrationError {
    if fault.code == codes::OBJECT_NOT_FOUND {
        MigrationError::NotFound(format!("{context}: {}", fault.message))
    } else if fault.is_protection() {
        MigrationError::Fatal(format!(
            "{context}: unhandled service protection fault {}",
            fault.code
        ))
    } else {
        MigrationError::Fatal(format!("{context}: {fault}"))
    }
}

/// Converts an executor record error into a progress report.
pub(crate) fn record_error_report(entity: &str, error: &RecordError) -> ErrorReport {
    let kind = match error.code {
        Some(codes::OBJECT_NOT_FOUND) => ErrorKind::NotFound,
        _ => ErrorKind::Fatal,
    };
    let mut report = ErrorReport::new(kind, error.message.clone())
        .with_entity(entity)
        .with_record_index(error.index);
    if let Some(code) = error.code {
        report = report.with_code(code);
    }
    report
}
