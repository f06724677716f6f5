//! The import pipeline driver.

use crate::context::ImportContext;
use crate::phases::{
    DeferredFieldsPhase, EntityPhase, ManyToManyPhase, PhaseProcessor, PhaseResult,
    TargetValidationPhase,
};
use dataport_bulk::BulkExecutor;
use dataport_core::error::MigrationError;
use dataport_core::progress::{Phase, ProgressEvent};
use std::sync::Arc;
use tracing::Instrument;

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every phase completed with zero failures.
    Success,
    /// The pipeline completed but some records or associations were
    /// skipped or failed.
    PartialSuccess,
    /// A phase failed or the run was cancelled before completion.
    Failed,
}

/// Per-phase results plus the overall status.
#[derive(Debug)]
pub struct ImportSummary {
    pub status: RunStatus,
    pub phases: Vec<(&'static str, PhaseResult)>,
}

impl ImportSummary {
    pub fn total_successes(&self) -> u64 {
        self.phases.iter().map(|(_, result)| result.success_count).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.phases.iter().map(|(_, result)| result.failure_count).sum()
    }

    /// The result of a phase by name.
    pub fn phase(&self, name: &str) -> Option<&PhaseResult> {
        self.phases
            .iter()
            .find(|(phase_name, _)| *phase_name == name)
            .map(|(_, result)| result)
    }
}

/// Runs the ordered phase pipeline over one import context.
pub struct Importer {
    phases: Vec<Box<dyn PhaseProcessor>>,
}

impl Importer {
    /// The standard pipeline: validation, entities, deferred fields,
    /// many-to-many.
    pub fn new(executor: Arc<BulkExecutor>) -> Self {
        let pool = executor.pool().clone();
        Self {
            phases: vec![
                Box::new(TargetValidationPhase::new(pool.clone())),
                Box::new(EntityPhase::new(Arc::clone(&executor))),
                Box::new(DeferredFieldsPhase::new(executor)),
                Box::new(ManyToManyPhase::new(pool)),
            ],
        }
    }

    /// A pipeline with custom phases, in the given order.
    pub fn with_phases(phases: Vec<Box<dyn PhaseProcessor>>) -> Self {
        Self { phases }
    }

    /// Runs all phases in order, stopping at the first phase that does
    /// not succeed. Completed phases' effects remain committed; the
    /// engine never rolls back.
    pub async fn run(&self, ctx: &ImportContext) -> Result<ImportSummary, MigrationError> {
        ctx.options.validate()?;
        let mut phases = Vec::with_capacity(self.phases.len());
        let mut completed = true;

        for phase in &self.phases {
            let span = tracing::info_span!("import_phase", phase = phase.name());
            ctx.progress.reset_cadence();

            let result = match phase.process(ctx).instrument(span).await {
                Ok(result) => result,
                Err(error) => {
                    ctx.progress.emit_error(error.to_report());
                    tracing::error!(phase = phase.name(), %error, "phase aborted");
                    return Err(error);
                }
            };

            tracing::info!(
                phase = phase.name(),
                processed = result.processed,
                successes = result.success_count,
                failures = result.failure_count,
                elapsed_ms = result.duration.as_millis() as u64,
                "phase finished"
            );
            let stop = !result.success;
            phases.push((phase.name(), result));
            if stop {
                completed = false;
                break;
            }
        }

        let failures: u64 = phases.iter().map(|(_, result)| result.failure_count).sum();
        let status = if !completed {
            RunStatus::Failed
        } else if failures > 0 {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Success
        };

        ctx.progress.emit(
            ProgressEvent::new(if status == RunStatus::Failed {
                Phase::Error
            } else {
                Phase::Complete
            })
            .with_counts(
                phases.iter().map(|(_, result)| result.success_count).sum(),
                None,
            )
            .with_message(match status {
                RunStatus::Success => "import complete",
                RunStatus::PartialSuccess => "import complete with skipped records",
                RunStatus::Failed => "import stopped",
            }),
        );

        Ok(ImportSummary { status, phases })
    }
}
