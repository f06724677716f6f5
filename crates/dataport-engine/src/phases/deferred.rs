//! Phase C: deferred field updates.
//!
//! For every entity with deferred fields, builds minimal update records
//! containing only the resolved deferred lookups: the record's own
//! identifier and every referenced identifier are translated through
//! the identity map. Records with unresolved references are skipped
//! with a warning; they never fail the phase.

use crate::context::ImportContext;
use crate::phases::{record_error_report, PhaseProcessor, PhaseResult};
use async_trait::async_trait;
use dataport_bulk::BulkExecutor;
use dataport_core::error::{ErrorKind, ErrorReport, MigrationError};
use dataport_core::progress::{Phase, ProgressEvent};
use dataport_core::record::{EntityRef, Record, Value};
use std::sync::Arc;
use std::time::Instant;

pub struct DeferredFieldsPhase {
    executor: Arc<BulkExecutor>,
}

impl DeferredFieldsPhase {
    pub fn new(executor: Arc<BulkExecutor>) -> Self {
        Self { executor }
    }
}

/// The translated update for one record, or the reference that failed
/// to translate.
enum Translation {
    Update(Record),
    Unresolved(EntityRef),
    /// The record carries no deferred values; nothing to do.
    Empty,
}

fn translate(ctx: &ImportContext, entity: &str, record: &Record, fields: &[String]) -> Translation {
    let Some(new_id) = ctx.id_map.resolve(entity, record.id()) else {
        return Translation::Unresolved(EntityRef::new(entity, record.id()));
    };

    let mut update = Record::new(new_id);
    for field in fields {
        let Some(value) = record.get(field) else {
            continue;
        };
        let Some(reference) = value.as_reference() else {
            continue;
        };
        let Some(target) = ctx.id_map.resolve(&reference.entity, reference.id) else {
            return Translation::Unresolved(reference.clone());
        };
        update.set(
            field.clone(),
            Value::Reference(EntityRef::new(reference.entity.clone(), target)),
        );
    }
    if update.is_empty() {
        Translation::Empty
    } else {
        Translation::Update(update)
    }
}

#[async_trait]
impl PhaseProcessor for DeferredFieldsPhase {
    fn name(&self) -> &'static str {
        "deferred-fields"
    }

    async fn process(&self, ctx: &ImportContext) -> Result<PhaseResult, MigrationError> {
        let started = Instant::now();
        let bulk = ctx.options.bulk_options()?;
        let mut result = PhaseResult::succeeded();

        for (entity, fields) in &ctx.plan.deferred_fields {
            if ctx.cancel.is_cancelled() {
                result.success = false;
                break;
            }
            let records = ctx.data.records(entity);
            let mut updates = Vec::new();
            let mut skipped = 0u64;

            for record in records {
                result.processed += 1;
                match translate(ctx, entity, record, fields) {
                    Translation::Update(update) => updates.push(update),
                    Translation::Empty => {}
                    Translation::Unresolved(reference) => {
                        skipped += 1;
                        tracing::warn!(
                            %entity,
                            record = %record.id(),
                            missing_entity = %reference.entity,
                            missing_id = %reference.id,
                            "deferred reference has no identity mapping; record skipped"
                        );
                        ctx.progress.emit_error(
                            ErrorReport::new(
                                ErrorKind::NotFound,
                                format!(
                                    "deferred reference {}:{} has no target mapping",
                                    reference.entity, reference.id
                                ),
                            )
                            .with_entity(entity.clone()),
                        );
                    }
                }
            }

            if updates.is_empty() {
                if skipped > 0 {
                    ctx.progress.emit(
                        ProgressEvent::new(Phase::Deferred)
                            .with_entity(entity.clone())
                            .with_counts(0, Some(records.len() as u64))
                            .with_message(format!("{skipped} records skipped")),
                    );
                }
                continue;
            }

            let update_count = updates.len() as u64;
            let outcome = self
                .executor
                .update_multiple(entity, updates, &bulk, &ctx.cancel)
                .await?;

            for error in &outcome.errors {
                let report = record_error_report(entity, error);
                ctx.progress.emit_error(report.clone());
                result.errors.push(report);
            }
            result.success_count += outcome.success_count() as u64;
            result.failure_count += outcome.failure_count() as u64;

            ctx.progress.emit(
                ProgressEvent::new(Phase::Deferred)
                    .with_entity(entity.clone())
                    .with_field(fields.join(","))
                    .with_counts(outcome.success_count() as u64, Some(update_count)),
            );
        }

        if result.failure_count > 0 && !ctx.options.continue_on_error() {
            result.success = false;
        }
        result.duration = started.elapsed();
        Ok(result)
    }
}
