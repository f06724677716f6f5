//! Phase B: tiered entity writes.
//!
//! Tiers run in order; a tier must complete before the next starts.
//! Within a tier, independent entities run concurrently up to the
//! configured parallelism, while members of one cyclic group run
//! sequentially in their plan order so every non-deferred intra-group
//! lookup is satisfiable at write time. Deferred and excluded fields
//! are stripped from each record before submission, and every
//! successful write is recorded in the identity map.

use crate::context::{ImportContext, ImportMode};
use crate::phases::{record_error_report, PhaseProcessor, PhaseResult};
use async_trait::async_trait;
use dataport_bulk::{BulkExecutor, BulkOptions};
use dataport_core::error::{ErrorReport, MigrationError};
use dataport_core::progress::{Phase, ProgressEvent};
use dataport_core::record::Record;
use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

pub struct EntityPhase {
    executor: Arc<BulkExecutor>,
}

#[derive(Default)]
struct UnitOutcome {
    processed: u64,
    success_count: u64,
    failure_count: u64,
    errors: Vec<ErrorReport>,
}

impl EntityPhase {
    pub fn new(executor: Arc<BulkExecutor>) -> Self {
        Self { executor }
    }

    async fn process_unit(
        &self,
        ctx: &ImportContext,
        tier: usize,
        unit: Vec<String>,
        bulk: &BulkOptions,
    ) -> Result<UnitOutcome, MigrationError> {
        let mut outcome = UnitOutcome::default();
        for entity in &unit {
            if ctx.cancel.is_cancelled() {
                break;
            }
            self.process_entity(ctx, tier, entity, bulk, &mut outcome)
                .await?;
        }
        Ok(outcome)
    }

    async fn process_entity(
        &self,
        ctx: &ImportContext,
        tier: usize,
        entity: &str,
        bulk: &BulkOptions,
        outcome: &mut UnitOutcome,
    ) -> Result<(), MigrationError> {
        let records = ctx.data.records(entity);
        outcome.processed += records.len() as u64;
        if records.is_empty() {
            ctx.progress.emit(
                ProgressEvent::new(Phase::Importing)
                    .with_entity(entity)
                    .with_tier(tier)
                    .with_counts(0, Some(0)),
            );
            return Ok(());
        }

        let stripped = ctx.stripped_fields(entity);
        let prepared = prepare_records(records, &stripped);

        tracing::debug!(entity, tier, records = records.len(), "writing entity");
        let result = match ctx.options.mode() {
            ImportMode::Create => {
                self.executor
                    .create_multiple(entity, prepared, bulk, &ctx.cancel)
                    .await?
            }
            ImportMode::Update => {
                self.executor
                    .update_multiple(entity, prepared, bulk, &ctx.cancel)
                    .await?
            }
            ImportMode::Upsert => {
                self.executor
                    .upsert_multiple(entity, prepared, bulk, &ctx.cancel)
                    .await?
            }
        };

        for (index, target) in result.successes() {
            ctx.id_map.insert(entity, records[index].id(), target);
        }
        for error in &result.errors {
            let report = record_error_report(entity, error);
            ctx.progress.emit_error(report.clone());
            outcome.errors.push(report);
        }

        let seconds = result.duration.as_secs_f64();
        let rps = if seconds > 0.0 {
            Some(result.success_count() as f64 / seconds)
        } else {
            None
        };
        let mut event = ProgressEvent::new(Phase::Importing)
            .with_entity(entity)
            .with_tier(tier)
            .with_counts(result.success_count() as u64, Some(records.len() as u64));
        if let Some(rps) = rps {
            event = event.with_rps(rps);
        }
        ctx.progress.emit(event);

        outcome.success_count += result.success_count() as u64;
        outcome.failure_count += result.failure_count() as u64;
        Ok(())
    }
}

/// Copies of the records with deferred and excluded fields removed.
fn prepare_records(records: &[Record], stripped: &BTreeSet<String>) -> Vec<Record> {
    if stripped.is_empty() {
        return records.to_vec();
    }
    records
        .iter()
        .map(|record| record.without_fields(stripped.iter().map(String::as_str)))
        .collect()
}

#[async_trait]
impl PhaseProcessor for EntityPhase {
    fn name(&self) -> &'static str {
        "entities"
    }

    async fn process(&self, ctx: &ImportContext) -> Result<PhaseResult, MigrationError> {
        let started = Instant::now();
        let bulk = ctx.options.bulk_options()?;
        let mut result = PhaseResult::succeeded();

        for (tier_index, tier) in ctx.plan.tiers.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                result.success = false;
                break;
            }

            // A cyclic group is one sequential unit; everything else in
            // the tier runs as its own unit.
            let mut grouped: BTreeSet<&String> = BTreeSet::new();
            let mut units: Vec<Vec<String>> = Vec::new();
            for group in &ctx.plan.cyclic_groups {
                if group.iter().any(|member| tier.contains(member)) {
                    units.push(group.clone());
                    grouped.extend(group.iter());
                }
            }
            for entity in tier {
                if !grouped.contains(entity) {
                    units.push(vec![entity.clone()]);
                }
            }
            units.sort();

            let outcomes: Vec<Result<UnitOutcome, MigrationError>> =
                futures::stream::iter(units.into_iter().map(|unit| {
                    self.process_unit(ctx, tier_index, unit, &bulk)
                }))
                .buffer_unordered(ctx.options.max_parallel_entities())
                .collect()
                .await;

            for outcome in outcomes {
                let unit = outcome?;
                result.processed += unit.processed;
                result.success_count += unit.success_count;
                result.failure_count += unit.failure_count;
                result.errors.extend(unit.errors);
            }

            if result.failure_count > 0 && !ctx.options.continue_on_error() {
                tracing::warn!(
                    tier = tier_index,
                    failures = result.failure_count,
                    "tier recorded failures; subsequent tiers cancelled"
                );
                result.success = false;
                break;
            }
        }

        if ctx.cancel.is_cancelled() {
            result.success = false;
        }
        result.duration = started.elapsed();
        Ok(result)
    }
}
