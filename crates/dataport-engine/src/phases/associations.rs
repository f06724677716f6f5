//! Phase D: many-to-many associations.
//!
//! Translates both endpoints of every archived association through the
//! identity map and issues associate requests. Targets that fail to
//! translate are skipped with a warning. The `role` entity gets one
//! extra chance: its identifiers are often identical across
//! organizations, so an untranslated role id is probed by identifier
//! against the target before being skipped.

use crate::context::ImportContext;
use crate::phases::{fault_to_error, PhaseProcessor, PhaseResult};
use async_trait::async_trait;
use dataport_client::ServiceClient;
use dataport_core::error::{ErrorKind, ErrorReport, MigrationError};
use dataport_core::progress::{Phase, ProgressEvent};
use dataport_core::record::{Association, EntityRef};
use dataport_pool::ConnectionPool;
use std::time::Instant;
use uuid::Uuid;

/// Entity whose associations fall back to a by-identifier probe.
const ROLE_ENTITY: &str = "role";

pub struct ManyToManyPhase {
    pool: ConnectionPool,
}

impl ManyToManyPhase {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Resolves one target id, with the role-probe fallback.
    async fn resolve_target(
        &self,
        ctx: &ImportContext,
        target_entity: &str,
        source_id: Uuid,
    ) -> Result<Option<Uuid>, MigrationError> {
        if let Some(mapped) = ctx.id_map.resolve(target_entity, source_id) {
            return Ok(Some(mapped));
        }
        if target_entity == ROLE_ENTITY {
            let handle = self.pool.get().await?;
            let exists = handle
                .record_exists(ROLE_ENTITY, source_id)
                .await
                .map_err(|fault| fault_to_error("role probe", &fault))?;
            if exists {
                return Ok(Some(source_id));
            }
        }
        Ok(None)
    }

    async fn process_association(
        &self,
        ctx: &ImportContext,
        association: &Association,
        result: &mut PhaseResult,
    ) -> Result<(), MigrationError> {
        result.processed += association.target_ids.len() as u64;

        let Some(source_id) = ctx.id_map.resolve(&association.entity, association.id) else {
            result.failure_count += association.target_ids.len() as u64;
            ctx.progress.emit_error(
                ErrorReport::new(
                    ErrorKind::NotFound,
                    format!(
                        "association source {}:{} has no target mapping",
                        association.entity, association.id
                    ),
                )
                .with_entity(association.entity.clone()),
            );
            return Ok(());
        };

        let mut targets = Vec::with_capacity(association.target_ids.len());
        for target_id in &association.target_ids {
            match self
                .resolve_target(ctx, &association.target_entity, *target_id)
                .await?
            {
                Some(mapped) => {
                    targets.push(EntityRef::new(association.target_entity.clone(), mapped))
                }
                None => {
                    result.failure_count += 1;
                    tracing::warn!(
                        relationship = %association.relationship,
                        target_entity = %association.target_entity,
                        target = %target_id,
                        "association target missing in target organization; skipped"
                    );
                    ctx.progress.emit_error(
                        ErrorReport::new(
                            ErrorKind::NotFound,
                            format!(
                                "association target {}:{} not found",
                                association.target_entity, target_id
                            ),
                        )
                        .with_entity(association.target_entity.clone()),
                    );
                }
            }
        }
        if targets.is_empty() {
            return Ok(());
        }

        let record = EntityRef::new(association.entity.clone(), source_id);
        let handle = self.pool.get().await?;
        match handle
            .associate(&association.relationship, &record, &targets)
            .await
        {
            Ok(()) => result.success_count += targets.len() as u64,
            Err(fault) => {
                result.failure_count += targets.len() as u64;
                let report = ErrorReport::new(
                    ErrorKind::Fatal,
                    format!(
                        "associate failed for '{}': {fault}",
                        association.relationship
                    ),
                )
                .with_entity(association.entity.clone())
                .with_code(fault.code);
                ctx.progress.emit_error(report.clone());
                result.errors.push(report);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PhaseProcessor for ManyToManyPhase {
    fn name(&self) -> &'static str {
        "many-to-many"
    }

    async fn process(&self, ctx: &ImportContext) -> Result<PhaseResult, MigrationError> {
        let started = Instant::now();
        let mut result = PhaseResult::succeeded();

        for relationship in &ctx.plan.many_to_many {
            if ctx.cancel.is_cancelled() {
                result.success = false;
                break;
            }
            let associations: Vec<&Association> = ctx
                .data
                .associations()
                .iter()
                .filter(|association| association.relationship == *relationship)
                .collect();
            if associations.is_empty() {
                continue;
            }

            let before_success = result.success_count;
            let before_total = result.processed;
            for association in associations {
                if ctx.cancel.is_cancelled() {
                    result.success = false;
                    break;
                }
                self.process_association(ctx, association, &mut result)
                    .await?;
            }

            ctx.progress.emit(
                ProgressEvent::new(Phase::ManyToMany)
                    .with_relationship(relationship.clone())
                    .with_counts(
                        result.success_count - before_success,
                        Some(result.processed - before_total),
                    ),
            );
        }

        result.duration = started.elapsed();
        Ok(result)
    }
}
