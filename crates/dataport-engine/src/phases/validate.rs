//! Phase A: target field validation.
//!
//! Retrieves attribute metadata from the target for every entity in the
//! data, reports archive fields the target does not have, and computes
//! the per-entity excluded-field sets (missing columns when skipping is
//! enabled, plus fields invalid for the current write mode).

use crate::context::{ImportContext, ImportMode};
use crate::phases::{fault_to_error, PhaseProcessor, PhaseResult};
use async_trait::async_trait;
use dataport_client::ServiceClient;
use dataport_core::error::{ErrorKind, ErrorReport, MigrationError};
use dataport_core::progress::{Phase, ProgressEvent};
use dataport_pool::ConnectionPool;
use std::collections::BTreeSet;
use std::time::Instant;

pub struct TargetValidationPhase {
    pool: ConnectionPool,
}

impl TargetValidationPhase {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PhaseProcessor for TargetValidationPhase {
    fn name(&self) -> &'static str {
        "target-validation"
    }

    async fn process(&self, ctx: &ImportContext) -> Result<PhaseResult, MigrationError> {
        let started = Instant::now();
        let mut result = PhaseResult::succeeded();
        let mut mismatches: Vec<(String, Vec<String>)> = Vec::new();

        for entity_data in ctx.data.entities() {
            if ctx.cancel.is_cancelled() {
                return Err(MigrationError::Fatal("import cancelled".into()));
            }
            let entity = &entity_data.name;
            let Some(entity_schema) = ctx.schema.entity(entity) else {
                // Unreachable with archive-parsed data; defensive for
                // programmatic datasets.
                return Err(MigrationError::Validation(format!(
                    "data contains entity '{entity}' absent from the schema"
                )));
            };

            let handle = self.pool.get().await?;
            let attributes = handle
                .entity_attributes(entity)
                .await
                .map_err(|fault| fault_to_error(&format!("entity '{entity}'"), &fault))?;
            drop(handle);

            // Every field any record actually carries.
            let mut archive_fields: BTreeSet<String> = BTreeSet::new();
            for record in &entity_data.records {
                archive_fields.extend(record.fields().map(|(name, _)| name.to_string()));
            }

            let mut excluded: BTreeSet<String> = BTreeSet::new();
            let mut missing: Vec<String> = Vec::new();
            for field in &archive_fields {
                // The primary-key alias never maps to an attribute.
                if *field == entity_schema.primary_id_field {
                    continue;
                }
                if attributes.attribute(field).is_none() {
                    missing.push(field.clone());
                }
            }

            for attribute in &attributes.attributes {
                let valid = match ctx.options.mode() {
                    ImportMode::Create => attribute.valid_for_create,
                    ImportMode::Update => attribute.valid_for_update,
                    ImportMode::Upsert => attribute.valid_for_create || attribute.valid_for_update,
                };
                if !valid {
                    excluded.insert(attribute.logical_name.clone());
                }
            }

            if !missing.is_empty() {
                let report = ErrorReport::new(
                    ErrorKind::SchemaMismatch,
                    format!(
                        "target entity '{entity}' is missing columns: {}",
                        missing.join(", ")
                    ),
                )
                .with_entity(entity.clone());
                ctx.progress.emit_error(report.clone());
                result.errors.push(report);

                if ctx.options.skip_missing_columns() {
                    tracing::warn!(%entity, columns = ?missing, "stripping missing target columns");
                    excluded.extend(missing.iter().cloned());
                } else {
                    mismatches.push((entity.clone(), missing));
                }
            }

            ctx.field_metadata.insert(entity.clone(), attributes);
            if !excluded.is_empty() {
                ctx.excluded_fields.insert(entity.clone(), excluded);
            }
            result.processed += 1;
            result.success_count += 1;
        }

        if let Some((entity, fields)) = mismatches.into_iter().next() {
            return Err(MigrationError::SchemaMismatch { entity, fields });
        }

        ctx.progress.emit(
            ProgressEvent::new(Phase::Analyzing)
                .with_counts(result.processed, Some(result.processed))
                .with_message("target metadata validated"),
        );
        result.duration = started.elapsed();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ImportOptions;
    use dataport_client::memory::InMemoryService;
    use dataport_client::AttributeMetadata;
    use dataport_core::record::{Record, Value};
    use dataport_plan::Planner;
    use dataport_pool::{PoolOptions, PreAuthenticatedSource};
    use dataport_schema::{DataSet, EntitySchema, FieldSchema, Schema};
    use dataport_throttle::{RateConfig, RateController, ThrottleTracker};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn schema() -> Schema {
        Schema::new(vec![EntitySchema::new("account", "accountid", "name")
            .with_field(FieldSchema::identifier("accountid"))
            .with_field(FieldSchema::text("name"))
            .with_field(FieldSchema::text("industrycode"))])
        .unwrap()
    }

    fn dataset() -> DataSet {
        let mut dataset = DataSet::new();
        dataset.push_entity(
            "account",
            vec![Record::new(Uuid::from_u128(1))
                .with_field("name", Value::Text("a".into()))
                .with_field("industrycode", Value::Text("retail".into()))],
        );
        dataset
    }

    fn pool_for(service: &InMemoryService) -> ConnectionPool {
        ConnectionPool::new(
            vec![Arc::new(PreAuthenticatedSource::new(
                "primary",
                Arc::new(service.clone()),
                2,
            ))],
            Arc::new(ThrottleTracker::default()),
            Arc::new(RateController::new(RateConfig::default())),
            PoolOptions::default(),
        )
        .unwrap()
    }

    fn ctx(options: ImportOptions) -> ImportContext {
        let schema = schema();
        let plan = Planner::new(&schema).plan();
        ImportContext::new(
            schema,
            dataset(),
            plan,
            options,
            dataport_core::progress::ProgressReporter::disabled(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn matching_target_passes() {
        let service = InMemoryService::builder()
            .entity(
                "account",
                [
                    AttributeMetadata::new("name"),
                    AttributeMetadata::new("industrycode"),
                ],
            )
            .build();
        let phase = TargetValidationPhase::new(pool_for(&service));
        let ctx = ctx(ImportOptions::default());

        let result = phase.process(&ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.processed, 1);
        assert!(ctx.field_metadata.contains_key("account"));
        assert!(ctx.stripped_fields("account").is_empty());
    }

    #[tokio::test]
    async fn missing_column_fails_fast_by_default() {
        let service = InMemoryService::builder()
            .entity("account", [AttributeMetadata::new("name")])
            .build();
        let phase = TargetValidationPhase::new(pool_for(&service));
        let ctx = ctx(ImportOptions::default());

        let error = phase.process(&ctx).await.unwrap_err();
        match error {
            MigrationError::SchemaMismatch { entity, fields } => {
                assert_eq!(entity, "account");
                assert_eq!(fields, vec!["industrycode".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn skip_missing_columns_strips_instead() {
        let service = InMemoryService::builder()
            .entity("account", [AttributeMetadata::new("name")])
            .build();
        let phase = TargetValidationPhase::new(pool_for(&service));
        let ctx = ctx(
            ImportOptions::builder()
                .skip_missing_columns(true)
                .build()
                .unwrap(),
        );

        let result = phase.process(&ctx).await.unwrap();
        assert!(result.success);
        assert!(ctx.stripped_fields("account").contains("industrycode"));
        // Reported even when stripped.
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn mode_invalid_fields_are_excluded() {
        let mut created_only = AttributeMetadata::new("industrycode");
        created_only.valid_for_update = false;
        let service = InMemoryService::builder()
            .entity("account", [AttributeMetadata::new("name"), created_only])
            .build();
        let phase = TargetValidationPhase::new(pool_for(&service));
        let ctx = ctx(
            ImportOptions::builder()
                .mode(crate::context::ImportMode::Update)
                .build()
                .unwrap(),
        );

        phase.process(&ctx).await.unwrap();
        assert!(ctx.stripped_fields("account").contains("industrycode"));
    }

    #[tokio::test]
    async fn unknown_target_entity_is_not_found() {
        let service = InMemoryService::builder().build();
        let phase = TargetValidationPhase::new(pool_for(&service));
        let ctx = ctx(ImportOptions::default());

        let error = phase.process(&ctx).await.unwrap_err();
        assert!(matches!(error, MigrationError::NotFound(_)));
    }
}
