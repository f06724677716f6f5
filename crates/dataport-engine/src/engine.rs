//! Top-level engine wiring.

use crate::context::{ImportContext, ImportOptions};
use crate::export::{ExportSummary, Exporter};
use crate::import::{ImportSummary, Importer};
use dataport_bulk::{BulkExecutor, BulkOptions};
use dataport_client::ServiceClient;
use dataport_core::error::MigrationError;
use dataport_core::progress::{Phase, ProgressEvent, ProgressListener, ProgressListeners, ProgressReporter};
use dataport_plan::{ExecutionPlan, Planner};
use dataport_pool::{ConnectionPool, ConnectionSource, PoolOptions, PoolStats};
use dataport_schema::{ArchiveReader, ArchiveWriter, DataSet, Schema};
use dataport_throttle::{RateConfig, RateController, RatePreset, ThrottleTracker};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The migration engine: owns the pool, tracker, rate controller and
/// executor, and drives exports and the tiered import pipeline.
///
/// The object graph is wired in the constructor; phases receive their
/// collaborators by reference. Dispose with [`MigrationEngine::close`]
/// when done.
pub struct MigrationEngine {
    pool: ConnectionPool,
    executor: Arc<BulkExecutor>,
    importer: Importer,
    progress: ProgressReporter,
}

impl MigrationEngine {
    pub fn builder() -> MigrationEngineBuilder {
        MigrationEngineBuilder::new()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn executor(&self) -> &Arc<BulkExecutor> {
        &self.executor
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Analyzes a schema into an execution plan.
    pub fn plan(&self, schema: &Schema) -> ExecutionPlan {
        self.plan_with_counts(schema, std::iter::empty())
    }

    /// Analyzes a schema with record-count load estimates.
    pub fn plan_with_counts(
        &self,
        schema: &Schema,
        counts: impl IntoIterator<Item = (String, u64)>,
    ) -> ExecutionPlan {
        let plan = Planner::new(schema).with_record_counts(counts).plan();
        self.progress.emit(
            ProgressEvent::new(Phase::Analyzing)
                .with_counts(plan.entity_count() as u64, Some(plan.entity_count() as u64))
                .with_message(format!(
                    "{} entities in {} tiers, {} with deferred fields",
                    plan.entity_count(),
                    plan.tiers.len(),
                    plan.deferred_fields.len()
                )),
        );
        plan
    }

    /// Builds an import context for a dataset already in memory.
    pub fn import_context(
        &self,
        schema: Schema,
        data: DataSet,
        options: ImportOptions,
        cancel: CancellationToken,
    ) -> ImportContext {
        let plan = self.plan(&schema);
        ImportContext::new(schema, data, plan, options, self.progress.clone(), cancel)
    }

    /// Runs the import pipeline over a prepared context.
    pub async fn run_import(&self, ctx: &ImportContext) -> Result<ImportSummary, MigrationError> {
        self.importer.run(ctx).await
    }

    /// Reads an archive and imports it.
    pub async fn import_archive(
        &self,
        root: impl AsRef<Path>,
        options: ImportOptions,
        cancel: CancellationToken,
    ) -> Result<ImportSummary, MigrationError> {
        let reader = ArchiveReader::open(root.as_ref())?;
        let schema = reader.read_schema()?;
        let data = reader.read_data(&schema)?;
        let counts = reader
            .read_manifest()?
            .map(|manifest| manifest.record_counts.into_iter().collect::<Vec<_>>())
            .unwrap_or_default();

        let plan = self.plan_with_counts(&schema, counts);
        let ctx = ImportContext::new(schema, data, plan, options, self.progress.clone(), cancel);
        self.run_import(&ctx).await
    }

    /// Exports every schema entity into an archive at `root`.
    pub async fn export_to(
        &self,
        schema: &Schema,
        root: impl AsRef<Path>,
        cancel: CancellationToken,
    ) -> Result<ExportSummary, MigrationError> {
        let writer = ArchiveWriter::create(root.as_ref())?;
        Exporter::new(self.pool.clone())
            .export(schema, &writer, &self.progress, &cancel)
            .await
    }

    /// Deletes every record of every schema entity from the target, in
    /// reverse tier order so referencing records go before their
    /// targets. Returns deleted counts per entity.
    pub async fn purge_entities(
        &self,
        schema: &Schema,
        cancel: CancellationToken,
    ) -> Result<BTreeMap<String, usize>, MigrationError> {
        let plan = self.plan(schema);
        let options = BulkOptions::builder().continue_on_error(true).build()?;
        let mut deleted = BTreeMap::new();

        for tier in plan.tiers.iter().rev() {
            for entity in tier.iter().rev() {
                if cancel.is_cancelled() {
                    return Err(MigrationError::Fatal("purge cancelled".into()));
                }
                let mut ids = Vec::new();
                let mut query = dataport_client::PageQuery::first(entity, 500);
                loop {
                    let handle = self.pool.get().await?;
                    let page = handle.retrieve_page(&query).await.map_err(|fault| {
                        MigrationError::Fatal(format!("scan of '{entity}' failed: {fault}"))
                    })?;
                    drop(handle);
                    ids.extend(page.records.iter().map(|record| record.id()));
                    match (page.more, page.cookie) {
                        (true, Some(cookie)) => query = query.next(cookie),
                        _ => break,
                    }
                }
                if ids.is_empty() {
                    deleted.insert(entity.clone(), 0);
                    continue;
                }
                let result = self
                    .executor
                    .delete_multiple(entity, ids, &options, &cancel)
                    .await?;
                deleted.insert(entity.clone(), result.success_count());
            }
        }
        Ok(deleted)
    }

    /// Disposes the pool and its sources. Idempotent.
    pub fn close(&self) {
        self.pool.close();
    }
}

/// Builder for [`MigrationEngine`].
pub struct MigrationEngineBuilder {
    sources: Vec<Arc<dyn ConnectionSource>>,
    rate_config: RateConfig,
    pool_options: PoolOptions,
    listeners: ProgressListeners,
    tracker: Option<Arc<ThrottleTracker>>,
}

impl Default for MigrationEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationEngineBuilder {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            rate_config: RateConfig::default(),
            pool_options: PoolOptions::default(),
            listeners: ProgressListeners::new(),
            tracker: None,
        }
    }

    /// Adds a connection source.
    pub fn source(mut self, source: Arc<dyn ConnectionSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Selects a rate-controller preset.
    pub fn preset(mut self, preset: RatePreset) -> Self {
        self.rate_config = RateConfig::preset(preset);
        self
    }

    /// Overrides the full rate-controller configuration.
    pub fn rate_config(mut self, config: RateConfig) -> Self {
        self.rate_config = config;
        self
    }

    pub fn pool_options(mut self, options: PoolOptions) -> Self {
        self.pool_options = options;
        self
    }

    /// Supplies a shared throttle tracker (e.g. spanning two engines
    /// that talk to the same organization).
    pub fn tracker(mut self, tracker: Arc<ThrottleTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Registers a progress listener.
    pub fn listener<L>(mut self, listener: L) -> Self
    where
        L: ProgressListener + 'static,
    {
        self.listeners.add(listener);
        self
    }

    pub fn build(self) -> Result<MigrationEngine, MigrationError> {
        if self.sources.is_empty() {
            return Err(MigrationError::Configuration(
                "at least one connection source is required".into(),
            ));
        }
        let tracker = self
            .tracker
            .unwrap_or_else(|| Arc::new(ThrottleTracker::default()));
        let controller = Arc::new(RateController::new(self.rate_config));
        let pool = ConnectionPool::new(self.sources, tracker, controller, self.pool_options)?;
        let executor = Arc::new(BulkExecutor::new(pool.clone()));
        let importer = Importer::new(Arc::clone(&executor));
        Ok(MigrationEngine {
            pool,
            executor,
            importer,
            progress: ProgressReporter::new(self.listeners),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataport_client::memory::InMemoryService;
    use dataport_pool::PreAuthenticatedSource;

    #[test]
    fn builder_requires_a_source() {
        let result = MigrationEngine::builder().build();
        assert!(matches!(result, Err(MigrationError::Configuration(_))));
    }

    #[tokio::test]
    async fn builder_wires_the_engine() {
        let service = InMemoryService::builder().recommended_parallelism(2).build();
        let engine = MigrationEngine::builder()
            .source(Arc::new(PreAuthenticatedSource::new(
                "target",
                Arc::new(service),
                2,
            )))
            .preset(RatePreset::Aggressive)
            .build()
            .unwrap();
        assert_eq!(engine.pool().source_names(), vec!["target"]);
        assert_eq!(
            engine.pool().total_recommended_parallelism().await.unwrap(),
            2
        );
        engine.close();
    }
}
