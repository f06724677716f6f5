//! The shared import context and options.

use dashmap::DashMap;
use dataport_bulk::BulkOptions;
use dataport_client::{BypassLogic, EntityAttributes};
use dataport_core::error::MigrationError;
use dataport_core::identity::IdentityMap;
use dataport_core::progress::ProgressReporter;
use dataport_plan::ExecutionPlan;
use dataport_schema::{DataSet, Schema};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

/// How records are written during the entity phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImportMode {
    /// Insert only; collisions are per-record failures.
    Create,
    /// Update only; source identifiers without a target match are
    /// reported and skipped.
    Update,
    /// Insert-or-update under the source identifier. The default, and
    /// what makes re-runs idempotent.
    #[default]
    Upsert,
}

/// Validated options for one import run.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub(crate) mode: ImportMode,
    /// Strip archive fields missing from the target instead of failing.
    pub(crate) skip_missing_columns: bool,
    pub(crate) continue_on_error: bool,
    /// Entities processed concurrently within a tier.
    pub(crate) max_parallel_entities: usize,
    pub(crate) batch_size: usize,
    pub(crate) bypass_custom_logic: BypassLogic,
    pub(crate) bypass_power_automate: bool,
    pub(crate) suppress_duplicate_detection: bool,
    pub(crate) tag: Option<String>,
    pub(crate) max_parallel_batches: Option<usize>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            mode: ImportMode::Upsert,
            skip_missing_columns: false,
            continue_on_error: false,
            max_parallel_entities: 4,
            batch_size: 100,
            bypass_custom_logic: BypassLogic::empty(),
            bypass_power_automate: false,
            suppress_duplicate_detection: false,
            tag: None,
            max_parallel_batches: None,
        }
    }
}

impl ImportOptions {
    pub fn builder() -> ImportOptionsBuilder {
        ImportOptionsBuilder::new()
    }

    pub fn mode(&self) -> ImportMode {
        self.mode
    }

    pub fn continue_on_error(&self) -> bool {
        self.continue_on_error
    }

    pub fn skip_missing_columns(&self) -> bool {
        self.skip_missing_columns
    }

    pub fn max_parallel_entities(&self) -> usize {
        self.max_parallel_entities
    }

    /// The executor options these import options translate to.
    pub(crate) fn bulk_options(&self) -> Result<BulkOptions, MigrationError> {
        let mut builder = BulkOptions::builder()
            .batch_size(self.batch_size)
            .continue_on_error(self.continue_on_error)
            .bypass_custom_logic(self.bypass_custom_logic)
            .bypass_power_automate(self.bypass_power_automate)
            .suppress_duplicate_detection(self.suppress_duplicate_detection);
        if let Some(tag) = &self.tag {
            builder = builder.tag(tag.clone());
        }
        if let Some(max) = self.max_parallel_batches {
            builder = builder.max_parallel_batches(max);
        }
        builder.build()
    }

    pub(crate) fn validate(&self) -> Result<(), MigrationError> {
        if self.max_parallel_entities == 0 {
            return Err(MigrationError::Configuration(
                "max_parallel_entities must be positive".into(),
            ));
        }
        self.bulk_options().map(|_| ())
    }
}

/// Builder for [`ImportOptions`].
#[derive(Debug, Clone, Default)]
pub struct ImportOptionsBuilder {
    options: ImportOptions,
}

impl ImportOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: ImportMode) -> Self {
        self.options.mode = mode;
        self
    }

    pub fn skip_missing_columns(mut self, skip: bool) -> Self {
        self.options.skip_missing_columns = skip;
        self
    }

    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.options.continue_on_error = continue_on_error;
        self
    }

    pub fn max_parallel_entities(mut self, max: usize) -> Self {
        self.options.max_parallel_entities = max;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.options.batch_size = batch_size;
        self
    }

    pub fn bypass_custom_logic(mut self, bypass: BypassLogic) -> Self {
        self.options.bypass_custom_logic = bypass;
        self
    }

    pub fn bypass_power_automate(mut self, bypass: bool) -> Self {
        self.options.bypass_power_automate = bypass;
        self
    }

    pub fn suppress_duplicate_detection(mut self, suppress: bool) -> Self {
        self.options.suppress_duplicate_detection = suppress;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.options.tag = Some(tag.into());
        self
    }

    pub fn max_parallel_batches(mut self, max: usize) -> Self {
        self.options.max_parallel_batches = Some(max);
        self
    }

    pub fn build(self) -> Result<ImportOptions, MigrationError> {
        self.options.validate()?;
        Ok(self.options)
    }
}

/// Everything the import phases share.
///
/// The identity map, field metadata and excluded-field sets use
/// concurrent containers; phases receive the context by shared
/// reference and never need exclusive access.
pub struct ImportContext {
    pub schema: Schema,
    pub data: DataSet,
    pub plan: ExecutionPlan,
    pub id_map: IdentityMap,
    pub options: ImportOptions,
    pub progress: ProgressReporter,
    /// Target attribute metadata gathered by the validation phase.
    pub field_metadata: DashMap<String, EntityAttributes>,
    /// Fields stripped from every record of an entity before write:
    /// target-missing columns (with skip enabled) and fields invalid
    /// for the current mode.
    pub excluded_fields: DashMap<String, BTreeSet<String>>,
    pub cancel: CancellationToken,
}

impl ImportContext {
    pub fn new(
        schema: Schema,
        data: DataSet,
        plan: ExecutionPlan,
        options: ImportOptions,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            schema,
            data,
            plan,
            id_map: IdentityMap::new(),
            options,
            progress,
            field_metadata: DashMap::new(),
            excluded_fields: DashMap::new(),
            cancel,
        }
    }

    /// All fields to strip from `entity` records before the initial
    /// write: deferred fields plus excluded fields.
    pub(crate) fn stripped_fields(&self, entity: &str) -> BTreeSet<String> {
        let mut stripped: BTreeSet<String> = self
            .plan
            .deferred_for(entity)
            .iter()
            .cloned()
            .collect();
        if let Some(excluded) = self.excluded_fields.get(&entity.to_ascii_lowercase()) {
            stripped.extend(excluded.iter().cloned());
        }
        stripped
    }
}
