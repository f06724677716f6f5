//! The exporter: parallel per-entity paged scan into a portable archive.
//!
//! Entities are scanned concurrently with a degree of parallelism equal
//! to the pool's recommended total; pages within one entity are
//! sequential, each page on a freshly acquired handle. Entity sections
//! are appended to the data document as their scans complete; the
//! archive is finalized only once every entity has either completed or
//! recorded an error.

use dataport_client::ServiceClient;
use dataport_core::error::{ErrorKind, ErrorReport, MigrationError};
use dataport_core::progress::{Phase, ProgressEvent, ProgressReporter};
use dataport_core::record::{Association, Record};
use dataport_pool::ConnectionPool;
use dataport_schema::{ArchiveWriter, Manifest, Schema};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Server page size used for entity scans.
const PAGE_SIZE: usize = 500;

/// Outcome of an export run.
#[derive(Debug)]
pub struct ExportSummary {
    pub record_counts: BTreeMap<String, u64>,
    pub errors: Vec<ErrorReport>,
    pub duration: Duration,
}

impl ExportSummary {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn total_records(&self) -> u64 {
        self.record_counts.values().sum()
    }
}

pub struct Exporter {
    pool: ConnectionPool,
}

impl Exporter {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Exports every schema entity (and the associations of every
    /// many-to-many relationship) into `writer`.
    pub async fn export(
        &self,
        schema: &Schema,
        writer: &ArchiveWriter,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ExportSummary, MigrationError> {
        let started = Instant::now();
        writer.write_schema(schema)?;

        let mut errors: Vec<ErrorReport> = Vec::new();

        // Associations first: they are written inside their source
        // entity's section.
        let mut associations_by_entity: HashMap<String, Vec<Association>> = HashMap::new();
        for relationship in schema.many_to_many() {
            if cancel.is_cancelled() {
                break;
            }
            let handle = self.pool.get().await?;
            match handle.retrieve_associations(&relationship.name).await {
                Ok(associations) => {
                    for association in associations {
                        associations_by_entity
                            .entry(association.entity.clone())
                            .or_default()
                            .push(association);
                    }
                }
                Err(fault) => {
                    let report = ErrorReport::new(
                        ErrorKind::Fatal,
                        format!(
                            "failed to read associations of '{}': {fault}",
                            relationship.name
                        ),
                    )
                    .with_code(fault.code);
                    progress.emit_error(report.clone());
                    errors.push(report);
                }
            }
        }

        let data_writer = Mutex::new(Some(writer.data_writer()?));
        let mut manifest = Manifest::default();
        let dop = self.pool.total_recommended_parallelism().await?;

        let scans: Vec<(String, Result<Vec<Record>, ErrorReport>)> =
            futures::stream::iter(schema.entities().iter().map(|entity| {
                let name = entity.logical_name.clone();
                async move {
                    let outcome = self.scan_entity(&name, progress, cancel).await;
                    (name, outcome)
                }
            }))
            .buffer_unordered(dop.max(1))
            .map(|(name, outcome)| {
                // Append each completed section while other scans run.
                if let Ok(records) = &outcome {
                    let associations = associations_by_entity
                        .get(&name)
                        .map(Vec::as_slice)
                        .unwrap_or(&[]);
                    let mut guard = data_writer.lock();
                    if let Some(open_writer) = guard.as_mut() {
                        if let Err(error) = open_writer.write_entity(&name, records, associations)
                        {
                            return (
                                name,
                                Err(ErrorReport::new(ErrorKind::Fatal, error.to_string())),
                            );
                        }
                    }
                }
                (name, outcome)
            })
            .collect()
            .await;

        for (name, outcome) in scans {
            match outcome {
                Ok(records) => {
                    manifest.record(&name, records.len() as u64);
                }
                Err(report) => {
                    progress.emit_error(report.clone());
                    errors.push(report);
                }
            }
        }

        let open_writer = data_writer
            .lock()
            .take()
            .expect("data writer finalized once");
        open_writer.finish()?;
        writer.write_manifest(&manifest)?;

        progress.emit(
            ProgressEvent::new(Phase::Complete)
                .with_counts(manifest.record_counts.values().sum(), None)
                .with_message("export finished"),
        );

        Ok(ExportSummary {
            record_counts: manifest.record_counts,
            errors,
            duration: started.elapsed(),
        })
    }

    /// Pages through one entity. Each page acquires its own handle so a
    /// long scan never pins a pooled client.
    async fn scan_entity(
        &self,
        entity: &str,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, ErrorReport> {
        let mut records = Vec::new();
        let mut query = dataport_client::PageQuery::first(entity, PAGE_SIZE);

        loop {
            if cancel.is_cancelled() {
                return Err(
                    ErrorReport::new(ErrorKind::Fatal, "export cancelled").with_entity(entity)
                );
            }
            let handle = self.pool.get().await.map_err(|error| {
                let migration: MigrationError = error.into();
                let mut report = migration.to_report();
                report.entity = Some(entity.to_string());
                report
            })?;
            let page = handle.retrieve_page(&query).await.map_err(|fault| {
                ErrorReport::new(ErrorKind::Fatal, fault.to_string())
                    .with_entity(entity)
                    .with_code(fault.code)
            })?;
            drop(handle);

            progress.record(
                Phase::Exporting,
                entity,
                page.records.len() as u64,
                None,
                None,
            );
            records.extend(page.records);

            match (page.more, page.cookie) {
                (true, Some(cookie)) => query = query.next(cookie),
                _ => break,
            }
        }

        tracing::debug!(entity, records = records.len(), "entity scan complete");
        Ok(records)
    }
}
