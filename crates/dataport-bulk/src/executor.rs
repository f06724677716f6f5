//! The bulk operation executor.

use crate::options::BulkOptions;
use crate::result::{BulkResult, RecordError};
use dataport_client::{BulkOperation, BulkPayload, BulkRequest, CallOptions, ServiceClient};
use dataport_core::error::MigrationError;
use dataport_core::record::Record;
use dataport_pool::ConnectionPool;
use dataport_throttle::{AdmissionGate, RateController, ThrottleVerdict};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Backoff ladder for the transient lazy-TVP race.
const RACE_DELAYS: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(2000),
];

/// Runs bulk writes through the pool under adaptive admission.
///
/// The rate controller is shared with the pool and reset at the start of
/// every operation; its cap is re-read on each batch admission.
#[derive(Clone)]
pub struct BulkExecutor {
    pool: ConnectionPool,
}

/// State shared by all batch tasks of one operation.
struct Operation {
    pool: ConnectionPool,
    gate: AdmissionGate,
    lanes: Arc<Semaphore>,
    controller: Arc<RateController>,
    entity: String,
    operation: BulkOperation,
    call_options: CallOptions,
    continue_on_error: bool,
    abort: CancellationToken,
    target_ids: Mutex<Vec<Option<Uuid>>>,
    errors: Mutex<Vec<RecordError>>,
}

impl BulkExecutor {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Creates `records` in `entity`.
    pub async fn create_multiple(
        &self,
        entity: &str,
        records: Vec<Record>,
        options: &BulkOptions,
        cancel: &CancellationToken,
    ) -> Result<BulkResult, MigrationError> {
        self.run(
            BulkOperation::Create,
            entity,
            BulkPayload::Records(records),
            options,
            cancel,
        )
        .await
    }

    /// Updates `records` in `entity` by identifier.
    pub async fn update_multiple(
        &self,
        entity: &str,
        records: Vec<Record>,
        options: &BulkOptions,
        cancel: &CancellationToken,
    ) -> Result<BulkResult, MigrationError> {
        self.run(
            BulkOperation::Update,
            entity,
            BulkPayload::Records(records),
            options,
            cancel,
        )
        .await
    }

    /// Creates or updates `records` in `entity` by identifier.
    pub async fn upsert_multiple(
        &self,
        entity: &str,
        records: Vec<Record>,
        options: &BulkOptions,
        cancel: &CancellationToken,
    ) -> Result<BulkResult, MigrationError> {
        self.run(
            BulkOperation::Upsert,
            entity,
            BulkPayload::Records(records),
            options,
            cancel,
        )
        .await
    }

    /// Deletes records of `entity` by identifier.
    pub async fn delete_multiple(
        &self,
        entity: &str,
        ids: Vec<Uuid>,
        options: &BulkOptions,
        cancel: &CancellationToken,
    ) -> Result<BulkResult, MigrationError> {
        self.run(
            BulkOperation::Delete,
            entity,
            BulkPayload::Ids(ids),
            options,
            cancel,
        )
        .await
    }

    async fn run(
        &self,
        operation: BulkOperation,
        entity: &str,
        payload: BulkPayload,
        options: &BulkOptions,
        cancel: &CancellationToken,
    ) -> Result<BulkResult, MigrationError> {
        options.validate()?;
        let total = payload.len();
        if total == 0 {
            return Ok(BulkResult::empty());
        }
        let started = Instant::now();

        let controller = Arc::clone(self.pool.rate_controller());
        controller.reset();

        let recommended = self.pool.total_recommended_parallelism().await?;
        let lane_count = options
            .max_parallel_batches()
            .map(|cap| cap.min(recommended))
            .unwrap_or(recommended)
            .max(1);

        let op = Arc::new(Operation {
            pool: self.pool.clone(),
            gate: AdmissionGate::new(Arc::clone(&controller)),
            lanes: Arc::new(Semaphore::new(lane_count)),
            controller,
            entity: entity.to_ascii_lowercase(),
            operation,
            call_options: options.call_options(),
            continue_on_error: options.continue_on_error(),
            abort: cancel.child_token(),
            target_ids: Mutex::new(vec![None; total]),
            errors: Mutex::new(Vec::new()),
        });

        tracing::debug!(
            entity = %op.entity,
            operation = operation.as_str(),
            records = total,
            batch_size = options.batch_size(),
            lanes = lane_count,
            "starting bulk operation"
        );

        let mut tasks = JoinSet::new();
        for (start, batch) in partition(payload, options.batch_size()) {
            let op = Arc::clone(&op);
            tasks.spawn(async move { run_batch(op, start, batch).await });
        }

        let mut fatal: Option<MigrationError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    if fatal.is_none() {
                        op.abort.cancel();
                        fatal = Some(error);
                    }
                }
                Err(join_error) => {
                    if fatal.is_none() {
                        op.abort.cancel();
                        fatal = Some(MigrationError::Fatal(format!(
                            "batch task failed: {join_error}"
                        )));
                    }
                }
            }
        }
        if let Some(error) = fatal {
            return Err(error);
        }

        let op = Arc::into_inner(op).expect("all batch tasks joined");
        let mut errors = op.errors.into_inner();
        errors.sort_by_key(|error| error.index);
        let result = BulkResult {
            target_ids: op.target_ids.into_inner(),
            errors,
            duration: started.elapsed(),
        };
        tracing::debug!(
            entity,
            successes = result.success_count(),
            failures = result.failure_count(),
            elapsed_ms = result.duration.as_millis() as u64,
            "bulk operation finished"
        );
        Ok(result)
    }
}

/// Splits the payload into `(start_index, batch)` chunks.
fn partition(payload: BulkPayload, batch_size: usize) -> Vec<(usize, BulkPayload)> {
    match payload {
        BulkPayload::Records(records) => {
            let mut batches = Vec::with_capacity(records.len().div_ceil(batch_size));
            let mut start = 0usize;
            let mut records = records.into_iter().peekable();
            while records.peek().is_some() {
                let chunk: Vec<Record> = records.by_ref().take(batch_size).collect();
                let len = chunk.len();
                batches.push((start, BulkPayload::Records(chunk)));
                start += len;
            }
            batches
        }
        BulkPayload::Ids(ids) => ids
            .chunks(batch_size)
            .enumerate()
            .map(|(chunk_index, chunk)| (chunk_index * batch_size, BulkPayload::Ids(chunk.to_vec())))
            .collect(),
    }
}

/// Identifier of the record at `offset` within the batch, when known.
fn record_id(payload: &BulkPayload, offset: usize) -> Option<Uuid> {
    match payload {
        BulkPayload::Records(records) => records
            .get(offset)
            .map(Record::id)
            .filter(|id| !id.is_nil()),
        BulkPayload::Ids(ids) => ids.get(offset).copied(),
    }
}

async fn run_batch(
    op: Arc<Operation>,
    start: usize,
    batch: BulkPayload,
) -> Result<(), MigrationError> {
    if op.abort.is_cancelled() {
        return Ok(());
    }

    // Static lane first, then the adaptive gate; both released on exit.
    let _lane = tokio::select! {
        _ = op.abort.cancelled() => return Ok(()),
        permit = Arc::clone(&op.lanes).acquire_owned() => {
            match permit {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            }
        }
    };
    let _slot = tokio::select! {
        _ = op.abort.cancelled() => return Ok(()),
        permit = op.gate.admit() => permit,
    };

    let request = BulkRequest {
        operation: op.operation,
        entity: op.entity.clone(),
        payload: batch,
        options: op.call_options.clone(),
    };

    // Outer loop: one pooled handle per submission round. Inner loop:
    // the transient-race ladder retries on the same handle so every
    // attempt lands on the same source.
    loop {
        if op.abort.is_cancelled() {
            return Ok(());
        }
        let handle = op.pool.get().await.map_err(MigrationError::from)?;
        let mut race_retries = 0usize;

        loop {
            let attempt_started = Instant::now();
            let outcome = tokio::select! {
                _ = op.abort.cancelled() => return Ok(()),
                outcome = handle.execute_bulk(&request) => outcome,
            };
            let elapsed = attempt_started.elapsed();

            match outcome {
                Ok(response) => {
                    op.controller.record_success(elapsed);
                    #[cfg(feature = "metrics")]
                    metrics::counter!("dataport_bulk_batches_total").increment(1);

                    let mut had_failures = false;
                    {
                        let mut target_ids = op.target_ids.lock();
                        let mut errors = op.errors.lock();
                        for (offset, outcome) in response.outcomes.iter().enumerate() {
                            match outcome {
                                dataport_client::BulkOutcome::Success { id } => {
                                    target_ids[start + offset] = Some(*id);
                                }
                                dataport_client::BulkOutcome::Failure { code, message } => {
                                    had_failures = true;
                                    errors.push(RecordError {
                                        index: start + offset,
                                        id: record_id(&request.payload, offset),
                                        code: Some(*code),
                                        message: message.clone(),
                                    });
                                }
                            }
                        }
                    }
                    if had_failures && !op.continue_on_error {
                        tracing::warn!(
                            entity = %op.entity,
                            batch_start = start,
                            "batch had record failures; cancelling remaining batches"
                        );
                        op.abort.cancel();
                    }
                    return Ok(());
                }
                Err(fault) if fault.is_protection() => {
                    let effective = op
                        .pool
                        .tracker()
                        .record(handle.source_name(), fault.retry_after);
                    let source = handle.source_name().to_string();
                    drop(handle);

                    match op.controller.record_throttle(effective) {
                        ThrottleVerdict::FailFast(retry_after) => {
                            op.abort.cancel();
                            return Err(MigrationError::ServiceProtection {
                                source_name: source,
                                code: fault.code,
                                retry_after,
                            });
                        }
                        ThrottleVerdict::Backoff(retry_after) => {
                            tracing::warn!(
                                entity = %op.entity,
                                source,
                                batch_start = start,
                                ?retry_after,
                                "throttled; sleeping before resubmit"
                            );
                            #[cfg(feature = "metrics")]
                            metrics::counter!("dataport_bulk_throttle_sleeps_total").increment(1);
                            tokio::select! {
                                _ = op.abort.cancelled() => return Ok(()),
                                _ = tokio::time::sleep(retry_after) => {}
                            }
                            break; // re-acquire a handle and resubmit
                        }
                    }
                }
                Err(fault) if fault.is_transient_race() && race_retries < RACE_DELAYS.len() => {
                    let delay = RACE_DELAYS[race_retries];
                    race_retries += 1;
                    tracing::debug!(
                        entity = %op.entity,
                        batch_start = start,
                        attempt = race_retries,
                        ?delay,
                        "transient bulk-type race; retrying on the same source"
                    );
                    #[cfg(feature = "metrics")]
                    metrics::counter!("dataport_bulk_race_retries_total").increment(1);
                    tokio::select! {
                        _ = op.abort.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    // keep the same handle; loop to retry
                }
                Err(fault) => {
                    let mut errors = op.errors.lock();
                    for offset in 0..request.payload.len() {
                        errors.push(RecordError {
                            index: start + offset,
                            id: record_id(&request.payload, offset),
                            code: Some(fault.code),
                            message: fault.message.clone(),
                        });
                    }
                    drop(errors);
                    if !op.continue_on_error {
                        tracing::warn!(
                            entity = %op.entity,
                            batch_start = start,
                            code = fault.code,
                            "batch failed; cancelling remaining batches"
                        );
                        op.abort.cancel();
                    }
                    return Ok(());
                }
            }
        }
    }
}
