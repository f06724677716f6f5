//! In-memory reference implementation of [`ServiceClient`].
//!
//! Backs the integration scenarios and doubles as a dry-run target. One
//! [`InMemoryService`] owns shared state; [`ServiceClient::clone_seed`]
//! hands out clients over the same state, mirroring how pooled clones of
//! a real seed all talk to the same organization.
//!
//! Fault injection is scriptable: faults can be pinned to the nth bulk
//! call overall, queued per entity (consumed one per call), or armed for
//! the next seed clones.

use crate::fault::ServiceFault;
use crate::request::{
    Association, AttributeMetadata, BulkOperation, BulkOutcome, BulkPayload, BulkRequest,
    BulkResponse, CloneOptions, EntityAttributes, PageQuery, RecordPage,
};
use crate::ServiceClient;
use async_trait::async_trait;
use dashmap::DashMap;
use dataport_core::record::{EntityRef, Record};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Object-does-not-exist error code used for update/delete misses.
pub const NOT_FOUND_CODE: i32 = crate::fault::codes::OBJECT_NOT_FOUND;
/// Duplicate-record error code used for create collisions.
pub const DUPLICATE_CODE: i32 = crate::fault::codes::DUPLICATE_RECORD;

/// A log line for one bulk call, kept for test assertions.
#[derive(Debug, Clone)]
pub struct BulkCallLog {
    /// 1-based global call index.
    pub call_index: u64,
    pub operation: BulkOperation,
    pub entity: String,
    pub size: usize,
    pub parameters: Vec<(&'static str, String)>,
}

struct EntityStore {
    records: RwLock<BTreeMap<Uuid, Record>>,
    attributes: Vec<AttributeMetadata>,
}

struct AssociationTable {
    entity: String,
    target_entity: String,
    pairs: Mutex<BTreeSet<(Uuid, Uuid)>>,
}

struct MemoryState {
    entities: DashMap<String, Arc<EntityStore>>,
    associations: DashMap<String, Arc<AssociationTable>>,
    recommended_parallelism: usize,
    page_size_cap: usize,

    bulk_calls: AtomicU64,
    bulk_log: Mutex<Vec<BulkCallLog>>,
    scripted_bulk_faults: Mutex<BTreeMap<u64, ServiceFault>>,
    entity_fault_queues: DashMap<String, Mutex<VecDeque<ServiceFault>>>,
    clone_failures: AtomicUsize,
    clone_count: AtomicUsize,
    last_clone_options: Mutex<Option<CloneOptions>>,
}

/// In-process service with scriptable faults.
#[derive(Clone)]
pub struct InMemoryService {
    state: Arc<MemoryState>,
}

impl InMemoryService {
    pub fn builder() -> InMemoryServiceBuilder {
        InMemoryServiceBuilder::new()
    }

    fn store(&self, entity: &str) -> Result<Arc<EntityStore>, ServiceFault> {
        self.state
            .entities
            .get(&entity.to_ascii_lowercase())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                ServiceFault::new(NOT_FOUND_CODE, format!("entity '{entity}' does not exist"))
            })
    }

    fn next_fault(&self, entity: &str, call_index: u64) -> Option<ServiceFault> {
        if let Some(fault) = self.state.scripted_bulk_faults.lock().remove(&call_index) {
            return Some(fault);
        }
        if let Some(queue) = self
            .state
            .entity_fault_queues
            .get(&entity.to_ascii_lowercase())
        {
            if let Some(fault) = queue.lock().pop_front() {
                return Some(fault);
            }
        }
        None
    }

    // --- test-support surface ---

    /// Injects a fault for the nth bulk call overall (1-based).
    pub fn inject_bulk_fault(&self, call_index: u64, fault: ServiceFault) {
        self.state
            .scripted_bulk_faults
            .lock()
            .insert(call_index, fault);
    }

    /// Queues faults consumed one per bulk call against `entity`.
    pub fn push_entity_faults<I>(&self, entity: &str, faults: I)
    where
        I: IntoIterator<Item = ServiceFault>,
    {
        let queue = self
            .state
            .entity_fault_queues
            .entry(entity.to_ascii_lowercase())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        queue.lock().extend(faults);
    }

    /// Arms the next `count` seed clones to fail.
    pub fn fail_next_clones(&self, count: usize) {
        self.state.clone_failures.store(count, Ordering::SeqCst);
    }

    /// Inserts a record directly, bypassing the bulk path.
    pub fn seed_record(&self, entity: &str, record: Record) {
        if let Ok(store) = self.store(entity) {
            store.records.write().insert(record.id(), record);
        }
    }

    /// Removes a record directly, bypassing the bulk path.
    pub fn remove_record(&self, entity: &str, id: Uuid) {
        if let Ok(store) = self.store(entity) {
            store.records.write().remove(&id);
        }
    }

    /// All records of an entity, ordered by id.
    pub fn records_of(&self, entity: &str) -> Vec<Record> {
        self.store(entity)
            .map(|store| store.records.read().values().cloned().collect())
            .unwrap_or_default()
    }

    /// One record by id.
    pub fn record(&self, entity: &str, id: Uuid) -> Option<Record> {
        self.store(entity)
            .ok()
            .and_then(|store| store.records.read().get(&id).cloned())
    }

    /// Count of records of an entity.
    pub fn record_count(&self, entity: &str) -> usize {
        self.store(entity)
            .map(|store| store.records.read().len())
            .unwrap_or(0)
    }

    /// All pairs of a relationship, ordered.
    pub fn association_pairs(&self, relationship: &str) -> Vec<(Uuid, Uuid)> {
        self.state
            .associations
            .get(&relationship.to_ascii_lowercase())
            .map(|table| table.pairs.lock().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Total bulk calls observed.
    pub fn bulk_call_count(&self) -> u64 {
        self.state.bulk_calls.load(Ordering::SeqCst)
    }

    /// Snapshot of the bulk call log.
    pub fn bulk_log(&self) -> Vec<BulkCallLog> {
        self.state.bulk_log.lock().clone()
    }

    /// How many seed clones have been made.
    pub fn clone_count(&self) -> usize {
        self.state.clone_count.load(Ordering::SeqCst)
    }

    /// The options used by the most recent clone.
    pub fn last_clone_options(&self) -> Option<CloneOptions> {
        self.state.last_clone_options.lock().clone()
    }
}

#[async_trait]
impl ServiceClient for InMemoryService {
    fn recommended_parallelism(&self) -> usize {
        self.state.recommended_parallelism
    }

    async fn execute_bulk(&self, request: &BulkRequest) -> Result<BulkResponse, ServiceFault> {
        let call_index = self.state.bulk_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.bulk_log.lock().push(BulkCallLog {
            call_index,
            operation: request.operation,
            entity: request.entity.clone(),
            size: request.len(),
            parameters: request.options.to_parameters(),
        });

        if request.len() > 1000 {
            return Err(ServiceFault::new(
                -2147220989,
                "bulk request exceeds the 1000 record limit",
            ));
        }
        if let Some(fault) = self.next_fault(&request.entity, call_index) {
            return Err(fault);
        }

        let store = self.store(&request.entity)?;
        let mut records = store.records.write();
        let outcomes = match (&request.payload, request.operation) {
            (BulkPayload::Records(batch), BulkOperation::Create) => batch
                .iter()
                .map(|record| {
                    let id = if record.id().is_nil() {
                        Uuid::new_v4()
                    } else {
                        record.id()
                    };
                    if records.contains_key(&id) {
                        BulkOutcome::Failure {
                            code: DUPLICATE_CODE,
                            message: format!("record {id} already exists"),
                        }
                    } else {
                        let mut stored = record.clone();
                        stored = reidentify(stored, id);
                        records.insert(id, stored);
                        BulkOutcome::Success { id }
                    }
                })
                .collect(),
            (BulkPayload::Records(batch), BulkOperation::Update) => batch
                .iter()
                .map(|record| match records.get_mut(&record.id()) {
                    Some(existing) => {
                        merge_fields(existing, record);
                        BulkOutcome::Success { id: record.id() }
                    }
                    None => BulkOutcome::Failure {
                        code: NOT_FOUND_CODE,
                        message: format!("record {} does not exist", record.id()),
                    },
                })
                .collect(),
            (BulkPayload::Records(batch), BulkOperation::Upsert) => batch
                .iter()
                .map(|record| {
                    match records.get_mut(&record.id()) {
                        Some(existing) => merge_fields(existing, record),
                        None => {
                            records.insert(record.id(), record.clone());
                        }
                    }
                    BulkOutcome::Success { id: record.id() }
                })
                .collect(),
            (BulkPayload::Ids(ids), BulkOperation::Delete) => ids
                .iter()
                .map(|id| {
                    if records.remove(id).is_some() {
                        BulkOutcome::Success { id: *id }
                    } else {
                        BulkOutcome::Failure {
                            code: NOT_FOUND_CODE,
                            message: format!("record {id} does not exist"),
                        }
                    }
                })
                .collect(),
            _ => {
                return Err(ServiceFault::new(
                    -2147220989,
                    "payload does not match operation",
                ))
            }
        };

        Ok(BulkResponse { outcomes })
    }

    async fn retrieve_page(&self, query: &PageQuery) -> Result<RecordPage, ServiceFault> {
        let store = self.store(&query.entity)?;
        let records = store.records.read();
        let page_size = query.page_size.min(self.state.page_size_cap).max(1);

        let after = match &query.cookie {
            Some(cookie) => Some(cookie.parse::<Uuid>().map_err(|_| {
                ServiceFault::new(-2147220989, format!("malformed paging cookie '{cookie}'"))
            })?),
            None => None,
        };

        let mut page: Vec<Record> = Vec::with_capacity(page_size);
        let mut remaining = false;
        for (id, record) in records.iter() {
            if let Some(after) = after {
                if *id <= after {
                    continue;
                }
            }
            if page.len() == page_size {
                remaining = true;
                break;
            }
            page.push(record.clone());
        }

        let cookie = if remaining {
            page.last().map(|record| record.id().to_string())
        } else {
            None
        };
        Ok(RecordPage {
            records: page,
            cookie,
            more: remaining,
        })
    }

    async fn entity_attributes(&self, entity: &str) -> Result<EntityAttributes, ServiceFault> {
        let store = self.store(entity)?;
        Ok(EntityAttributes {
            entity: entity.to_ascii_lowercase(),
            attributes: store.attributes.clone(),
        })
    }

    async fn retrieve_associations(
        &self,
        relationship: &str,
    ) -> Result<Vec<Association>, ServiceFault> {
        let table = self
            .state
            .associations
            .get(&relationship.to_ascii_lowercase())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                ServiceFault::new(
                    NOT_FOUND_CODE,
                    format!("relationship '{relationship}' does not exist"),
                )
            })?;

        let pairs = table.pairs.lock();
        let mut grouped: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
        for (source, target) in pairs.iter() {
            grouped.entry(*source).or_default().push(*target);
        }
        Ok(grouped
            .into_iter()
            .map(|(id, target_ids)| Association {
                relationship: relationship.to_ascii_lowercase(),
                entity: table.entity.clone(),
                id,
                target_entity: table.target_entity.clone(),
                target_ids,
            })
            .collect())
    }

    async fn associate(
        &self,
        relationship: &str,
        record: &EntityRef,
        targets: &[EntityRef],
    ) -> Result<(), ServiceFault> {
        let table = self
            .state
            .associations
            .get(&relationship.to_ascii_lowercase())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                ServiceFault::new(
                    NOT_FOUND_CODE,
                    format!("relationship '{relationship}' does not exist"),
                )
            })?;

        if !self.record_exists(&record.entity, record.id).await? {
            return Err(ServiceFault::new(
                NOT_FOUND_CODE,
                format!("record {} does not exist in '{}'", record.id, record.entity),
            ));
        }
        for target in targets {
            if !self.record_exists(&target.entity, target.id).await? {
                return Err(ServiceFault::new(
                    NOT_FOUND_CODE,
                    format!("record {} does not exist in '{}'", target.id, target.entity),
                ));
            }
        }

        let mut pairs = table.pairs.lock();
        for target in targets {
            pairs.insert((record.id, target.id));
        }
        Ok(())
    }

    async fn record_exists(&self, entity: &str, id: Uuid) -> Result<bool, ServiceFault> {
        Ok(self
            .store(entity)
            .map(|store| store.records.read().contains_key(&id))
            .unwrap_or(false))
    }

    fn clone_seed(&self, options: &CloneOptions) -> Result<Arc<dyn ServiceClient>, ServiceFault> {
        let remaining = self.state.clone_failures.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .state
                .clone_failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(ServiceFault::new(-2147180286, "clone refused by script"));
        }
        self.state.clone_count.fetch_add(1, Ordering::SeqCst);
        *self.state.last_clone_options.lock() = Some(options.clone());
        Ok(Arc::new(self.clone()))
    }
}

fn merge_fields(existing: &mut Record, incoming: &Record) {
    for (name, value) in incoming.fields() {
        existing.set(name, value.clone());
    }
}

fn reidentify(record: Record, id: Uuid) -> Record {
    if record.id() == id {
        return record;
    }
    let mut replacement = Record::new(id);
    for (name, value) in record.fields() {
        replacement.set(name, value.clone());
    }
    replacement
}

/// Builder for [`InMemoryService`].
pub struct InMemoryServiceBuilder {
    entities: Vec<(String, Vec<AttributeMetadata>, Vec<Record>)>,
    associations: Vec<(String, String, String, Vec<(Uuid, Uuid)>)>,
    recommended_parallelism: usize,
    page_size_cap: usize,
}

impl Default for InMemoryServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryServiceBuilder {
    pub fn new() -> Self {
        Self {
            entities: Vec::new(),
            associations: Vec::new(),
            recommended_parallelism: 4,
            page_size_cap: 5000,
        }
    }

    /// Declares an entity with its attribute metadata.
    pub fn entity<I>(mut self, name: impl Into<String>, attributes: I) -> Self
    where
        I: IntoIterator<Item = AttributeMetadata>,
    {
        self.entities.push((
            name.into().to_ascii_lowercase(),
            attributes.into_iter().collect(),
            Vec::new(),
        ));
        self
    }

    /// Seeds records into a previously declared entity.
    pub fn records<I>(mut self, entity: &str, records: I) -> Self
    where
        I: IntoIterator<Item = Record>,
    {
        let lowered = entity.to_ascii_lowercase();
        if let Some(slot) = self.entities.iter_mut().find(|(name, _, _)| *name == lowered) {
            slot.2.extend(records);
        }
        self
    }

    /// Declares a many-to-many relationship, optionally pre-populated.
    pub fn relationship(
        mut self,
        name: impl Into<String>,
        entity: impl Into<String>,
        target_entity: impl Into<String>,
        pairs: Vec<(Uuid, Uuid)>,
    ) -> Self {
        self.associations.push((
            name.into().to_ascii_lowercase(),
            entity.into().to_ascii_lowercase(),
            target_entity.into().to_ascii_lowercase(),
            pairs,
        ));
        self
    }

    /// The server-advertised recommended parallelism.
    pub fn recommended_parallelism(mut self, dop: usize) -> Self {
        self.recommended_parallelism = dop.max(1);
        self
    }

    /// Server-side cap on page size.
    pub fn page_size_cap(mut self, cap: usize) -> Self {
        self.page_size_cap = cap.max(1);
        self
    }

    pub fn build(self) -> InMemoryService {
        let entities = DashMap::new();
        for (name, attributes, records) in self.entities {
            let store = EntityStore {
                records: RwLock::new(
                    records
                        .into_iter()
                        .map(|record| (record.id(), record))
                        .collect(),
                ),
                attributes,
            };
            entities.insert(name, Arc::new(store));
        }
        let associations = DashMap::new();
        for (name, entity, target_entity, pairs) in self.associations {
            associations.insert(
                name,
                Arc::new(AssociationTable {
                    entity,
                    target_entity,
                    pairs: Mutex::new(pairs.into_iter().collect()),
                }),
            );
        }
        InMemoryService {
            state: Arc::new(MemoryState {
                entities,
                associations,
                recommended_parallelism: self.recommended_parallelism,
                page_size_cap: self.page_size_cap,
                bulk_calls: AtomicU64::new(0),
                bulk_log: Mutex::new(Vec::new()),
                scripted_bulk_faults: Mutex::new(BTreeMap::new()),
                entity_fault_queues: DashMap::new(),
                clone_failures: AtomicUsize::new(0),
                clone_count: AtomicUsize::new(0),
                last_clone_options: Mutex::new(None),
            }),
        }
    }
}
