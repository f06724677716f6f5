//! Shared builders for the integration scenarios.

#![allow(dead_code)]

use dataport_client::memory::InMemoryService;
use dataport_client::AttributeMetadata;
use dataport_core::progress::{ProgressEvent, ProgressListener};
use dataport_core::record::{EntityRef, Record, Value};
use dataport_engine::MigrationEngine;
use dataport_pool::PreAuthenticatedSource;
use dataport_schema::{EntitySchema, FieldSchema, RelationshipSchema, Schema};
use dataport_throttle::RateConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// S1 shape: currency <- businessunit <- account.
pub fn acyclic_schema() -> Schema {
    Schema::new(vec![
        EntitySchema::new("currency", "currencyid", "currencyname")
            .with_field(FieldSchema::identifier("currencyid"))
            .with_field(FieldSchema::text("currencyname")),
        EntitySchema::new("businessunit", "businessunitid", "name")
            .with_field(FieldSchema::identifier("businessunitid"))
            .with_field(FieldSchema::text("name"))
            .with_field(FieldSchema::lookup("transactioncurrencyid", "currency")),
        EntitySchema::new("account", "accountid", "name")
            .with_field(FieldSchema::identifier("accountid"))
            .with_field(FieldSchema::text("name"))
            .with_field(FieldSchema::lookup("owningbusinessunit", "businessunit")),
    ])
    .unwrap()
}

/// S2 shape: account.primarycontactid -> contact, contact.parentaccountid -> account.
pub fn cyclic_schema() -> Schema {
    Schema::new(vec![
        EntitySchema::new("account", "accountid", "name")
            .with_field(FieldSchema::identifier("accountid"))
            .with_field(FieldSchema::text("name"))
            .with_field(FieldSchema::lookup("primarycontactid", "contact")),
        EntitySchema::new("contact", "contactid", "fullname")
            .with_field(FieldSchema::identifier("contactid"))
            .with_field(FieldSchema::text("fullname"))
            .with_field(FieldSchema::lookup("parentaccountid", "account")),
    ])
    .unwrap()
}

/// S5 shape: account and contact joined by one m2m relationship.
pub fn m2m_schema() -> Schema {
    Schema::new(vec![
        EntitySchema::new("account", "accountid", "name")
            .with_field(FieldSchema::identifier("accountid"))
            .with_field(FieldSchema::text("name"))
            .with_relationship(RelationshipSchema::many_to_many(
                "account_contacts",
                "account",
                "contact",
            )),
        EntitySchema::new("contact", "contactid", "fullname")
            .with_field(FieldSchema::identifier("contactid"))
            .with_field(FieldSchema::text("fullname")),
    ])
    .unwrap()
}

/// Attribute metadata a target advertises for one schema entity: every
/// declared field, valid for create and update.
pub fn attributes_for(schema: &Schema, entity: &str) -> Vec<AttributeMetadata> {
    schema
        .entity(entity)
        .expect("entity in schema")
        .fields
        .iter()
        .map(|field| AttributeMetadata::new(field.logical_name.clone()))
        .collect()
}

/// An empty in-memory target advertising the schema's entities.
pub fn target_for(schema: &Schema) -> InMemoryService {
    let mut builder = InMemoryService::builder().recommended_parallelism(4);
    for entity in schema.entities() {
        builder = builder.entity(
            entity.logical_name.clone(),
            attributes_for(schema, &entity.logical_name),
        );
    }
    for relationship in schema.many_to_many() {
        builder = builder.relationship(
            relationship.name.clone(),
            relationship.entity_a.clone(),
            relationship.entity_b.clone(),
            Vec::new(),
        );
    }
    builder.build()
}

/// An engine over one pre-authenticated source for `service`.
pub fn engine_for(service: &InMemoryService) -> MigrationEngine {
    engine_with_rate(service, RateConfig::default())
}

pub fn engine_with_rate(service: &InMemoryService, config: RateConfig) -> MigrationEngine {
    MigrationEngine::builder()
        .source(Arc::new(PreAuthenticatedSource::new(
            "target",
            Arc::new(service.clone()),
            4,
        )))
        .rate_config(config)
        .build()
        .unwrap()
}

pub fn engine_with_listener(service: &InMemoryService, sink: EventSink) -> MigrationEngine {
    MigrationEngine::builder()
        .source(Arc::new(PreAuthenticatedSource::new(
            "target",
            Arc::new(service.clone()),
            4,
        )))
        .listener(sink)
        .build()
        .unwrap()
}

pub fn uuid(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

pub fn named(id: u128, field: &str, value: &str) -> Record {
    Record::new(uuid(id)).with_field(field, Value::Text(value.into()))
}

pub fn reference(entity: &str, id: u128) -> Value {
    Value::Reference(EntityRef::new(entity, uuid(id)))
}

/// Collects every progress event for assertions.
#[derive(Clone, Default)]
pub struct EventSink {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }
}

impl ProgressListener for EventSink {
    fn on_event(&self, event: &ProgressEvent) {
        self.events.lock().push(event.clone());
    }
}
