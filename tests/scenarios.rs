//! End-to-end import scenarios against the in-memory service.

mod support;

use dataport_client::fault::codes;
use dataport_client::{BulkOperation, ServiceFault};
use dataport_core::progress::Phase;
use dataport_core::record::Value;
use dataport_engine::{ImportMode, ImportOptions, RunStatus};
use dataport_schema::{parse_schema, schema_to_xml};
use dataport_throttle::RateConfigBuilder;
use std::time::Duration;
use support::*;
use tokio_util::sync::CancellationToken;

/// S1: acyclic three-entity import. 5 currencies, 3 business units,
/// 10 accounts; three tiers, no deferred fields, 18 creates, 18
/// identity mappings, zero deferred updates.
#[tokio::test]
async fn s1_acyclic_three_entity_import() {
    let schema = acyclic_schema();
    let target = target_for(&schema);
    let engine = engine_for(&target);

    let mut data = dataport_schema::DataSet::new();
    data.push_entity(
        "currency",
        (1..=5)
            .map(|i| named(i, "currencyname", &format!("cur{i}")))
            .collect(),
    );
    data.push_entity(
        "businessunit",
        (11..=13)
            .map(|i| {
                named(i, "name", &format!("bu{i}"))
                    .with_field("transactioncurrencyid", reference("currency", 1))
            })
            .collect(),
    );
    data.push_entity(
        "account",
        (21..=30)
            .map(|i| {
                named(i, "name", &format!("acct{i}"))
                    .with_field("owningbusinessunit", reference("businessunit", 11))
            })
            .collect(),
    );

    let options = ImportOptions::builder()
        .mode(ImportMode::Create)
        .build()
        .unwrap();
    let ctx = engine.import_context(schema, data, options, CancellationToken::new());

    assert_eq!(
        ctx.plan.tiers,
        vec![
            vec!["currency".to_string()],
            vec!["businessunit".to_string()],
            vec!["account".to_string()],
        ]
    );
    assert!(ctx.plan.deferred_fields.is_empty());

    let summary = engine.run_import(&ctx).await.unwrap();
    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.phase("entities").unwrap().success_count, 18);
    assert_eq!(summary.phase("deferred-fields").unwrap().success_count, 0);

    assert_eq!(ctx.id_map.len("currency"), 5);
    assert_eq!(ctx.id_map.len("businessunit"), 3);
    assert_eq!(ctx.id_map.len("account"), 10);
    assert_eq!(ctx.id_map.total_len(), 18);

    assert_eq!(target.record_count("currency"), 5);
    assert_eq!(target.record_count("businessunit"), 3);
    assert_eq!(target.record_count("account"), 10);
    assert!(target
        .bulk_log()
        .iter()
        .all(|call| call.operation == BulkOperation::Create));
}

/// S2: two-entity cycle. Phase B writes all 8 records with
/// account.primarycontactid stripped; phase C issues 4 updates that
/// set it; final state matches the source relationships.
#[tokio::test]
async fn s2_two_entity_cycle() {
    let schema = cyclic_schema();
    let target = target_for(&schema);
    let engine = engine_for(&target);

    let mut data = dataport_schema::DataSet::new();
    data.push_entity(
        "account",
        (1..=4)
            .map(|i| {
                named(i, "name", &format!("acct{i}"))
                    .with_field("primarycontactid", reference("contact", 10 + i))
            })
            .collect(),
    );
    data.push_entity(
        "contact",
        (11..=14)
            .map(|i| {
                named(i, "fullname", &format!("contact{i}"))
                    .with_field("parentaccountid", reference("account", i - 10))
            })
            .collect(),
    );

    let options = ImportOptions::builder()
        .mode(ImportMode::Create)
        .build()
        .unwrap();
    let ctx = engine.import_context(schema, data, options, CancellationToken::new());

    assert_eq!(ctx.plan.tiers.len(), 1);
    assert_eq!(
        ctx.plan.deferred_fields.get("account"),
        Some(&vec!["primarycontactid".to_string()])
    );

    let summary = engine.run_import(&ctx).await.unwrap();
    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.phase("entities").unwrap().success_count, 8);
    assert_eq!(summary.phase("deferred-fields").unwrap().success_count, 4);

    // Deferred updates arrive as UpdateMultiple on account.
    let updates: Vec<_> = target
        .bulk_log()
        .into_iter()
        .filter(|call| call.operation == BulkOperation::Update)
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].entity, "account");
    assert_eq!(updates[0].size, 4);

    // Final state carries the cycle both ways.
    for i in 1..=4u128 {
        let account = target.record("account", uuid(i)).unwrap();
        assert_eq!(
            account.get("primarycontactid"),
            Some(&reference("contact", 10 + i))
        );
        let contact = target.record("contact", uuid(10 + i)).unwrap();
        assert_eq!(
            contact.get("parentaccountid"),
            Some(&reference("account", i))
        );
    }
}

/// S3: a protection fault mid-operation. The executor records the
/// throttle, sleeps for the hint, resubmits the same batch and the
/// operation finishes with zero failures.
#[tokio::test]
async fn s3_throttle_mid_operation_recovers() {
    let schema = acyclic_schema();
    let target = target_for(&schema);
    let config = RateConfigBuilder::new()
        .successes_per_increase(1)
        .min_increase_interval(Duration::ZERO)
        .build();
    let engine = engine_with_rate(&target, config);

    let mut data = dataport_schema::DataSet::new();
    data.push_entity(
        "currency",
        (1..=20)
            .map(|i| named(i, "currencyname", &format!("cur{i}")))
            .collect(),
    );

    // Metadata retrieval is not a bulk call, so bulk call 7 is batch 7.
    target.inject_bulk_fault(
        7,
        ServiceFault::throttle(codes::REQUEST_RATE, Duration::from_millis(80)),
    );

    let options = ImportOptions::builder()
        .batch_size(1)
        .max_parallel_batches(1)
        .build()
        .unwrap();
    let ctx = engine.import_context(schema, data, options, CancellationToken::new());
    let summary = engine.run_import(&ctx).await.unwrap();

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.total_failures(), 0);
    assert_eq!(target.record_count("currency"), 20);
    // 20 batches + 1 resubmission of the throttled one.
    assert_eq!(target.bulk_call_count(), 21);
    assert_eq!(engine.pool().tracker().throttle_events(), 1);
}

/// S4: the lazy bulk-type race on a freshly created table. Two race
/// faults then success; three attempts total, same source, no record
/// marked failed.
#[tokio::test]
async fn s4_transient_race_on_fresh_table() {
    let schema = acyclic_schema();
    let target = target_for(&schema);
    let engine = engine_for(&target);

    target.push_entity_faults(
        "currency",
        vec![
            ServiceFault::transient_race("currency"),
            ServiceFault::transient_race("currency"),
        ],
    );

    let mut data = dataport_schema::DataSet::new();
    data.push_entity(
        "currency",
        (1..=5)
            .map(|i| named(i, "currencyname", &format!("cur{i}")))
            .collect(),
    );

    let ctx = engine.import_context(
        schema,
        data,
        ImportOptions::default(),
        CancellationToken::new(),
    );
    let summary = engine.run_import(&ctx).await.unwrap();

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.total_failures(), 0);
    // One batch, three attempts.
    assert_eq!(target.bulk_call_count(), 3);
    assert_eq!(target.clone_count(), 1, "all attempts on the same source");
    assert_eq!(target.record_count("currency"), 5);
}

/// S5: many-to-many with a missing target. One association lands, the
/// missing contact is skipped with a warning, status is
/// partial-success.
#[tokio::test]
async fn s5_m2m_with_missing_target() {
    let schema = m2m_schema();
    let target = target_for(&schema);
    let sink = EventSink::new();
    let engine = engine_with_listener(&target, sink.clone());

    let mut data = dataport_schema::DataSet::new();
    data.push_entity("account", vec![named(1, "name", "A")]);
    // C2 (id 12) is absent from the data, so it never maps.
    data.push_entity("contact", vec![named(11, "fullname", "C1")]);
    data.push_association(dataport_core::record::Association {
        relationship: "account_contacts".into(),
        entity: "account".into(),
        id: uuid(1),
        target_entity: "contact".into(),
        target_ids: vec![uuid(11), uuid(12)],
    });

    let ctx = engine.import_context(
        schema,
        data,
        ImportOptions::default(),
        CancellationToken::new(),
    );
    let summary = engine.run_import(&ctx).await.unwrap();

    assert_eq!(summary.status, RunStatus::PartialSuccess);
    let m2m = summary.phase("many-to-many").unwrap();
    assert_eq!(m2m.success_count, 1);
    assert_eq!(m2m.failure_count, 1);

    assert_eq!(
        target.association_pairs("account_contacts"),
        vec![(uuid(1), uuid(11))]
    );
    assert!(sink
        .events()
        .iter()
        .any(|event| event.phase == Phase::Error
            && event
                .error
                .as_ref()
                .is_some_and(|report| report.message.contains(&uuid(12).to_string()))));
}

/// S6: planner determinism. The same schema document always yields a
/// byte-identical plan.
#[tokio::test]
async fn s6_planner_determinism() {
    let schema = cyclic_schema();
    let xml = schema_to_xml(&schema);

    let target = target_for(&schema);
    let engine = engine_for(&target);

    let first = engine.plan(&parse_schema(&xml).unwrap());
    let second = engine.plan(&parse_schema(&xml).unwrap());

    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
}

/// Boundary: an entity with zero records succeeds with processed = 0.
#[tokio::test]
async fn empty_entity_phase_succeeds() {
    let schema = acyclic_schema();
    let target = target_for(&schema);
    let engine = engine_for(&target);

    let mut data = dataport_schema::DataSet::new();
    data.push_entity("currency", Vec::new());

    let ctx = engine.import_context(
        schema,
        data,
        ImportOptions::default(),
        CancellationToken::new(),
    );
    let summary = engine.run_import(&ctx).await.unwrap();
    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.phase("entities").unwrap().processed, 0);
    assert_eq!(target.bulk_call_count(), 0);
}

/// Boundary: a deferred lookup whose target never mapped is skipped
/// with a warning; the deferred phase does not error.
#[tokio::test]
async fn deferred_miss_skips_with_warning() {
    let schema = cyclic_schema();
    let target = target_for(&schema);
    let sink = EventSink::new();
    let engine = engine_with_listener(&target, sink.clone());

    let mut data = dataport_schema::DataSet::new();
    // Account 1 points at contact 99, which is not in the data.
    data.push_entity(
        "account",
        vec![named(1, "name", "A").with_field("primarycontactid", reference("contact", 99))],
    );
    data.push_entity("contact", vec![named(11, "fullname", "C")]);

    let ctx = engine.import_context(
        schema,
        data,
        ImportOptions::default(),
        CancellationToken::new(),
    );
    let summary = engine.run_import(&ctx).await.unwrap();

    assert_eq!(summary.status, RunStatus::Success);
    let deferred = summary.phase("deferred-fields").unwrap();
    assert!(deferred.success);
    assert_eq!(deferred.success_count, 0);

    // The record exists, but its deferred lookup stayed unset.
    let account = target.record("account", uuid(1)).unwrap();
    assert!(!account.contains("primarycontactid"));
    assert!(sink
        .events()
        .iter()
        .any(|event| event.phase == Phase::Error
            && event
                .error
                .as_ref()
                .is_some_and(|report| report.message.contains("deferred reference"))));
}

/// Boundary: update mode skips source records with no target match and
/// reports them.
#[tokio::test]
async fn update_mode_reports_unmatched_records() {
    let schema = acyclic_schema();
    let target = target_for(&schema);
    // Only record 1 exists in the target.
    target.seed_record("currency", named(1, "currencyname", "old"));
    let engine = engine_for(&target);

    let mut data = dataport_schema::DataSet::new();
    data.push_entity(
        "currency",
        vec![
            named(1, "currencyname", "renamed"),
            named(2, "currencyname", "ghost"),
        ],
    );

    let options = ImportOptions::builder()
        .mode(ImportMode::Update)
        .continue_on_error(true)
        .build()
        .unwrap();
    let ctx = engine.import_context(schema, data, options, CancellationToken::new());
    let summary = engine.run_import(&ctx).await.unwrap();

    assert_eq!(summary.status, RunStatus::PartialSuccess);
    let entities = summary.phase("entities").unwrap();
    assert_eq!(entities.success_count, 1);
    assert_eq!(entities.failure_count, 1);
    let updated = target.record("currency", uuid(1)).unwrap();
    assert_eq!(
        updated.get("currencyname"),
        Some(&Value::Text("renamed".into()))
    );
}

/// The tag and bypass options reach the wire as request parameters.
#[tokio::test]
async fn bypass_options_reach_the_wire() {
    let schema = acyclic_schema();
    let target = target_for(&schema);
    let engine = engine_for(&target);

    let mut data = dataport_schema::DataSet::new();
    data.push_entity("currency", vec![named(1, "currencyname", "x")]);

    let options = ImportOptions::builder()
        .bypass_custom_logic(dataport_client::BypassLogic::ALL)
        .suppress_duplicate_detection(true)
        .tag("nightly-sync")
        .build()
        .unwrap();
    let ctx = engine.import_context(schema, data, options, CancellationToken::new());
    engine.run_import(&ctx).await.unwrap();

    let log = target.bulk_log();
    assert_eq!(log.len(), 1);
    let parameters = &log[0].parameters;
    assert!(parameters
        .iter()
        .any(|(k, v)| *k == "BypassBusinessLogicExecution" && v == "CustomSync,CustomAsync"));
    assert!(parameters
        .iter()
        .any(|(k, v)| *k == "SuppressDuplicateDetection" && v == "true"));
    assert!(parameters.iter().any(|(k, v)| *k == "tag" && v == "nightly-sync"));
}

/// Schema mismatch without --skip-missing-columns aborts before any
/// write; with it, the import proceeds and strips the column.
#[tokio::test]
async fn missing_target_column_behavior() {
    let schema = acyclic_schema();
    // Target advertises currency without the name column.
    let target = dataport_client::memory::InMemoryService::builder()
        .entity(
            "currency",
            [dataport_client::AttributeMetadata::new("currencyid")],
        )
        .build();
    let engine = engine_for(&target);

    let mut data = dataport_schema::DataSet::new();
    data.push_entity("currency", vec![named(1, "currencyname", "x")]);

    let ctx = engine.import_context(
        schema.clone(),
        data.clone(),
        ImportOptions::default(),
        CancellationToken::new(),
    );
    let error = engine.run_import(&ctx).await.unwrap_err();
    assert!(matches!(
        error,
        dataport_core::error::MigrationError::SchemaMismatch { .. }
    ));
    assert_eq!(target.record_count("currency"), 0);

    let options = ImportOptions::builder()
        .skip_missing_columns(true)
        .build()
        .unwrap();
    let ctx = engine.import_context(schema, data, options, CancellationToken::new());
    let summary = engine.run_import(&ctx).await.unwrap();
    assert_eq!(summary.status, RunStatus::Success);
    let written = target.record("currency", uuid(1)).unwrap();
    assert!(!written.contains("currencyname"));
}

/// Cancellation before the run admits no batches and fails the run.
#[tokio::test]
async fn cancelled_import_writes_nothing() {
    let schema = acyclic_schema();
    let target = target_for(&schema);
    let engine = engine_for(&target);

    let mut data = dataport_schema::DataSet::new();
    data.push_entity("currency", vec![named(1, "currencyname", "x")]);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let ctx = engine.import_context(schema, data, ImportOptions::default(), cancel);
    let result = engine.run_import(&ctx).await;
    match result {
        Err(_) => {}
        Ok(summary) => assert_eq!(summary.status, RunStatus::Failed),
    }
    assert_eq!(target.record_count("currency"), 0);
}
