//! End-to-end coverage for `Orchestrator::run` itself -- the SQL-synthesis
//! populate/hydrate/insert pipeline that actually ships, as opposed to the
//! `Cloner`-based row transform exercised in `tests/scenarios.rs`. Each test
//! drives a real `rusqlite::Connection` pair through a full transform and
//! asserts spec §8's scenarios against the resulting target rows.
//!
//! Both `source` and `target` are real on-disk files: `Orchestrator::new` has
//! `target` `ATTACH` the source file by path so `class_plan`'s generated SQL
//! can join `source.ec_Class` against `main.ec_Class` in the same statement,
//! which a `:memory:` database can't do from a second, unrelated connection
//! -- so `tempfile` is load-bearing here, not incidental. Keeping `target` on
//! disk too means a fresh connection can reopen it for assertions once the
//! `Orchestrator` that drove the transform is dropped.

mod common;

use ecdb_transform::{
    config::{
        DanglingReferencesBehavior,
        TransformConfig,
    },
    ids::Id,
    Cloner,
    Orchestrator,
    TransformError,
    TransformErrorCode,
};
use rusqlite::{
    params,
    Connection,
};

fn open_db_file() -> (tempfile::NamedTempFile, Connection) {
    let file = tempfile::NamedTempFile::new().unwrap();
    let conn = Connection::open(file.path()).unwrap();
    (file, conn)
}

// Scenario 2: two-element chain. 0x21's Parent resolves to 0x20's freshly
// assigned target id; 0x20's Parent still resolves to the identity-preserved
// root subject.
#[tokio::test]
async fn two_element_chain_resolves_parent_to_freshly_assigned_id() {
    let (source_file, source) = open_db_file();
    common::bootstrap_source(&source);
    common::insert_element(&source, 0x20, "Elem20", Id::ROOT_SUBJECT.0);
    common::insert_element(&source, 0x21, "Elem21", 0x20);

    let (target_file, target) = open_db_file();
    common::bootstrap_target(&target);

    let catalog = common::catalog();
    let plans = common::class_plans(&catalog);
    let mut orchestrator = Orchestrator::new(
        source,
        target,
        source_file.path().to_str().unwrap(),
        catalog,
        Cloner::new(),
        TransformConfig::default(),
        false,
    )
    .unwrap();

    let report = orchestrator.run(&plans).await.unwrap();
    assert_eq!(report.elements_copied, 2);
    drop(orchestrator);

    let target_conn = Connection::open(target_file.path()).unwrap();
    let graph = common::parent_graph_by_code_value(&target_conn);
    assert_eq!(graph.get("Elem20").map(String::as_str), Some("ROOT"));
    assert_eq!(graph.get("Elem21").map(String::as_str), Some("Elem20"));
}

// Scenario 3: self-cycle through a relationship. An element that refers to
// itself still produces exactly one relationship row in the target, with
// both endpoints equal to the element's remapped id.
#[tokio::test]
async fn relationship_with_both_endpoints_on_the_same_element_round_trips() {
    let (source_file, source) = open_db_file();
    common::bootstrap_source(&source);
    common::insert_element(&source, 0x30, "Elem30", Id::ROOT_SUBJECT.0);
    common::insert_relationship(&source, 0x40, 0x30, 0x30);

    let (target_file, target) = open_db_file();
    common::bootstrap_target(&target);

    let catalog = common::catalog();
    let plans = common::class_plans(&catalog);
    let mut orchestrator = Orchestrator::new(
        source,
        target,
        source_file.path().to_str().unwrap(),
        catalog,
        Cloner::new(),
        TransformConfig::default(),
        false,
    )
    .unwrap();

    let report = orchestrator.run(&plans).await.unwrap();
    assert_eq!(report.relationships_copied, 1);
    assert_eq!(report.relationships_skipped_dangling, 0);
    drop(orchestrator);

    let target_conn = Connection::open(target_file.path()).unwrap();
    let remapped_elem30: i64 = target_conn
        .query_row("SELECT ECInstanceId FROM \"BisCore_Subject\" WHERE CodeValue = 'Elem30'", [], |r| r.get(0))
        .unwrap();
    let (src, tgt): (i64, i64) = target_conn
        .query_row("SELECT SourceECInstanceId, TargetECInstanceId FROM \"BisCore_ElementRefersToElements\"", [], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .unwrap();
    assert_eq!(src, remapped_elem30);
    assert_eq!(tgt, remapped_elem30);
}

// Scenario 4: dangling reference. 0x51 was deleted from the source, so the
// relationship 0x60 -> 0x51 never resolves. `reject` (the default) fails the
// whole transform; `ignore` drops just that relationship.
#[tokio::test]
async fn dangling_relationship_endpoint_rejects_by_default() {
    let (source_file, source) = open_db_file();
    common::bootstrap_source(&source);
    common::insert_element(&source, 0x50, "Elem50", Id::ROOT_SUBJECT.0);
    common::insert_relationship(&source, 0x60, 0x50, 0x51);

    let (_target_file, target) = open_db_file();
    common::bootstrap_target(&target);

    let catalog = common::catalog();
    let plans = common::class_plans(&catalog);
    let mut orchestrator = Orchestrator::new(
        source,
        target,
        source_file.path().to_str().unwrap(),
        catalog,
        Cloner::new(),
        TransformConfig::default(),
        false,
    )
    .unwrap();

    let err = orchestrator.run(&plans).await.unwrap_err();
    let transform_err = TransformError::downcast(&err).expect("a TransformError should be attached");
    assert_eq!(transform_err.code, TransformErrorCode::DanglingReference);
}

#[tokio::test]
async fn dangling_relationship_endpoint_is_skipped_when_ignored() {
    let (source_file, source) = open_db_file();
    common::bootstrap_source(&source);
    common::insert_element(&source, 0x50, "Elem50", Id::ROOT_SUBJECT.0);
    common::insert_relationship(&source, 0x60, 0x50, 0x51);

    let (_target_file, target) = open_db_file();
    common::bootstrap_target(&target);

    let catalog = common::catalog();
    let plans = common::class_plans(&catalog);
    let config = TransformConfig {
        dangling_references_behavior: DanglingReferencesBehavior::Ignore,
        ..TransformConfig::default()
    };
    let mut orchestrator = Orchestrator::new(
        source,
        target,
        source_file.path().to_str().unwrap(),
        catalog,
        Cloner::new(),
        config,
        false,
    )
    .unwrap();

    let report = orchestrator.run(&plans).await.unwrap();
    assert_eq!(report.elements_copied, 1);
    assert_eq!(report.relationships_copied, 0);
    assert_eq!(report.relationships_skipped_dangling, 1);
}

// Scenario 6: preserve-ids mode. Source ids survive verbatim in the target,
// and the target's element-id sequence is pre-advanced past the highest one.
#[tokio::test]
async fn preserve_element_ids_mode_keeps_source_ids_and_advances_sequence() {
    let (source_file, source) = open_db_file();
    common::bootstrap_source(&source);
    common::insert_element(&source, 0x20, "Elem20", Id::ROOT_SUBJECT.0);
    common::insert_element(&source, 0x21, "Elem21", 0x20);

    let (target_file, target) = open_db_file();
    common::bootstrap_target(&target);

    let catalog = common::catalog();
    let plans = common::class_plans(&catalog);
    let config = TransformConfig {
        preserve_element_ids_for_filtering: true,
        ..TransformConfig::default()
    };
    let mut orchestrator = Orchestrator::new(
        source,
        target,
        source_file.path().to_str().unwrap(),
        catalog,
        Cloner::new(),
        config,
        false,
    )
    .unwrap();

    orchestrator.run(&plans).await.unwrap();
    drop(orchestrator);

    let target_conn = Connection::open(target_file.path()).unwrap();
    let ids: Vec<i64> = {
        let mut stmt = target_conn.prepare("SELECT ECInstanceId FROM \"BisCore_Subject\" ORDER BY ECInstanceId").unwrap();
        stmt.query_map([], |r| r.get(0)).unwrap().collect::<Result<_, _>>().unwrap()
    };
    assert_eq!(ids, vec![0x20, 0x21]);

    let sequence_val: i64 = target_conn
        .query_row("SELECT Val FROM be_Local WHERE Name = ?1", params!["bis_elementidsequence"], |r| r.get(0))
        .unwrap();
    assert!(sequence_val >= 0x21, "sequence should be pre-advanced past 0x21, got {sequence_val}");
}
