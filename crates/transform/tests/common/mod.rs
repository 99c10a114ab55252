//! Shared fixtures for the `Orchestrator::run` integration tests: a tiny
//! hand-built schema (`BisCore:Subject` with a `Parent` navigation property,
//! plus `BisCore:ElementRefersToElements`) wired through `SchemaCatalog` and
//! `ClassPlan` the way a real EC schema importer would feed them. No schema
//! importer is in scope, so the catalog is built by hand once and shared
//! across every test in this file.

use std::collections::HashMap;

use ecdb_transform::{
    class_plan::ClassPlan,
    ids::EntityKind,
    schema::{
        ClassDescriptor,
        ClassName,
        PropertyDescriptor,
        SchemaCatalog,
    },
};
use rusqlite::{
    params,
    Connection,
};

pub const SOURCE_CLASS_PARENT_REL: i64 = 3;
pub const TARGET_CLASS_PARENT_REL: i64 = 103;

pub fn catalog() -> SchemaCatalog {
    let mut catalog = SchemaCatalog::new();
    catalog.insert(ClassDescriptor {
        name: ClassName::new("BisCore", "Subject"),
        properties: vec![
            PropertyDescriptor::primitive("CodeValue"),
            PropertyDescriptor::navigation("Parent", EntityKind::Element, true),
        ],
        is_element: true,
    });
    catalog.insert(ClassDescriptor {
        name: ClassName::new("BisCore", "ElementRefersToElements"),
        properties: vec![
            PropertyDescriptor::id_long("SourceECInstanceId", EntityKind::Element),
            PropertyDescriptor::id_long("TargetECInstanceId", EntityKind::Element),
        ],
        is_element: false,
    });
    catalog
}

pub fn class_plans(catalog: &SchemaCatalog) -> HashMap<String, ClassPlan> {
    catalog.classes().map(|c| (c.name.qualified(), ClassPlan::build(c))).collect()
}

fn bootstrap(conn: &Connection, schema_id: i64, class_subject: i64, class_relationship: i64, class_parent_rel: i64) {
    conn.execute_batch(
        r#"
        CREATE TABLE ec_Schema (Id INTEGER PRIMARY KEY, Name TEXT);
        CREATE TABLE ec_Class (Id INTEGER PRIMARY KEY, SchemaId INTEGER, Name TEXT);
        CREATE TABLE bis_Element (ECInstanceId INTEGER PRIMARY KEY, ECClassId INTEGER);
        CREATE TABLE bis_Model (ECInstanceId INTEGER PRIMARY KEY);
        CREATE TABLE bis_ElementAspect (ECInstanceId INTEGER PRIMARY KEY);
        CREATE TABLE bis_CodeSpec (Id INTEGER PRIMARY KEY, Name TEXT);
        CREATE TABLE "BisCore_Subject" (
            ECInstanceId INTEGER PRIMARY KEY,
            CodeValue TEXT,
            "Parent.Id" INTEGER,
            "Parent.RelECClassId" INTEGER
        );
        CREATE TABLE "BisCore_ElementRefersToElements" (
            ECInstanceId INTEGER PRIMARY KEY,
            ECClassId INTEGER,
            SourceECInstanceId INTEGER,
            TargetECInstanceId INTEGER
        );
        CREATE TABLE be_Local (Name TEXT PRIMARY KEY, Val INTEGER);
        "#,
    )
    .unwrap();
    conn.execute("INSERT INTO ec_Schema (Id, Name) VALUES (?1, 'BisCore')", params![schema_id]).unwrap();
    conn.execute_batch(&format!(
        "INSERT INTO ec_Class (Id, SchemaId, Name) VALUES
            ({class_subject}, {schema_id}, 'Subject'),
            ({class_relationship}, {schema_id}, 'ElementRefersToElements'),
            ({class_parent_rel}, {schema_id}, 'ElementOwnsChildElements');"
    ))
    .unwrap();
    conn.execute("INSERT INTO bis_Element (ECInstanceId, ECClassId) VALUES (0x1, ?1)", params![class_subject])
        .unwrap();
}

/// Numeric `ec_Class`/`ec_Schema` ids deliberately differ from
/// [`bootstrap_target`]'s -- `class_id_subquery` joins source to target by
/// schema+class *name*, never by id, and these fixtures are the thing that
/// proves it.
pub fn bootstrap_source(conn: &Connection) {
    bootstrap(conn, 1, 1, 2, SOURCE_CLASS_PARENT_REL);
}

pub fn bootstrap_target(conn: &Connection) {
    bootstrap(conn, 9, 101, 102, TARGET_CLASS_PARENT_REL);
}

pub fn insert_element(conn: &Connection, id: u64, code_value: &str, parent_id: u64) {
    conn.execute("INSERT INTO bis_Element (ECInstanceId, ECClassId) VALUES (?1, 1)", params![id as i64]).unwrap();
    conn.execute(
        "INSERT INTO \"BisCore_Subject\" (ECInstanceId, CodeValue, \"Parent.Id\", \"Parent.RelECClassId\") \
         VALUES (?1, ?2, ?3, ?4)",
        params![id as i64, code_value, parent_id as i64, SOURCE_CLASS_PARENT_REL],
    )
    .unwrap();
}

pub fn insert_relationship(conn: &Connection, id: u64, source_endpoint: u64, target_endpoint: u64) {
    conn.execute(
        "INSERT INTO \"BisCore_ElementRefersToElements\" (ECInstanceId, SourceECInstanceId, TargetECInstanceId) \
         VALUES (?1, ?2, ?3)",
        params![id as i64, source_endpoint as i64, target_endpoint as i64],
    )
    .unwrap();
}

/// `CodeValue -> parent's CodeValue` (or `"ROOT"` for a direct child of the
/// root subject), read back from a target briefcase. Comparing graphs this
/// way rather than by raw id is what makes the comparison survive a
/// transform, whose whole point is that ids change.
pub fn parent_graph_by_code_value(conn: &Connection) -> std::collections::BTreeMap<String, String> {
    let mut stmt = conn.prepare("SELECT ECInstanceId, CodeValue, \"Parent.Id\" FROM \"BisCore_Subject\"").unwrap();
    let rows: Vec<(i64, String, i64)> =
        stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?))).unwrap().collect::<Result<_, _>>().unwrap();
    let by_id: std::collections::BTreeMap<i64, String> = rows.iter().map(|(id, code, _)| (*id, code.clone())).collect();
    rows.into_iter()
        .map(|(_, code, parent_id)| {
            let parent_label = if parent_id == ecdb_transform::ids::Id::ROOT_SUBJECT.0 as i64 {
                "ROOT".to_owned()
            } else {
                by_id.get(&parent_id).cloned().unwrap_or_else(|| "?".to_owned())
            };
            (code, parent_label)
        })
        .collect()
}
