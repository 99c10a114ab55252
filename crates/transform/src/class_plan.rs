//! `ClassPlan` (C3): for each concrete class, the four precomputed SQL
//! fragments the Orchestrator executes per row (spec §4.3).
//!
//! Built once per class from schema metadata, then cached for the lifetime
//! of the transform -- the same "build the SQL text once, bind params every
//! row" shape as the host's `crates/sqlite` persistence layer, whose
//! `INSERT_DOCUMENT` / `INSERT_OVERWRITE_DOCUMENT` constants are prepared
//! once and reused via `Connection::prepare_cached` on every write.

use crate::schema::{
    ClassDescriptor,
    PropertyKind,
};

/// A single bound parameter name, following the host's `:b_<col>` /
/// `:n_<col>_{x,y,z}` / `:p_<col>` naming convention (spec §9 "Dynamic SQL
/// synthesis") so every statement's binding logic can stay uniform: `b_`
/// prefixes a plain bound scalar, `n_` a navigation id/class-id pair, `p_` a
/// point component, and `blob_` a binary parameter pulled from
/// `select_binaries`.
pub(crate) fn bind_name(prefix: &str, column: &str) -> String {
    format!(":{prefix}_{column}")
}

#[derive(Clone, Debug)]
pub struct ClassPlan {
    pub table_name: String,
    /// `SELECT [binCol1], [binCol2], … FROM ClassTable WHERE ECInstanceId = ?`
    pub select_binaries: String,
    /// Populate-phase `INSERT` (elements only): placeholders for every
    /// reference column, real values for everything else.
    pub populate: Option<String>,
    /// Hydrate-phase `UPDATE`: inline remap expressions for every reference
    /// column, plus `CodeValue` pulled from the row's JSON projection.
    pub hydrate: Option<String>,
    /// Full `INSERT` used for aspects and relationships, with inline remap
    /// expressions for every reference.
    pub insert: String,
}

/// SQL expression that resolves a source id through a temp remap table
/// flushed from a `CompactRemapTable` (spec §4.2): `temp.<kind>_remap`.
fn remap_expr(temp_table: &str, source_value_sql: &str) -> String {
    format!(
        "(SELECT TargetId + ({source_value_sql} - SourceId) FROM {temp_table} \
         WHERE {source_value_sql} BETWEEN SourceId AND SourceId + Length - 1)"
    )
}

/// Which temp remap table a navigation/long property resolves through.
fn temp_table_for(ref_kind: crate::ids::EntityKind) -> &'static str {
    use crate::ids::EntityKind::*;
    match ref_kind {
        Element | Model => "temp.element_remap",
        Aspect => "temp.aspect_remap",
        CodeSpec => "temp.codespec_remap",
        Relationship => "temp.element_remap", // endpoints resolve through element ids once loaded
    }
}

/// The class-id translation subquery: source `ec_Class` row -> target
/// `ec_Class` row, joined on schema+class name (spec §4.3 "insert").
fn class_id_subquery(source_class_id_col: &str) -> String {
    format!(
        "(SELECT tc.Id FROM source.ec_Class sc \
          JOIN source.ec_Schema ss ON ss.Id = sc.SchemaId \
          JOIN main.ec_Class tc ON tc.Name = sc.Name \
          JOIN main.ec_Schema ts ON ts.Id = tc.SchemaId AND ts.Name = ss.Name \
          WHERE sc.Id = {source_class_id_col})"
    )
}

impl ClassPlan {
    /// Build every statement this class needs. `populate`/`hydrate` are only
    /// produced for element classes (spec §4.3 item 2-3 are "elements
    /// only"); aspect and relationship classes only get `insert`.
    pub fn build(class: &ClassDescriptor) -> Self {
        let table_name = class.name.table_name();
        let select_binaries = build_select_binaries(class, &table_name);
        let insert = build_insert(class, &table_name);
        let (populate, hydrate) = if class.is_element {
            (
                Some(build_populate(class, &table_name)),
                Some(build_hydrate(class, &table_name)),
            )
        } else {
            (None, None)
        };
        Self {
            table_name,
            select_binaries,
            populate,
            hydrate,
            insert,
        }
    }
}

/// Reads from `source.[table]`, never `main.[table]` -- `selectBinaries` is
/// always run against the row that hasn't been cloned yet (spec §4.3 item 1
/// feeds both the P1 populate binaries and the P2 hydrate's GeometryStream).
fn build_select_binaries(class: &ClassDescriptor, table_name: &str) -> String {
    let cols: Vec<String> = class
        .binary_properties()
        .map(|p| format!("[{}]", p.name))
        .collect();
    if cols.is_empty() {
        format!("SELECT NULL FROM [source].[{table_name}] WHERE ECInstanceId = ?1 LIMIT 0")
    } else {
        format!(
            "SELECT {} FROM [source].[{table_name}] WHERE ECInstanceId = ?1",
            cols.join(", ")
        )
    }
}

/// Populate-phase placeholder for a reference column: `0x1` when the
/// column's foreign key forbids null, `NULL` when it permits it (spec §9
/// "Placeholder 0x1 in P1").
fn populate_placeholder(nullable: bool) -> &'static str {
    if nullable {
        "NULL"
    } else {
        "0x1"
    }
}

fn build_populate(class: &ClassDescriptor, table_name: &str) -> String {
    let mut columns = vec!["ECInstanceId".to_owned()];
    let mut values = vec![":id".to_owned()];

    for prop in &class.properties {
        match prop.kind {
            PropertyKind::Navigation => {
                columns.push(format!("[{}.Id]", prop.name));
                columns.push(format!("[{}.RelECClassId]", prop.name));
                let placeholder = populate_placeholder(prop.nullable_placeholder);
                values.push(placeholder.to_owned());
                values.push(placeholder.to_owned());
            },
            PropertyKind::IdLong => {
                columns.push(format!("[{}]", prop.name));
                values.push(populate_placeholder(prop.nullable_placeholder).to_owned());
            },
            PropertyKind::Point2d => {
                columns.push(format!("[{}.x]", prop.name));
                columns.push(format!("[{}.y]", prop.name));
                values.push(bind_name("n", &format!("{}_x", prop.name)));
                values.push(bind_name("n", &format!("{}_y", prop.name)));
            },
            PropertyKind::Point3d => {
                columns.push(format!("[{}.x]", prop.name));
                columns.push(format!("[{}.y]", prop.name));
                columns.push(format!("[{}.z]", prop.name));
                values.push(bind_name("n", &format!("{}_x", prop.name)));
                values.push(bind_name("n", &format!("{}_y", prop.name)));
                values.push(bind_name("n", &format!("{}_z", prop.name)));
            },
            PropertyKind::Binary | PropertyKind::GeometryStream => {
                columns.push(format!("[{}]", prop.name));
                values.push(bind_name("p", &prop.name));
            },
            PropertyKind::Primitive => {
                columns.push(format!("[{}]", prop.name));
                values.push(bind_name("b", &prop.name));
            },
            PropertyKind::Unsupported => {
                // Arrays/structs/struct-arrays are skipped silently at plan
                // time; the Cloner logs the warning once per property name
                // the first time it sees one (spec §4.3, §9 open question
                // (iii)).
            },
        }
    }

    format!(
        "INSERT INTO [{table_name}] ({}) VALUES ({})",
        columns.join(", "),
        values.join(", ")
    )
}

fn build_hydrate(class: &ClassDescriptor, table_name: &str) -> String {
    let mut assignments = Vec::new();
    for prop in &class.properties {
        match prop.kind {
            PropertyKind::Navigation => {
                let ref_kind = prop
                    .ref_kind
                    .expect("navigation property must have a ref_kind (RefTypeCache-resolved)");
                let temp_table = temp_table_for(ref_kind);
                assignments.push(format!(
                    "[{}.Id] = {}",
                    prop.name,
                    remap_expr(temp_table, &bind_name("n", &format!("{}_id", prop.name)))
                ));
                assignments.push(format!(
                    "[{}.RelECClassId] = {}",
                    prop.name,
                    class_id_subquery(&bind_name("n", &format!("{}_relclassid", prop.name)))
                ));
            },
            PropertyKind::IdLong => {
                let ref_kind = prop
                    .ref_kind
                    .expect("id-typed long property must have a ref_kind");
                let temp_table = temp_table_for(ref_kind);
                assignments.push(format!(
                    "[{}] = {}",
                    prop.name,
                    remap_expr(temp_table, &bind_name("b", &prop.name))
                ));
            },
            _ => {},
        }
    }
    assignments.push("CodeValue = JSON_EXTRACT(:json, '$.CodeValue')".to_owned());

    format!(
        "UPDATE [{table_name}] SET {} WHERE ECInstanceId = {}",
        assignments.join(", "),
        remap_expr("temp.element_remap", ":src_id")
    )
}

fn build_insert(class: &ClassDescriptor, table_name: &str) -> String {
    let mut columns = vec!["ECInstanceId".to_owned(), "ECClassId".to_owned()];
    let mut values = vec![
        remap_expr("temp.element_remap", ":src_id"),
        class_id_subquery(":src_class_id"),
    ];

    for prop in &class.properties {
        match prop.kind {
            PropertyKind::Navigation => {
                let ref_kind = prop
                    .ref_kind
                    .expect("navigation property must have a ref_kind (RefTypeCache-resolved)");
                let temp_table = temp_table_for(ref_kind);
                columns.push(format!("[{}.Id]", prop.name));
                values.push(remap_expr(temp_table, &bind_name("n", &format!("{}_id", prop.name))));
                columns.push(format!("[{}.RelECClassId]", prop.name));
                values.push(class_id_subquery(&bind_name("n", &format!("{}_relclassid", prop.name))));
            },
            PropertyKind::IdLong => {
                let ref_kind = prop.ref_kind.expect("id-typed long property must have a ref_kind");
                let temp_table = temp_table_for(ref_kind);
                columns.push(format!("[{}]", prop.name));
                values.push(remap_expr(temp_table, &bind_name("b", &prop.name)));
            },
            PropertyKind::Point2d => {
                columns.push(format!("[{}.x]", prop.name));
                columns.push(format!("[{}.y]", prop.name));
                values.push(bind_name("n", &format!("{}_x", prop.name)));
                values.push(bind_name("n", &format!("{}_y", prop.name)));
            },
            PropertyKind::Point3d => {
                columns.push(format!("[{}.x]", prop.name));
                columns.push(format!("[{}.y]", prop.name));
                columns.push(format!("[{}.z]", prop.name));
                values.push(bind_name("n", &format!("{}_x", prop.name)));
                values.push(bind_name("n", &format!("{}_y", prop.name)));
                values.push(bind_name("n", &format!("{}_z", prop.name)));
            },
            PropertyKind::GeometryStream => {
                columns.push(format!("[{}]", prop.name));
                values.push(format!(
                    "CAST(RemapGeom({}, 'temp.font_remap', 'temp.element_remap') AS BINARY)",
                    bind_name("p", &prop.name)
                ));
            },
            PropertyKind::Binary => {
                columns.push(format!("[{}]", prop.name));
                values.push(bind_name("p", &prop.name));
            },
            PropertyKind::Primitive => {
                columns.push(format!("[{}]", prop.name));
                values.push(bind_name("b", &prop.name));
            },
            PropertyKind::Unsupported => {},
        }
    }

    format!(
        "INSERT INTO [{table_name}] ({}) VALUES ({})",
        columns.join(", "),
        values.join(", ")
    )
}
