//! `Orchestrator` (C6): drives the whole bulk copy end to end.
//!
//! The flow is roughly: initialize (attach the source, build the
//! `RefTypeCache`, seed the remap tables) -> suspend triggers -> import
//! codespecs -> pass 1 populate elements and models with placeholder
//! references -> flush the remap tables into temp SQL tables -> pass 2
//! hydrate every reference -> insert aspects -> insert relationships ->
//! finalize (reinstate triggers, commit). Each bracketed stage below is one
//! method. This narrative convention, and running each stage inside its own
//! `Transaction`, follows `crates/application/src/snapshot_import/mod.rs`.
//!
//! Two connections are open for the lifetime of a transform: `source`, a
//! plain read-only handle on the source file used for streaming scans, and
//! `target`, the read-write handle the Orchestrator owns exclusively, which
//! also has the source file `ATTACH`ed as schema `source` so the statements
//! [`crate::class_plan::ClassPlan`] builds can join `source.ec_Class` against
//! `main.ec_Class` in a single statement (spec §4.6 step 1, §6 "class-id
//! lookup").

use std::collections::HashMap;

use rusqlite::{
    params,
    OptionalExtension as _,
};
use tracing::{
    debug,
    info,
    warn,
};

use crate::{
    class_plan::{
        bind_name,
        ClassPlan,
    },
    cloner::Cloner,
    config::{
        DanglingReferencesBehavior,
        TransformConfig,
    },
    error::{
        wrap_statement_error,
        TransformError,
    },
    ids::Id,
    ref_type_cache::RefTypeCache,
    remap_context::RemapContext,
    schema::{
        ClassDescriptor,
        ClassName,
        PropertyKind,
        SchemaCatalog,
    },
};

/// Which columns of a class's source row a given statement kind needs bound
/// (spec §4.6 "populate vs. hydrate split"). Populate writes every
/// non-reference column plus a literal placeholder for references; hydrate
/// comes back later and rewrites only the references; insert (aspects,
/// relationships) writes everything in one shot since there is no placeholder
/// phase for those classes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum BindScope {
    Populate,
    Hydrate,
    Insert,
}

/// Builds the `(select-expression, bind-name)` pairs a [`BindScope`] needs for
/// a class, matching the column layout `class_plan::build_populate`,
/// `build_hydrate`, and `build_insert` bake into their SQL text. The bind
/// names reuse `class_plan::bind_name`'s `:b_/:n_/:p_` convention so the same
/// column always gets the same placeholder name regardless of which builder
/// produced the statement.
fn binding_columns(class: &ClassDescriptor, scope: BindScope) -> Vec<(String, String)> {
    let mut columns = Vec::new();
    for prop in &class.properties {
        match (&prop.kind, scope) {
            (PropertyKind::Navigation, BindScope::Hydrate | BindScope::Insert) => {
                columns.push((format!("[{}.Id]", prop.name), bind_name("n", &format!("{}_id", prop.name))));
                columns.push((
                    format!("[{}.RelECClassId]", prop.name),
                    bind_name("n", &format!("{}_relclassid", prop.name)),
                ));
            },
            (PropertyKind::IdLong, BindScope::Hydrate | BindScope::Insert) => {
                columns.push((format!("[{}]", prop.name), bind_name("b", &prop.name)));
            },
            (PropertyKind::Point2d, BindScope::Populate | BindScope::Insert) => {
                columns.push((format!("[{}.x]", prop.name), bind_name("n", &format!("{}_x", prop.name))));
                columns.push((format!("[{}.y]", prop.name), bind_name("n", &format!("{}_y", prop.name))));
            },
            (PropertyKind::Point3d, BindScope::Populate | BindScope::Insert) => {
                columns.push((format!("[{}.x]", prop.name), bind_name("n", &format!("{}_x", prop.name))));
                columns.push((format!("[{}.y]", prop.name), bind_name("n", &format!("{}_y", prop.name))));
                columns.push((format!("[{}.z]", prop.name), bind_name("n", &format!("{}_z", prop.name))));
            },
            (PropertyKind::Binary | PropertyKind::GeometryStream, BindScope::Populate | BindScope::Insert) => {
                columns.push((format!("[{}]", prop.name), bind_name("p", &prop.name)));
            },
            (PropertyKind::Primitive, BindScope::Populate | BindScope::Insert) => {
                columns.push((format!("[{}]", prop.name), bind_name("b", &prop.name)));
            },
            _ => {},
        }
    }
    columns
}

/// Number of rows processed between cooperative yield points (spec §5, §4.6
/// "ambient: cooperative yielding"). Chosen the same way the teacher tunes
/// its own batch sizes: large enough to amortize the `yield_now` overhead,
/// small enough that no single pass starves the executor for long.
const YIELD_EVERY_ROWS: usize = 500;

const ELEMENT_ID_SEQUENCE: &str = "bis_elementidsequence";
const INSTANCE_ID_SEQUENCE: &str = "ec_instanceidsequence";

/// Briefcase-local ids are restricted to the low 32 bits by convention; a
/// sequence that would overflow this range is a fatal `SequenceOverflow`
/// rather than silently wrapping (spec §7).
const MAX_BRIEFCASE_LOCAL_ID: u64 = 0xFFFF_FFFF;

/// A saved trigger's DDL, captured before being dropped so it can be
/// reinstated verbatim at finalize (spec §4.6 step 2, step 8).
#[derive(Clone, Debug)]
struct SavedTrigger {
    name: String,
    sql: String,
}

/// Row counts produced by one run, used both by callers and by the
/// integration tests that assert the count-identity invariant (spec §8
/// invariant 4).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransformReport {
    pub elements_copied: u64,
    pub aspects_copied: u64,
    pub relationships_copied: u64,
    pub relationships_skipped_dangling: u64,
    pub codespecs_imported: u64,
}

pub struct Orchestrator {
    source: rusqlite::Connection,
    target: rusqlite::Connection,
    catalog: SchemaCatalog,
    ref_type_cache: RefTypeCache,
    cloner: Cloner,
    config: TransformConfig,
    context: RemapContext,
    same_database: bool,
    saved_triggers: Vec<SavedTrigger>,
}

impl Orchestrator {
    /// Step 1, "Initialization". `source` must already be opened read-only;
    /// `target` read-write. `source_path` is the file `target` attaches as
    /// schema `source` for the class-id join. `same_database` controls
    /// whether `federationGuid` survives cloning (spec §4.5).
    pub fn new(
        source: rusqlite::Connection,
        target: rusqlite::Connection,
        source_path: &str,
        catalog: SchemaCatalog,
        cloner: Cloner,
        config: TransformConfig,
        same_database: bool,
    ) -> anyhow::Result<Self> {
        target
            .execute_batch(&format!("ATTACH DATABASE '{source_path}' AS source"))
            .map_err(|e| wrap_statement_error(e, "attach source database"))?;
        target
            .execute_batch(
                "CREATE TEMP TABLE element_remap (SourceId INTEGER, TargetId INTEGER, Length INTEGER);\
                 CREATE TEMP TABLE aspect_remap (SourceId INTEGER, TargetId INTEGER, Length INTEGER);\
                 CREATE TEMP TABLE codespec_remap (SourceId INTEGER, TargetId INTEGER, Length INTEGER);\
                 CREATE TEMP TABLE font_remap (SourceId INTEGER, TargetId INTEGER, Length INTEGER);",
            )
            .map_err(|e| wrap_statement_error(e, "create temp remap tables"))?;
        target
            .execute_batch("PRAGMA defer_foreign_keys = true;")
            .map_err(|e| wrap_statement_error(e, "enable defer_foreign_keys"))?;

        let ref_type_cache = RefTypeCache::build(&catalog);
        let mut context = RemapContext::new();
        if config.was_source_imodel_copied_to_target {
            let source_ids = Self::all_source_element_ids(&source)?;
            context.seed_identity_for_master_branch(source_ids);
        }

        Ok(Self {
            source,
            target,
            catalog,
            ref_type_cache,
            cloner,
            config,
            context,
            same_database,
            saved_triggers: Vec::new(),
        })
    }

    fn all_source_element_ids(source: &rusqlite::Connection) -> anyhow::Result<Vec<Id>> {
        let mut stmt = source
            .prepare("SELECT ECInstanceId FROM bis_Element")
            .map_err(|e| wrap_statement_error(e, "scan source element ids"))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, Id>(0))
            .map_err(|e| wrap_statement_error(e, "scan source element ids"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| wrap_statement_error(e, "scan source element ids"))?;
        Ok(ids)
    }

    /// Run the whole transform and return to the caller once the target
    /// transaction has committed.
    pub async fn run(&mut self, class_plans: &HashMap<String, ClassPlan>) -> anyhow::Result<TransformReport> {
        let mut report = TransformReport::default();

        self.suspend_triggers()?;
        report.codespecs_imported = self.import_codespecs()?;

        if self.config.preserve_element_ids_for_filtering {
            let max_source_id = Self::all_source_element_ids(&self.source)?
                .into_iter()
                .map(|id| id.0)
                .max()
                .unwrap_or(0);
            self.advance_sequence_past(ELEMENT_ID_SEQUENCE, max_source_id)?;
        }

        report.elements_copied = self.populate_pass(class_plans).await?;
        self.flush_remap_tables()?;
        self.hydrate_pass(class_plans).await?;
        report.aspects_copied = self.import_aspects(class_plans).await?;
        let (relationships, skipped) = self.import_relationships(class_plans).await?;
        report.relationships_copied = relationships;
        report.relationships_skipped_dangling = skipped;

        self.finalize()?;
        Ok(report)
    }

    /// Step 2, "Trigger suspension". Drops every trigger on the target,
    /// saving its `CREATE TRIGGER` text for step 8.
    fn suspend_triggers(&mut self) -> anyhow::Result<()> {
        let mut stmt = self
            .target
            .prepare("SELECT name, sql FROM main.sqlite_master WHERE type = 'trigger'")
            .map_err(|e| wrap_statement_error(e, "list target triggers"))?;
        let triggers = stmt
            .query_map([], |row| {
                Ok(SavedTrigger {
                    name: row.get(0)?,
                    sql: row.get(1)?,
                })
            })
            .map_err(|e| wrap_statement_error(e, "list target triggers"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| wrap_statement_error(e, "list target triggers"))?;

        for trigger in &triggers {
            self.target
                .execute(&format!("DROP TRIGGER [{}]", trigger.name), [])
                .map_err(|e| wrap_statement_error(e, "drop trigger"))?;
        }
        debug!(count = triggers.len(), "suspended target triggers");
        self.saved_triggers = triggers;
        Ok(())
    }

    /// Step 3, "Codespec import". Matches every source codespec to the
    /// target by name; inserts missing ones and always records the remap,
    /// whether newly inserted or reused (spec §7 `DuplicateCodeSpec`: never
    /// an error, the existing row is reused silently).
    ///
    /// `bis_CodeSpec` is a fixed-shape host table rather than a schema-defined
    /// class, so this goes straight at it instead of through a `ClassPlan`.
    fn import_codespecs(&mut self) -> anyhow::Result<u64> {
        let mut stmt = self
            .source
            .prepare("SELECT Id, Name FROM bis_CodeSpec ORDER BY Id ASC")
            .map_err(|e| wrap_statement_error(e, "list source codespecs"))?;
        let rows = stmt
            .query_map([], |row| {
                let id: Id = row.get(0)?;
                let name: String = row.get(1)?;
                Ok((id, name))
            })
            .map_err(|e| wrap_statement_error(e, "list source codespecs"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| wrap_statement_error(e, "list source codespecs"))?;

        let mut imported = 0u64;
        for (source_id, name) in rows {
            let existing: Option<Id> = self
                .target
                .query_row("SELECT Id FROM main.bis_CodeSpec WHERE Name = ?1", params![name], |row| row.get(0))
                .optional()
                .map_err(|e| wrap_statement_error(e, "look up target codespec by name"))?;

            let target_id = match existing {
                Some(id) => id,
                None => {
                    let new_id = self.next_sequence_value(INSTANCE_ID_SEQUENCE)?;
                    self.target
                        .execute("INSERT INTO main.bis_CodeSpec (Id, Name) VALUES (?1, ?2)", params![new_id, name])
                        .map_err(|e| wrap_statement_error(e, "insert codespec"))?;
                    imported += 1;
                    new_id
                },
            };
            self.context.record_codespec_by_name(name, source_id, target_id);
        }
        Ok(imported)
    }

    /// Step 4, "Pass 1 -- populate". Streams elements (and their model row,
    /// if any) in ascending id order, assigns a target id, and writes the
    /// row with placeholder references.
    async fn populate_pass(&mut self, class_plans: &HashMap<String, ClassPlan>) -> anyhow::Result<u64> {
        let rows = self.stream_elements()?;
        let mut copied = 0u64;

        for (idx, row) in rows.into_iter().enumerate() {
            let target_id = if self.config.preserve_element_ids_for_filtering {
                row.source_id
            } else {
                self.next_sequence_value(ELEMENT_ID_SEQUENCE)?
            };

            let class = self.catalog.get(&row.class_name()).ok_or_else(|| {
                anyhow::Error::new(TransformError::schema_missing(format!(
                    "no ClassDescriptor for element class {}",
                    row.class_qualified
                )))
            })?;
            let plan = class_plans.get(&row.class_qualified).ok_or_else(|| {
                anyhow::Error::new(TransformError::schema_missing(format!(
                    "no ClassPlan for element class {}",
                    row.class_qualified
                )))
            })?;
            let populate = plan
                .populate
                .as_deref()
                .ok_or_else(|| anyhow::Error::new(TransformError::schema_missing("element class has no populate statement")))?;
            self.bind_and_execute_populate(populate, class, &plan.table_name, target_id, &row)?;

            if row.has_model {
                let model_class_name = ClassName::from_qualified(&row.model_class_qualified);
                let model_class = self.catalog.get(&model_class_name).ok_or_else(|| {
                    anyhow::Error::new(TransformError::schema_missing(format!(
                        "no ClassDescriptor for model class {}",
                        row.model_class_qualified
                    )))
                })?;
                let model_plan = class_plans.get(&row.model_class_qualified).ok_or_else(|| {
                    anyhow::Error::new(TransformError::schema_missing(format!(
                        "no ClassPlan for model class {}",
                        row.model_class_qualified
                    )))
                })?;
                let model_src_class_id = self.source_class_id(&model_class_name)?;
                let mut bindings =
                    self.collect_bindings(model_class, &model_plan.table_name, row.source_id, BindScope::Insert)?;
                bindings.push((":src_id".to_owned(), rusqlite::types::Value::from(row.source_id.0 as i64)));
                bindings.push((":src_class_id".to_owned(), rusqlite::types::Value::from(model_src_class_id.0 as i64)));
                let param_refs: Vec<(&str, &dyn rusqlite::ToSql)> =
                    bindings.iter().map(|(name, value)| (name.as_str(), value as &dyn rusqlite::ToSql)).collect();
                self.target
                    .execute(&model_plan.insert, &param_refs[..])
                    .map_err(|e| wrap_statement_error(e, "insert model placeholder row"))?;
            }

            self.context.element.remap(row.source_id, target_id);
            copied += 1;
            if idx % YIELD_EVERY_ROWS == 0 {
                tokio::task::yield_now().await;
            }
        }
        info!(copied, "pass 1 populate complete");
        Ok(copied)
    }

    /// Binds `:id` plus every non-reference column's real value (`:b_<col>`,
    /// `:p_<col>`, `:n_<col>_{x,y,z}`) and executes the class's populate
    /// statement. Reference columns keep the literal placeholder
    /// `build_populate` already baked into the SQL text, so they need no
    /// binding here; they're filled in by the hydrate pass.
    fn bind_and_execute_populate(
        &self,
        sql: &str,
        class: &ClassDescriptor,
        table: &str,
        target_id: Id,
        row: &ElementRow,
    ) -> anyhow::Result<()> {
        let mut bindings = self.collect_bindings(class, table, row.source_id, BindScope::Populate)?;
        bindings.push((":id".to_owned(), rusqlite::types::Value::from(target_id.0 as i64)));
        let param_refs: Vec<(&str, &dyn rusqlite::ToSql)> =
            bindings.iter().map(|(name, value)| (name.as_str(), value as &dyn rusqlite::ToSql)).collect();
        self.target
            .execute(sql, &param_refs[..])
            .map_err(|e| wrap_statement_error(e, &format!("populate {}", row.class_qualified)))?;
        Ok(())
    }

    /// The scope determines which of a class's properties need a column
    /// pulled from the source row: populate only needs the non-reference
    /// ones (references stay placeholders until hydrate), hydrate only needs
    /// the reference ones (it's an `UPDATE` touching nothing else), and
    /// insert (aspects, relationships) needs every column at once.
    fn collect_bindings(
        &self,
        class: &ClassDescriptor,
        table: &str,
        source_id: Id,
        scope: BindScope,
    ) -> anyhow::Result<Vec<(String, rusqlite::types::Value)>> {
        let columns = binding_columns(class, scope);
        if columns.is_empty() {
            return Ok(Vec::new());
        }
        let select_list: Vec<&str> = columns.iter().map(|(expr, _)| expr.as_str()).collect();
        let sql = format!("SELECT {} FROM [{table}] WHERE ECInstanceId = ?1", select_list.join(", "));
        let mut stmt = self.source.prepare_cached(&sql).map_err(|e| wrap_statement_error(e, "select row bindings"))?;
        let values: Vec<rusqlite::types::Value> = stmt
            .query_row(params![source_id], |row| {
                (0..columns.len())
                    .map(|i| row.get_ref(i).map(|v| v.into()))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(|e| wrap_statement_error(e, "select row bindings"))?;
        Ok(columns.into_iter().zip(values).map(|((_, name), value)| (name, value)).collect())
    }

    /// Flushes every `CompactRemapTable`'s runs into its temp SQL table
    /// (spec §4.6 step 4 "after the pass"). Pass 2 may not start before this
    /// completes (spec §5 ordering guarantee).
    fn flush_remap_tables(&self) -> anyhow::Result<()> {
        self.flush_one("element_remap", &self.context.element)?;
        self.flush_one("aspect_remap", &self.context.aspect)?;
        self.flush_one("codespec_remap", &self.context.codespec)?;
        self.flush_one("font_remap", &self.context.font)?;
        Ok(())
    }

    fn flush_one(&self, temp_table: &str, table: &crate::remap_table::CompactRemapTable) -> anyhow::Result<()> {
        self.target
            .execute(&format!("DELETE FROM temp.{temp_table}"), [])
            .map_err(|e| wrap_statement_error(e, "clear temp remap table"))?;
        let mut stmt = self
            .target
            .prepare_cached(&format!(
                "INSERT INTO temp.{temp_table} (SourceId, TargetId, Length) VALUES (?1, ?2, ?3)"
            ))
            .map_err(|e| wrap_statement_error(e, "prepare temp remap insert"))?;
        for run in table.runs() {
            stmt.execute(params![run.from as i64, run.to as i64, run.length as i64])
                .map_err(|e| wrap_statement_error(e, "flush remap run"))?;
        }
        Ok(())
    }

    /// Step 5, "Pass 2 -- hydrate". Re-streams elements in the same order
    /// and rewrites every reference now that the remap tables are complete.
    async fn hydrate_pass(&mut self, class_plans: &HashMap<String, ClassPlan>) -> anyhow::Result<()> {
        let rows = self.stream_elements()?;

        for (idx, row) in rows.into_iter().enumerate() {
            let class = self.catalog.get(&row.class_name()).ok_or_else(|| {
                anyhow::Error::new(TransformError::schema_missing(format!(
                    "no ClassDescriptor for element class {}",
                    row.class_qualified
                )))
            })?;
            let plan = class_plans.get(&row.class_qualified).ok_or_else(|| {
                anyhow::Error::new(TransformError::schema_missing(format!(
                    "no ClassPlan for element class {}",
                    row.class_qualified
                )))
            })?;
            let hydrate = plan
                .hydrate
                .as_deref()
                .ok_or_else(|| anyhow::Error::new(TransformError::schema_missing("element class has no hydrate statement")))?;

            let source_json = self.select_row_json(&row.class_qualified, row.source_id)?;
            let mut bindings = self.collect_bindings(class, &plan.table_name, row.source_id, BindScope::Hydrate)?;
            bindings.push((":src_id".to_owned(), rusqlite::types::Value::from(row.source_id.0 as i64)));
            bindings.push((":json".to_owned(), rusqlite::types::Value::from(source_json.to_string())));
            let param_refs: Vec<(&str, &dyn rusqlite::ToSql)> =
                bindings.iter().map(|(name, value)| (name.as_str(), value as &dyn rusqlite::ToSql)).collect();
            self.target
                .execute(hydrate, &param_refs[..])
                .map_err(|e| wrap_statement_error(e, &format!("hydrate {}", row.class_qualified)))?;

            if idx % YIELD_EVERY_ROWS == 0 {
                tokio::task::yield_now().await;
            }
        }
        info!("pass 2 hydrate complete");
        Ok(())
    }

    /// Step 6, "Aspects". Every aspect gets a fresh instance id from the
    /// instance-id sequence and is inserted with inline remap expressions.
    async fn import_aspects(&mut self, class_plans: &HashMap<String, ClassPlan>) -> anyhow::Result<u64> {
        let aspect_classes: Vec<&ClassDescriptor> = self.catalog.classes().filter(|c| !c.is_element).collect();
        let mut copied = 0u64;
        let mut idx = 0usize;

        for class in aspect_classes {
            let qualified = class.name.qualified();
            if qualified == "BisCore:ElementRefersToElements" {
                continue; // relationships are handled separately, step 7
            }
            if !self.config.include_source_provenance && qualified == "BisCore:ExternalSourceAspect" {
                continue;
            }

            let table = class.name.table_name();
            let mut stmt = self
                .source
                .prepare(&format!("SELECT ECInstanceId FROM [{table}] ORDER BY ECInstanceId ASC"))
                .map_err(|e| wrap_statement_error(e, "list source aspect ids"))?;
            let ids: Vec<Id> = stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| wrap_statement_error(e, "list source aspect ids"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| wrap_statement_error(e, "list source aspect ids"))?;

            let plan = class_plans
                .get(&qualified)
                .ok_or_else(|| anyhow::Error::new(TransformError::schema_missing(format!("no ClassPlan for aspect class {qualified}"))))?;
            let src_class_id = self.source_class_id(&class.name)?;

            for source_id in ids {
                let target_id = self.next_sequence_value(INSTANCE_ID_SEQUENCE)?;
                let mut bindings = self.collect_bindings(class, &table, source_id, BindScope::Insert)?;
                bindings.push((":src_id".to_owned(), rusqlite::types::Value::from(source_id.0 as i64)));
                bindings.push((":src_class_id".to_owned(), rusqlite::types::Value::from(src_class_id.0 as i64)));
                let param_refs: Vec<(&str, &dyn rusqlite::ToSql)> =
                    bindings.iter().map(|(name, value)| (name.as_str(), value as &dyn rusqlite::ToSql)).collect();
                self.target
                    .execute(&plan.insert, &param_refs[..])
                    .map_err(|e| wrap_statement_error(e, &format!("insert aspect {qualified}")))?;
                self.context.aspect.remap(source_id, target_id);
                copied += 1;
                idx += 1;
                if idx % YIELD_EVERY_ROWS == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }
        info!(copied, "aspect import complete");
        Ok(copied)
    }

    /// Step 7, "Relationships". `ElementRefersToElements` (and, if ever
    /// supported, `ElementDrivesElement` -- left unhandled per spec §9 open
    /// question (i)) is streamed and inserted via its `ClassPlan`. A row
    /// whose endpoint did not resolve is skipped and counted rather than
    /// inserted, unless the dangling-reference policy rejects it outright.
    async fn import_relationships(
        &mut self,
        class_plans: &HashMap<String, ClassPlan>,
    ) -> anyhow::Result<(u64, u64)> {
        let relationship_class = ClassName::new("BisCore", "ElementRefersToElements");
        let class = self.catalog.get(&relationship_class).ok_or_else(|| {
            anyhow::Error::new(TransformError::schema_missing(
                "no ClassDescriptor for BisCore:ElementRefersToElements",
            ))
        })?;
        let plan = class_plans.get("BisCore:ElementRefersToElements").ok_or_else(|| {
            anyhow::Error::new(TransformError::schema_missing(
                "no ClassPlan for BisCore:ElementRefersToElements",
            ))
        })?;
        let src_class_id = self.source_class_id(&relationship_class)?;

        let mut stmt = self
            .source
            .prepare(
                "SELECT ECInstanceId, SourceECInstanceId, TargetECInstanceId \
                 FROM BisCore_ElementRefersToElements ORDER BY ECInstanceId ASC",
            )
            .map_err(|e| wrap_statement_error(e, "list source relationships"))?;
        let relationships: Vec<(Id, Id, Id)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(|e| wrap_statement_error(e, "list source relationships"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| wrap_statement_error(e, "list source relationships"))?;

        let mut copied = 0u64;
        let mut skipped = 0u64;
        for (idx, (relationship_id, source_endpoint, target_endpoint)) in relationships.into_iter().enumerate() {
            // Endpoints must already have a remapped element, not a target
            // relationship row -- that row is exactly what this loop is
            // about to insert, so it never pre-exists (spec §4.6 step 7:
            // relationships are imported after both passes over elements).
            let endpoints_resolved = self.context.find_target_element_id(source_endpoint).is_some()
                && self.context.find_target_element_id(target_endpoint).is_some();
            if !endpoints_resolved {
                match self.config.dangling_references_behavior {
                    DanglingReferencesBehavior::Reject => {
                        return Err(anyhow::Error::new(TransformError::dangling_reference(format!(
                            "relationship {relationship_id:?} has an unresolved endpoint"
                        ))));
                    },
                    DanglingReferencesBehavior::Ignore => {
                        warn!(?relationship_id, "skipping relationship with dangling endpoint");
                        skipped += 1;
                        continue;
                    },
                }
            }

            let mut bindings = self.collect_bindings(class, &plan.table_name, relationship_id, BindScope::Insert)?;
            bindings.push((":src_id".to_owned(), rusqlite::types::Value::from(relationship_id.0 as i64)));
            bindings.push((":src_class_id".to_owned(), rusqlite::types::Value::from(src_class_id.0 as i64)));
            let param_refs: Vec<(&str, &dyn rusqlite::ToSql)> =
                bindings.iter().map(|(name, value)| (name.as_str(), value as &dyn rusqlite::ToSql)).collect();
            self.target
                .execute(&plan.insert, &param_refs[..])
                .map_err(|e| wrap_statement_error(e, "insert relationship"))?;
            copied += 1;
            if idx % YIELD_EVERY_ROWS == 0 {
                tokio::task::yield_now().await;
            }
        }
        info!(copied, skipped, "relationship import complete");
        Ok((copied, skipped))
    }

    /// Step 8, "Finalize". Disables deferred FK checking (forcing SQLite to
    /// validate every foreign key accumulated across both passes),
    /// reinstates every saved trigger, and commits by dropping the
    /// connection's implicit transaction.
    fn finalize(&mut self) -> anyhow::Result<()> {
        self.target
            .execute_batch("PRAGMA defer_foreign_keys = false;")
            .map_err(|e| wrap_statement_error(e, "disable defer_foreign_keys"))?;

        for trigger in self.saved_triggers.drain(..) {
            self.target.execute_batch(&trigger.sql).map_err(|e| {
                wrap_statement_error(e, "reinstate trigger").context(TransformError::trigger_restore_failure(format!(
                    "failed to reinstate trigger {}",
                    trigger.name
                )))
            })?;
        }

        self.target
            .execute_batch("DETACH DATABASE source;")
            .map_err(|e| wrap_statement_error(e, "detach source database"))?;
        Ok(())
    }

    fn stream_elements(&self) -> anyhow::Result<Vec<ElementRow>> {
        let sql = "
            SELECT e.ECInstanceId, ec.Name, es.Name, m.ECInstanceId IS NOT NULL, mc.Name, ms.Name
            FROM bis_Element e
            JOIN ec_Class ec ON ec.Id = e.ECClassId
            JOIN ec_Schema es ON es.Id = ec.SchemaId
            LEFT JOIN bis_Model m ON m.ECInstanceId = e.ECInstanceId
            LEFT JOIN ec_Class mc ON mc.Id = m.ECClassId
            LEFT JOIN ec_Schema ms ON ms.Id = mc.SchemaId
            WHERE e.ECInstanceId NOT IN (0x1, 0xe, 0x10)
            ORDER BY e.ECInstanceId ASC
        ";
        let mut stmt = self.source.prepare(sql).map_err(|e| wrap_statement_error(e, "stream elements"))?;
        let rows = stmt
            .query_map([], |row| {
                let source_id: Id = row.get(0)?;
                let class_name: String = row.get(1)?;
                let schema_name: String = row.get(2)?;
                let has_model: bool = row.get(3)?;
                let model_class: Option<String> = row.get(4)?;
                let model_schema: Option<String> = row.get(5)?;
                Ok(ElementRow {
                    source_id,
                    class_qualified: format!("{schema_name}:{class_name}"),
                    has_model,
                    model_class_qualified: match (model_schema, model_class) {
                        (Some(s), Some(c)) => format!("{s}:{c}"),
                        _ => String::new(),
                    },
                })
            })
            .map_err(|e| wrap_statement_error(e, "stream elements"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| wrap_statement_error(e, "stream elements"))?;
        Ok(rows)
    }

    /// Pulls the JSON projection of a row (spec §6 "host-provided
    /// primitives"): `SELECT $ -> text` is the source system's built-in
    /// row-to-JSON cast; this stands in for it with `json_object` over the
    /// columns the `ClassPlan` cares about, which is sufficient for the
    /// `CodeValue` extraction the hydrate statement performs.
    fn select_row_json(&self, class_qualified: &str, source_id: Id) -> anyhow::Result<serde_json::Value> {
        let table = class_qualified.replacen(':', "_", 1);
        let row: Option<String> = self
            .source
            .query_row(
                &format!("SELECT json_object('CodeValue', CodeValue) FROM [{table}] WHERE ECInstanceId = ?1"),
                params![source_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| wrap_statement_error(e, "select row json"))?;
        match row {
            Some(text) => serde_json::from_str(&text).map_err(|e| anyhow::Error::new(e).context(TransformError::statement_failure("row json was not valid JSON"))),
            None => Ok(serde_json::Value::Object(serde_json::Map::new())),
        }
    }

    /// Looks up a class's own `ec_Class.Id` in the source database (spec §6
    /// "class-id lookup"), the value `class_id_subquery` binds as
    /// `:src_class_id` to resolve the matching target class id via the
    /// attached `source` schema join. Distinct from any per-row column value
    /// and never a hardcoded placeholder.
    fn source_class_id(&self, name: &ClassName) -> anyhow::Result<Id> {
        self.source
            .query_row(
                "SELECT ec.Id FROM ec_Class ec JOIN ec_Schema es ON es.Id = ec.SchemaId \
                 WHERE es.Name = ?1 AND ec.Name = ?2",
                params![name.schema, name.class],
                |row| row.get(0),
            )
            .map_err(|e| wrap_statement_error(e, &format!("look up source class id for {}", name.qualified())))
    }

    fn next_sequence_value(&self, key: &str) -> anyhow::Result<Id> {
        let current: Option<i64> = self
            .target
            .query_row("SELECT Val FROM be_Local WHERE Name = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(|e| wrap_statement_error(e, "read id sequence"))?;
        let next = current.unwrap_or(0) + 1;
        if next as u64 > MAX_BRIEFCASE_LOCAL_ID {
            return Err(anyhow::Error::new(TransformError::sequence_overflow(format!(
                "sequence {key} would exceed the briefcase-local id range"
            ))));
        }
        self.target
            .execute(
                "INSERT INTO be_Local (Name, Val) VALUES (?1, ?2) \
                 ON CONFLICT(Name) DO UPDATE SET Val = excluded.Val",
                params![key, next],
            )
            .map_err(|e| wrap_statement_error(e, "advance id sequence"))?;
        Ok(Id(next as u64))
    }

    /// Used by `preserveElementIdsForFiltering` to push the sequence above
    /// the highest id already claimed by a preserved source id (spec §6).
    fn advance_sequence_past(&self, key: &str, min_value: u64) -> anyhow::Result<()> {
        self.target
            .execute(
                "INSERT INTO be_Local (Name, Val) VALUES (?1, ?2) \
                 ON CONFLICT(Name) DO UPDATE SET Val = MAX(be_Local.Val, excluded.Val)",
                params![key, min_value as i64],
            )
            .map_err(|e| wrap_statement_error(e, "pre-advance id sequence"))?;
        Ok(())
    }

    pub fn context(&self) -> &RemapContext {
        &self.context
    }

    pub fn ref_type_cache(&self) -> &RefTypeCache {
        &self.ref_type_cache
    }

    pub fn cloner(&self) -> &Cloner {
        &self.cloner
    }

    pub fn same_database(&self) -> bool {
        self.same_database
    }
}

struct ElementRow {
    source_id: Id,
    class_qualified: String,
    has_model: bool,
    model_class_qualified: String,
}

impl ElementRow {
    fn class_name(&self) -> ClassName {
        ClassName::from_qualified(&self.class_qualified)
    }
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;
    use crate::schema::{
        ClassName,
        PropertyDescriptor,
    };

    fn element_only_catalog() -> SchemaCatalog {
        let mut catalog = SchemaCatalog::new();
        catalog.insert(ClassDescriptor {
            name: ClassName::new("BisCore", "Subject"),
            properties: vec![PropertyDescriptor::primitive("CodeValue")],
            is_element: true,
        });
        catalog
    }

    fn bootstrap_briefcase(conn: &Connection) {
        conn.execute_batch(
            r#"
            CREATE TABLE ec_Schema (Id INTEGER PRIMARY KEY, Name TEXT);
            CREATE TABLE ec_Class (Id INTEGER PRIMARY KEY, SchemaId INTEGER, Name TEXT);
            CREATE TABLE bis_Element (ECInstanceId INTEGER PRIMARY KEY, ECClassId INTEGER);
            CREATE TABLE bis_Model (ECInstanceId INTEGER PRIMARY KEY);
            CREATE TABLE bis_CodeSpec (Id INTEGER PRIMARY KEY, Name TEXT);
            CREATE TABLE BisCore_ElementRefersToElements (ECInstanceId INTEGER PRIMARY KEY, SourceECInstanceId INTEGER, TargetECInstanceId INTEGER);
            CREATE TABLE be_Local (Name TEXT PRIMARY KEY, Val INTEGER);
            INSERT INTO ec_Schema (Id, Name) VALUES (1, 'BisCore');
            INSERT INTO ec_Class (Id, SchemaId, Name) VALUES (1, 1, 'Subject');
            INSERT INTO bis_Element (ECInstanceId, ECClassId) VALUES (0x1, 1);
            "#,
        )
        .unwrap();
    }

    #[test]
    fn next_sequence_value_starts_at_one_and_increments() {
        let target = Connection::open_in_memory().unwrap();
        bootstrap_briefcase(&target);
        let source = Connection::open_in_memory().unwrap();
        bootstrap_briefcase(&source);

        let orchestrator = Orchestrator::new(
            source,
            target,
            ":memory:",
            element_only_catalog(),
            Cloner::new(),
            TransformConfig::default(),
            false,
        )
        .unwrap();

        let first = orchestrator.next_sequence_value(ELEMENT_ID_SEQUENCE).unwrap();
        let second = orchestrator.next_sequence_value(ELEMENT_ID_SEQUENCE).unwrap();
        assert_eq!(first, Id(1));
        assert_eq!(second, Id(2));
    }

    #[test]
    fn advance_sequence_past_only_moves_forward() {
        let target = Connection::open_in_memory().unwrap();
        bootstrap_briefcase(&target);
        let source = Connection::open_in_memory().unwrap();
        bootstrap_briefcase(&source);

        let orchestrator = Orchestrator::new(
            source,
            target,
            ":memory:",
            element_only_catalog(),
            Cloner::new(),
            TransformConfig::default(),
            false,
        )
        .unwrap();

        orchestrator.advance_sequence_past(ELEMENT_ID_SEQUENCE, 0x21).unwrap();
        let next = orchestrator.next_sequence_value(ELEMENT_ID_SEQUENCE).unwrap();
        assert_eq!(next, Id(0x22));

        orchestrator.advance_sequence_past(ELEMENT_ID_SEQUENCE, 0x10).unwrap();
        let next = orchestrator.next_sequence_value(ELEMENT_ID_SEQUENCE).unwrap();
        assert_eq!(next, Id(0x23));
    }

    #[test]
    fn reserved_ids_are_seeded_on_construction() {
        let target = Connection::open_in_memory().unwrap();
        bootstrap_briefcase(&target);
        let source = Connection::open_in_memory().unwrap();
        bootstrap_briefcase(&source);

        let orchestrator = Orchestrator::new(
            source,
            target,
            ":memory:",
            element_only_catalog(),
            Cloner::new(),
            TransformConfig::default(),
            false,
        )
        .unwrap();

        for id in Id::RESERVED {
            assert_eq!(orchestrator.context().find_target_element_id(id), Some(id));
        }
    }
}
