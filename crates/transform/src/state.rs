//! Persisting a [`RemapContext`]'s remap tables to a small SQLite state
//! file, so an interrupted transform can resume (spec §3 "Lifecycle", §6
//! "State file layout").
//!
//! Table layout and the `CREATE TABLE IF NOT EXISTS` + batched-insert idiom
//! follow `crates/sqlite`'s persistence init pattern (`DOCUMENTS_INIT`,
//! `PERSISTENCE_GLOBALS_INIT`).

use rusqlite::Connection;

use crate::{
    error::wrap_statement_error,
    ids::Id,
    remap_context::RemapContext,
    remap_table::CompactRemapTable,
};

const STATE_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS ElementIdRemaps (Source INTEGER NOT NULL, Target INTEGER NOT NULL, Length INTEGER NOT NULL);
CREATE TABLE IF NOT EXISTS AspectIdRemaps (Source INTEGER NOT NULL, Target INTEGER NOT NULL, Length INTEGER NOT NULL);
CREATE TABLE IF NOT EXISTS CodeSpecIdRemaps (Source INTEGER NOT NULL, Target INTEGER NOT NULL, Length INTEGER NOT NULL);
CREATE TABLE IF NOT EXISTS FontIdRemaps (Source INTEGER NOT NULL, Target INTEGER NOT NULL, Length INTEGER NOT NULL);
"#;

fn save_table(conn: &Connection, sql_table: &str, table: &CompactRemapTable) -> anyhow::Result<()> {
    conn.execute(&format!("DELETE FROM {sql_table}"), [])
        .map_err(|e| wrap_statement_error(e, "state: clear table"))?;
    let mut stmt = conn
        .prepare_cached(&format!("INSERT INTO {sql_table} (Source, Target, Length) VALUES (?1, ?2, ?3)"))
        .map_err(|e| wrap_statement_error(e, "state: prepare insert"))?;
    for run in table.runs() {
        stmt.execute(rusqlite::params![run.from as i64, run.to as i64, run.length as i64])
            .map_err(|e| wrap_statement_error(e, "state: insert run"))?;
    }
    Ok(())
}

fn load_table(conn: &Connection, sql_table: &str) -> anyhow::Result<CompactRemapTable> {
    let mut stmt = conn
        .prepare(&format!("SELECT Source, Target, Length FROM {sql_table} ORDER BY Source ASC"))
        .map_err(|e| wrap_statement_error(e, "state: prepare select"))?;
    let mut table = CompactRemapTable::new();
    let rows = stmt
        .query_map([], |row| {
            let source: i64 = row.get(0)?;
            let target: i64 = row.get(1)?;
            let length: i64 = row.get(2)?;
            Ok((source as u64, target as u64, length as u64))
        })
        .map_err(|e| wrap_statement_error(e, "state: query runs"))?;
    for row in rows {
        let (source, target, length) = row.map_err(|e| wrap_statement_error(e, "state: read run"))?;
        for offset in 0..length {
            table.remap(Id(source + offset), Id(target + offset));
        }
    }
    Ok(table)
}

/// Write all four remap tables into `conn` (expected to be a dedicated
/// state-file connection, not the source or target database).
pub fn save_state(conn: &Connection, context: &RemapContext) -> anyhow::Result<()> {
    conn.execute_batch(STATE_INIT)
        .map_err(|e| wrap_statement_error(e, "state: init tables"))?;
    save_table(conn, "ElementIdRemaps", &context.element)?;
    save_table(conn, "AspectIdRemaps", &context.aspect)?;
    save_table(conn, "CodeSpecIdRemaps", &context.codespec)?;
    save_table(conn, "FontIdRemaps", &context.font)?;
    Ok(())
}

/// Read all four remap tables back from `conn` into a fresh
/// [`RemapContext`], re-applying the reserved identity seeds so a resumed
/// transform still satisfies the invariants from spec §3 even if the saved
/// state predates them (defensive against a state file from an older run).
pub fn load_state(conn: &Connection) -> anyhow::Result<RemapContext> {
    conn.execute_batch(STATE_INIT)
        .map_err(|e| wrap_statement_error(e, "state: init tables"))?;
    let mut context = RemapContext::new();
    context.element = load_table(conn, "ElementIdRemaps")?;
    context.aspect = load_table(conn, "AspectIdRemaps")?;
    context.codespec = load_table(conn, "CodeSpecIdRemaps")?;
    context.font = load_table(conn, "FontIdRemaps")?;
    for id in Id::RESERVED {
        if context.element.get(id).is_none() {
            context.element.seed_identity(id);
        }
    }
    if context.element.get(Id::INVALID).is_none() {
        context.element.seed_identity(Id::INVALID);
    }
    Ok(context)
}
