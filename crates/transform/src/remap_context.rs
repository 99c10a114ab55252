//! `RemapContext` (C4): owns the four id remap tables plus the codespec- and
//! class-rename rules, and resolves `findTarget*Id` / `findTargetEntityId`.

use std::collections::BTreeMap;

use rusqlite::Connection;
use tracing::warn;

use crate::{
    error::{
        wrap_statement_error,
        TransformError,
    },
    ids::{
        EntityKind,
        EntityRef,
        Id,
    },
    remap_table::CompactRemapTable,
};

/// The endpoint-kind classification for one side of a relationship, read
/// from the source's link table (spec §4.4's CASE expression over the
/// endpoint's class-id). Named the way [`crate::schema::ClassName::table_name`]
/// lowers `BisCore:ElementRefersToElements`, for consistency with the table
/// names [`crate::class_plan`] generates.
const REFERS_TO_ELEMENTS: &str = "BisCore_ElementRefersToElements";

#[derive(Clone, Copy, Debug)]
struct RelationshipEndpoints {
    source_kind: EntityKind,
    source_id: Id,
    target_kind: EntityKind,
    target_id: Id,
}

#[derive(Default)]
pub struct RemapContext {
    pub element: CompactRemapTable,
    pub aspect: CompactRemapTable,
    pub codespec: CompactRemapTable,
    pub font: CompactRemapTable,
    /// `codespec name -> (sourceId, targetId)`, populated during codespec
    /// import (spec §4.6 step 3) so duplicate-name codespecs reuse the
    /// target's existing row instead of inserting a second one.
    codespec_by_name: BTreeMap<String, (Id, Id)>,
    /// `sourceClass -> targetClass`, an optional rename rule consulted by
    /// the class-id subquery in `insert`/`hydrate` statements.
    class_rename: BTreeMap<String, String>,
}

impl RemapContext {
    pub fn new() -> Self {
        let mut ctx = Self::default();
        // Identity remaps for invalid and the reserved root entities (spec
        // §3 invariants, §4.6 step 1).
        ctx.element.seed_identity(Id::INVALID);
        for id in Id::RESERVED {
            ctx.element.seed_identity(id);
        }
        ctx.aspect.seed_identity(Id::INVALID);
        ctx.codespec.seed_identity(Id::INVALID);
        ctx.font.seed_identity(Id::INVALID);
        ctx
    }

    /// Seed the element table with identity for every id in `source_ids`.
    /// Used when `wasSourceIModelCopiedToTarget` is set (spec §6).
    pub fn seed_identity_for_master_branch(&mut self, source_ids: impl IntoIterator<Item = Id>) {
        for id in source_ids {
            self.element.seed_identity(id);
        }
    }

    pub fn record_codespec_by_name(&mut self, name: String, source_id: Id, target_id: Id) {
        self.codespec_by_name.insert(name, (source_id, target_id));
        self.codespec.remap(source_id, target_id);
    }

    /// Resolve a codespec by name, reusing an existing target row rather
    /// than inserting a duplicate (spec §7 `DuplicateCodeSpec`).
    pub fn codespec_target_by_name(&self, name: &str) -> Option<Id> {
        self.codespec_by_name.get(name).map(|(_, target)| *target)
    }

    pub fn record_class_rename(&mut self, source_class: String, target_class: String) {
        self.class_rename.insert(source_class, target_class);
    }

    pub fn rename_class(&self, source_class: &str) -> &str {
        self.class_rename
            .get(source_class)
            .map(String::as_str)
            .unwrap_or(source_class)
    }

    fn table_for(&self, kind: EntityKind) -> &CompactRemapTable {
        match kind {
            EntityKind::Element | EntityKind::Model => &self.element,
            EntityKind::Aspect => &self.aspect,
            EntityKind::CodeSpec => &self.codespec,
            EntityKind::Relationship => {
                unreachable!("relationships have no flat remap table; resolved recursively")
            },
        }
    }

    pub fn find_target_element_id(&self, source: Id) -> Option<Id> {
        self.element.get(source)
    }

    pub fn find_target_aspect_id(&self, source: Id) -> Option<Id> {
        self.aspect.get(source)
    }

    pub fn find_target_codespec_id(&self, source: Id) -> Option<Id> {
        self.codespec.get(source)
    }

    pub fn find_target_font_id(&self, source: Id) -> Option<Id> {
        self.font.get(source)
    }

    /// Resolve a polymorphic entity reference to its target id (spec
    /// §4.4). Models share ids with the element they submodel, so `Model`
    /// resolves through the element table. `Relationship` endpoints require
    /// a connection to the source's link table and are resolved
    /// recursively; other kinds are flat lookups.
    pub fn find_target_entity_id(
        &self,
        source_conn: &Connection,
        target_conn: &Connection,
        entity_ref: EntityRef,
    ) -> anyhow::Result<EntityRef> {
        match entity_ref {
            EntityRef::Element(id) => Ok(EntityRef::Element(
                self.table_for(EntityKind::Element).get(id).unwrap_or(Id::INVALID),
            )),
            EntityRef::Model(id) => Ok(EntityRef::Model(
                self.table_for(EntityKind::Element).get(id).unwrap_or(Id::INVALID),
            )),
            EntityRef::Aspect(id) => Ok(EntityRef::Aspect(
                self.table_for(EntityKind::Aspect).get(id).unwrap_or(Id::INVALID),
            )),
            EntityRef::CodeSpec(id) => Ok(EntityRef::CodeSpec(
                self.table_for(EntityKind::CodeSpec).get(id).unwrap_or(Id::INVALID),
            )),
            EntityRef::Relationship(id) => self.find_target_relationship_id(source_conn, target_conn, id),
        }
    }

    fn find_target_relationship_id(
        &self,
        source_conn: &Connection,
        target_conn: &Connection,
        source_relationship_id: Id,
    ) -> anyhow::Result<EntityRef> {
        let endpoints = self.load_relationship_endpoints(source_conn, source_relationship_id)?;

        // A relationship endpoint that is itself this same relationship
        // would recurse forever; the host treats that fixed point as fatal
        // rather than looping (spec §4.4, §9 "Cyclic relationships").
        let points_at_self = (endpoints.source_kind == EntityKind::Relationship
            && endpoints.source_id == source_relationship_id)
            || (endpoints.target_kind == EntityKind::Relationship
                && endpoints.target_id == source_relationship_id);
        if points_at_self {
            return Err(anyhow::Error::new(TransformError::endpoint_self_reference(format!(
                "relationship {source_relationship_id:?} endpoint resolved to itself"
            ))));
        }

        let remapped_source =
            self.resolve_endpoint(source_conn, target_conn, endpoints.source_kind, endpoints.source_id)?;
        let remapped_target =
            self.resolve_endpoint(source_conn, target_conn, endpoints.target_kind, endpoints.target_id)?;

        let (Some(remapped_source), Some(remapped_target)) = (remapped_source, remapped_target) else {
            return Ok(EntityRef::Relationship(Id::INVALID));
        };

        let target_id = self
            .lookup_existing_target_relationship(target_conn, remapped_source, remapped_target)?
            .unwrap_or(Id::INVALID);
        Ok(EntityRef::Relationship(target_id))
    }

    /// `SELECT` the relationship's raw endpoints and their root-class kinds
    /// from the source's link table. Deliberately reads straight from the
    /// source row rather than recursing through other relationships, which
    /// is how cycles through relationships-of-relationships are avoided
    /// (spec §9).
    fn load_relationship_endpoints(
        &self,
        source_conn: &Connection,
        relationship_id: Id,
    ) -> anyhow::Result<RelationshipEndpoints> {
        let sql = format!(
            r#"
SELECT
    CASE
        WHEN se.ECClassId IS NOT NULL THEN 'e'
        WHEN sm.ECClassId IS NOT NULL THEN 'm'
        WHEN sa.ECClassId IS NOT NULL THEN 'a'
        WHEN sc.Id IS NOT NULL THEN 'c'
        WHEN sr.ECInstanceId IS NOT NULL THEN 'r'
        ELSE NULL
    END AS source_kind,
    r.SourceECInstanceId,
    CASE
        WHEN te.ECClassId IS NOT NULL THEN 'e'
        WHEN tm.ECClassId IS NOT NULL THEN 'm'
        WHEN ta.ECClassId IS NOT NULL THEN 'a'
        WHEN tc.Id IS NOT NULL THEN 'c'
        WHEN tr.ECInstanceId IS NOT NULL THEN 'r'
        ELSE NULL
    END AS target_kind,
    r.TargetECInstanceId
FROM "{REFERS_TO_ELEMENTS}" r
LEFT JOIN bis_Element se ON se.ECInstanceId = r.SourceECInstanceId
LEFT JOIN bis_Model sm ON sm.ECInstanceId = r.SourceECInstanceId
LEFT JOIN bis_ElementAspect sa ON sa.ECInstanceId = r.SourceECInstanceId
LEFT JOIN bis_CodeSpec sc ON sc.Id = r.SourceECInstanceId
LEFT JOIN "{REFERS_TO_ELEMENTS}" sr ON sr.ECInstanceId = r.SourceECInstanceId
LEFT JOIN bis_Element te ON te.ECInstanceId = r.TargetECInstanceId
LEFT JOIN bis_Model tm ON tm.ECInstanceId = r.TargetECInstanceId
LEFT JOIN bis_ElementAspect ta ON ta.ECInstanceId = r.TargetECInstanceId
LEFT JOIN bis_CodeSpec tc ON tc.Id = r.TargetECInstanceId
LEFT JOIN "{REFERS_TO_ELEMENTS}" tr ON tr.ECInstanceId = r.TargetECInstanceId
WHERE r.ECInstanceId = ?1
"#
        );
        let mut stmt = source_conn
            .prepare_cached(&sql)
            .map_err(|e| wrap_statement_error(e, "load_relationship_endpoints"))?;
        let row = stmt
            .query_row([relationship_id], |row| {
                let source_kind: Option<String> = row.get(0)?;
                let source_id: Id = row.get(1)?;
                let target_kind: Option<String> = row.get(2)?;
                let target_id: Id = row.get(3)?;
                Ok((source_kind, source_id, target_kind, target_id))
            })
            .map_err(|e| wrap_statement_error(e, "load_relationship_endpoints"))?;

        let (source_kind, source_id, target_kind, target_id) = row;
        let source_kind = parse_endpoint_kind(source_kind.as_deref())?;
        let target_kind = parse_endpoint_kind(target_kind.as_deref())?;

        Ok(RelationshipEndpoints {
            source_kind,
            source_id,
            target_kind,
            target_id,
        })
    }

    fn resolve_endpoint(
        &self,
        source_conn: &Connection,
        target_conn: &Connection,
        kind: EntityKind,
        id: Id,
    ) -> anyhow::Result<Option<Id>> {
        let entity_ref = EntityRef::from_kind(kind, id);
        let resolved = self.find_target_entity_id(source_conn, target_conn, entity_ref)?;
        Ok(if resolved.id().is_valid() {
            Some(resolved.id())
        } else {
            warn!(?entity_ref, "relationship endpoint did not resolve to a target entity");
            None
        })
    }

    /// Once both endpoints are remapped, the target relationship row
    /// already exists (relationships are always inserted after both of
    /// their endpoint elements, per the pass ordering in spec §4.6) --
    /// find its id by the remapped `(sourceId, targetId)` pair.
    fn lookup_existing_target_relationship(
        &self,
        target_conn: &Connection,
        target_source_id: Id,
        target_target_id: Id,
    ) -> anyhow::Result<Option<Id>> {
        let sql = format!(
            r#"SELECT ECInstanceId FROM "{REFERS_TO_ELEMENTS}" WHERE SourceECInstanceId = ?1 AND TargetECInstanceId = ?2"#
        );
        let mut stmt = target_conn
            .prepare_cached(&sql)
            .map_err(|e| wrap_statement_error(e, "lookup_existing_target_relationship"))?;
        let found = stmt
            .query_row([target_source_id, target_target_id], |row| row.get::<_, Id>(0))
            .ok();
        Ok(found)
    }
}

fn parse_endpoint_kind(tag: Option<&str>) -> anyhow::Result<EntityKind> {
    match tag {
        Some("e") => Ok(EntityKind::Element),
        Some("m") => Ok(EntityKind::Model),
        Some("a") => Ok(EntityKind::Aspect),
        Some("c") => Ok(EntityKind::CodeSpec),
        Some("r") => Ok(EntityKind::Relationship),
        other => Err(anyhow::Error::new(TransformError::unknown_root_class(format!(
            "relationship endpoint resolved to an unrecognized root class tag: {other:?}"
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ids_remap_to_themselves() {
        let ctx = RemapContext::new();
        assert_eq!(ctx.find_target_element_id(Id::INVALID), Some(Id::INVALID));
        for id in Id::RESERVED {
            assert_eq!(ctx.find_target_element_id(id), Some(id));
        }
    }

    #[test]
    fn codespec_by_name_reuses_existing_target() {
        let mut ctx = RemapContext::new();
        ctx.record_codespec_by_name("X".to_owned(), Id(0x100), Id(0x200));
        assert_eq!(ctx.codespec_target_by_name("X"), Some(Id(0x200)));
        assert_eq!(ctx.find_target_codespec_id(Id(0x100)), Some(Id(0x200)));
    }

    #[test]
    fn class_rename_defaults_to_identity() {
        let ctx = RemapContext::new();
        assert_eq!(ctx.rename_class("BisCore:Foo"), "BisCore:Foo");
    }

    #[test]
    fn parse_endpoint_kind_rejects_unknown_tag() {
        let err = parse_endpoint_kind(Some("z")).unwrap_err();
        let transform_err = TransformError::downcast(&err).unwrap();
        assert_eq!(transform_err.code, crate::error::TransformErrorCode::UnknownRootClass);
    }
}
