//! 64-bit identifiers and the polymorphic entity references built on them.

use std::fmt;

use serde::{
    Deserialize,
    Serialize,
};

/// A 64-bit identifier. `0` is reserved for "invalid"; a handful of other
/// small values name well-known root entities that must map identity-to-
/// identity across every transform.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(pub u64);

impl Id {
    pub const INVALID: Id = Id(0x0);
    /// The root subject element, present in every briefcase.
    pub const ROOT_SUBJECT: Id = Id(0x1);
    /// The dictionary model.
    pub const DICTIONARY_MODEL: Id = Id(0xe);
    /// The real-world model.
    pub const REAL_WORLD_MODEL: Id = Id(0x10);

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// The reserved ids that must always remap identity-to-identity
    /// (spec §3 invariants, §4.6 step 1).
    pub const RESERVED: [Id; 3] = [Id::ROOT_SUBJECT, Id::DICTIONARY_MODEL, Id::REAL_WORLD_MODEL];
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Id(value)
    }
}

/// Ids never exceed the briefcase-local 32-bit range (spec §7
/// `SequenceOverflow`), so the lossy `u64 -> i64` SQLite representation never
/// actually loses anything.
impl rusqlite::ToSql for Id {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::from(self.0 as i64))
    }
}

impl rusqlite::types::FromSql for Id {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        i64::column_result(value).map(|v| Id(v as u64))
    }
}

/// The entity kind a navigation property's value refers to. Determined by
/// schema metadata (`RefTypeCache`), never by inspecting the id's value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum EntityKind {
    Element,
    Model,
    Aspect,
    Relationship,
    CodeSpec,
}

impl EntityKind {
    /// Single-letter tag used in the CASE expression that classifies a
    /// relationship endpoint's root class (spec §4.4).
    pub fn endpoint_tag(self) -> char {
        match self {
            EntityKind::Element => 'e',
            EntityKind::Model => 'm',
            EntityKind::Aspect => 'a',
            EntityKind::Relationship => 'r',
            EntityKind::CodeSpec => 'c',
        }
    }
}

/// A polymorphic reference to an entity: its kind plus its id in whichever
/// database the reference was read from. Used in place of the source
/// system's prefix-stringified ids (spec §9).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum EntityRef {
    Element(Id),
    Model(Id),
    Aspect(Id),
    Relationship(Id),
    CodeSpec(Id),
}

impl EntityRef {
    pub fn kind(self) -> EntityKind {
        match self {
            EntityRef::Element(_) => EntityKind::Element,
            EntityRef::Model(_) => EntityKind::Model,
            EntityRef::Aspect(_) => EntityKind::Aspect,
            EntityRef::Relationship(_) => EntityKind::Relationship,
            EntityRef::CodeSpec(_) => EntityKind::CodeSpec,
        }
    }

    pub fn id(self) -> Id {
        match self {
            EntityRef::Element(id)
            | EntityRef::Model(id)
            | EntityRef::Aspect(id)
            | EntityRef::Relationship(id)
            | EntityRef::CodeSpec(id) => id,
        }
    }

    pub fn with_id(self, id: Id) -> EntityRef {
        match self {
            EntityRef::Element(_) => EntityRef::Element(id),
            EntityRef::Model(_) => EntityRef::Model(id),
            EntityRef::Aspect(_) => EntityRef::Aspect(id),
            EntityRef::Relationship(_) => EntityRef::Relationship(id),
            EntityRef::CodeSpec(_) => EntityRef::CodeSpec(id),
        }
    }

    pub fn from_kind(kind: EntityKind, id: Id) -> EntityRef {
        match kind {
            EntityKind::Element => EntityRef::Element(id),
            EntityKind::Model => EntityRef::Model(id),
            EntityKind::Aspect => EntityRef::Aspect(id),
            EntityKind::Relationship => EntityRef::Relationship(id),
            EntityKind::CodeSpec => EntityRef::CodeSpec(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ids_are_valid() {
        for id in Id::RESERVED {
            assert!(id.is_valid());
        }
        assert!(!Id::INVALID.is_valid());
    }

    #[test]
    fn entity_ref_round_trips_kind_and_id() {
        let r = EntityRef::Aspect(Id(42));
        assert_eq!(r.kind(), EntityKind::Aspect);
        assert_eq!(r.id(), Id(42));
        assert_eq!(r.with_id(Id(7)), EntityRef::Aspect(Id(7)));
        assert_eq!(EntityRef::from_kind(EntityKind::Model, Id(7)), EntityRef::Model(Id(7)));
    }
}
