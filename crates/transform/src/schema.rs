//! Table-driven schema metadata.
//!
//! The host system reflects over schema metadata at clone time; a typed
//! implementation instead builds, once per class, a `ClassDescriptor` the
//! hot loop dispatches on (spec §9 "Runtime reflection over schemas").

use std::collections::BTreeMap;

use crate::ids::EntityKind;

/// `Schema:Class`, the fully qualified name of a concrete class.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ClassName {
    pub schema: String,
    pub class: String,
}

impl ClassName {
    pub fn new(schema: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            class: class.into(),
        }
    }

    pub fn qualified(&self) -> String {
        format!("{}:{}", self.schema, self.class)
    }

    /// Parse a `Schema:Class` string back into its parts. Panics if `s`
    /// doesn't contain exactly one `:`, since every qualified name this crate
    /// produces (`Self::qualified`) is well-formed by construction.
    pub fn from_qualified(s: &str) -> Self {
        let (schema, class) = s.split_once(':').expect("qualified class name must contain ':'");
        Self::new(schema, class)
    }

    /// The SQL table name a class lowers to. The host maps `Schema:Class` to
    /// a single table per concrete class.
    pub fn table_name(&self) -> String {
        format!("{}_{}", self.schema, self.class)
    }
}

/// The property kinds the core needs to lower into SQL (spec §3 "Class").
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PropertyKind {
    /// An ordinary scalar column, copied as-is.
    Primitive,
    /// An `Id`-typed long column, remapped through a `CompactRemapTable`.
    IdLong,
    /// A navigation property: two columns, `.Id` and `.RelECClassId`.
    Navigation,
    /// A 2D point, expanded to `.x, .y`.
    Point2d,
    /// A 3D point, expanded to `.x, .y, .z`.
    Point3d,
    /// An ordinary binary blob, bound from `selectBinaries`.
    Binary,
    /// The geometry stream: a binary blob whose embedded ids are rewritten
    /// by the `RemapGeom` SQL function.
    GeometryStream,
    /// Array, struct, or struct-array: unsupported, skipped with a warning
    /// (spec §4.3, §9 open question (iii)).
    Unsupported,
}

impl PropertyKind {
    pub fn is_reference(&self) -> bool {
        matches!(self, PropertyKind::Navigation | PropertyKind::IdLong)
    }
}

#[derive(Clone, Debug)]
pub struct PropertyDescriptor {
    pub name: String,
    pub kind: PropertyKind,
    /// For `Navigation` and `IdLong` properties, the entity kind the
    /// reference resolves to. Populated from `RefTypeCache`; `None` for
    /// non-reference kinds.
    pub ref_kind: Option<EntityKind>,
    /// Whether a `NULL` value is permitted in place of a placeholder during
    /// the populate phase (spec §9 "Placeholder 0x1 in P1" — `Parent` and
    /// `TypeDefinition` permit null; most navigation columns do not).
    pub nullable_placeholder: bool,
}

impl PropertyDescriptor {
    pub fn primitive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Primitive,
            ref_kind: None,
            nullable_placeholder: false,
        }
    }

    pub fn navigation(name: impl Into<String>, ref_kind: EntityKind, nullable_placeholder: bool) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Navigation,
            ref_kind: Some(ref_kind),
            nullable_placeholder,
        }
    }

    pub fn id_long(name: impl Into<String>, ref_kind: EntityKind) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::IdLong,
            ref_kind: Some(ref_kind),
            nullable_placeholder: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClassDescriptor {
    pub name: ClassName,
    pub properties: Vec<PropertyDescriptor>,
    /// True for classes whose rows are Elements (participate in P1/P2);
    /// false for Aspect and Relationship classes (§4.6 steps 6-7).
    pub is_element: bool,
}

impl ClassDescriptor {
    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn binary_properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties
            .iter()
            .filter(|p| matches!(p.kind, PropertyKind::Binary | PropertyKind::GeometryStream))
    }
}

/// A schema catalog: every concrete class known to a database, keyed by
/// qualified name. Built once by reading the source's `ec_Schema`/`ec_Class`
/// tables (out of scope here — callers construct this from whatever schema
/// importer they use) and handed to [`crate::ref_type_cache::RefTypeCache`]
/// and [`crate::class_plan::ClassPlan`].
#[derive(Clone, Debug, Default)]
pub struct SchemaCatalog {
    classes: BTreeMap<ClassName, ClassDescriptor>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, class: ClassDescriptor) {
        self.classes.insert(class.name.clone(), class);
    }

    pub fn get(&self, name: &ClassName) -> Option<&ClassDescriptor> {
        self.classes.get(name)
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassDescriptor> {
        self.classes.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_name_and_table_name() {
        let name = ClassName::new("BisCore", "PhysicalElement");
        assert_eq!(name.qualified(), "BisCore:PhysicalElement");
        assert_eq!(name.table_name(), "BisCore_PhysicalElement");
    }

    #[test]
    fn catalog_round_trips_class() {
        let mut catalog = SchemaCatalog::new();
        let name = ClassName::new("BisCore", "PhysicalElement");
        catalog.insert(ClassDescriptor {
            name: name.clone(),
            properties: vec![PropertyDescriptor::primitive("CodeValue")],
            is_element: true,
        });
        assert!(catalog.get(&name).is_some());
        assert!(catalog.get(&ClassName::new("BisCore", "Nope")).is_none());
    }
}
