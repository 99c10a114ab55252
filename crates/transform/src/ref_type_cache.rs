//! `RefTypeCache` (C1): for every `(schema, class, property)` that is a
//! navigation property, memoizes which entity kind it points to.
//!
//! Built once by walking every schema of the source and never mutated
//! afterward — the same eagerly-built, immutable lookup-table shape as the
//! host's table-name cache (`value::table_mapping`). A miss is a programming
//! error: without this cache the core cannot tell whether a raw id like
//! `0x200000001` names an Element or an Aspect, so it cannot even pick the
//! right remap table (spec §4.1).

use std::collections::BTreeMap;

use crate::{
    error::TransformError,
    ids::EntityKind,
    schema::{
        ClassName,
        SchemaCatalog,
    },
};

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
struct Key {
    class: ClassName,
    property: String,
}

#[derive(Clone, Debug, Default)]
pub struct RefTypeCache {
    entries: BTreeMap<Key, EntityKind>,
}

impl RefTypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the cache by iterating every class's navigation properties in
    /// `catalog`. Called once, at transform initialization (spec §4.6 step
    /// 1).
    pub fn build(catalog: &SchemaCatalog) -> Self {
        let mut entries = BTreeMap::new();
        for class in catalog.classes() {
            for property in &class.properties {
                if property.kind.is_reference() {
                    if let Some(ref_kind) = property.ref_kind {
                        entries.insert(
                            Key {
                                class: class.name.clone(),
                                property: property.name.clone(),
                            },
                            ref_kind,
                        );
                    }
                }
            }
        }
        Self { entries }
    }

    /// Look up the entity kind a navigation property resolves to. A miss is
    /// fatal: `SchemaMissing` (spec §4.1, §7).
    pub fn lookup(&self, class: &ClassName, property: &str) -> anyhow::Result<EntityKind> {
        self.entries
            .get(&Key {
                class: class.clone(),
                property: property.to_owned(),
            })
            .copied()
            .ok_or_else(|| {
                anyhow::Error::new(TransformError::schema_missing(format!(
                    "no RefTypeCache entry for {}.{property}",
                    class.qualified()
                )))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        ClassDescriptor,
        PropertyDescriptor,
    };

    fn catalog() -> SchemaCatalog {
        let mut catalog = SchemaCatalog::new();
        let name = ClassName::new("BisCore", "PhysicalElement");
        catalog.insert(ClassDescriptor {
            name: name.clone(),
            properties: vec![
                PropertyDescriptor::navigation("Parent", EntityKind::Element, true),
                PropertyDescriptor::primitive("CodeValue"),
            ],
            is_element: true,
        });
        catalog
    }

    #[test]
    fn lookup_finds_navigation_property() {
        let cache = RefTypeCache::build(&catalog());
        let name = ClassName::new("BisCore", "PhysicalElement");
        assert_eq!(cache.lookup(&name, "Parent").unwrap(), EntityKind::Element);
    }

    #[test]
    fn lookup_missing_property_is_fatal() {
        let cache = RefTypeCache::build(&catalog());
        let name = ClassName::new("BisCore", "PhysicalElement");
        let err = cache.lookup(&name, "CodeValue").unwrap_err();
        let transform_err = TransformError::downcast(&err).unwrap();
        assert_eq!(transform_err.code, crate::error::TransformErrorCode::SchemaMissing);
    }
}
