//! `Cloner` (C5): turns one source row's JSON projection + binary blobs
//! into bound values for the class's `ClassPlan` statement, consulting
//! [`RefTypeCache`] and [`RemapContext`] for every reference along the way
//! (spec §4.5).

use std::collections::{
    HashMap,
    HashSet,
};

use rusqlite::Connection;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::{
    code::Code,
    ids::{
        EntityRef,
        Id,
    },
    ref_type_cache::RefTypeCache,
    remap_context::RemapContext,
    schema::{
        ClassDescriptor,
        PropertyKind,
    },
};

/// A schema-specific fix-up invoked while cloning one property (spec §4.5
/// rule 1): `code.spec`, `code.scope`, `modelSelector`, `displayStyle`,
/// `categorySelector`, and `baseModel` are the host's built-in examples.
pub trait SpecialHandler: Send + Sync {
    /// Read the property's value out of the source row as an entity
    /// reference, if the property is present and non-null.
    fn get_source(&self, source_row: &JsonValue, property: &str) -> Option<EntityRef>;
    /// Write the resolved target reference back into the row being built.
    fn set_target(&self, target_row: &mut JsonValue, property: &str, resolved: EntityRef);
}

/// The per-class "onCloned" hook (spec §6): invoked before the hydrate
/// `UPDATE` is bound, letting schema-specific code fix up the target row.
pub trait OnClonedHook: Send + Sync {
    fn on_cloned(&self, source_row: &JsonValue, target_row: &mut JsonValue);
}

#[derive(Default)]
pub struct Cloner {
    special_handlers: HashMap<String, Box<dyn SpecialHandler>>,
    on_cloned_hooks: HashMap<String, Box<dyn OnClonedHook>>,
    warned_unsupported: parking_lot::Mutex<HashSet<(String, String)>>,
}

/// The outcome of cloning one row: a target-shaped JSON object plus the
/// binary blobs to bind separately (binaries never round-trip through
/// JSON).
pub struct ClonedRow {
    pub target_json: JsonValue,
    pub binaries: HashMap<String, Vec<u8>>,
}

impl Cloner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_special_handler(&mut self, property: impl Into<String>, handler: Box<dyn SpecialHandler>) {
        self.special_handlers.insert(property.into(), handler);
    }

    pub fn register_on_cloned(&mut self, class_qualified_name: impl Into<String>, hook: Box<dyn OnClonedHook>) {
        self.on_cloned_hooks.insert(class_qualified_name.into(), hook);
    }

    /// Clone one row. `source_json` is the row's JSON projection (spec §6);
    /// `binaries` come from the class's `select_binaries` statement;
    /// `same_database` is true only for intra-database transforms, used to
    /// decide whether `federationGuid` is restored verbatim (spec §4.5).
    pub fn clone_row(
        &self,
        source_conn: &Connection,
        target_conn: &Connection,
        ref_type_cache: &RefTypeCache,
        remap_context: &RemapContext,
        class: &ClassDescriptor,
        source_json: &JsonValue,
        binaries: HashMap<String, Vec<u8>>,
        same_database: bool,
    ) -> anyhow::Result<ClonedRow> {
        let mut target = JsonValue::Object(serde_json::Map::new());

        for prop in &class.properties {
            if let Some(handler) = self.special_handlers.get(&prop.name) {
                if let Some(source_ref) = handler.get_source(source_json, &prop.name) {
                    let resolved =
                        remap_context.find_target_entity_id(source_conn, target_conn, source_ref)?;
                    handler.set_target(&mut target, &prop.name, resolved);
                }
                continue;
            }

            match prop.kind {
                PropertyKind::Navigation => {
                    self.clone_navigation(source_conn, target_conn, ref_type_cache, remap_context, class, prop, source_json, &mut target)?;
                },
                PropertyKind::IdLong => {
                    if let Some(raw) = source_json.get(&prop.name).and_then(JsonValue::as_u64) {
                        let resolved = remap_context
                            .find_target_element_id(Id(raw))
                            .unwrap_or(Id::INVALID);
                        target[&prop.name] = JsonValue::from(resolved.0);
                    }
                },
                PropertyKind::Unsupported => {
                    self.warn_unsupported_once(&class.name.qualified(), &prop.name);
                },
                _ => {
                    if let Some(value) = source_json.get(&prop.name) {
                        target[&prop.name] = value.clone();
                    }
                },
            }
        }

        if class.is_element {
            self.apply_element_adjustments(source_json, &mut target, same_database);
        }

        if let Some(hook) = self.on_cloned_hooks.get(&class.name.qualified()) {
            hook.on_cloned(source_json, &mut target);
        }

        Ok(ClonedRow {
            target_json: target,
            binaries,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn clone_navigation(
        &self,
        source_conn: &Connection,
        target_conn: &Connection,
        ref_type_cache: &RefTypeCache,
        remap_context: &RemapContext,
        class: &ClassDescriptor,
        prop: &crate::schema::PropertyDescriptor,
        source_json: &JsonValue,
        target: &mut JsonValue,
    ) -> anyhow::Result<()> {
        let Some(raw) = source_json.get(&prop.name) else {
            return Ok(());
        };
        if raw.is_null() {
            return Ok(());
        }

        // Navigation values appear either as a bare string/number id or as
        // `{ id, relClassName }`; preserve whichever shape the source used
        // (spec §4.5 rule 2).
        let (source_id, rel_class_name, object_form) = match raw {
            JsonValue::Object(map) => (
                map.get("id").and_then(json_to_id),
                map.get("relClassName").and_then(JsonValue::as_str).map(str::to_owned),
                true,
            ),
            other => (json_to_id(other), None, false),
        };
        let Some(source_id) = source_id else {
            return Ok(());
        };

        let ref_kind = ref_type_cache.lookup(&class.name, &prop.name)?;
        let resolved = remap_context.find_target_entity_id(
            source_conn,
            target_conn,
            EntityRef::from_kind(ref_kind, source_id),
        )?;

        if object_form {
            let mut obj = serde_json::Map::new();
            obj.insert("id".to_owned(), JsonValue::from(resolved.id().0));
            if let Some(rel_class_name) = rel_class_name {
                obj.insert("relClassName".to_owned(), JsonValue::String(rel_class_name));
            }
            target[&prop.name] = JsonValue::Object(obj);
        } else {
            target[&prop.name] = JsonValue::from(resolved.id().0);
        }
        Ok(())
    }

    fn apply_element_adjustments(&self, source_json: &JsonValue, target: &mut JsonValue, same_database: bool) {
        if same_database {
            if let Some(guid) = source_json.get("federationGuid") {
                target["federationGuid"] = guid.clone();
            }
        }

        let code = Code {
            spec: target.get("code").and_then(|c| c.get("spec")).and_then(json_to_id).unwrap_or(Id::INVALID),
            scope: target.get("code").and_then(|c| c.get("scope")).and_then(json_to_id).unwrap_or(Id::INVALID),
            value: target
                .get("code")
                .and_then(|c| c.get("value"))
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_owned(),
        };
        if code.is_empty() {
            let canonical = Code::canonical_empty();
            target["code"] = serde_json::json!({
                "spec": canonical.spec.0,
                "scope": canonical.scope.0,
                "value": canonical.value,
            });
        }
    }

    fn warn_unsupported_once(&self, class_name: &str, property: &str) {
        let mut warned = self.warned_unsupported.lock();
        let key = (class_name.to_owned(), property.to_owned());
        if warned.insert(key) {
            warn!(class = class_name, property, "skipping unsupported compound property kind");
        }
    }
}

fn json_to_id(value: &JsonValue) -> Option<Id> {
    match value {
        JsonValue::Number(n) => n.as_u64().map(Id),
        JsonValue::String(s) => {
            let hex = s.strip_prefix("0x").unwrap_or(s);
            u64::from_str_radix(hex, 16).ok().map(Id)
        },
        _ => None,
    }
}
