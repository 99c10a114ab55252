//! Transform configuration (spec §6 "Configuration").

use serde::{
    Deserialize,
    Serialize,
};

use crate::ids::Id;

/// What to do when `findTargetEntityId` yields `invalid` for a required
/// reference during the hydrate phase (spec §4.6 step 5, §7
/// `DanglingReference`).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DanglingReferencesBehavior {
    /// Fail the transform with `DanglingReference`.
    Reject,
    /// Write `invalid` and log a warning.
    Ignore,
}

impl Default for DanglingReferencesBehavior {
    fn default() -> Self {
        DanglingReferencesBehavior::Reject
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformConfig {
    /// Identity marker used to prevent two transforms from clashing on the
    /// same target. Defaults to the root subject.
    #[serde(default = "default_target_scope_element_id")]
    pub target_scope_element_id: Id,
    /// Copy the source's external-source aspects through to the target.
    #[serde(default)]
    pub include_source_provenance: bool,
    /// When true, pass 1 assigns `targetId = sourceId` instead of consuming
    /// the target's id sequence; the orchestrator must pre-advance the
    /// target's sequence above the maximum source id (spec §6, scenario 6).
    #[serde(default)]
    pub preserve_element_ids_for_filtering: bool,
    #[serde(default)]
    pub dangling_references_behavior: DanglingReferencesBehavior,
    /// Seed the element remap table with identity for all source ids, used
    /// for master/branch workflows where source and target already share an
    /// id space.
    #[serde(default)]
    pub was_source_imodel_copied_to_target: bool,
}

fn default_target_scope_element_id() -> Id {
    Id::ROOT_SUBJECT
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            target_scope_element_id: default_target_scope_element_id(),
            include_source_provenance: false,
            preserve_element_ids_for_filtering: false,
            dangling_references_behavior: DanglingReferencesBehavior::default(),
            was_source_imodel_copied_to_target: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_defaults() {
        let config = TransformConfig::default();
        assert_eq!(config.target_scope_element_id, Id::ROOT_SUBJECT);
        assert_eq!(
            config.dangling_references_behavior,
            DanglingReferencesBehavior::Reject
        );
        assert!(!config.preserve_element_ids_for_filtering);
    }

    #[test]
    fn deserializes_from_partial_json() {
        let config: TransformConfig = serde_json::from_str(
            r#"{"danglingReferencesBehavior": "ignore", "preserveElementIdsForFiltering": true}"#,
        )
        .unwrap();
        assert_eq!(config.dangling_references_behavior, DanglingReferencesBehavior::Ignore);
        assert!(config.preserve_element_ids_for_filtering);
        assert_eq!(config.target_scope_element_id, Id::ROOT_SUBJECT);
    }
}
