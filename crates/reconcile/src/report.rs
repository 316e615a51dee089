//! Change reporting for successful create/replace calls.

use serde_json::{json, Map, Value as Json};

use kubestate_core::{ChangeShape, DesiredState, ResourceRef};

/// Builds the `changes` mapping for a create or recreate that went through.
/// The shape is a per-kind policy decision; values come from the desired
/// state or the object the cluster handed back.
pub(crate) fn convergence_changes(
    reference: &ResourceRef,
    desired: &DesiredState,
    applied: &Json,
) -> Map<String, Json> {
    let mut changes = Map::new();
    match reference.kind.policy().change_shape {
        ChangeShape::MetadataSpec => {
            changes.insert("metadata".into(), Json::Object(desired.metadata.clone()));
            changes.insert("spec".into(), Json::Object(desired.spec.clone()));
        }
        ChangeShape::DataMap => {
            let data = applied
                .get("data")
                .filter(|d| d.is_object())
                .cloned()
                .unwrap_or_else(|| Json::Object(desired.data.clone()));
            changes.insert("data".into(), data);
        }
        ChangeShape::DataKeys => {
            // Key names only; secret values never reach the report.
            let keys: Vec<Json> =
                desired.data.keys().map(|k| Json::String(k.clone())).collect();
            changes.insert("data".into(), Json::Array(keys));
        }
        ChangeShape::Named(key) => {
            changes.insert(key.to_string(), json!({ "old": {}, "new": applied }));
        }
        ChangeShape::NamedByName => {
            changes.insert(reference.name.clone(), json!({ "old": {}, "new": applied }));
        }
        ChangeShape::NamespacedOldNew => {
            let new_spec = applied
                .get("spec")
                .cloned()
                .unwrap_or_else(|| Json::Object(desired.spec.clone()));
            changes.insert(reference.change_key(), json!({ "old": {}, "new": new_spec }));
        }
    }
    changes
}
