//! Per-kind reconciliation policy, auditable in one place.
//!
//! The original engine dispatched on hand-written per-kind functions; this
//! table drives one generic reconciliation path instead. Adding a kind means
//! adding one `KindPolicy` entry (plus a validator if it has immutability or
//! encoding rules of its own).

use crate::Kind;

/// What to do when the resource already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceStrategy {
    /// The kind cannot be replaced in place; `present` on an existing
    /// resource is a hard failure (Pod).
    Never,
    /// Existence alone satisfies `present`; desired state is not diffed
    /// (Namespace, PersistentVolume).
    ExistsOk,
    /// Always recreate with the desired state, no diff beforehand
    /// (Deployment, ReplicaSet, Service, ConfigMap, Secret).
    Recreate,
    /// Replace only after validating that no immutable field changes
    /// (PersistentVolumeClaim).
    ValidatedReplace,
}

/// How the `changes` value of a successful create/replace is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeShape {
    /// `{"metadata": .., "spec": ..}` from the desired state.
    MetadataSpec,
    /// `{"data": <full data mapping>}`.
    DataMap,
    /// `{"data": [key, ..]}` — key names only, never values (Secret).
    DataKeys,
    /// `{<key>: {"old": {}, "new": <created object>}}` under a fixed key.
    Named(&'static str),
    /// `{<resource name>: {"old": {}, "new": <created object>}}`.
    NamedByName,
    /// `{"<namespace>.<name>": {"old": .., "new": ..}}` spec snapshots.
    NamespacedOldNew,
}

#[derive(Debug, Clone, Copy)]
pub struct KindPolicy {
    pub replace: ReplaceStrategy,
    /// Dotted spec paths that must not change across a replace.
    pub immutable_fields: &'static [&'static str],
    pub change_shape: ChangeShape,
}

/// `resources.requests.storage` is deliberately not listed: growing a claim
/// is allowed, and shrink rejection belongs to cluster-side admission.
pub const PVC_IMMUTABLE_FIELDS: &[&str] = &["access_modes", "storage_class_name", "volume_mode"];

const NAMESPACE: KindPolicy = KindPolicy {
    replace: ReplaceStrategy::ExistsOk,
    immutable_fields: &[],
    change_shape: ChangeShape::Named("namespace"),
};

const POD: KindPolicy = KindPolicy {
    replace: ReplaceStrategy::Never,
    immutable_fields: &[],
    change_shape: ChangeShape::MetadataSpec,
};

const WORKLOAD: KindPolicy = KindPolicy {
    replace: ReplaceStrategy::Recreate,
    immutable_fields: &[],
    change_shape: ChangeShape::MetadataSpec,
};

const CONFIG_MAP: KindPolicy = KindPolicy {
    replace: ReplaceStrategy::Recreate,
    immutable_fields: &[],
    change_shape: ChangeShape::DataMap,
};

const SECRET: KindPolicy = KindPolicy {
    replace: ReplaceStrategy::Recreate,
    immutable_fields: &[],
    change_shape: ChangeShape::DataKeys,
};

const PERSISTENT_VOLUME: KindPolicy = KindPolicy {
    replace: ReplaceStrategy::ExistsOk,
    immutable_fields: &[],
    change_shape: ChangeShape::NamedByName,
};

const PERSISTENT_VOLUME_CLAIM: KindPolicy = KindPolicy {
    replace: ReplaceStrategy::ValidatedReplace,
    immutable_fields: PVC_IMMUTABLE_FIELDS,
    change_shape: ChangeShape::NamespacedOldNew,
};

impl Kind {
    pub const fn policy(&self) -> &'static KindPolicy {
        match self {
            Kind::Namespace => &NAMESPACE,
            Kind::Pod => &POD,
            Kind::Deployment | Kind::ReplicaSet | Kind::Service => &WORKLOAD,
            Kind::ConfigMap => &CONFIG_MAP,
            Kind::Secret => &SECRET,
            Kind::PersistentVolume => &PERSISTENT_VOLUME,
            Kind::PersistentVolumeClaim => &PERSISTENT_VOLUME_CLAIM,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn behavioral_matrix_matches_the_contract() {
        assert_eq!(Kind::Pod.policy().replace, ReplaceStrategy::Never);
        assert_eq!(Kind::Namespace.policy().replace, ReplaceStrategy::ExistsOk);
        assert_eq!(Kind::PersistentVolume.policy().replace, ReplaceStrategy::ExistsOk);
        for kind in [Kind::Deployment, Kind::ReplicaSet, Kind::Service, Kind::ConfigMap, Kind::Secret] {
            assert_eq!(kind.policy().replace, ReplaceStrategy::Recreate, "{:?}", kind);
        }
        assert_eq!(Kind::PersistentVolumeClaim.policy().replace, ReplaceStrategy::ValidatedReplace);
    }

    #[test]
    fn only_pvc_declares_immutable_fields() {
        for kind in [
            Kind::Namespace,
            Kind::Pod,
            Kind::Deployment,
            Kind::ReplicaSet,
            Kind::Service,
            Kind::ConfigMap,
            Kind::Secret,
            Kind::PersistentVolume,
        ] {
            assert!(kind.policy().immutable_fields.is_empty(), "{:?}", kind);
        }
        assert_eq!(
            Kind::PersistentVolumeClaim.policy().immutable_fields,
            &["access_modes", "storage_class_name", "volume_mode"]
        );
    }

    #[test]
    fn secret_changes_are_key_names_only() {
        assert_eq!(Kind::Secret.policy().change_shape, ChangeShape::DataKeys);
        assert_eq!(Kind::ConfigMap.policy().change_shape, ChangeShape::DataMap);
    }
}
