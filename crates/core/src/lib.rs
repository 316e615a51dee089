//! Kubestate core: data model, kind policy table and the accessor contract.

#![forbid(unsafe_code)]

pub mod policy;

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value as Json};

pub use policy::{ChangeShape, KindPolicy, ReplaceStrategy};

/// Resource kinds this engine knows how to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Namespace,
    Pod,
    Deployment,
    ReplicaSet,
    Service,
    ConfigMap,
    Secret,
    PersistentVolume,
    PersistentVolumeClaim,
}

impl Kind {
    /// Lowercase form used inside result comments ("The configmap already exists").
    pub fn display(&self) -> &'static str {
        match self {
            Kind::Namespace => "namespace",
            Kind::Pod => "pod",
            Kind::Deployment => "deployment",
            Kind::ReplicaSet => "replicaset",
            Kind::Service => "service",
            Kind::ConfigMap => "configmap",
            Kind::Secret => "secret",
            Kind::PersistentVolume => "persistent volume",
            Kind::PersistentVolumeClaim => "persistent volume claim",
        }
    }

    /// Canonical Kubernetes kind name ("ConfigMap deleted").
    pub fn title(&self) -> &'static str {
        match self {
            Kind::Namespace => "Namespace",
            Kind::Pod => "Pod",
            Kind::Deployment => "Deployment",
            Kind::ReplicaSet => "ReplicaSet",
            Kind::Service => "Service",
            Kind::ConfigMap => "ConfigMap",
            Kind::Secret => "Secret",
            Kind::PersistentVolume => "PersistentVolume",
            Kind::PersistentVolumeClaim => "PersistentVolumeClaim",
        }
    }

    /// Key used in deletion change reports ("kubernetes.configmap").
    pub fn changes_key(&self) -> &'static str {
        match self {
            Kind::Namespace => "kubernetes.namespace",
            Kind::Pod => "kubernetes.pod",
            Kind::Deployment => "kubernetes.deployment",
            Kind::ReplicaSet => "kubernetes.replicaset",
            Kind::Service => "kubernetes.service",
            Kind::ConfigMap => "kubernetes.configmap",
            Kind::Secret => "kubernetes.secret",
            Kind::PersistentVolume => "kubernetes.persistent_volume",
            Kind::PersistentVolumeClaim => "kubernetes.persistent_volume_claim",
        }
    }

    pub fn namespaced(&self) -> bool {
        !matches!(self, Kind::Namespace | Kind::PersistentVolume)
    }

    /// ConfigMap and Secret carry a `data` payload instead of a spec.
    pub fn data_backed(&self) -> bool {
        matches!(self, Kind::ConfigMap | Kind::Secret)
    }
}

impl FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "namespace" | "ns" => Ok(Kind::Namespace),
            "pod" => Ok(Kind::Pod),
            "deployment" | "deploy" => Ok(Kind::Deployment),
            "replicaset" | "rs" => Ok(Kind::ReplicaSet),
            "service" | "svc" => Ok(Kind::Service),
            "configmap" | "cm" => Ok(Kind::ConfigMap),
            "secret" => Ok(Kind::Secret),
            "persistentvolume" | "pv" => Ok(Kind::PersistentVolume),
            "persistentvolumeclaim" | "pvc" => Ok(Kind::PersistentVolumeClaim),
            other => Err(format!("unknown resource kind: {}", other)),
        }
    }
}

/// Identifies one resource instance. `namespace` is required for namespaced
/// kinds and must be absent for cluster-scoped ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: Kind,
    pub name: String,
    pub namespace: Option<String>,
}

impl ResourceRef {
    pub fn namespaced(kind: Kind, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { kind, name: name.into(), namespace: Some(namespace.into()) }
    }

    pub fn cluster_scoped(kind: Kind, name: impl Into<String>) -> Self {
        Self { kind, name: name.into(), namespace: None }
    }

    /// "<namespace>.<name>" for namespaced refs, "<name>" otherwise; used as
    /// the change-report key for creations and PVC replacements.
    pub fn change_key(&self) -> String {
        match self.namespace.as_deref() {
            Some(ns) => format!("{}.{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

/// The target configuration for a resource, either supplied directly or
/// resolved from a rendered manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub metadata: Map<String, Json>,
    #[serde(default)]
    pub spec: Map<String, Json>,
    #[serde(default)]
    pub data: Map<String, Json>,
    /// Secret type ("Opaque", "kubernetes.io/tls", ...); Secret kind only.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub secret_type: Option<String>,
}

/// Three-valued reconciliation verdict. Serializes as `true`/`false`/`null`
/// so downstream tooling keeps its existing branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Failed,
    Simulated,
}

impl Outcome {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Outcome::Applied => Some(true),
            Outcome::Failed => Some(false),
            Outcome::Simulated => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed)
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self, Outcome::Simulated)
    }
}

impl Serialize for Outcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.as_bool() {
            Some(b) => serializer.serialize_bool(b),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for Outcome {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<bool>::deserialize(deserializer)? {
            Some(true) => Outcome::Applied,
            Some(false) => Outcome::Failed,
            None => Outcome::Simulated,
        })
    }
}

/// The sole externally observable artifact of a reconciliation call.
///
/// Invariants: `changes` is empty whenever `result` is `Failed` (no partial
/// mutation is ever reported) or `Simulated` (dry-run never mutates). The
/// constructors below are the only way this crate builds one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResult {
    pub name: String,
    pub result: Outcome,
    pub comment: String,
    pub changes: Map<String, Json>,
}

impl StateResult {
    pub fn applied(
        name: impl Into<String>,
        comment: impl Into<String>,
        changes: Map<String, Json>,
    ) -> Self {
        Self { name: name.into(), result: Outcome::Applied, comment: comment.into(), changes }
    }

    pub fn failed(name: impl Into<String>, comment: impl Into<String>) -> Self {
        Self { name: name.into(), result: Outcome::Failed, comment: comment.into(), changes: Map::new() }
    }

    pub fn simulated(name: impl Into<String>, comment: impl Into<String>) -> Self {
        Self { name: name.into(), result: Outcome::Simulated, comment: comment.into(), changes: Map::new() }
    }
}

/// What the cluster answered to a delete call. Namespace deletion is
/// asynchronous and may come back as a still-terminating object rather than a
/// plain status, so the raw response is kept for diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub code: Option<i64>,
    pub message: Option<String>,
    pub status: Option<Json>,
    pub raw: Json,
}

impl DeleteOutcome {
    pub fn from_response(raw: Json) -> Self {
        let code = raw.get("code").and_then(Json::as_i64);
        let message = raw.get("message").and_then(Json::as_str).map(str::to_owned);
        let status = raw.get("status").cloned();
        Self { code, message, status, raw }
    }
}

/// Flat label map of a node.
pub type LabelMap = BTreeMap<String, String>;

/// Errors surfaced by the cluster accessor.
#[derive(Debug, thiserror::Error)]
pub enum AccessorError {
    #[error("cluster API error ({code}): {message}")]
    Api { code: u16, message: String },
    #[error("cluster transport error: {0}")]
    Transport(String),
}

/// Error taxonomy of the reconciliation boundary. Everything here is normally
/// resolved locally into a `StateResult` with `Outcome::Failed`; see the
/// reconcile crate for the one deliberate passthrough.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),
    #[error("failed to render manifest source: {0}")]
    Render(String),
    #[error("failed to parse manifest: {0}")]
    Parse(String),
    #[error("forbidden: spec is immutable after creation ({field} cannot change)")]
    ImmutableField { field: String },
    #[error(transparent)]
    Accessor(#[from] AccessorError),
}

/// Capability boundary to the cluster API. Implemented by `kubestate-kubehub`
/// for real clusters and by in-memory mocks in tests; the reconciliation core
/// only ever talks to this trait.
#[async_trait::async_trait]
pub trait ClusterAccessor: Send + Sync {
    /// Current snapshot of a resource, or `None` when it does not exist.
    async fn get(&self, reference: &ResourceRef) -> Result<Option<Json>, AccessorError>;

    async fn create(&self, reference: &ResourceRef, desired: &DesiredState) -> Result<Json, AccessorError>;

    /// Full replace (PUT). Treated as atomic by the reconciliation core.
    async fn replace(&self, reference: &ResourceRef, desired: &DesiredState) -> Result<Json, AccessorError>;

    async fn delete(&self, reference: &ResourceRef) -> Result<DeleteOutcome, AccessorError>;

    async fn list(&self, kind: Kind, namespace: Option<&str>) -> Result<Vec<String>, AccessorError>;

    async fn node_labels(&self, node: &str) -> Result<LabelMap, AccessorError>;

    async fn node_add_label(&self, node: &str, key: &str, value: &str) -> Result<(), AccessorError>;

    async fn node_remove_label(&self, node: &str, key: &str) -> Result<(), AccessorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_wire_format_is_three_valued() {
        assert_eq!(serde_json::to_string(&Outcome::Applied).unwrap(), "true");
        assert_eq!(serde_json::to_string(&Outcome::Failed).unwrap(), "false");
        assert_eq!(serde_json::to_string(&Outcome::Simulated).unwrap(), "null");

        let back: Outcome = serde_json::from_str("null").unwrap();
        assert!(back.is_simulated());
        let back: Outcome = serde_json::from_str("false").unwrap();
        assert!(back.is_failed());
    }

    #[test]
    fn failed_and_simulated_results_carry_no_changes() {
        let f = StateResult::failed("x", "boom");
        assert!(f.changes.is_empty());
        let s = StateResult::simulated("x", "would do");
        assert!(s.changes.is_empty());
        assert_eq!(s.result.as_bool(), None);
    }

    #[test]
    fn state_result_serializes_like_the_original_return_dict() {
        let r = StateResult::failed("demo", "nope");
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["name"], "demo");
        assert_eq!(v["result"], serde_json::json!(false));
        assert_eq!(v["comment"], "nope");
        assert!(v["changes"].as_object().unwrap().is_empty());
    }

    #[test]
    fn delete_outcome_parses_code_message_and_status() {
        let out = DeleteOutcome::from_response(serde_json::json!({
            "code": 200,
            "message": "gone",
            "status": {"phase": "Terminating"}
        }));
        assert_eq!(out.code, Some(200));
        assert_eq!(out.message.as_deref(), Some("gone"));
        assert_eq!(out.status.unwrap()["phase"], "Terminating");
    }

    #[test]
    fn ref_change_key_includes_namespace_when_present() {
        let r = ResourceRef::namespaced(Kind::Service, "web", "prod");
        assert_eq!(r.change_key(), "prod.web");
        let r = ResourceRef::cluster_scoped(Kind::PersistentVolume, "pv0");
        assert_eq!(r.change_key(), "pv0");
    }

    #[test]
    fn kind_parsing_accepts_short_names() {
        assert_eq!("pvc".parse::<Kind>().unwrap(), Kind::PersistentVolumeClaim);
        assert_eq!("ConfigMap".parse::<Kind>().unwrap(), Kind::ConfigMap);
        assert!("gateway".parse::<Kind>().is_err());
    }

    #[test]
    fn scope_matches_the_cluster_model() {
        assert!(!Kind::Namespace.namespaced());
        assert!(!Kind::PersistentVolume.namespaced());
        assert!(Kind::PersistentVolumeClaim.namespaced());
        assert!(Kind::Pod.namespaced());
    }
}
