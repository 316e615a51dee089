//! Kubestate kubehub: the cluster accessor over the Kubernetes API.
//!
//! Everything cluster-facing lives behind `KubeAccessor`; the reconciliation
//! core never sees kube types, only JSON snapshots and `DeleteOutcome`s.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use base64::{engine::general_purpose, Engine as _};
use either::Either;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject},
    Client, Config,
};
use serde_json::{json, Map, Value as Json};
use tracing::{debug, info};

use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;

use kubestate_core::{
    AccessorError, ClusterAccessor, DeleteOutcome, DesiredState, Kind, LabelMap, ResourceRef,
};

/// How to reach the cluster. Every field defaults to the ambient
/// kubeconfig/in-cluster resolution `kubectl` uses.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    pub default_namespace: Option<String>,
}

impl ClusterConfig {
    pub async fn connect(&self) -> Result<KubeAccessor, AccessorError> {
        let transport = |e: &dyn std::fmt::Display| AccessorError::Transport(e.to_string());
        let mut config = match (&self.kubeconfig, &self.context) {
            (None, None) => Config::infer().await.map_err(|e| transport(&e))?,
            (path, _) => {
                let kubeconfig = match path {
                    Some(p) => Kubeconfig::read_from(p).map_err(|e| transport(&e))?,
                    None => Kubeconfig::read().map_err(|e| transport(&e))?,
                };
                let options =
                    KubeConfigOptions { context: self.context.clone(), ..Default::default() };
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| transport(&e))?
            }
        };
        if let Some(ns) = &self.default_namespace {
            config.default_namespace = ns.clone();
        }
        let client = Client::try_from(config).map_err(to_accessor_error)?;
        info!(context = ?self.context, "kube client connected");
        Ok(KubeAccessor { client })
    }
}

/// Cluster accessor backed by a live kube client.
#[derive(Clone)]
pub struct KubeAccessor {
    client: Client,
}

impl KubeAccessor {
    /// Connects using the ambient kubeconfig/in-cluster environment, the
    /// same resolution `kubectl` uses.
    pub async fn connect() -> Result<Self, AccessorError> {
        ClusterConfig::default().connect().await
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, kind: Kind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(kind);
        match namespace {
            Some(ns) if kind.namespaced() => {
                Api::namespaced_with(self.client.clone(), ns, &ar)
            }
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn nodes(&self) -> Api<corev1::Node> {
        Api::all(self.client.clone())
    }
}

fn api_resource(kind: Kind) -> ApiResource {
    match kind {
        Kind::Namespace => ApiResource::erase::<corev1::Namespace>(&()),
        Kind::Pod => ApiResource::erase::<corev1::Pod>(&()),
        Kind::Deployment => ApiResource::erase::<appsv1::Deployment>(&()),
        Kind::ReplicaSet => ApiResource::erase::<appsv1::ReplicaSet>(&()),
        Kind::Service => ApiResource::erase::<corev1::Service>(&()),
        Kind::ConfigMap => ApiResource::erase::<corev1::ConfigMap>(&()),
        Kind::Secret => ApiResource::erase::<corev1::Secret>(&()),
        Kind::PersistentVolume => ApiResource::erase::<corev1::PersistentVolume>(&()),
        Kind::PersistentVolumeClaim => ApiResource::erase::<corev1::PersistentVolumeClaim>(&()),
    }
}

fn to_accessor_error(e: kube::Error) -> AccessorError {
    match e {
        kube::Error::Api(ae) => AccessorError::Api { code: ae.code, message: ae.message },
        other => AccessorError::Transport(other.to_string()),
    }
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(obj) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        obj.remove("managedFields");
    }
}

fn to_snapshot(obj: &DynamicObject) -> Result<Json, AccessorError> {
    let mut raw = serde_json::to_value(obj)
        .map_err(|e| AccessorError::Transport(format!("serializing object: {}", e)))?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

/// True when the string survives a decode/encode round trip, i.e. it is
/// already valid standard base64.
pub fn is_base64(s: &str) -> bool {
    match general_purpose::STANDARD.decode(s) {
        Ok(decoded) => general_purpose::STANDARD.encode(decoded) == s,
        Err(_) => false,
    }
}

/// Secret payloads go over the wire base64-encoded; values that already are
/// base64 pass through untouched so callers can supply either form.
pub fn encode_secret_data(data: &Map<String, Json>) -> Map<String, Json> {
    let mut out = Map::new();
    for (key, value) in data {
        let plain = match value {
            Json::String(s) => s.clone(),
            other => other.to_string(),
        };
        let encoded = if is_base64(&plain) {
            plain
        } else {
            general_purpose::STANDARD.encode(plain.as_bytes())
        };
        out.insert(key.clone(), Json::String(encoded));
    }
    out
}

/// Builds the full object body sent on create/replace.
fn object_body(reference: &ResourceRef, desired: &DesiredState) -> Json {
    let ar = api_resource(reference.kind);
    let api_version = if ar.group.is_empty() {
        ar.version.clone()
    } else {
        format!("{}/{}", ar.group, ar.version)
    };

    let mut metadata = desired.metadata.clone();
    metadata.insert("name".into(), Json::String(reference.name.clone()));
    if let Some(ns) = &reference.namespace {
        metadata.insert("namespace".into(), Json::String(ns.clone()));
    }

    let mut body = Map::new();
    body.insert("apiVersion".into(), Json::String(api_version));
    body.insert("kind".into(), Json::String(reference.kind.title().to_string()));
    body.insert("metadata".into(), Json::Object(metadata));

    if reference.kind.data_backed() {
        let data = if reference.kind == Kind::Secret {
            encode_secret_data(&desired.data)
        } else {
            desired.data.clone()
        };
        body.insert("data".into(), Json::Object(data));
        if reference.kind == Kind::Secret {
            let secret_type = desired.secret_type.clone().unwrap_or_else(|| "Opaque".into());
            body.insert("type".into(), Json::String(secret_type));
        }
    } else if !desired.spec.is_empty() || reference.kind != Kind::Namespace {
        body.insert("spec".into(), Json::Object(desired.spec.clone()));
    }

    Json::Object(body)
}

/// A full replace must echo the live `resourceVersion`, and a Service must
/// keep its allocated `clusterIP` or the API server rejects the PUT.
fn graft_live_fields(kind: Kind, body: &mut Json, live: &Json) {
    if let Some(rv) = live.pointer("/metadata/resourceVersion").cloned() {
        if let Some(meta) = body.get_mut("metadata").and_then(Json::as_object_mut) {
            meta.insert("resourceVersion".into(), rv);
        }
    }
    if kind == Kind::Service {
        if let Some(ip) = live.pointer("/spec/clusterIP").cloned() {
            if let Some(spec) = body.get_mut("spec").and_then(Json::as_object_mut) {
                spec.entry("clusterIP".to_string()).or_insert(ip);
            }
        }
    }
}

fn parse_dynamic(body: Json) -> Result<DynamicObject, AccessorError> {
    serde_json::from_value(body)
        .map_err(|e| AccessorError::Transport(format!("building object body: {}", e)))
}

#[async_trait::async_trait]
impl ClusterAccessor for KubeAccessor {
    async fn get(&self, reference: &ResourceRef) -> Result<Option<Json>, AccessorError> {
        let api = self.dynamic_api(reference.kind, reference.namespace.as_deref());
        match api.get_opt(&reference.name).await.map_err(to_accessor_error)? {
            Some(obj) => Ok(Some(to_snapshot(&obj)?)),
            None => Ok(None),
        }
    }

    async fn create(
        &self,
        reference: &ResourceRef,
        desired: &DesiredState,
    ) -> Result<Json, AccessorError> {
        let api = self.dynamic_api(reference.kind, reference.namespace.as_deref());
        let obj = parse_dynamic(object_body(reference, desired))?;
        debug!(kind = reference.kind.title(), name = %reference.name, ns = ?reference.namespace, "create");
        let created = api.create(&PostParams::default(), &obj).await.map_err(to_accessor_error)?;
        to_snapshot(&created)
    }

    async fn replace(
        &self,
        reference: &ResourceRef,
        desired: &DesiredState,
    ) -> Result<Json, AccessorError> {
        let api = self.dynamic_api(reference.kind, reference.namespace.as_deref());
        let live = api.get(&reference.name).await.map_err(to_accessor_error)?;
        let live = to_snapshot(&live)?;
        let mut body = object_body(reference, desired);
        graft_live_fields(reference.kind, &mut body, &live);
        let obj = parse_dynamic(body)?;
        debug!(kind = reference.kind.title(), name = %reference.name, ns = ?reference.namespace, "replace");
        let replaced =
            api.replace(&reference.name, &PostParams::default(), &obj).await.map_err(to_accessor_error)?;
        to_snapshot(&replaced)
    }

    async fn delete(&self, reference: &ResourceRef) -> Result<DeleteOutcome, AccessorError> {
        let api = self.dynamic_api(reference.kind, reference.namespace.as_deref());
        debug!(kind = reference.kind.title(), name = %reference.name, ns = ?reference.namespace, "delete");
        let response = api
            .delete(&reference.name, &DeleteParams::default())
            .await
            .map_err(to_accessor_error)?;
        let raw = match response {
            // Deletion still in progress; the API hands back the object
            // itself (namespaces do this while terminating).
            Either::Left(obj) => to_snapshot(&obj)?,
            Either::Right(status) => serde_json::to_value(&status)
                .map_err(|e| AccessorError::Transport(format!("serializing status: {}", e)))?,
        };
        Ok(DeleteOutcome::from_response(raw))
    }

    async fn list(&self, kind: Kind, namespace: Option<&str>) -> Result<Vec<String>, AccessorError> {
        let api = self.dynamic_api(kind, namespace);
        let objects = api.list(&ListParams::default()).await.map_err(to_accessor_error)?;
        Ok(objects.items.iter().filter_map(|o| o.metadata.name.clone()).collect())
    }

    async fn node_labels(&self, node: &str) -> Result<LabelMap, AccessorError> {
        let node = self.nodes().get(node).await.map_err(to_accessor_error)?;
        Ok(node.metadata.labels.unwrap_or_default())
    }

    async fn node_add_label(&self, node: &str, key: &str, value: &str) -> Result<(), AccessorError> {
        let patch = json!({ "metadata": { "labels": { key: value } } });
        self.nodes()
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(to_accessor_error)?;
        Ok(())
    }

    async fn node_remove_label(&self, node: &str, key: &str) -> Result<(), AccessorError> {
        // A null value in a merge patch removes the key.
        let patch = json!({ "metadata": { "labels": { key: Json::Null } } });
        self.nodes()
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(to_accessor_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubestate_core::Kind;
    use serde_json::json;

    fn as_map(v: Json) -> Map<String, Json> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn base64_round_trip_detection() {
        assert!(is_base64("Zm9vYmFy"));
        assert!(!is_base64("hunter2"));
        assert!(!is_base64("not base64!"));
        assert!(!is_base64("Zm9vYmFy\n"));
    }

    #[test]
    fn secret_values_are_encoded_unless_already_base64() {
        let data = as_map(json!({"plain": "hunter2", "encoded": "Zm9vYmFy", "port": 8080}));
        let encoded = encode_secret_data(&data);
        assert_eq!(encoded["plain"], "aHVudGVyMg==");
        assert_eq!(encoded["encoded"], "Zm9vYmFy");
        assert_eq!(encoded["port"], "ODA4MA==");
    }

    #[test]
    fn deployment_body_targets_apps_v1() {
        let r = ResourceRef::namespaced(Kind::Deployment, "web", "default");
        let desired = DesiredState { spec: as_map(json!({"replicas": 2})), ..Default::default() };
        let body = object_body(&r, &desired);
        assert_eq!(body["apiVersion"], "apps/v1");
        assert_eq!(body["kind"], "Deployment");
        assert_eq!(body["metadata"]["name"], "web");
        assert_eq!(body["metadata"]["namespace"], "default");
        assert_eq!(body["spec"]["replicas"], 2);
    }

    #[test]
    fn namespace_body_omits_an_empty_spec() {
        let r = ResourceRef::cluster_scoped(Kind::Namespace, "demo");
        let body = object_body(&r, &DesiredState::default());
        assert_eq!(body["apiVersion"], "v1");
        assert!(body.get("spec").is_none());
        assert!(body["metadata"].get("namespace").is_none());
    }

    #[test]
    fn secret_body_defaults_to_opaque_and_encodes_data() {
        let r = ResourceRef::namespaced(Kind::Secret, "creds", "default");
        let desired =
            DesiredState { data: as_map(json!({"password": "hunter2"})), ..Default::default() };
        let body = object_body(&r, &desired);
        assert_eq!(body["type"], "Opaque");
        assert_eq!(body["data"]["password"], "aHVudGVyMg==");

        let typed = DesiredState { secret_type: Some("kubernetes.io/tls".into()), ..desired };
        assert_eq!(object_body(&r, &typed)["type"], "kubernetes.io/tls");
    }

    #[test]
    fn configmap_body_keeps_data_verbatim() {
        let r = ResourceRef::namespaced(Kind::ConfigMap, "conf", "default");
        let desired =
            DesiredState { data: as_map(json!({"app.conf": "debug=false"})), ..Default::default() };
        let body = object_body(&r, &desired);
        assert_eq!(body["data"]["app.conf"], "debug=false");
        assert!(body.get("type").is_none());
    }

    #[test]
    fn replace_grafts_resource_version_and_cluster_ip() {
        let r = ResourceRef::namespaced(Kind::Service, "web", "default");
        let desired = DesiredState { spec: as_map(json!({"ports": [{"port": 80}]})), ..Default::default() };
        let live = json!({
            "metadata": {"resourceVersion": "4242"},
            "spec": {"clusterIP": "10.0.0.7"},
        });
        let mut body = object_body(&r, &desired);
        graft_live_fields(Kind::Service, &mut body, &live);
        assert_eq!(body["metadata"]["resourceVersion"], "4242");
        assert_eq!(body["spec"]["clusterIP"], "10.0.0.7");
    }

    #[test]
    fn replace_keeps_an_explicit_cluster_ip() {
        let r = ResourceRef::namespaced(Kind::Service, "web", "default");
        let desired =
            DesiredState { spec: as_map(json!({"clusterIP": "10.0.0.9"})), ..Default::default() };
        let live = json!({"spec": {"clusterIP": "10.0.0.7"}});
        let mut body = object_body(&r, &desired);
        graft_live_fields(Kind::Service, &mut body, &live);
        assert_eq!(body["spec"]["clusterIP"], "10.0.0.9");
    }

    #[test]
    fn managed_fields_are_stripped_from_snapshots() {
        let mut v = json!({"metadata": {"name": "x", "managedFields": [{"manager": "kubectl"}]}});
        strip_managed_fields(&mut v);
        assert!(v["metadata"].get("managedFields").is_none());
        assert_eq!(v["metadata"]["name"], "x");
    }
}
