//! Kubestate manifest resolution: explicit arguments or a rendered source
//! file, never both.

#![forbid(unsafe_code)]

use serde_json::{Map, Value as Json};
use tracing::debug;

use kubestate_core::{DesiredState, Error, Kind};

fn max_yaml_bytes() -> usize {
    std::env::var("KUBESTATE_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

/// Renders a source template into manifest text. Implemented outside this
/// core; the engine tag selects the template language.
pub trait Renderer: Send + Sync {
    fn render(&self, source: &str, template: &str, context: &Map<String, Json>) -> Result<String, Error>;
}

/// Renderer over plain files: the empty/"none" engine returns the file
/// verbatim, any other tag is rejected. Template engines plug in behind the
/// `Renderer` trait.
#[derive(Debug, Default)]
pub struct FileRenderer;

impl Renderer for FileRenderer {
    fn render(&self, source: &str, template: &str, _context: &Map<String, Json>) -> Result<String, Error> {
        if !template.is_empty() && template != "none" {
            return Err(Error::Render(format!("Unknown template specified: {}", template)));
        }
        std::fs::read_to_string(source)
            .map_err(|e| Error::Render(format!("Source file '{}' not found: {}", source, e)))
    }
}

/// Raw inputs of a `present` call before resolution.
#[derive(Debug, Clone, Default)]
pub struct ManifestArgs {
    pub metadata: Map<String, Json>,
    pub spec: Map<String, Json>,
    pub data: Map<String, Json>,
    pub secret_type: Option<String>,
    pub source: Option<String>,
    pub template: Option<String>,
    pub context: Map<String, Json>,
}

impl ManifestArgs {
    fn has_explicit_body(&self) -> bool {
        !self.metadata.is_empty() || !self.spec.is_empty()
    }
}

/// Resolves the effective desired state for `kind`. Explicit `metadata`/
/// `spec`/`data` and `source` are mutually exclusive; supplying both is a
/// validation error raised before any cluster call.
pub fn resolve(kind: Kind, args: &ManifestArgs, renderer: &dyn Renderer) -> Result<DesiredState, Error> {
    let Some(source) = args.source.as_deref() else {
        return Ok(DesiredState {
            metadata: args.metadata.clone(),
            spec: args.spec.clone(),
            data: args.data.clone(),
            secret_type: args.secret_type.clone(),
        });
    };

    if kind.data_backed() && !args.data.is_empty() {
        return Err(Error::Validation(
            "'source' cannot be used in combination with 'data'".into(),
        ));
    }
    if args.has_explicit_body() {
        return Err(Error::Validation(
            "'source' cannot be used in combination with 'metadata' or 'spec'".into(),
        ));
    }

    let template = args.template.as_deref().unwrap_or("");
    let text = renderer.render(source, template, &args.context)?;
    debug!(source = %source, template = %template, bytes = text.len(), "manifest rendered");
    let manifest = parse_manifest(&text)?;

    if let Some(doc_kind) = manifest.get("kind").and_then(Json::as_str) {
        if doc_kind != kind.title() {
            return Err(Error::Validation(format!(
                "The source file should define only a {} object",
                kind.title()
            )));
        }
    }

    Ok(DesiredState {
        metadata: object_field(&manifest, "metadata"),
        spec: object_field(&manifest, "spec"),
        data: object_field(&manifest, "data"),
        secret_type: manifest.get("type").and_then(Json::as_str).map(str::to_owned),
    })
}

/// Parses rendered manifest text into a JSON mapping.
pub fn parse_manifest(text: &str) -> Result<Map<String, Json>, Error> {
    if text.len() > max_yaml_bytes() {
        return Err(Error::Parse(format!("manifest too large (>{} bytes)", max_yaml_bytes())));
    }
    let val: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|e| Error::Parse(e.to_string()))?;
    let json = serde_json::to_value(val).map_err(|e| Error::Parse(e.to_string()))?;
    match json {
        Json::Object(map) => Ok(map),
        other => Err(Error::Parse(format!(
            "manifest must be a mapping, got {}",
            json_type_name(&other)
        ))),
    }
}

fn object_field(map: &Map<String, Json>, key: &str) -> Map<String, Json> {
    map.get(key).and_then(Json::as_object).cloned().unwrap_or_default()
}

fn json_type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "sequence",
        Json::Object(_) => "mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StaticRenderer(&'static str);

    impl Renderer for StaticRenderer {
        fn render(&self, _source: &str, _template: &str, _context: &Map<String, Json>) -> Result<String, Error> {
            Ok(self.0.to_string())
        }
    }

    fn as_map(v: Json) -> Map<String, Json> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn explicit_arguments_pass_through_verbatim() {
        let args = ManifestArgs {
            spec: as_map(json!({"replicas": 2})),
            metadata: as_map(json!({"labels": {"app": "web"}})),
            ..Default::default()
        };
        let d = resolve(Kind::Deployment, &args, &FileRenderer).unwrap();
        assert_eq!(d.spec["replicas"], 2);
        assert_eq!(d.metadata["labels"]["app"], "web");
    }

    #[test]
    fn source_conflicts_with_data_for_data_backed_kinds() {
        let args = ManifestArgs {
            data: as_map(json!({"k": "v"})),
            source: Some("salt://cm.yml".into()),
            ..Default::default()
        };
        let err = resolve(Kind::ConfigMap, &args, &StaticRenderer("")).unwrap_err();
        assert_eq!(err.to_string(), "'source' cannot be used in combination with 'data'");
    }

    #[test]
    fn source_conflicts_with_metadata_or_spec() {
        let args = ManifestArgs {
            spec: as_map(json!({"replicas": 1})),
            source: Some("salt://deploy.yml".into()),
            ..Default::default()
        };
        let err = resolve(Kind::Deployment, &args, &StaticRenderer("")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "'source' cannot be used in combination with 'metadata' or 'spec'"
        );
    }

    #[test]
    fn rendered_manifest_is_parsed_into_desired_state() {
        let yaml = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  labels:
    run: my-nginx
spec:
  replicas: 3
"#;
        let args = ManifestArgs { source: Some("d.yml".into()), ..Default::default() };
        let d = resolve(Kind::Deployment, &args, &StaticRenderer(yaml)).unwrap();
        assert_eq!(d.spec["replicas"], 3);
        assert_eq!(d.metadata["labels"]["run"], "my-nginx");
        assert!(d.data.is_empty());
    }

    #[test]
    fn secret_manifest_keeps_type_and_data() {
        let yaml = "kind: Secret\ntype: kubernetes.io/tls\ndata:\n  tls.crt: Zm9v\n";
        let args = ManifestArgs { source: Some("s.yml".into()), ..Default::default() };
        let d = resolve(Kind::Secret, &args, &StaticRenderer(yaml)).unwrap();
        assert_eq!(d.secret_type.as_deref(), Some("kubernetes.io/tls"));
        assert_eq!(d.data["tls.crt"], "Zm9v");
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let yaml = "kind: Service\nspec: {}\n";
        let args = ManifestArgs { source: Some("svc.yml".into()), ..Default::default() };
        let err = resolve(Kind::Deployment, &args, &StaticRenderer(yaml)).unwrap_err();
        assert!(err.to_string().contains("should define only a Deployment"));
    }

    #[test]
    fn invalid_yaml_is_a_parse_error() {
        let args = ManifestArgs { source: Some("bad.yml".into()), ..Default::default() };
        let err = resolve(Kind::Service, &args, &StaticRenderer("a: [unclosed")).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn scalar_manifest_is_a_parse_error() {
        let err = parse_manifest("just a string").unwrap_err();
        assert!(err.to_string().contains("must be a mapping"));
    }

    #[test]
    fn file_renderer_rejects_unknown_engines() {
        let err = FileRenderer
            .render("x.yml", "jinja", &Map::new())
            .unwrap_err();
        assert!(err.to_string().contains("Unknown template specified: jinja"));
    }
}
