use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value as Json};
use tracing::info;

use kubestate_core::{ClusterAccessor, Kind, ResourceRef, StateResult};
use kubestate_kubehub::ClusterConfig;
use kubestate_manifest::{parse_manifest, FileRenderer, ManifestArgs};
use kubestate_reconcile::Engine;

#[derive(Parser, Debug)]
#[command(name = "kubestatectl", version, about = "Converge Kubernetes resources to a declared state")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: "default" for namespaced kinds)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Dry run: report what would change without touching the cluster
    #[arg(long = "test", global = true, action = ArgAction::SetTrue)]
    test: bool,

    /// Path to a kubeconfig file (default: ambient resolution)
    #[arg(long = "kubeconfig", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long = "context", global = true)]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ensure a resource exists with the given configuration
    Present {
        /// Resource kind, e.g. "deployment", "cm", "pvc"
        kind: String,
        /// Resource name
        name: String,
        /// YAML file with explicit metadata/spec/data for the resource
        #[arg(long = "manifest", conflicts_with = "source")]
        manifest: Option<PathBuf>,
        /// Source file defining the resource (rendered before use)
        #[arg(long = "source")]
        source: Option<String>,
        /// Template engine for --source ("none" or empty)
        #[arg(long = "template", requires = "source")]
        template: Option<String>,
        /// Template context values, key=value (repeatable)
        #[arg(long = "set", value_name = "KEY=VALUE", requires = "source")]
        set: Vec<String>,
    },
    /// Ensure a resource does not exist
    Absent {
        /// Resource kind, e.g. "deployment", "cm", "pvc"
        kind: String,
        /// Resource name
        name: String,
    },
    /// List resource names of a kind
    Ls {
        /// Resource kind, e.g. "pod", "svc"
        kind: String,
    },
    /// Node label states
    #[command(subcommand)]
    Label(LabelCommands),
}

#[derive(Subcommand, Debug)]
enum LabelCommands {
    /// Ensure a node carries key=value
    Set { node: String, key: String, value: String },
    /// Ensure a node does not carry the label
    Rm { node: String, key: String },
    /// Remove every label under a prefix folder from a node
    RmFolder { node: String, prefix: String },
}

fn init_tracing() {
    let env = std::env::var("KUBESTATE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KUBESTATE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KUBESTATE_METRICS_ADDR; expected host:port");
        }
    }
}

fn resource_ref(kind: &str, name: &str, namespace: Option<&str>) -> Result<ResourceRef> {
    let kind: Kind = kind.parse().map_err(|e: String| anyhow!(e))?;
    Ok(if kind.namespaced() {
        ResourceRef::namespaced(kind, name, namespace.unwrap_or("default"))
    } else {
        ResourceRef::cluster_scoped(kind, name)
    })
}

fn object_field(map: &Map<String, Json>, key: &str) -> Map<String, Json> {
    map.get(key).and_then(Json::as_object).cloned().unwrap_or_default()
}

/// Builds the resolver inputs from the CLI flags. `--manifest` supplies the
/// explicit body; `--source`/`--template`/`--set` defer to rendering.
fn manifest_args(
    manifest: Option<&PathBuf>,
    source: Option<String>,
    template: Option<String>,
    set: &[String],
) -> Result<ManifestArgs> {
    let mut args = ManifestArgs { source, template, ..Default::default() };

    for pair in set {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("--set expects KEY=VALUE, got '{}'", pair))?;
        args.context.insert(key.to_string(), Json::String(value.to_string()));
    }

    if let Some(path) = manifest {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        let body = parse_manifest(&text)?;
        args.metadata = object_field(&body, "metadata");
        args.spec = object_field(&body, "spec");
        args.data = object_field(&body, "data");
        args.secret_type = body.get("type").and_then(Json::as_str).map(str::to_owned);
    }
    Ok(args)
}

fn emit(output: Output, result: &StateResult) -> Result<()> {
    match output {
        Output::Human => {
            let verdict = match result.result.as_bool() {
                Some(true) => "ok",
                Some(false) => "failed",
                None => "dry-run",
            };
            println!("{}: {} {}", verdict, result.name, result.comment);
            if !result.changes.is_empty() {
                println!("{}", serde_json::to_string_pretty(&result.changes)?);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(result)?),
    }
    if result.result.is_failed() {
        std::process::exit(1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    let config = ClusterConfig {
        kubeconfig: cli.kubeconfig.clone(),
        context: cli.context.clone(),
        default_namespace: cli.namespace.clone(),
    };
    let accessor = config.connect().await?;
    let engine = Engine::new(&accessor);

    match cli.command {
        Commands::Present { kind, name, manifest, source, template, set } => {
            let reference = resource_ref(&kind, &name, ns)?;
            info!(kind = reference.kind.title(), name = %name, ns = ?reference.namespace, test = cli.test, "present invoked");
            let args = manifest_args(manifest.as_ref(), source, template, &set)?;
            let result = engine.present_rendered(&reference, &args, &FileRenderer, cli.test).await?;
            emit(cli.output, &result)?;
        }
        Commands::Absent { kind, name } => {
            let reference = resource_ref(&kind, &name, ns)?;
            info!(kind = reference.kind.title(), name = %name, ns = ?reference.namespace, test = cli.test, "absent invoked");
            let result = engine.absent(&reference, cli.test).await;
            emit(cli.output, &result)?;
        }
        Commands::Ls { kind } => {
            let kind: Kind = kind.parse().map_err(|e: String| anyhow!(e))?;
            info!(kind = kind.title(), ns = ?ns, "ls invoked");
            let names = accessor.list(kind, ns).await?;
            match cli.output {
                Output::Human => {
                    for name in names {
                        println!("{}", name);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&names)?),
            }
        }
        Commands::Label(label) => {
            let result = match label {
                LabelCommands::Set { node, key, value } => {
                    info!(node = %node, label = %key, test = cli.test, "label set invoked");
                    engine.label_present(&node, &key, &value, cli.test).await
                }
                LabelCommands::Rm { node, key } => {
                    info!(node = %node, label = %key, test = cli.test, "label rm invoked");
                    engine.label_absent(&node, &key, cli.test).await
                }
                LabelCommands::RmFolder { node, prefix } => {
                    info!(node = %node, folder = %prefix, test = cli.test, "label rm-folder invoked");
                    engine.label_folder_absent(&node, &prefix, cli.test).await
                }
            };
            emit(cli.output, &result)?;
        }
    }
    Ok(())
}
