use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kubeclerk_api::{ContextBuilder, NaiveGc, ResourceContext};
use kubeclerk_core::{GenericObject, InstanceId, KindId, LabelSelector, ListOptions};
use kubeclerk_kubehub::KubeStore;
use kubeclerk_schema::Registry;
use kubeclerk_store::PatchKind;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kubeclerkctl", version, about = "Resource operations by kind key")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Sweep owned children after deletes (a live cluster runs its own collector)
    #[arg(long = "naive-gc", global = true, action = ArgAction::SetTrue)]
    naive_gc: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum PatchType { Merge, Json, Strategic }

impl From<PatchType> for PatchKind {
    fn from(t: PatchType) -> Self {
        match t {
            PatchType::Merge => PatchKind::Merge,
            PatchType::Json => PatchKind::Json,
            PatchType::Strategic => PatchKind::Strategic,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered kinds, or the kinds the cluster serves
    Kinds {
        #[arg(long = "served", action = ArgAction::SetTrue)]
        served: bool,
    },
    /// Fetch one object
    Get {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
        /// "name" or "namespace/name"
        id: String,
    },
    /// List objects of a kind
    Ls {
        gvk: String,
        /// Restrict to one namespace (default: all)
        #[arg(long = "ns")]
        namespace: Option<String>,
        /// Label selector, e.g. "app=web,tier=front"
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
    /// Create an object, optionally from a YAML or JSON file
    Create {
        gvk: String,
        id: String,
        #[arg(short = 'f', long = "file")]
        file: Option<std::path::PathBuf>,
    },
    /// Patch an object
    Patch {
        gvk: String,
        id: String,
        #[arg(long = "type", value_enum, default_value_t = PatchType::Merge)]
        patch_type: PatchType,
        /// Patch document as JSON
        #[arg(long = "data")]
        data: String,
    },
    /// Delete an object
    Delete {
        gvk: String,
        id: String,
        /// Skip the owned-children sweep even with --naive-gc
        #[arg(long = "no-gc", action = ArgAction::SetTrue)]
        no_gc: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KUBECLERK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KUBECLERK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KUBECLERK_METRICS_ADDR; expected host:port");
        }
    }
}

async fn connect(naive_gc: bool) -> Result<ResourceContext> {
    let store = KubeStore::try_default().await.context("connecting to cluster")?;
    let mut builder = ContextBuilder::new()
        .with_registry(Arc::new(Registry::builtin()))
        .with_store(Arc::new(store));
    if naive_gc {
        builder = builder.with_garbage_collector(Arc::new(NaiveGc));
    }
    Ok(builder.build()?)
}

fn read_manifest(path: &std::path::Path) -> Result<GenericObject> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: serde_json::Value = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(GenericObject::try_from(value)?)
}

fn print_object(output: Output, obj: &GenericObject) -> Result<()> {
    match output {
        Output::Human => print!("{}", serde_yaml::to_string(obj)?),
        Output::Json => println!("{}", serde_json::to_string_pretty(obj)?),
    }
    Ok(())
}

fn render_age(creation_ts: Option<&str>) -> String {
    let Some(ts) = creation_ts.and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok()) else {
        return "-".to_string();
    };
    let mut secs = (chrono::Utc::now().timestamp() - ts.timestamp()).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Kinds { served } => {
            let kinds: Vec<(KindId, bool)> = if served {
                let store = KubeStore::try_default().await.context("connecting to cluster")?;
                kubeclerk_kubehub::discover(store.client().clone())
                    .await?
                    .into_iter()
                    .map(|r| (r.kind, r.namespaced))
                    .collect()
            } else {
                let reg = Registry::builtin();
                reg.all_kinds()
                    .into_iter()
                    .map(|k| {
                        let namespaced = reg.resolve(&k).map(|d| d.namespaced()).unwrap_or(false);
                        (k, namespaced)
                    })
                    .collect()
            };
            match cli.output {
                Output::Human => {
                    for (kind, namespaced) in &kinds {
                        let scope = if *namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {}", kind, scope);
                    }
                }
                Output::Json => {
                    let rows: Vec<_> = kinds
                        .iter()
                        .map(|(k, n)| serde_json::json!({ "kind": k, "namespaced": n }))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Get { gvk, id } => {
            let ctx = connect(cli.naive_gc).await?;
            let obj = ctx.get(&gvk.parse()?, &id.parse()?).await?;
            print_object(cli.output, &obj)?;
        }
        Commands::Ls { gvk, namespace, selector } => {
            let ctx = connect(cli.naive_gc).await?;
            let mut opts = ListOptions { namespace, ..ListOptions::default() };
            if let Some(sel) = selector.as_deref() {
                opts = opts.with_labels(LabelSelector::from_str(sel)?);
            }
            info!(gvk = %gvk, ns = ?opts.namespace, selector = %opts.label_selector, "ls invoked");
            let items = ctx.list(&gvk.parse()?, &opts).await?;
            match cli.output {
                Output::Human => {
                    println!("{:<20} {:<40} {}", "NAMESPACE", "NAME", "AGE");
                    for item in &items {
                        println!(
                            "{:<20} {:<40} {}",
                            item.namespace().unwrap_or("-"),
                            item.name().unwrap_or(""),
                            render_age(item.creation_timestamp())
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
        }
        Commands::Create { gvk, id, file } => {
            let ctx = connect(cli.naive_gc).await?;
            let obj = match file.as_deref() {
                Some(path) => read_manifest(path)?,
                None => GenericObject::new(),
            };
            let id: InstanceId = id.parse()?;
            let created = ctx.create(&gvk.parse()?, &id, obj).await?;
            info!(gvk = %gvk, id = %id, uid = ?created.uid(), "created");
            print_object(cli.output, &created)?;
        }
        Commands::Patch { gvk, id, patch_type, data } => {
            let ctx = connect(cli.naive_gc).await?;
            let patched = ctx.patch_raw(&gvk.parse()?, &id.parse()?, patch_type.into(), data.as_bytes()).await?;
            print_object(cli.output, &patched)?;
        }
        Commands::Delete { gvk, id, no_gc } => {
            let ctx = connect(cli.naive_gc).await?;
            let (kind, id): (KindId, InstanceId) = (gvk.parse()?, id.parse()?);
            let removed = if no_gc { ctx.delete_without_gc(&kind, &id).await? } else { ctx.delete(&kind, &id).await? };
            match cli.output {
                Output::Human => println!("deleted {} {}", kind, id),
                Output::Json => println!("{}", serde_json::to_string_pretty(&removed)?),
            }
        }
    }
    Ok(())
}
