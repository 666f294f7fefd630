#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use rudder_api::{InProcApi, Plan, ResolveFilter, ResolveReport, Resolver, RudderApi};
use rudder_core::{prelude::*, Clusters};
use rudder_gather::{GatherConfig, Gatherer};
use rudder_queue::{QueueConfig, R11nQueueSet, RectifyHandler};
use rudder_rectify::{RectifyConfig, Rectifier};
use rudder_scheduler::{DryRunScheduler, KubeScheduler, SchedulerClient, TableRegistry};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "rudderctl", version, about = "Converge scheduler clusters toward declared deployments")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Cluster definitions (YAML map of name -> base_url, kube_context, namespace, env)
    #[arg(long, env = "RUDDER_CLUSTERS", global = true, default_value = "clusters.yaml")]
    clusters: PathBuf,

    /// Artifact table (YAML list of repo, dir, version, artifact)
    #[arg(long, env = "RUDDER_REGISTRY", global = true, default_value = "registry.yaml")]
    registry: PathBuf,

    #[command(flatten)]
    filter: FilterArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct FilterArgs {
    /// Only this cluster
    #[arg(long = "cluster", global = true)]
    cluster: Option<String>,
    /// Only this source repo
    #[arg(long = "repo", global = true)]
    repo: Option<String>,
    /// Only this directory within the repo
    #[arg(long = "dir", global = true)]
    dir: Option<String>,
    /// Only this flavor
    #[arg(long = "flavor", global = true)]
    flavor: Option<String>,
}

impl From<FilterArgs> for ResolveFilter {
    fn from(a: FilterArgs) -> Self { ResolveFilter { cluster: a.cluster, repo: a.repo, dir: a.dir, flavor: a.flavor } }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show what a resolve would change, without changing it
    Plan {
        /// Intended deployments (YAML list)
        #[arg(long, env = "RUDDER_INTENDED")]
        intended: PathBuf,
    },
    /// Gather, diff and rectify
    Resolve {
        /// Intended deployments (YAML list)
        #[arg(long, env = "RUDDER_INTENDED")]
        intended: PathBuf,
        /// Log scheduler writes instead of issuing them
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Print the deployments currently running on the clusters
    Gather,
}

fn init_tracing() {
    let env = std::env::var("RUDDER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RUDDER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid RUDDER_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_clusters(path: &Path) -> Result<Clusters> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading clusters {}", path.display()))?;
    let clusters: Clusters = serde_yaml::from_str(&text).with_context(|| format!("parsing clusters {}", path.display()))?;
    if clusters.is_empty() {
        bail!("{} defines no clusters", path.display());
    }
    Ok(clusters)
}

fn parse_intended(text: &str) -> Result<Deployments> { Ok(serde_yaml::from_str(text)?) }

fn load_intended(path: &Path) -> Result<Deployments> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading intended state {}", path.display()))?;
    parse_intended(&text).with_context(|| format!("parsing intended state {}", path.display()))
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; cancelling");
            token.cancel();
        }
    });
}

struct Engine {
    api: InProcApi,
    dry: Option<Arc<DryRunScheduler>>,
}

fn engine(clusters: Clusters, registry: Arc<TableRegistry>, dry_run: bool, cancel: CancellationToken) -> Engine {
    let kube: Arc<dyn SchedulerClient> = Arc::new(KubeScheduler::new(&clusters));
    let dry = dry_run.then(|| Arc::new(DryRunScheduler::new(kube.clone())));
    let client: Arc<dyn SchedulerClient> = match &dry {
        Some(d) => d.clone(),
        None => kube,
    };
    let gatherer = Gatherer::new(client.clone(), registry.clone(), GatherConfig::from_env());
    let rectifier = Rectifier::with_config(registry, client, RectifyConfig::from_env());
    let queue = R11nQueueSet::new(Arc::new(RectifyHandler::new(rectifier.clone())), QueueConfig::from_env());
    let resolver = Resolver::new(clusters, gatherer, rectifier).with_cancel(cancel);
    Engine { api: InProcApi::new(resolver, queue), dry }
}

fn print_plan(plan: &Plan) {
    let c = &plan.counts;
    println!("{} to create, {} to update, {} to delete, {} unchanged", c.created, c.modified, c.deleted, c.unchanged);
    for id in &plan.created {
        println!("+ {}", id);
    }
    for m in &plan.modified {
        let what: Vec<String> = m.differences.iter().map(|d| d.to_string()).collect();
        println!("~ {} ({})", m.id, what.join(", "));
    }
    for id in &plan.deleted {
        println!("- {}", id);
    }
    for w in &plan.warnings {
        println!("! {}", w);
    }
}

fn print_report(report: &ResolveReport) {
    for r in &report.status.log {
        match &r.error {
            None => println!("{:<10} {}", r.desc, r.deployment_id),
            Some(e) => println!("{:<10} {} FAILED {}", r.desc, r.deployment_id, e),
        }
    }
    let failed = report.status.failures().count();
    println!(
        "phase {}: {} resolved, {} failed",
        report.status.phase,
        report.status.log.len() - failed,
        failed
    );
    if let Some(e) = &report.error {
        println!("error: {}", e);
    }
}

fn print_deployments(ds: &Deployments) {
    println!("{:<40} {:<12} {:<10} {:>9}  STATUS", "DEPLOYMENT", "VERSION", "KIND", "INSTANCES");
    for d in ds {
        println!(
            "{:<40} {:<12} {:<10} {:>9}  {:?}",
            d.id().to_string(),
            d.source_id.version.to_string(),
            d.kind.to_string(),
            d.config.num_instances,
            d.annotation.status
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let clusters = load_clusters(&cli.clusters)?;
    let registry = Arc::new(TableRegistry::load(&cli.registry)?);
    let filter: ResolveFilter = cli.filter.into();
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());
    info!(clusters = clusters.len(), artifacts = registry.len(), ?filter, "rudderctl: configured");

    match cli.command {
        Commands::Plan { intended } => {
            let intended = load_intended(&intended)?;
            let Engine { api, .. } = engine(clusters, registry, true, cancel);
            let plan = api.plan(intended, filter).await?;
            match cli.output {
                Output::Human => print_plan(&plan),
                Output::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
            }
        }
        Commands::Resolve { intended, dry_run } => {
            let intended = load_intended(&intended)?;
            let Engine { api, dry } = engine(clusters, registry, dry_run, cancel);
            let report = api.resolve(intended, filter).await?;
            match cli.output {
                Output::Human => {
                    print_report(&report);
                    if let Some(dry) = &dry {
                        for call in dry.skipped() {
                            println!("dry-run: would {:?} {}", call.op(), call.request_id().unwrap_or("-"));
                        }
                    }
                }
                Output::Json => {
                    let skipped = dry.as_ref().map(|d| d.skipped());
                    let out = serde_json::json!({ "report": &report, "skipped": skipped });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
            if let Some(e) = report.error {
                error!(error = %e, "resolve failed");
                bail!("resolve failed: {}", e);
            }
        }
        Commands::Gather => {
            let scope = clusters.only(filter.cluster.as_deref());
            let client: Arc<dyn SchedulerClient> = Arc::new(KubeScheduler::new(&scope));
            let gatherer = Gatherer::new(client, registry, GatherConfig::from_env());
            let (found, err) = match gatherer.gather(&scope, cancel).await {
                Ok(ds) => (ds, None),
                Err(partial) => {
                    let msg = partial.to_string();
                    (partial.collected, Some(msg))
                }
            };
            let found = filter.apply(found);
            match cli.output {
                Output::Human => print_deployments(&found),
                Output::Json => println!("{}", serde_json::to_string_pretty(&found)?),
            }
            if let Some(e) = err {
                bail!("gather incomplete: {}", e);
            }
        }
    }
    Ok(())
}
