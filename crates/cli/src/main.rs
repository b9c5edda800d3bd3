use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use horizon_coord::{CoordConfig, Coordinator};
use horizon_core::{DeploymentEvent, EventType, PodEvent, ResourceKind, RunParams};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "horizonctl", version, about = "Horizon coordinator CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for created deployments; overrides the kubeconfig context namespace (default: "default")
    #[arg(long = "ns", global = true, env = "HORIZON_NAMESPACE")]
    namespace: Option<String>,

    /// Path to a kubeconfig file (default: in-cluster, then ~/.kube/config)
    #[arg(long, global = true, env = "KUBECONFIG")]
    kubeconfig: Option<String>,

    /// Coordinator name, stamped on every created deployment
    #[arg(long = "coordinator", global = true, env = "HORIZON_NAME", default_value = "horizon")]
    coordinator: String,

    /// Give up when the initial cache sync takes longer than this
    #[arg(long = "sync-timeout-secs", global = true, env = "HORIZON_SYNC_TIMEOUT_SECS")]
    sync_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a coordinated deployment and follow its events until interrupted
    Deploy {
        #[command(flatten)]
        workload: Workload,
        /// Exit once the deployment reports all replicas ready
        #[arg(long = "until-ready", action = ArgAction::SetTrue)]
        until_ready: bool,
    },
    /// Print deployment and pod events until interrupted
    Watch {
        /// Only watch this namespace (default: all namespaces)
        #[arg(long = "watch-ns", env = "HORIZON_WATCH_NAMESPACE")]
        watch_ns: Option<String>,
    },
    /// Print the manifest `deploy` would submit, without contacting the cluster
    Render {
        #[command(flatten)]
        workload: Workload,
    },
}

#[derive(Args, Debug)]
struct Workload {
    /// Deployment and container name
    name: String,
    #[arg(long)]
    image: String,
    #[arg(long, default_value_t = 1)]
    replicas: i64,
    /// Container port to expose; 0 exposes none
    #[arg(long, default_value_t = 0)]
    port: i64,
    /// Image pull policy (default IfNotPresent)
    #[arg(long = "pull-policy", default_value = "")]
    pull_policy: String,
    /// Container environment, KEY=VALUE; repeatable
    #[arg(long = "env", action = ArgAction::Append)]
    envs: Vec<String>,
    /// Extra labels, k1=v1,k2=v2
    #[arg(long, default_value = "")]
    labels: String,
}

impl Workload {
    fn params(self, namespace: &str) -> RunParams {
        RunParams {
            image_pull_policy: self.pull_policy,
            port: self.port,
            envs: self.envs,
            labels: self.labels,
            replicas: self.replicas,
            ..RunParams::new(namespace, &self.name, &self.image)
        }
    }
}

fn init_tracing() {
    let env = std::env::var("HORIZON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("HORIZON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid HORIZON_METRICS_ADDR; expected host:port");
        }
    }
}

fn config(cli: &Cli) -> CoordConfig {
    let mut cfg = CoordConfig::from_env(&cli.coordinator);
    if let Some(ns) = cli.namespace.as_ref().filter(|s| !s.is_empty()) {
        cfg.namespace = ns.clone();
    }
    if let Some(secs) = cli.sync_timeout_secs {
        cfg.sync_timeout = Some(Duration::from_secs(secs));
    }
    cfg
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            token.cancel();
        }
    });
}

fn print_deployment(output: Output, e: &DeploymentEvent) {
    match output {
        Output::Human => println!(
            "deployment {:<8} {}/{}  ready {}/{}{}",
            format!("{:?}", e.ty),
            e.namespace,
            e.name,
            e.ready_replicas,
            e.replicas,
            if e.ready { "  (ready)" } else { "" }
        ),
        Output::Json => {
            let v = serde_json::json!({
                "category": "deployment",
                "type": e.ty,
                "namespace": e.namespace,
                "name": e.name,
                "replicas": e.replicas,
                "readyReplicas": e.ready_replicas,
                "ready": e.ready,
                "status": e.status,
            });
            println!("{}", v);
        }
    }
}

fn print_pod(output: Output, e: &PodEvent) {
    match output {
        Output::Human => println!(
            "pod        {:<8} {}/{}  {} host={} ip={}",
            format!("{:?}", e.ty),
            e.namespace,
            e.name,
            e.phase,
            e.host_ip,
            e.pod_ip
        ),
        Output::Json => match serde_json::to_string(e) {
            Ok(s) => println!("{}", s),
            Err(err) => warn!(error = %err, "failed to encode pod event"),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let mut cfg = config(&cli);
    let output = cli.output;

    match cli.command {
        Commands::Render { workload } => {
            let params = workload.params(&cfg.namespace);
            horizon_apply::validate(&params)?;
            let params = horizon_apply::with_defaults(params);
            let manifest = horizon_apply::render_deployment(&cfg.name, &ResourceKind::deployments(), &params);
            match output {
                Output::Human => print!("{}", horizon_apply::to_yaml(&manifest)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(manifest.as_json())?),
            }
        }
        Commands::Deploy { workload, until_ready } => {
            let coord = Coordinator::connect(cfg, cli.kubeconfig.as_deref()).await?;
            let params = workload.params(&coord.config().namespace);
            let (ns, name) = (params.namespace.clone(), params.name.clone());
            let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<()>();
            {
                let (ns, name) = (ns.clone(), name.clone());
                coord.on_deployment_event(move |e| {
                    if e.namespace != ns || e.name != name {
                        return;
                    }
                    print_deployment(output, e);
                    if e.ty != EventType::Deleted && e.ready && e.replicas > 0 {
                        let _ = ready_tx.send(());
                    }
                });
            }
            {
                // pods of a deployment are named <deployment>-<hash>-<suffix>
                let (ns, prefix) = (ns.clone(), format!("{}-", name));
                coord.on_pod_event(move |e| {
                    if e.namespace == ns && e.name.starts_with(&prefix) {
                        print_pod(output, e);
                    }
                });
            }

            let cancel = CancellationToken::new();
            cancel_on_interrupt(cancel.clone());
            coord.start(cancel.clone()).await.context("starting coordinator")?;
            let result = coord.run(params).await;
            match &result {
                Ok(()) => {
                    info!(ns = %ns, name = %name, "deployment created");
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        Some(()) = ready_rx.recv(), if until_ready => {}
                    }
                }
                Err(e) => eprintln!("deploy error: {}", e),
            }
            if !coord.drain(coord.config().drain_grace).await {
                warn!("some tasks did not stop within the drain grace period");
            }
            result?;
        }
        Commands::Watch { watch_ns } => {
            cfg.watch_namespace = watch_ns.filter(|s| !s.is_empty());
            let coord = Coordinator::connect(cfg, cli.kubeconfig.as_deref()).await?;
            coord
                .on_coord_event(|e| info!(event = ?e, "coordinator"))
                .on_deployment_event(move |e| print_deployment(output, e))
                .on_pod_event(move |e| print_pod(output, e));

            let cancel = CancellationToken::new();
            cancel_on_interrupt(cancel.clone());
            coord.start(cancel.clone()).await.context("starting coordinator")?;
            cancel.cancelled().await;
            if !coord.drain(coord.config().drain_grace).await {
                warn!("some tasks did not stop within the drain grace period");
            }
        }
    }
    Ok(())
}
