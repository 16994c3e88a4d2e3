//! ccm-csi-plugin - node plugin serving ClusterConfigMap volumes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use libccm::config::{DEFAULT_REQUEST_TIMEOUT, DEFAULT_STORAGE_DIR};
use libccm::mount::LinuxMounter;
use libccm::source::KubeConfigSource;
use libccm::transport::parse_endpoint;
use libccm::{Config, Coordinator, CsiServer, LogMetrics, Metrics};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_ENDPOINT: &str = "unix:///var/lib/kubelet/plugins/ccm.csi.rk8s.io/csi.sock";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "ccm-csi-plugin", version, about = "CSI node plugin for ClusterConfigMap volumes")]
struct Args {
    /// CSI endpoint to listen on
    #[arg(long, env = "CCM_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Node identifier reported to the kubelet (defaults to the host name)
    #[arg(long, env = "CCM_NODE_ID")]
    node_id: Option<String>,

    /// Directory holding volume data and metadata
    #[arg(long, env = "CCM_STORAGE_DIR", default_value = DEFAULT_STORAGE_DIR)]
    storage_dir: PathBuf,

    /// Deadline for a single request
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT.as_secs())]
    request_timeout_secs: u64,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

fn node_id(flag: Option<String>) -> anyhow::Result<String> {
    if let Some(id) = flag.filter(|id| !id.is_empty()) {
        return Ok(id);
    }
    let host = nix::unistd::gethostname().context("failed to read host name")?;
    host.into_string()
        .map_err(|h| anyhow::anyhow!("host name {h:?} is not valid UTF-8"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let socket = parse_endpoint(&args.endpoint)?;
    let mut config = Config::new(&args.storage_dir, node_id(args.node_id)?);
    config.request_timeout = Duration::from_secs(args.request_timeout_secs);

    let source = Arc::new(
        KubeConfigSource::in_cluster().context("failed to build Kubernetes client")?,
    );
    let metrics: Arc<dyn Metrics> = Arc::new(LogMetrics);
    let timeout = config.request_timeout;
    info!(
        node_id = %config.node_id,
        storage_dir = %config.storage_dir.display(),
        endpoint = %args.endpoint,
        "starting ccm csi plugin"
    );

    let coordinator = Arc::new(Coordinator::new(
        config,
        source,
        Arc::new(LinuxMounter::new()),
        metrics,
    ));

    // Reclaim whatever a previous run left behind before taking requests.
    let report = coordinator.reconcile().await;
    info!(?report, "startup cleanup finished");

    let server = CsiServer::bind(socket, coordinator, timeout)?;
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received interrupt, shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for interrupt, shutting down"),
        }
        shutdown.cancel();
    });

    server.serve().await?;
    info!("ccm csi plugin stopped");
    Ok(())
}
