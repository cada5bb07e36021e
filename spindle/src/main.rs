use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod config;
use config::{ClusterProvider, Config, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;

#[derive(Parser, Debug)]
#[command(name = "spindle", about = "Request-routing proxy for torrent backends")]
struct Args {
    #[arg(long)]
    config_file_path: PathBuf,

    /// Name of the node this replica runs on.
    #[arg(long, env = "MY_NODE_NAME")]
    my_node_name: Option<String>,

    /// Override the configured listening host.
    #[arg(long, env = "SPINDLE_HOST")]
    host: Option<String>,

    /// Override the configured listening port.
    #[arg(long, env = "SPINDLE_PORT")]
    port: Option<u16>,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("failed to load config file: {0}")]
    ConfigLoadError(#[from] config::ConfigError),
    #[error("failed to create runtime: {0}")]
    RuntimeError(#[from] std::io::Error),
}

fn main() {
    init_tracing();

    if let Err(e) = cli() {
        tracing::error!(error = %e, "startup error");
        process::exit(1);
    }
}

fn cli() -> Result<(), CliError> {
    let args = Args::parse();
    let mut cfg = Config::from_file(&args.config_file_path)?;

    if let Some(node) = args.my_node_name {
        cfg.proxy.my_node_name = node;
    }
    if let Some(host) = args.host {
        cfg.proxy.listener.host = host;
    }
    if let Some(port) = args.port {
        cfg.proxy.listener.port = port;
    }

    let _sentry_guard = init_sentry(cfg.common.logging.take());
    init_statsd_recorder("spindle", cfg.common.metrics.take());

    let cluster: Arc<dyn cluster::ClusterClient> = match cfg.cluster.provider {
        ClusterProvider::Env => Arc::new(cluster::env::EnvCluster::new()),
    };
    let locks = Arc::new(proxy::lock::InProcessLockProvider::new());

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    if let Err(e) = rt.block_on(proxy::run(cfg.proxy, cluster, locks)) {
        tracing::error!(error = %e, "runtime error");
        process::exit(1);
    }
    Ok(())
}

fn init_statsd_recorder(prefix: &str, metrics_config: Option<MetricsConfig>) {
    if let Some(MetricsConfig {
        statsd_host,
        statsd_port,
    }) = metrics_config
    {
        match StatsdBuilder::from(statsd_host, statsd_port).build(Some(prefix)) {
            Ok(recorder) => {
                if let Err(e) = metrics::set_global_recorder(recorder) {
                    tracing::warn!(error = %e, "could not set global metrics recorder");
                }
            }
            Err(e) => tracing::warn!(error = %e, "could not create statsd recorder"),
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(sentry::integrations::tracing::layer())
        .init();
}

fn init_sentry(logging_config: Option<config::LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    // The tracing layer installed in main starts shipping events once this
    // client exists.
    logging_config.map(|cfg| {
        sentry::init((
            cfg.sentry_dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    })
}
