//! Request-routing proxy for per-torrent backend services.
//!
//! Requests name a torrent by infohash and optionally a *mod* (a functional
//! transformation of its content). The proxy authenticates the request,
//! resolves a backend (a long-lived service picked by consistent hashing,
//! or a per-torrent worker job spawned on demand) and reverse-proxies to
//! it, throttling external traffic and emitting analytics rows.

pub mod access_history;
pub mod claims;
pub mod config;
pub mod errors;
pub mod handler;
pub mod job_resolver;
pub mod lock;
pub mod metrics_defs;
pub mod proxy_pool;
pub mod resolver;
pub mod service_resolver;
pub mod source;
pub mod stats;
pub mod throttle;

use crate::config::ProxyConfig;
use crate::errors::Result;
use crate::handler::WebHandler;
use crate::lock::LockProvider;
use crate::stats::{HttpRowWriter, NullRowWriter, RowWriter};
use cluster::ClusterClient;
use std::sync::Arc;

pub use crate::claims::{Auth, Claims};
pub use crate::errors::ProxyError;
pub use crate::source::{Source, UrlParser};

/// Serve the proxy until the process is told to stop; flushes buffered
/// analytics rows on the way out.
pub async fn run(
    cfg: ProxyConfig,
    cluster: Arc<dyn ClusterClient>,
    locks: Arc<dyn LockProvider>,
) -> Result<()> {
    shared::metrics_defs::describe_all(metrics_defs::ALL_METRICS);

    let writer: Arc<dyn RowWriter> = if cfg.stats.dsn.is_empty() {
        Arc::new(NullRowWriter)
    } else {
        Arc::new(HttpRowWriter::new(&cfg.stats.dsn))
    };

    let handler = WebHandler::new(&cfg, cluster, locks, writer);
    let stats = handler.stats();

    tokio::select! {
        res = shared::http::run_http_service(&cfg.listener.host, cfg.listener.port, handler) => {
            res?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }
    stats.flush().await;
    Ok(())
}
