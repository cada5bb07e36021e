use crate::claims::Claims;
use crate::config::{ConnectionConfig, ConnectionsConfig};
use crate::errors::{ProxyError, Result};
use crate::job_resolver::{JobParams, JobPool};
use crate::metrics_defs::RESOLVE_DURATION;
use crate::service_resolver::ServiceResolver;
use crate::source::Source;
use shared::histogram;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ports {
    pub http: u16,
    pub probe: u16,
    pub grpc: Option<u16>,
}

/// One-shot broadcast that fires when a job backend stops being healthy.
#[derive(Debug, Clone)]
pub struct Expiry {
    rx: watch::Receiver<bool>,
}

impl Expiry {
    /// Resolves once the backend has expired. Also resolves if the signal
    /// owner went away.
    pub async fn expired(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_expired(&self) -> bool {
        *self.rx.borrow()
    }
}

#[derive(Debug)]
pub struct ExpiryHandle {
    tx: watch::Sender<bool>,
}

impl ExpiryHandle {
    pub fn expire(&self) {
        let _ = self.tx.send(true);
    }
}

pub fn expiry() -> (ExpiryHandle, Expiry) {
    let (tx, rx) = watch::channel(false);
    (ExpiryHandle { tx }, Expiry { rx })
}

/// A resolved backend address.
#[derive(Debug, Clone)]
pub struct Location {
    pub ip: Option<IpAddr>,
    pub ports: Ports,
    pub unavailable: bool,
    /// Present for job backends; closes when the worker dies.
    pub expire: Option<Expiry>,
}

impl Location {
    pub fn available(ip: IpAddr, ports: Ports) -> Self {
        Location {
            ip: Some(ip),
            ports,
            unavailable: false,
            expire: None,
        }
    }

    pub fn unavailable() -> Self {
        Location {
            ip: None,
            ports: Ports::default(),
            unavailable: true,
            expire: None,
        }
    }

    /// `ip:http_port`, when the location is usable.
    pub fn http_authority(&self) -> Option<String> {
        match (self.unavailable, self.ip) {
            (false, Some(ip)) => Some(format!("{}:{}", ip, self.ports.http)),
            _ => None,
        }
    }
}

/// Everything needed to resolve (and re-resolve) one request's backend.
/// The reverse-proxy dialer keeps a copy so each new connection can run the
/// full resolution again.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub source: Source,
    pub claims: Claims,
    /// API client name, `default` when unauthenticated.
    pub client: String,
    /// Path as originally requested, before mod rewriting.
    pub origin_path: String,
    /// Absolute URL the content is served from.
    pub source_url: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolveOpts {
    /// Whether a missing job backend may be spawned for this call.
    pub invoke: bool,
    /// Drop any cached job location and resolve fresh.
    pub purge: bool,
}

/// Dispatches a parsed source to the service or job resolver according to
/// its connection config.
pub struct Resolver {
    mods: Arc<ConnectionsConfig>,
    services: Arc<ServiceResolver>,
    jobs: Arc<JobPool>,
}

impl Resolver {
    pub fn new(
        mods: Arc<ConnectionsConfig>,
        services: Arc<ServiceResolver>,
        jobs: Arc<JobPool>,
    ) -> Self {
        Self {
            mods,
            services,
            jobs,
        }
    }

    pub async fn resolve(&self, req: &ResolveRequest, opts: ResolveOpts) -> Result<Location> {
        let edge = req.source.edge_type();
        let cfg = self
            .mods
            .get(edge)
            .ok_or_else(|| ProxyError::Resolve(format!("no connection config for {edge:?}")))?;

        let started = Instant::now();
        let res = match cfg {
            ConnectionConfig::Service(sc) => {
                self.services.get(sc, &req.source, &req.claims).await
            }
            ConnectionConfig::Job(jc) => {
                self.jobs
                    .get(jc, &JobParams::from_request(req), opts)
                    .await
            }
        };
        let elapsed = started.elapsed();
        histogram!(RESOLVE_DURATION, "edge" => req.source.edge_name().to_string())
            .record(elapsed.as_secs_f64());

        match &res {
            Ok(loc) => {
                tracing::debug!(edge, ip = ?loc.ip, unavailable = loc.unavailable, ?elapsed, "location resolved")
            }
            Err(e) => tracing::error!(edge, error = %e, ?elapsed, "failed to resolve location"),
        }
        res
    }
}
