use crate::errors::{ProxyError, Result};
use crate::metrics_defs::{DIAL_CURRENT, DIAL_DURATION, DIAL_ERRORS, DIAL_TOTAL};
use crate::resolver::{ResolveOpts, ResolveRequest, Resolver};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use shared::http::filter_hop_by_hop;
use shared::{counter, gauge, histogram};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

const PROXY_TTL: Duration = Duration::from_secs(600);
const DIAL_TIMEOUT: Duration = Duration::from_secs(60);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 500;

static CORS_HEADERS: &[&str] = &[
    "access-control-allow-origin",
    "access-control-allow-credentials",
];

/// Request body type flowing to upstreams.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// A cached way to reach one backend. Unavailable locations get a stub so
/// clients receive a structured 503 instead of TCP failures.
#[derive(Clone)]
pub enum BackendProxy {
    Stub,
    Forward(Arc<ForwardProxy>),
}

/// Keyed pool of reverse proxies, one per backend `ip:port`, dropped after
/// ten minutes without use.
pub struct ProxyPool {
    resolver: Arc<Resolver>,
    cache: moka::future::Cache<String, BackendProxy>,
    tries: u32,
    delay: Duration,
}

impl ProxyPool {
    pub fn new(resolver: Arc<Resolver>, redial_tries: u32, redial_delay: Duration) -> Self {
        Self {
            resolver,
            cache: moka::future::Cache::builder()
                .time_to_idle(PROXY_TTL)
                .build(),
            tries: redial_tries.max(1),
            delay: redial_delay,
        }
    }

    pub async fn get(&self, req: &ResolveRequest, invoke: bool) -> Result<BackendProxy> {
        let loc = self
            .resolver
            .resolve(
                req,
                ResolveOpts {
                    invoke,
                    purge: false,
                },
            )
            .await?;
        if loc.unavailable {
            return Ok(BackendProxy::Stub);
        }
        let authority = loc
            .http_authority()
            .ok_or_else(|| ProxyError::Internal("available location without address".into()))?;

        self.cache
            .try_get_with(authority.clone(), async {
                let dialer = RetryDialer {
                    resolver: self.resolver.clone(),
                    request: Arc::new(req.clone()),
                    edge: req.source.edge_name().to_string(),
                    tries: self.tries,
                    delay: self.delay,
                };
                let client = Client::builder(TokioExecutor::new())
                    .pool_idle_timeout(POOL_IDLE_TIMEOUT)
                    .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
                    .build(dialer);
                Ok(BackendProxy::Forward(Arc::new(ForwardProxy {
                    client,
                    authority,
                })))
            })
            .await
            .map_err(ProxyError::shared)
    }
}

/// Reverse proxy for a single backend authority.
pub struct ForwardProxy {
    client: Client<RetryDialer, ProxyBody>,
    authority: String,
}

impl ForwardProxy {
    /// Forward a request whose path has already been rewritten for the
    /// upstream. Hop-by-hop headers are filtered both ways and upstream
    /// CORS headers are stripped; the handler decides the final CORS
    /// answer.
    pub async fn forward(&self, req: Request<ProxyBody>) -> Result<Response<Incoming>> {
        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = format!("http://{}{}", self.authority, path_and_query)
            .parse()
            .map_err(|e| ProxyError::Internal(format!("failed to build upstream uri: {e}")))?;

        let mut headers = parts.headers;
        filter_hop_by_hop(&mut headers, parts.version);

        let mut builder = Request::builder().method(parts.method).uri(uri);
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        let upstream_req = builder
            .body(body)
            .map_err(|e| ProxyError::Internal(format!("failed to build upstream request: {e}")))?;

        let mut resp = self.client.request(upstream_req).await.map_err(|e| {
            if e.is_connect() {
                ProxyError::Dial(source_message(&e))
            } else {
                ProxyError::Upstream(e.to_string())
            }
        })?;

        let version = resp.version();
        filter_hop_by_hop(resp.headers_mut(), version);
        for h in CORS_HEADERS {
            resp.headers_mut().remove(*h);
        }
        Ok(resp)
    }
}

fn source_message(e: &dyn std::error::Error) -> String {
    let mut msg = e.to_string();
    let mut cur = e.source();
    while let Some(src) = cur {
        msg = src.to_string();
        cur = src.source();
    }
    msg
}

/// Connector that re-resolves the backend location for every new connection
/// and redials with a forced location refresh on failure.
#[derive(Clone)]
pub struct RetryDialer {
    resolver: Arc<Resolver>,
    request: Arc<ResolveRequest>,
    edge: String,
    tries: u32,
    delay: Duration,
}

impl RetryDialer {
    async fn dial_with_retry(self) -> Result<TokioIo<TcpStream>> {
        let started = Instant::now();
        gauge!(DIAL_CURRENT, "name" => self.edge.clone()).increment(1.0);
        counter!(DIAL_TOTAL, "name" => self.edge.clone()).increment(1);

        let res = self.try_dial().await;

        gauge!(DIAL_CURRENT, "name" => self.edge.clone()).decrement(1.0);
        histogram!(DIAL_DURATION, "name" => self.edge.clone())
            .record(started.elapsed().as_secs_f64());
        if res.is_err() {
            counter!(DIAL_ERRORS, "name" => self.edge.clone()).increment(1);
        }
        res
    }

    async fn try_dial(&self) -> Result<TokioIo<TcpStream>> {
        let mut last_error = String::new();
        for attempt in 0..self.tries {
            // the first attempt trusts the cached location; every retry
            // forces a refresh
            let loc = self
                .resolver
                .resolve(
                    &self.request,
                    ResolveOpts {
                        invoke: true,
                        purge: attempt > 0,
                    },
                )
                .await?;
            let (ip, port) = match (loc.ip, loc.unavailable) {
                (Some(ip), false) => (ip, loc.ports.http),
                _ => return Err(ProxyError::Unavailable),
            };

            tracing::debug!(edge = %self.edge, %ip, port, attempt, "dialing proxy backend");
            match timeout(DIAL_TIMEOUT, TcpStream::connect((ip, port))).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(TokioIo::new(stream));
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "connect timed out".to_string(),
            }
            tracing::warn!(edge = %self.edge, error = %last_error, attempt, "failed to dial");
            sleep(self.delay).await;
        }
        Err(ProxyError::Dial(last_error))
    }
}

impl tower_service::Service<Uri> for RetryDialer {
    type Response = TokioIo<TcpStream>;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<TokioIo<TcpStream>>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _dst: Uri) -> Self::Future {
        let dialer = self.clone();
        Box::pin(dialer.dial_with_retry())
    }
}
