use crate::access_history::AccessHistory;
use crate::claims::{Auth, Claims};
use crate::config::{ConnectionConfig, ConnectionsConfig, ProxyConfig, RedirectConfig};
use crate::errors::{ProxyError, Result};
use crate::job_resolver::{JobPool, JobRuntime};
use crate::lock::LockProvider;
use crate::metrics_defs::{REQUEST_TTFB, REQUESTS_TOTAL};
use crate::proxy_pool::{BackendProxy, ProxyPool};
use crate::resolver::{ResolveRequest, Resolver};
use crate::service_resolver::ServiceResolver;
use crate::source::{Source, UrlParser};
use crate::stats::{
    BodyStats, MeteredBody, RowWriter, StatRecord, StatSink, TrafficSource, unix_now,
};
use crate::throttle::{RateBuckets, ThrottledBody};
use bytes::Bytes;
use cluster::{ClusterClient, LabelSelector, NodesStat, PodPhase, ServiceEndpoints};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, USER_AGENT};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode, Uri};
use shared::http::make_boxed_error_response;
use shared::{counter, histogram};
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub type HandlerBody = BoxBody<Bytes, ProxyError>;

const CORS_ALLOW_HEADERS: &str =
    "Content-Type, Download-Id, User-Id, Token, X-Grpc-Web, Api-Key, Range";
const CORS_ALLOW_METHODS: &str = "GET,HEAD,OPTIONS,POST,PUT";
const CORS_MAX_AGE: &str = "600";

/// Handler-level configuration distilled from [`ProxyConfig`].
#[derive(Clone)]
pub(crate) struct HandlerConfig {
    base_url: String,
    node_name: String,
    namespace: String,
    label_prefix: String,
    rate_limit: bool,
    affinity_key: String,
    affinity_value: String,
    redirect: RedirectConfig,
}

pub(crate) struct HandlerInner {
    parser: UrlParser,
    auth: Auth,
    mods: Arc<ConnectionsConfig>,
    pool: ProxyPool,
    buckets: RateBuckets,
    history: AccessHistory,
    stats: Arc<StatSink>,
    cluster: Arc<dyn ClusterClient>,
    cfg: HandlerConfig,
}

/// Top-level HTTP handler: parses, authenticates, resolves, forwards,
/// throttles, and accounts for every request.
#[derive(Clone)]
pub struct WebHandler {
    inner: Arc<HandlerInner>,
}

impl WebHandler {
    pub fn new(
        cfg: &ProxyConfig,
        cluster: Arc<dyn ClusterClient>,
        locks: Arc<dyn LockProvider>,
        writer: Arc<dyn RowWriter>,
    ) -> Self {
        let mods = Arc::new(cfg.mods.clone());
        let local_node = (!cfg.my_node_name.is_empty()).then(|| cfg.my_node_name.clone());

        let endpoints = Arc::new(ServiceEndpoints::new(cluster.clone(), cfg.namespace.clone()));
        let nodes = Arc::new(NodesStat::new(
            cluster.clone(),
            cfg.node_label_prefix.clone(),
        ));
        let services = Arc::new(ServiceResolver::new(endpoints, nodes, local_node.clone()));
        let jobs = Arc::new(JobPool::new(
            cluster.clone(),
            locks,
            JobRuntime {
                namespace: cfg.jobs.namespace.clone(),
                label_prefix: cfg.node_label_prefix.clone(),
                affinity_key: cfg.jobs.affinity_key.clone(),
                affinity_value: cfg.jobs.affinity_value.clone(),
                request_affinity: cfg.jobs.request_affinity,
                local_node,
                init_tries: cfg.jobs.init_tries,
                init_interval: Duration::from_secs(cfg.jobs.init_interval_secs),
                ..JobRuntime::default()
            },
        ));
        let resolver = Arc::new(Resolver::new(mods.clone(), services, jobs));
        let pool = ProxyPool::new(
            resolver,
            cfg.http_proxy.redial_tries,
            Duration::from_secs(cfg.http_proxy.redial_delay_secs),
        );

        WebHandler {
            inner: Arc::new(HandlerInner {
                parser: UrlParser::new(mods.clone()),
                auth: Auth::new(Arc::new(cfg.api_keys.clone())),
                mods,
                pool,
                buckets: RateBuckets::new(),
                history: AccessHistory::new(),
                stats: Arc::new(StatSink::new(writer, cfg.stats.batch_size)),
                cluster,
                cfg: HandlerConfig {
                    base_url: cfg.base_url.clone(),
                    node_name: cfg.my_node_name.clone(),
                    namespace: cfg.jobs.namespace.clone(),
                    label_prefix: cfg.node_label_prefix.clone(),
                    rate_limit: cfg.rate_limit,
                    affinity_key: cfg.jobs.affinity_key.clone(),
                    affinity_value: cfg.jobs.affinity_value.clone(),
                    redirect: cfg.redirect.clone(),
                },
            }),
        }
    }

    pub fn stats(&self) -> Arc<StatSink> {
        self.inner.stats.clone()
    }
}

impl Service<Request<Incoming>> for WebHandler {
    type Response = Response<HandlerBody>;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(inner.handle(req).await) })
    }
}

fn ok_empty() -> Response<HandlerBody> {
    Response::new(Full::new(Bytes::new()).map_err(|e| match e {}).boxed())
}

fn error_response(e: &ProxyError) -> Response<HandlerBody> {
    make_boxed_error_response(e.status())
}

fn with_cors(resp: &mut Response<HandlerBody>) {
    resp.headers_mut().insert(
        "access-control-allow-origin",
        HeaderValue::from_static("*"),
    );
}

fn preflight() -> Response<HandlerBody> {
    let mut resp = ok_empty();
    let headers = resp.headers_mut();
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert("access-control-max-age", HeaderValue::from_static(CORS_MAX_AGE));
    resp
}

fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

impl HandlerInner {
    async fn handle(self: Arc<Self>, req: Request<Incoming>) -> Response<HandlerBody> {
        let path = req.uri().path().to_string();

        let mut resp = match path.as_str() {
            "/liveness" | "/" | "/ads.txt" | "/robots.txt" => ok_empty(),
            p if p.starts_with("/favicon") => ok_empty(),
            "/debug" => self.debug(&req),
            "/subdomains.json" => match self.subdomains(&req).await {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serve subdomains");
                    error_response(&e)
                }
            },
            _ if req.method() == Method::OPTIONS => preflight(),
            _ => match self.proxy(req).await {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::error!(%path, error = %e, "request failed");
                    error_response(&e)
                }
            },
        };
        with_cors(&mut resp);
        resp
    }

    fn debug(&self, req: &Request<Incoming>) -> Response<HandlerBody> {
        let body = format!(
            "node:\t{}\nuri:\t{}\n",
            self.cfg.node_name,
            req.uri()
        );
        Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
    }

    async fn proxy(&self, req: Request<Incoming>) -> Result<Response<HandlerBody>> {
        let src = self.parser.parse(req.uri())?;
        let (claims, entry) = self.auth.claims(&src.token, &src.api_key)?;
        let client = entry
            .map(|e| e.name.clone())
            .unwrap_or_else(|| "default".to_string());

        let external = req.headers().contains_key("x-forwarded-for");
        if external {
            self.check_access(&req, &claims)?;
        }

        // a bucket that fails to parse must fail the request before any
        // bytes flow
        let bucket = if self.cfg.rate_limit && external {
            self.buckets.get(&claims)?
        } else {
            None
        };

        let invoke = self.may_invoke(&src);
        let origin_path = req.uri().path().to_string();
        let source_url = format!(
            "{}/{}{}?{}",
            self.cfg.base_url, src.info_hash, src.path, src.query
        );
        let resolve_req = ResolveRequest {
            source: src.clone(),
            claims: claims.clone(),
            client: client.clone(),
            origin_path: origin_path.clone(),
            source_url: source_url.clone(),
        };

        let req = self.prepare_upstream_request(req, &src, &claims, &origin_path, &source_url)?;

        let backend = self.pool.get(&resolve_req, invoke).await?;
        let resp = match backend {
            BackendProxy::Stub => {
                tracing::debug!(edge = src.edge_name(), "backend unavailable, answering 503");
                return Ok(make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE));
            }
            BackendProxy::Forward(proxy) => {
                proxy
                    .forward(req.map(|b| b.boxed()))
                    .await?
            }
        };

        let status = resp.status();
        let (parts, body) = resp.into_parts();
        let mut body: HandlerBody = body
            .map_err(|e| ProxyError::Upstream(e.to_string()))
            .boxed();
        if let Some(limiter) = bucket {
            body = ThrottledBody::new(body, limiter).boxed();
        }

        let record = StatRecord {
            timestamp: unix_now(),
            api_key: src.api_key.clone(),
            client,
            bytes_written: 0,
            ttfb_ms: 0,
            duration_ms: 0,
            path: src.path.clone(),
            infohash: src.info_hash.clone(),
            original_path: origin_path,
            session_id: claims.session_id.clone(),
            domain: claims.domain.clone(),
            status: status.as_u16(),
            grouped_status: status.as_u16() / 100 * 100,
            edge: src.edge_name().to_string(),
            source: if external {
                TrafficSource::External
            } else {
                TrafficSource::Internal
            },
            role: claims.role.clone(),
            ads: claims.ads,
            node: self.cfg.node_name.clone(),
        };
        let stats = self.stats.clone();
        let edge = record.edge.clone();
        let grouped = record.grouped_status.to_string();
        let body = MeteredBody::new(body, move |s: BodyStats| {
            counter!(REQUESTS_TOTAL, "edge" => edge.clone(), "status" => grouped.clone())
                .increment(1);
            if let Some(ttfb) = s.ttfb {
                histogram!(REQUEST_TTFB, "edge" => edge.clone()).record(ttfb.as_secs_f64());
            }
            if (200..300).contains(&record.status) && s.bytes_written > 0 {
                stats.add(StatRecord {
                    bytes_written: s.bytes_written,
                    ttfb_ms: s.ttfb.unwrap_or_default().as_millis() as u64,
                    duration_ms: s.duration.as_millis() as u64,
                    ..record.clone()
                });
            }
        })
        .boxed();

        Ok(Response::from_parts(parts, body))
    }

    /// Reject external requests whose identity drifted past the budget.
    fn check_access(&self, req: &Request<Incoming>, claims: &Claims) -> Result<()> {
        let (Some(orig_ip), Some(orig_ua)) = (&claims.remote_address, &claims.agent) else {
            return Ok(());
        };
        let ip = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let ua = req
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if ip == orig_ip.as_str() && ua == orig_ua.as_str() {
            return Ok(());
        }
        let (ok, remaining) = self.history.store(orig_ip, orig_ua, ip, ua);
        if !ok {
            tracing::warn!(
                expected_ip = %orig_ip,
                got_ip = %ip,
                "identity change budget exhausted, denying access"
            );
            return Err(ProxyError::AccessDenied(
                "identity changed too many times".into(),
            ));
        }
        tracing::debug!(remaining, "accepted changed identity");
        Ok(())
    }

    /// Whether this request may spawn a missing worker.
    fn may_invoke(&self, src: &Source) -> bool {
        if query_param(&src.query, "invoke").as_deref() == Some("false") {
            return false;
        }
        if let Some(ConnectionConfig::Job(jc)) = self.mods.get(src.edge_type()) {
            if jc.ignores_path(src.upstream_path()) {
                return false;
            }
        }
        true
    }

    fn prepare_upstream_request(
        &self,
        mut req: Request<Incoming>,
        src: &Source,
        claims: &Claims,
        origin_path: &str,
        source_url: &str,
    ) -> Result<Request<Incoming>> {
        let full_path = format!(
            "/{}/{}",
            src.info_hash,
            src.path.strip_prefix('/').unwrap_or(&src.path)
        );
        let mut pairs: Vec<(&str, String)> = vec![
            ("x-source-url", source_url.to_string()),
            ("x-proxy-url", self.cfg.base_url.clone()),
            ("x-info-hash", src.info_hash.clone()),
            ("x-path", src.path.clone()),
            ("x-origin-path", origin_path.to_string()),
            ("x-full-path", full_path),
            ("x-token", src.token.clone()),
            ("x-api-key", src.api_key.clone()),
            ("x-session-id", claims.session_id.clone()),
        ];
        if let Some(rate) = &claims.rate {
            pairs.push(("x-download-rate", rate.clone()));
        }
        if let Some(ConnectionConfig::Service(sc)) = self.mods.get(src.edge_type()) {
            pairs.extend(sc.headers.iter().map(|(k, v)| (k.as_str(), v.clone())));
        }
        let headers = req.headers_mut();
        for (name, value) in pairs {
            if let (Ok(name), Ok(value)) = (
                name.parse::<hyper::header::HeaderName>(),
                HeaderValue::from_str(&value),
            ) {
                headers.insert(name, value);
            }
        }

        // the upstream sees the mod subpath (or the file path), query intact
        let path_and_query = if src.query.is_empty() {
            src.upstream_path().to_string()
        } else {
            format!("{}?{}", src.upstream_path(), src.query)
        };
        *req.uri_mut() = path_and_query
            .parse::<Uri>()
            .map_err(|e| ProxyError::Internal(format!("failed to rewrite path: {e}")))?;
        Ok(req)
    }

    /// Edge subdomains for origin-host redirects: one `<prefix><hex-ip>`
    /// entry per eligible node, narrowed to nodes already holding the
    /// infohash's pods, else hash-routed to a single entry.
    async fn subdomains(&self, req: &Request<Incoming>) -> Result<Response<HandlerBody>> {
        let query = req.uri().query().unwrap_or_default();
        let token = query_param(query, "token").unwrap_or_default();
        let api_key = query_param(query, "api-key").unwrap_or_default();
        self.auth.claims(&token, &api_key)?;
        let info_hash = query_param(query, "infohash").unwrap_or_default();

        let mut pod_nodes: Vec<String> = Vec::new();
        if !info_hash.is_empty() {
            let selector = LabelSelector::new(
                format!("{}info-hash", self.cfg.label_prefix),
                info_hash.clone(),
            );
            let pods = self
                .cluster
                .list_pods(&self.cfg.namespace, &selector)
                .await
                .unwrap_or_default();
            pod_nodes = pods
                .iter()
                .filter(|p| p.phase != PodPhase::Failed)
                .filter_map(|p| p.node_name.clone())
                .collect();
        }

        let nodes = self.cluster.list_nodes().await?;
        let mut subs: Vec<String> = Vec::new();
        for node in nodes.iter().filter(|n| n.ready) {
            if !pod_nodes.is_empty() && !pod_nodes.contains(&node.name) {
                continue;
            }
            if pod_nodes.is_empty()
                && !self.cfg.affinity_key.is_empty()
                && node.labels.get(&self.cfg.affinity_key) != Some(&self.cfg.affinity_value)
            {
                continue;
            }
            if let Some(addr) = node.addresses.get(&self.cfg.redirect.address_type) {
                if let Ok(ip) = addr.parse::<Ipv4Addr>() {
                    subs.push(format!(
                        "{}{}",
                        self.cfg.redirect.prefix,
                        hex::encode(ip.octets())
                    ));
                }
            }
        }
        subs.sort();

        if pod_nodes.is_empty() && subs.len() > 1 && !info_hash.is_empty() {
            let num = info_hash
                .get(..5)
                .and_then(|p| i64::from_str_radix(p, 16).ok())
                .ok_or_else(|| {
                    ProxyError::Internal(format!("bad infohash prefix {info_hash:?}"))
                })?;
            let interval = 0xfffff / subs.len() as i64;
            let mut target = 0;
            for i in 0..subs.len() {
                if num < (i as i64 + 1) * interval {
                    target = i;
                    break;
                }
            }
            subs = vec![subs[target].clone()];
        }

        let json = serde_json::to_vec(&subs)
            .map_err(|e| ProxyError::Internal(format!("failed to encode subdomains: {e}")))?;
        let mut resp = Response::new(Full::new(Bytes::from(json)).map_err(|e| match e {}).boxed());
        resp.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(resp)
    }
}
