use crate::claims::Claims;
use crate::config::{Distribution, ServiceConfig};
use crate::errors::{ProxyError, Result};
use crate::metrics_defs::PROBE_FAILURES;
use crate::resolver::{Location, Ports};
use crate::source::Source;
use cluster::{EndpointAddress, Endpoints, NodesStat, ServiceEndpoints};
use rand::Rng;
use shared::counter;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

const LOCATION_TTL: Duration = Duration::from_secs(15);
const IGNORE_TTL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// The infohash prefix space: five hex chars, 20 bits.
const HASH_SPACE: i64 = 0xfffff;
/// Scale factor so integer bucket arithmetic keeps enough resolution.
const SCALE: i64 = 1000;

fn is_hash_like(s: &str) -> bool {
    (5..=40).contains(&s.len())
        && s.bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Picks one endpoint address for a source, deterministically per infohash,
/// and keeps the answer cached for a few seconds. Addresses that fail their
/// probe check sit on an ignore list until they recover.
pub struct ServiceResolver {
    endpoints: Arc<ServiceEndpoints>,
    nodes: Arc<NodesStat>,
    probe: reqwest::Client,
    local_node: Option<String>,
    cache: moka::future::Cache<String, Location>,
    ignore: moka::sync::Cache<IpAddr, ()>,
}

impl ServiceResolver {
    pub fn new(
        endpoints: Arc<ServiceEndpoints>,
        nodes: Arc<NodesStat>,
        local_node: Option<String>,
    ) -> Self {
        Self {
            endpoints,
            nodes,
            probe: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .unwrap_or_default(),
            local_node,
            cache: moka::future::Cache::builder()
                .time_to_live(LOCATION_TTL)
                .build(),
            ignore: moka::sync::Cache::builder()
                .time_to_live(IGNORE_TTL)
                .build(),
        }
    }

    pub async fn get(
        &self,
        cfg: &ServiceConfig,
        src: &Source,
        claims: &Claims,
    ) -> Result<Location> {
        let key = format!("{}{}", cfg.name, src.info_hash);
        self.cache
            .try_get_with(key, self.resolve_with_probe(cfg, src, claims))
            .await
            .map_err(ProxyError::shared)
    }

    async fn resolve_with_probe(
        &self,
        cfg: &ServiceConfig,
        src: &Source,
        claims: &Claims,
    ) -> Result<Location> {
        let loc = self.select_location(cfg, src, claims).await?;
        if loc.unavailable {
            return Ok(loc);
        }
        if let Err(e) = self.check_probe(&loc).await {
            tracing::warn!(service = %cfg.name, ip = ?loc.ip, error = %e, "probe check failed, ignoring address");
            counter!(PROBE_FAILURES, "service" => cfg.name.clone()).increment(1);
            if let Some(ip) = loc.ip {
                self.ignore.insert(ip, ());
            }
            return self.select_location(cfg, src, claims).await;
        }
        Ok(loc)
    }

    async fn select_location(
        &self,
        cfg: &ServiceConfig,
        src: &Source,
        claims: &Claims,
    ) -> Result<Location> {
        let eps = self.endpoints.get(&cfg.name).await?;
        let mut addrs: Vec<&EndpointAddress> = eps
            .addresses
            .iter()
            .filter(|a| !self.ignore.contains_key(&a.ip))
            .collect();
        if addrs.is_empty() {
            return Ok(Location::unavailable());
        }
        // the original sorts textually; keep selection identical across
        // implementations
        addrs.sort_by_key(|a| a.ip.to_string());

        let mut chosen = if !is_hash_like(&src.info_hash) {
            Some(addrs[rand::thread_rng().gen_range(0..addrs.len())])
        } else {
            match cfg.distribution {
                Distribution::Hash => distribute_by_hash(&src.info_hash, &addrs)?,
                Distribution::NodeHash => {
                    self.distribute_by_node_hash(&src.info_hash, &addrs, claims)
                        .await?
                }
            }
        };

        if let (Some(sel), Some(local)) = (chosen, self.local_node.as_deref()) {
            if cfg.prefer_local_node
                && is_hash_like(&src.info_hash)
                && sel.node_name.as_deref() != Some(local)
            {
                let local_addrs: Vec<&EndpointAddress> = addrs
                    .iter()
                    .copied()
                    .filter(|a| a.node_name.as_deref() == Some(local))
                    .collect();
                if !local_addrs.is_empty() {
                    chosen = distribute_by_hash(&src.info_hash, &local_addrs)?;
                }
            }
        }

        Ok(match chosen {
            Some(a) => address_to_location(a, &eps),
            None => Location::unavailable(),
        })
    }

    async fn distribute_by_node_hash<'a>(
        &self,
        info_hash: &str,
        addrs: &[&'a EndpointAddress],
        claims: &Claims,
    ) -> Result<Option<&'a EndpointAddress>> {
        let mut nodes: Vec<&str> = addrs
            .iter()
            .filter_map(|a| a.node_name.as_deref())
            .collect();
        nodes.sort_unstable();
        nodes.dedup();

        let stats = self.nodes.get().await?;
        let nodes: Vec<&str> = nodes
            .into_iter()
            .filter(|n| {
                stats
                    .iter()
                    .any(|s| s.name == *n && s.is_allowed(&claims.role))
            })
            .collect();
        if nodes.is_empty() {
            return Ok(None);
        }

        let num = hash_prefix(info_hash)? * SCALE;
        let total = HASH_SPACE * SCALE;
        let node_interval = total / nodes.len() as i64;
        for (i, node) in nodes.iter().enumerate() {
            let on_node: Vec<&&EndpointAddress> = addrs
                .iter()
                .filter(|a| a.node_name.as_deref() == Some(*node))
                .collect();
            let addr_interval = node_interval / on_node.len() as i64;
            for (j, a) in on_node.iter().enumerate() {
                if num < i as i64 * node_interval + (j + 1) as i64 * addr_interval {
                    return Ok(Some(**a));
                }
            }
        }
        Ok(None)
    }

    async fn check_probe(&self, loc: &Location) -> Result<()> {
        let ip = loc
            .ip
            .ok_or_else(|| ProxyError::Internal("probing location without ip".into()))?;
        let port = if loc.ports.probe != 0 {
            loc.ports.probe
        } else {
            loc.ports.http
        };
        let resp = self
            .probe
            .get(format!("http://{ip}:{port}/"))
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(format!("probe request failed: {e}")))?;
        if resp.status().as_u16() >= 500 {
            return Err(ProxyError::Upstream(format!(
                "probe returned status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

fn hash_prefix(info_hash: &str) -> Result<i64> {
    i64::from_str_radix(&info_hash[..5], 16)
        .map_err(|e| ProxyError::Resolve(format!("bad infohash prefix {info_hash:?}: {e}")))
}

fn distribute_by_hash<'a>(
    info_hash: &str,
    addrs: &[&'a EndpointAddress],
) -> Result<Option<&'a EndpointAddress>> {
    let num = hash_prefix(info_hash)? * SCALE;
    let total = HASH_SPACE * SCALE;
    let interval = total / addrs.len() as i64;
    for (i, a) in addrs.iter().enumerate() {
        if num < (i + 1) as i64 * interval {
            return Ok(Some(*a));
        }
    }
    Ok(None)
}

fn address_to_location(a: &EndpointAddress, eps: &Endpoints) -> Location {
    Location::available(
        a.ip,
        Ports {
            http: eps.port("http").unwrap_or(0),
            probe: eps.port("httpprobe").unwrap_or(0),
            grpc: eps.port("grpc"),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster::testutils::FakeCluster;
    use cluster::{EndpointPort, NodeInfo};
    use hyper::service::service_fn;
    use hyper::{Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::collections::HashMap;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    const HASH: &str = "935d59df63e6b94305b5e2a32cdfd00488f1b055";
    // 0x00001 lands in the first bucket of any split
    const LOW_HASH: &str = "00001aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn addr(ip: &str, node: &str) -> EndpointAddress {
        EndpointAddress {
            ip: ip.parse().unwrap(),
            node_name: Some(node.into()),
        }
    }

    fn endpoints(addrs: Vec<EndpointAddress>) -> Endpoints {
        Endpoints {
            addresses: addrs,
            ports: vec![
                EndpointPort {
                    name: "http".into(),
                    port: 8080,
                },
                EndpointPort {
                    name: "httpprobe".into(),
                    port: 8081,
                },
            ],
        }
    }

    fn source(info_hash: &str) -> Source {
        Source {
            info_hash: info_hash.into(),
            path: "/a.mp4".into(),
            r#type: "default".into(),
            name: "torrent-web-seeder".into(),
            token: String::new(),
            api_key: String::new(),
            query: String::new(),
            r#mod: None,
        }
    }

    fn service_cfg(distribution: Distribution, prefer_local: bool) -> ServiceConfig {
        ServiceConfig {
            name: "torrent-web-seeder".into(),
            distribution,
            prefer_local_node: prefer_local,
            headers: HashMap::new(),
        }
    }

    fn resolver_with(
        fake: Arc<FakeCluster>,
        local_node: Option<String>,
    ) -> ServiceResolver {
        let endpoints = Arc::new(ServiceEndpoints::new(fake.clone(), "testns"));
        let nodes = Arc::new(NodesStat::new(fake, "spindle.io/"));
        ServiceResolver::new(endpoints, nodes, local_node)
    }

    #[test]
    fn hash_split_picks_upper_bucket() {
        let a5 = addr("10.0.0.5", "n1");
        let a9 = addr("10.0.0.9", "n2");
        let addrs = vec![&a5, &a9];
        // prefix 935d5 is in the upper half of the 20-bit space
        let chosen = distribute_by_hash(HASH, &addrs).unwrap().unwrap();
        assert_eq!(chosen.ip.to_string(), "10.0.0.9");

        let chosen = distribute_by_hash(LOW_HASH, &addrs).unwrap().unwrap();
        assert_eq!(chosen.ip.to_string(), "10.0.0.5");
    }

    #[tokio::test]
    async fn scenario_hash_distribution() {
        let fake = Arc::new(FakeCluster::new());
        fake.set_endpoints(
            "torrent-web-seeder",
            endpoints(vec![addr("10.0.0.9", "n2"), addr("10.0.0.5", "n1")]),
        );
        let resolver = resolver_with(fake, None);

        let loc = resolver
            .select_location(
                &service_cfg(Distribution::Hash, false),
                &source(HASH),
                &Claims::default(),
            )
            .await
            .unwrap();
        assert_eq!(loc.ip.unwrap().to_string(), "10.0.0.9");
        assert_eq!(loc.ports.http, 8080);
        assert_eq!(loc.ports.probe, 8081);
    }

    #[tokio::test]
    async fn empty_endpoints_is_unavailable() {
        let fake = Arc::new(FakeCluster::new());
        fake.set_endpoints("torrent-web-seeder", endpoints(vec![]));
        let resolver = resolver_with(fake, None);

        let loc = resolver
            .select_location(
                &service_cfg(Distribution::Hash, false),
                &source(HASH),
                &Claims::default(),
            )
            .await
            .unwrap();
        assert!(loc.unavailable);
    }

    #[tokio::test]
    async fn node_hash_respects_role_policy() {
        let fake = Arc::new(FakeCluster::new());
        fake.set_endpoints(
            "torrent-web-seeder",
            endpoints(vec![addr("10.0.0.5", "n1"), addr("10.0.0.9", "n2")]),
        );
        let mut n1_labels = HashMap::new();
        n1_labels.insert("spindle.io/roles-denied".to_string(), "nobody".to_string());
        fake.set_nodes(vec![
            NodeInfo {
                name: "n1".into(),
                ready: true,
                labels: n1_labels,
                addresses: HashMap::new(),
            },
            NodeInfo {
                name: "n2".into(),
                ready: true,
                labels: HashMap::new(),
                addresses: HashMap::new(),
            },
        ]);
        let resolver = resolver_with(fake, None);
        let cfg = service_cfg(Distribution::NodeHash, false);

        // role "nobody" is denied on n1, so even a low hash lands on n2
        let loc = resolver
            .select_location(&cfg, &source(LOW_HASH), &Claims::default())
            .await
            .unwrap();
        assert_eq!(loc.ip.unwrap().to_string(), "10.0.0.9");

        // an allowed role sees both nodes and the low hash stays on n1
        let premium = Claims {
            role: "premium".into(),
            ..Claims::default()
        };
        let loc = resolver
            .select_location(&cfg, &source(LOW_HASH), &premium)
            .await
            .unwrap();
        assert_eq!(loc.ip.unwrap().to_string(), "10.0.0.5");
    }

    #[tokio::test]
    async fn prefer_local_node_restricts_to_local_addresses() {
        let fake = Arc::new(FakeCluster::new());
        fake.set_endpoints(
            "torrent-web-seeder",
            endpoints(vec![addr("10.0.0.5", "n1"), addr("10.0.0.9", "n2")]),
        );
        let resolver = resolver_with(fake, Some("n1".into()));

        // the hash picks n2's address, but the local node has a candidate
        let loc = resolver
            .select_location(
                &service_cfg(Distribution::Hash, true),
                &source(HASH),
                &Claims::default(),
            )
            .await
            .unwrap();
        assert_eq!(loc.ip.unwrap().to_string(), "10.0.0.5");
    }

    async fn spawn_status_server(status: StatusCode) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(_) => return,
                };
                let io = TokioIo::new(stream);
                tokio::spawn(async move {
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(
                            io,
                            service_fn(move |_req| async move {
                                let mut resp =
                                    Response::new(http_body_util::Full::<bytes::Bytes>::default());
                                *resp.status_mut() = status;
                                Ok::<_, Infallible>(resp)
                            }),
                        )
                        .await;
                });
            }
        });
        port
    }

    fn local_endpoints(port: u16) -> Endpoints {
        Endpoints {
            addresses: vec![EndpointAddress {
                ip: "127.0.0.1".parse().unwrap(),
                node_name: Some("n1".into()),
            }],
            ports: vec![EndpointPort {
                name: "http".into(),
                port,
            }],
        }
    }

    #[tokio::test]
    async fn probe_failure_ignores_address() {
        let port = spawn_status_server(StatusCode::INTERNAL_SERVER_ERROR).await;
        let fake = Arc::new(FakeCluster::new());
        fake.set_endpoints("torrent-web-seeder", local_endpoints(port));
        let resolver = resolver_with(fake, None);

        let loc = resolver
            .resolve_with_probe(
                &service_cfg(Distribution::Hash, false),
                &source(HASH),
                &Claims::default(),
            )
            .await
            .unwrap();
        // the only address failed its probe, so the retry comes up empty
        assert!(loc.unavailable);
        assert!(resolver.ignore.contains_key(&"127.0.0.1".parse::<IpAddr>().unwrap()));
    }

    #[tokio::test]
    async fn healthy_probe_resolves() {
        let port = spawn_status_server(StatusCode::OK).await;
        let fake = Arc::new(FakeCluster::new());
        fake.set_endpoints("torrent-web-seeder", local_endpoints(port));
        let resolver = resolver_with(fake, None);

        let loc = resolver
            .get(
                &service_cfg(Distribution::Hash, false),
                &source(HASH),
                &Claims::default(),
            )
            .await
            .unwrap();
        assert_eq!(loc.ip.unwrap().to_string(), "127.0.0.1");
        assert_eq!(loc.ports.http, port);
    }
}
