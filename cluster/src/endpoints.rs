use crate::ClusterError;
use crate::client::ClusterClient;
use crate::types::Endpoints;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const CACHE_TTL: Duration = Duration::from_secs(60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Cached per-service endpoints lists. Concurrent look-ups of the same
/// service name coalesce into a single in-flight control-plane call.
pub struct ServiceEndpoints {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    cache: moka::future::Cache<String, Arc<Endpoints>>,
}

impl ServiceEndpoints {
    pub fn new(client: Arc<dyn ClusterClient>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            cache: moka::future::Cache::builder()
                .time_to_live(CACHE_TTL)
                .build(),
        }
    }

    pub async fn get(&self, service: &str) -> Result<Arc<Endpoints>, ClusterError> {
        self.cache
            .try_get_with(service.to_string(), async {
                tracing::debug!(service, "fetching endpoints");
                let eps = timeout(FETCH_TIMEOUT, self.client.endpoints(&self.namespace, service))
                    .await
                    .map_err(|_| ClusterError::Timeout(format!("endpoints for {service}")))??;
                Ok(Arc::new(eps))
            })
            .await
            .map_err(|e: Arc<ClusterError>| (*e).clone())
    }

    /// Drop the cached entry so the next `get` refetches.
    pub fn invalidate(&self, service: &str) {
        self.cache.invalidate(&service.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeCluster;
    use crate::types::{EndpointAddress, EndpointPort};

    fn two_address_endpoints() -> Endpoints {
        Endpoints {
            addresses: vec![
                EndpointAddress {
                    ip: "10.0.0.5".parse().unwrap(),
                    node_name: Some("n1".into()),
                },
                EndpointAddress {
                    ip: "10.0.0.9".parse().unwrap(),
                    node_name: Some("n2".into()),
                },
            ],
            ports: vec![EndpointPort {
                name: "http".into(),
                port: 8080,
            }],
        }
    }

    #[tokio::test]
    async fn caches_between_calls() {
        let fake = Arc::new(FakeCluster::new());
        fake.set_endpoints("web-seeder", two_address_endpoints());

        let eps = ServiceEndpoints::new(fake.clone(), "testns");
        let first = eps.get("web-seeder").await.unwrap();
        let second = eps.get("web-seeder").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fake.endpoints_calls(), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let fake = Arc::new(FakeCluster::new());
        fake.set_endpoints("web-seeder", two_address_endpoints());

        let eps = ServiceEndpoints::new(fake.clone(), "testns");
        let _ = eps.get("web-seeder").await.unwrap();
        eps.invalidate("web-seeder");
        let _ = eps.get("web-seeder").await.unwrap();
        assert_eq!(fake.endpoints_calls(), 2);
    }

    #[tokio::test]
    async fn unknown_service_errors_and_is_not_cached() {
        let fake = Arc::new(FakeCluster::new());
        let eps = ServiceEndpoints::new(fake.clone(), "testns");
        assert!(eps.get("missing").await.is_err());
        // errors are not stored; the next call hits the control plane again
        assert!(eps.get("missing").await.is_err());
        assert_eq!(fake.endpoints_calls(), 2);
    }
}
