use crate::ClusterError;
use crate::client::{ClusterClient, PodWatch};
use crate::types::{EndpointAddress, EndpointPort, Endpoints, JobSpec, LabelSelector, NodeInfo, Pod};
use async_trait::async_trait;

/// Endpoints provider backed by `<NAME>_SERVICE_HOST` / `<NAME>_SERVICE_PORT`
/// environment variables, the convention the orchestrator injects into every
/// container. Useful for development and single-service deployments; job and
/// node operations are unsupported.
pub struct EnvCluster;

impl EnvCluster {
    pub fn new() -> Self {
        Self
    }

    fn var(name: &str) -> Result<String, ClusterError> {
        std::env::var(name).map_err(|_| ClusterError::NotFound(format!("env var {name}")))
    }
}

impl Default for EnvCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterClient for EnvCluster {
    async fn endpoints(&self, _namespace: &str, service: &str) -> Result<Endpoints, ClusterError> {
        let prefix = service.to_uppercase().replace('-', "_");
        let host = Self::var(&format!("{prefix}_SERVICE_HOST"))?;
        let port = Self::var(&format!("{prefix}_SERVICE_PORT"))?;

        let ip = host
            .parse()
            .map_err(|_| ClusterError::Api(format!("bad {prefix}_SERVICE_HOST value {host:?}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ClusterError::Api(format!("bad {prefix}_SERVICE_PORT value {port:?}")))?;

        Ok(Endpoints {
            addresses: vec![EndpointAddress {
                ip,
                node_name: None,
            }],
            ports: vec![EndpointPort {
                name: "http".into(),
                port,
            }],
        })
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        Ok(vec![])
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        _selector: &LabelSelector,
    ) -> Result<Vec<Pod>, ClusterError> {
        Ok(vec![])
    }

    async fn create_job(&self, _namespace: &str, _spec: &JobSpec) -> Result<(), ClusterError> {
        Err(ClusterError::Unsupported("create_job"))
    }

    async fn delete_job(&self, _namespace: &str, _name: &str) -> Result<(), ClusterError> {
        Err(ClusterError::Unsupported("delete_job"))
    }

    async fn watch_pods(
        &self,
        _namespace: &str,
        _selector: &LabelSelector,
    ) -> Result<PodWatch, ClusterError> {
        Err(ClusterError::Unsupported("watch_pods"))
    }
}
