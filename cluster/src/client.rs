use crate::ClusterError;
use crate::types::{Endpoints, JobSpec, LabelSelector, NodeInfo, Pod};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A stream of pod snapshots for a label selector. The watch ends when the
/// control-plane connection closes; callers decide whether to re-establish.
pub struct PodWatch {
    rx: mpsc::Receiver<Pod>,
}

impl PodWatch {
    pub fn new(rx: mpsc::Receiver<Pod>) -> Self {
        Self { rx }
    }

    /// Next pod snapshot, or `None` once the watch has ended.
    pub async fn next(&mut self) -> Option<Pod> {
        self.rx.recv().await
    }
}

/// Control-plane operations the proxy depends on. Implementations wrap the
/// orchestrator API of the deployment (or fake it in tests).
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// The ready endpoints subset of a named service.
    async fn endpoints(&self, namespace: &str, service: &str) -> Result<Endpoints, ClusterError>;

    /// All nodes, ready or not; callers filter.
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError>;

    /// Pods in `namespace` matching `selector`.
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Pod>, ClusterError>;

    /// Create a batch job. Must be idempotent-safe for the caller: a job
    /// with the same name already existing is an `Api` error the spawn path
    /// recovers from by adopting the existing pod.
    async fn create_job(&self, namespace: &str, spec: &JobSpec) -> Result<(), ClusterError>;

    /// Delete a job and its pods.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Watch pods matching `selector`. The current state of matching pods
    /// is delivered first, followed by updates.
    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<PodWatch, ClusterError>;
}
