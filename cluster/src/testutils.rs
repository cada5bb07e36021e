//! In-memory [`ClusterClient`] for tests.

use crate::ClusterError;
use crate::client::{ClusterClient, PodWatch};
use crate::types::{Endpoints, JobSpec, LabelSelector, NodeInfo, Pod, PodPhase};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

#[derive(Default)]
struct State {
    endpoints: HashMap<String, Endpoints>,
    nodes: Vec<NodeInfo>,
    pods: Vec<Pod>,
    created_jobs: Vec<JobSpec>,
    watchers: Vec<(LabelSelector, mpsc::Sender<Pod>)>,
}

/// Scriptable fake control plane. Created jobs can automatically
/// materialize a ready pod, which is what the happy-path spawn tests want;
/// tests drive failure paths through [`FakeCluster::update_pod`].
pub struct FakeCluster {
    state: Mutex<State>,
    endpoints_calls: AtomicUsize,
    auto_ready_pods: Mutex<Option<IpAddr>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            endpoints_calls: AtomicUsize::new(0),
            auto_ready_pods: Mutex::new(None),
        }
    }

    pub fn set_endpoints(&self, service: &str, eps: Endpoints) {
        self.state.lock().endpoints.insert(service.to_string(), eps);
    }

    pub fn set_nodes(&self, nodes: Vec<NodeInfo>) {
        self.state.lock().nodes = nodes;
    }

    /// When set, `create_job` immediately materializes a ready pod with the
    /// job's labels at the given IP.
    pub fn auto_ready_pods(&self, ip: IpAddr) {
        *self.auto_ready_pods.lock() = Some(ip);
    }

    pub fn endpoints_calls(&self) -> usize {
        self.endpoints_calls.load(Ordering::SeqCst)
    }

    pub fn created_jobs(&self) -> Vec<JobSpec> {
        self.state.lock().created_jobs.clone()
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.state.lock().pods.clone()
    }

    /// Insert or replace a pod (matched by name) and notify matching
    /// watchers.
    pub fn update_pod(&self, pod: Pod) {
        let watchers = {
            let mut state = self.state.lock();
            match state.pods.iter_mut().find(|p| p.name == pod.name) {
                Some(existing) => *existing = pod.clone(),
                None => state.pods.push(pod.clone()),
            }
            state
                .watchers
                .iter()
                .filter(|(sel, _)| sel.matches(&pod.labels))
                .map(|(_, tx)| tx.clone())
                .collect::<Vec<_>>()
        };
        for tx in watchers {
            let _ = tx.try_send(pod.clone());
        }
    }

    pub fn mark_pod_finished(&self, name: &str) {
        let pod = {
            let state = self.state.lock();
            state.pods.iter().find(|p| p.name == name).cloned()
        };
        if let Some(mut pod) = pod {
            pod.phase = PodPhase::Failed;
            pod.ready = false;
            self.update_pod(pod);
        }
    }
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn endpoints(&self, _namespace: &str, service: &str) -> Result<Endpoints, ClusterError> {
        self.endpoints_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .endpoints
            .get(service)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("endpoints {service}")))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        Ok(self.state.lock().nodes.clone())
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Pod>, ClusterError> {
        Ok(self
            .state
            .lock()
            .pods
            .iter()
            .filter(|p| selector.matches(&p.labels))
            .cloned()
            .collect())
    }

    async fn create_job(&self, _namespace: &str, spec: &JobSpec) -> Result<(), ClusterError> {
        self.state.lock().created_jobs.push(spec.clone());
        let auto_ip = *self.auto_ready_pods.lock();
        if let Some(ip) = auto_ip {
            self.update_pod(Pod {
                name: format!("{}-pod", spec.name),
                phase: PodPhase::Running,
                ready: true,
                ip: Some(ip),
                node_name: Some("n1".into()),
                labels: spec.labels.clone(),
            });
        }
        Ok(())
    }

    async fn delete_job(&self, _namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        state.created_jobs.retain(|j| j.name != name);
        state.pods.retain(|p| !p.name.starts_with(name));
        Ok(())
    }

    async fn watch_pods(
        &self,
        _namespace: &str,
        selector: &LabelSelector,
    ) -> Result<PodWatch, ClusterError> {
        let (tx, rx) = mpsc::channel(16);
        let current: Vec<Pod> = {
            let mut state = self.state.lock();
            state.watchers.push((selector.clone(), tx.clone()));
            state
                .pods
                .iter()
                .filter(|p| selector.matches(&p.labels))
                .cloned()
                .collect()
        };
        for pod in current {
            let _ = tx.try_send(pod);
        }
        Ok(PodWatch::new(rx))
    }
}
