use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

/// One reachable backend address of a cluster service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddress {
    pub ip: IpAddr,
    pub node_name: Option<String>,
}

/// A named port shared by every address of an endpoints subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPort {
    pub name: String,
    pub port: u16,
}

/// The ready subset of a service's endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub addresses: Vec<EndpointAddress>,
    pub ports: Vec<EndpointPort>,
}

impl Endpoints {
    pub fn port(&self, name: &str) -> Option<u16> {
        self.ports.iter().find(|p| p.name == name).map(|p| p.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl PodPhase {
    /// Succeeded and Failed pods never come back.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pod {
    pub name: String,
    pub phase: PodPhase,
    pub ready: bool,
    pub ip: Option<IpAddr>,
    pub node_name: Option<String>,
    pub labels: HashMap<String, String>,
}

impl Pod {
    pub fn is_ready(&self) -> bool {
        self.ready && matches!(self.phase, PodPhase::Running)
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// A node as seen by the control plane; `addresses` maps address kinds
/// (e.g. `InternalIP`, `ExternalIP`) to values.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub name: String,
    pub ready: bool,
    pub labels: HashMap<String, String>,
    pub addresses: HashMap<String, String>,
}

/// Single-label equality selector, the only kind the proxy needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabelSelector {
    pub key: String,
    pub value: String,
}

impl LabelSelector {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        labels.get(&self.key).map(String::as_str) == Some(self.value.as_str())
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Everything the resolver knows about a worker it wants started. The
/// control-plane implementation translates this into its own batch-job
/// object; the fields deliberately stay orchestrator-neutral.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub env: Vec<(String, String)>,

    pub cpu_requests: String,
    pub cpu_limits: String,
    pub memory_requests: String,
    pub memory_limits: String,

    /// Hard placement constraint (label equality).
    pub node_selector: HashMap<String, String>,
    /// Node labels that must NOT be set to "true" (opt-out labels).
    pub avoid_node_labels: Vec<String>,
    /// Soft preference for a specific node (weight 100).
    pub preferred_node: Option<String>,
    /// Soft preference to colocate with pods carrying this label (weight 50).
    pub colocate_with: Option<LabelSelector>,

    /// Named container ports: (name, port).
    pub ports: Vec<(String, u16)>,
    pub liveness_path: String,
    pub readiness_path: String,

    pub ttl_seconds_after_finished: u32,
    pub backoff_limit: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_port_lookup() {
        let eps = Endpoints {
            addresses: vec![],
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
        };
        assert_eq!(eps.port("http"), Some(8080));
        assert_eq!(eps.port("httpprobe"), Some(8081));
        assert_eq!(eps.port("grpc"), None);
    }

    #[test]
    fn pod_readiness() {
        let mut pod = Pod {
            name: "w-1".into(),
            phase: PodPhase::Running,
            ready: true,
            ip: None,
            node_name: None,
            labels: HashMap::new(),
        };
        assert!(pod.is_ready());
        pod.phase = PodPhase::Pending;
        assert!(!pod.is_ready());
        pod.phase = PodPhase::Failed;
        assert!(pod.is_finished());
    }

    #[test]
    fn selector_matches() {
        let sel = LabelSelector::new("job-id", "seeder-abc");
        let mut labels = HashMap::new();
        labels.insert("job-id".to_string(), "seeder-abc".to_string());
        assert!(sel.matches(&labels));
        labels.insert("job-id".to_string(), "other".to_string());
        assert!(!sel.matches(&labels));
        assert_eq!(sel.to_string(), "job-id=seeder-abc");
    }
}
