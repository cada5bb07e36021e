use crate::ClusterError;
use crate::client::ClusterClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const CACHE_TTL: Duration = Duration::from_secs(60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Role policy of one ready node, derived from its labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStat {
    pub name: String,
    pub roles_allowed: Vec<String>,
    pub roles_denied: Vec<String>,
}

impl NodeStat {
    /// A role is allowed when it appears in the allow list, or when the
    /// allow list is empty and the role is not denied.
    pub fn is_allowed(&self, role: &str) -> bool {
        if !self.roles_allowed.is_empty() {
            return self.roles_allowed.iter().any(|r| r == role);
        }
        !self.roles_denied.iter().any(|r| r == role)
    }
}

/// Cached view of ready nodes and their role labels
/// (`<prefix>roles-allowed` / `<prefix>roles-denied`, comma separated).
pub struct NodesStat {
    client: Arc<dyn ClusterClient>,
    label_prefix: String,
    cache: moka::future::Cache<(), Arc<Vec<NodeStat>>>,
}

impl NodesStat {
    pub fn new(client: Arc<dyn ClusterClient>, label_prefix: impl Into<String>) -> Self {
        Self {
            client,
            label_prefix: label_prefix.into(),
            cache: moka::future::Cache::builder()
                .time_to_live(CACHE_TTL)
                .build(),
        }
    }

    pub async fn get(&self) -> Result<Arc<Vec<NodeStat>>, ClusterError> {
        self.cache
            .try_get_with((), async {
                tracing::debug!("fetching nodes");
                let nodes = timeout(FETCH_TIMEOUT, self.client.list_nodes())
                    .await
                    .map_err(|_| ClusterError::Timeout("nodes".into()))??;
                let mut stats: Vec<NodeStat> = nodes
                    .into_iter()
                    .filter(|n| n.ready)
                    .map(|n| NodeStat {
                        roles_allowed: self.label_list(&n, "roles-allowed"),
                        roles_denied: self.label_list(&n, "roles-denied"),
                        name: n.name,
                    })
                    .collect();
                stats.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(Arc::new(stats))
            })
            .await
            .map_err(|e: Arc<ClusterError>| (*e).clone())
    }

    fn label_list(&self, node: &crate::types::NodeInfo, name: &str) -> Vec<String> {
        node.labels
            .get(&format!("{}{}", self.label_prefix, name))
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeCluster;
    use crate::types::NodeInfo;
    use std::collections::HashMap;

    fn node(name: &str, ready: bool, labels: &[(&str, &str)]) -> NodeInfo {
        NodeInfo {
            name: name.into(),
            ready,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            addresses: HashMap::new(),
        }
    }

    #[test]
    fn allow_deny_logic() {
        let open = NodeStat {
            name: "n1".into(),
            roles_allowed: vec![],
            roles_denied: vec![],
        };
        assert!(open.is_allowed("nobody"));

        let denied = NodeStat {
            name: "n2".into(),
            roles_allowed: vec![],
            roles_denied: vec!["nobody".into()],
        };
        assert!(!denied.is_allowed("nobody"));
        assert!(denied.is_allowed("premium"));

        let allow_list = NodeStat {
            name: "n3".into(),
            roles_allowed: vec!["premium".into()],
            roles_denied: vec!["premium".into()],
        };
        // the allow list wins over the deny list
        assert!(allow_list.is_allowed("premium"));
        assert!(!allow_list.is_allowed("nobody"));
    }

    #[tokio::test]
    async fn skips_unready_nodes_and_parses_labels() {
        let fake = Arc::new(FakeCluster::new());
        fake.set_nodes(vec![
            node("n2", true, &[("spindle.io/roles-allowed", "premium, vip")]),
            node("n1", true, &[("spindle.io/roles-denied", "nobody")]),
            node("n3", false, &[]),
        ]);

        let stats = NodesStat::new(fake, "spindle.io/");
        let got = stats.get().await.unwrap();
        assert_eq!(got.len(), 2);
        // sorted by name
        assert_eq!(got[0].name, "n1");
        assert_eq!(got[0].roles_denied, vec!["nobody".to_string()]);
        assert_eq!(got[1].name, "n2");
        assert_eq!(
            got[1].roles_allowed,
            vec!["premium".to_string(), "vip".to_string()]
        );
    }
}
