use serde::Deserialize;
use std::collections::HashMap;

pub const DEFAULT_MOD: &str = "default";

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    #[default]
    Hash,
    NodeHash,
}

/// A long-lived backend service reachable through cluster endpoints.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub distribution: Distribution,
    #[serde(default)]
    pub prefer_local_node: bool,
    /// Extra headers injected into requests forwarded to this service.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub use_snapshot: bool,
    #[serde(default)]
    pub start_threshold: f64,
    #[serde(default)]
    pub start_full_download_threshold: f64,
    #[serde(default)]
    pub download_ratio: f64,
    #[serde(default)]
    pub torrent_size_limit: u64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ObjectStoreConfig {
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub bucket_spread: bool,
    #[serde(default)]
    pub no_ssl: bool,
    #[serde(default)]
    pub endpoint: String,
}

fn default_grace() -> u64 {
    600
}

/// A per-torrent worker spawned on demand.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct JobConfig {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub cpu_requests: String,
    #[serde(default)]
    pub cpu_limits: String,
    #[serde(default)]
    pub memory_requests: String,
    #[serde(default)]
    pub memory_limits: String,
    /// Seconds the worker keeps serving after the last request.
    #[serde(default = "default_grace")]
    pub grace: u64,
    /// Upstream paths that may ride an existing worker but never force a
    /// spawn.
    #[serde(default)]
    pub ignored_paths: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub snapshot: Option<SnapshotConfig>,
    #[serde(default)]
    pub object_store: Option<ObjectStoreConfig>,
}

impl JobConfig {
    pub fn ignores_path(&self, path: &str) -> bool {
        self.ignored_paths.iter().any(|p| p == path)
    }
}

/// How requests for one mod reach their backend. The tag keeps job-only
/// fields (resources, affinity) out of service flows entirely.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionConfig {
    Service(ServiceConfig),
    Job(JobConfig),
}

impl ConnectionConfig {
    pub fn name(&self) -> &str {
        match self {
            ConnectionConfig::Service(s) => &s.name,
            ConnectionConfig::Job(j) => &j.name,
        }
    }
}

/// The static map from mod name to its connection template. The entry named
/// `default` serves bare infohash URLs.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ConnectionsConfig(pub HashMap<String, ConnectionConfig>);

impl ConnectionsConfig {
    pub fn get(&self, name: &str) -> Option<&ConnectionConfig> {
        self.0.get(name)
    }

    /// Every configured mod name except `default`.
    pub fn mods(&self) -> impl Iterator<Item = &str> {
        self.0
            .keys()
            .map(String::as_str)
            .filter(|k| *k != DEFAULT_MOD)
    }

    pub fn default_connection(&self) -> Option<&ConnectionConfig> {
        self.0.get(DEFAULT_MOD)
    }
}

/// One API client: requests carrying `api_key` must present tokens signed
/// with `secret`; `name` becomes the client label on jobs and stat rows.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ApiKeyEntry {
    pub name: String,
    pub api_key: String,
    pub secret: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ApiKeys(pub Vec<ApiKeyEntry>);

impl ApiKeys {
    pub fn get(&self, api_key: &str) -> Option<&ApiKeyEntry> {
        self.0.iter().find(|e| e.api_key == api_key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn default_label_prefix() -> String {
    "spindle.io/".into()
}

fn default_init_tries() -> u32 {
    3
}

fn default_init_interval_secs() -> u64 {
    2
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct JobsConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub affinity_key: String,
    #[serde(default)]
    pub affinity_value: String,
    /// Prefer scheduling workers onto the proxy's own node.
    #[serde(default)]
    pub request_affinity: bool,
    /// Re-scan attempts after losing the spawn lock to a peer.
    #[serde(default = "default_init_tries")]
    pub init_tries: u32,
    #[serde(default = "default_init_interval_secs")]
    pub init_interval_secs: u64,
}

fn default_namespace() -> String {
    "spindle".into()
}

impl Default for JobsConfig {
    fn default() -> Self {
        JobsConfig {
            namespace: default_namespace(),
            affinity_key: String::new(),
            affinity_value: String::new(),
            request_affinity: false,
            init_tries: default_init_tries(),
            init_interval_secs: default_init_interval_secs(),
        }
    }
}

fn default_redial_tries() -> u32 {
    2
}

fn default_redial_delay_secs() -> u64 {
    1
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct HttpProxyConfig {
    #[serde(default = "default_redial_tries")]
    pub redial_tries: u32,
    #[serde(default = "default_redial_delay_secs")]
    pub redial_delay_secs: u64,
}

impl Default for HttpProxyConfig {
    fn default() -> Self {
        HttpProxyConfig {
            redial_tries: default_redial_tries(),
            redial_delay_secs: default_redial_delay_secs(),
        }
    }
}

fn default_batch_size() -> usize {
    1000
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StatsConfig {
    /// HTTP endpoint of the analytics row store; empty disables writes.
    #[serde(default)]
    pub dsn: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            dsn: String::new(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_redirect_prefix() -> String {
    "abra--".into()
}

fn default_redirect_address_type() -> String {
    "ExternalIP".into()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RedirectConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Subdomain prefix of hosts to be redirected.
    #[serde(default = "default_redirect_prefix")]
    pub prefix: String,
    /// Preferred node address type for redirect targets.
    #[serde(default = "default_redirect_address_type")]
    pub address_type: String,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        RedirectConfig {
            enabled: false,
            prefix: default_redirect_prefix(),
            address_type: default_redirect_address_type(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ProxyConfig {
    #[serde(default)]
    pub listener: Listener,
    /// External base URL clients reach this proxy at.
    #[serde(default)]
    pub base_url: String,
    /// Namespace holding backend services and worker jobs.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Prefix for all orchestrator labels/annotations this proxy reads or
    /// writes.
    #[serde(default = "default_label_prefix")]
    pub node_label_prefix: String,
    /// Name of the node this replica runs on; enables local-node placement
    /// preferences.
    #[serde(default)]
    pub my_node_name: String,
    #[serde(default)]
    pub rate_limit: bool,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub http_proxy: HttpProxyConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub redirect: RedirectConfig,
    #[serde(default)]
    pub api_keys: ApiKeys,
    pub mods: ConnectionsConfig,
}
