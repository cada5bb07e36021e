use crate::config::JobConfig;
use crate::errors::{ProxyError, Result};
use crate::lock::LockProvider;
use crate::metrics_defs::{
    JOB_SPAWN_CURRENT, JOB_SPAWN_DURATION, JOB_SPAWN_ERRORS, JOB_SPAWN_TOTAL,
};
use crate::resolver::{ExpiryHandle, Location, Ports, ResolveOpts, ResolveRequest, expiry};
use cluster::{ClusterClient, JobSpec, LabelSelector, Pod};
use parking_lot::Mutex;
use rand::Rng;
use sha1::{Digest, Sha1};
use shared::{counter, gauge, histogram};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};

pub const PORT_HTTP: u16 = 8080;
pub const PORT_PROBE: u16 = 8081;
pub const PORT_GRPC: u16 = 50051;

const LIVENESS_PATH: &str = "/liveness";
const READINESS_PATH: &str = "/readiness";

const LOCK_TTL: Duration = Duration::from_secs(30);
const LOCK_STANDBY: Duration = Duration::from_secs(1);
const TTL_AFTER_FINISHED: u32 = 600;
const LIVENESS_FAILURE_BUDGET: u32 = 3;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deployment-level knobs for the job resolver. Intervals are overridable
/// so tests run fast.
#[derive(Clone)]
pub struct JobRuntime {
    pub namespace: String,
    pub label_prefix: String,
    pub affinity_key: String,
    pub affinity_value: String,
    pub request_affinity: bool,
    pub local_node: Option<String>,
    /// Re-scan attempts after losing the spawn lock to a peer.
    pub init_tries: u32,
    pub init_interval: Duration,
    pub liveness_interval: Duration,
    pub ready_wait: Duration,
}

impl Default for JobRuntime {
    fn default() -> Self {
        JobRuntime {
            namespace: "spindle".into(),
            label_prefix: "spindle.io/".into(),
            affinity_key: String::new(),
            affinity_value: String::new(),
            request_affinity: false,
            local_node: None,
            init_tries: 3,
            init_interval: Duration::from_secs(2),
            liveness_interval: Duration::from_secs(5),
            ready_wait: Duration::from_secs(300),
        }
    }
}

/// Identity of the worker a request wants, plus the request context that
/// gets baked into the worker's annotations.
#[derive(Debug, Clone)]
pub struct JobParams {
    pub info_hash: String,
    pub path: String,
    pub origin_path: String,
    pub source_url: String,
    pub extra: String,
    pub client: String,
}

impl JobParams {
    pub fn from_request(req: &ResolveRequest) -> Self {
        JobParams {
            info_hash: req.source.info_hash.clone(),
            path: req.source.path.clone(),
            origin_path: req.origin_path.clone(),
            source_url: req.source_url.clone(),
            extra: req
                .source
                .r#mod
                .as_ref()
                .map(|m| m.extra.clone())
                .unwrap_or_default(),
            client: req.client.clone(),
        }
    }
}

fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable worker id for a `(job name, infohash, path, extra)` fingerprint.
pub fn make_job_id(job_name: &str, params: &JobParams) -> String {
    if !params.extra.is_empty() {
        let h = sha1_hex(&format!("{}{}{}", params.info_hash, params.path, params.extra));
        return format!("{job_name}-{h}");
    }
    if !params.path.is_empty() {
        let h = sha1_hex(&format!("{}{}", params.info_hash, params.path));
        return format!("{job_name}-{h}");
    }
    format!("{}-{}", job_name, params.info_hash)
}

fn rand_suffix() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..4)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

// Label values must match the orchestrator's label grammar:
// empty, or alphanumeric at both ends with [-_.] allowed in between.
fn is_valid_label_value(v: &str) -> bool {
    if v.is_empty() {
        return true;
    }
    let bytes = v.as_bytes();
    if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

type EntryResult = Option<Result<Location>>;

/// One spawned (or spawning) worker. Everybody asking for the same
/// fingerprint waits on the same channel; nobody holds a handle back into
/// the pool map.
struct JobEntry {
    result: watch::Receiver<EntryResult>,
}

impl JobEntry {
    async fn wait(&self) -> Result<Location> {
        let mut rx = self.result.clone();
        loop {
            let current = rx.borrow().clone();
            if let Some(res) = current {
                return res;
            }
            if rx.changed().await.is_err() {
                return Err(ProxyError::Resolve("worker initialization aborted".into()));
            }
        }
    }
}

struct Reap {
    key: String,
    entry: Weak<JobEntry>,
}

type Entries = Arc<Mutex<HashMap<String, Arc<JobEntry>>>>;

/// Per-fingerprint worker pool: spawns jobs on demand, waits for readiness,
/// watches liveness, and prunes records whose expiry fired.
pub struct JobPool {
    cluster: Arc<dyn ClusterClient>,
    locks: Arc<dyn LockProvider>,
    probe: reqwest::Client,
    rt: JobRuntime,
    entries: Entries,
    reaper_tx: mpsc::Sender<Reap>,
}

impl JobPool {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        locks: Arc<dyn LockProvider>,
        rt: JobRuntime,
    ) -> Self {
        let entries: Entries = Arc::new(Mutex::new(HashMap::new()));
        let (reaper_tx, mut reaper_rx) = mpsc::channel::<Reap>(64);

        // the reaper owns map removal; watchers only send events
        let reaper_entries = entries.clone();
        tokio::spawn(async move {
            while let Some(reap) = reaper_rx.recv().await {
                let mut map = reaper_entries.lock();
                if let Some(current) = map.get(&reap.key) {
                    let same = reap
                        .entry
                        .upgrade()
                        .is_some_and(|e| Arc::ptr_eq(&e, current));
                    if same {
                        map.remove(&reap.key);
                        tracing::info!(job_id = %reap.key, "worker removed from pool");
                    }
                }
            }
        });

        Self {
            cluster,
            locks,
            probe: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .unwrap_or_default(),
            rt,
            entries,
            reaper_tx,
        }
    }

    pub async fn get(
        &self,
        cfg: &JobConfig,
        params: &JobParams,
        opts: ResolveOpts,
    ) -> Result<Location> {
        let id = make_job_id(&cfg.name, params);

        if !opts.invoke {
            let entry = self.entries.lock().get(&id).cloned();
            return match entry {
                None => Ok(Location::unavailable()),
                Some(entry) => entry.wait().await,
            };
        }

        let entry = {
            let mut entries = self.entries.lock();
            match entries.get(&id) {
                Some(existing) if !opts.purge => existing.clone(),
                _ => {
                    let fresh = self.spawn_entry(&id, cfg, params);
                    entries.insert(id.clone(), fresh.clone());
                    fresh
                }
            }
        };
        entry.wait().await
    }

    /// Kick off worker initialization on its own task so a client
    /// disconnect cannot orphan a half-created job.
    fn spawn_entry(&self, id: &str, cfg: &JobConfig, params: &JobParams) -> Arc<JobEntry> {
        let (tx, rx) = watch::channel(None);
        let entry = Arc::new(JobEntry { result: rx });

        let ctx = SpawnCtx {
            id: id.to_string(),
            cfg: cfg.clone(),
            params: params.clone(),
            cluster: self.cluster.clone(),
            locks: self.locks.clone(),
            probe: self.probe.clone(),
            rt: self.rt.clone(),
            reaper_tx: self.reaper_tx.clone(),
            entry: Arc::downgrade(&entry),
        };
        tokio::spawn(async move {
            let name = ctx.cfg.name.clone();
            gauge!(JOB_SPAWN_CURRENT, "name" => name.clone()).increment(1.0);
            counter!(JOB_SPAWN_TOTAL, "name" => name.clone()).increment(1);
            let started = Instant::now();

            let res = ctx.invoke().await;
            histogram!(JOB_SPAWN_DURATION, "name" => name.clone())
                .record(started.elapsed().as_secs_f64());
            gauge!(JOB_SPAWN_CURRENT, "name" => name.clone()).decrement(1.0);

            let res = match res {
                Ok((loc, handle, pod_name)) => {
                    tracing::info!(job_id = %ctx.id, ip = ?loc.ip, "got worker location");
                    ctx.watch_liveness(loc.ip, pod_name, handle);
                    Ok(loc)
                }
                Err(e) => {
                    tracing::error!(job_id = %ctx.id, error = %e, "failed to get worker location");
                    counter!(JOB_SPAWN_ERRORS, "name" => name).increment(1);
                    ctx.reap().await;
                    Err(e)
                }
            };
            let _ = tx.send(Some(res));
        });
        entry
    }
}

/// Everything one spawn needs, detached from the pool's lifetime.
struct SpawnCtx {
    id: String,
    cfg: JobConfig,
    params: JobParams,
    cluster: Arc<dyn ClusterClient>,
    locks: Arc<dyn LockProvider>,
    probe: reqwest::Client,
    rt: JobRuntime,
    reaper_tx: mpsc::Sender<Reap>,
    entry: Weak<JobEntry>,
}

impl SpawnCtx {
    fn selector(&self) -> LabelSelector {
        LabelSelector::new(format!("{}job-id", self.rt.label_prefix), self.id.clone())
    }

    async fn reap(&self) {
        let _ = self
            .reaper_tx
            .send(Reap {
                key: self.id.clone(),
                entry: self.entry.clone(),
            })
            .await;
    }

    async fn invoke(&self) -> Result<(Location, ExpiryHandle, String)> {
        let lock = self
            .locks
            .obtain(&self.id, LOCK_TTL)
            .await
            .map_err(|e| ProxyError::Lock(e.to_string()))?;

        let Some(_lock) = lock else {
            // a peer replica is spawning this fingerprint; wait for its pod
            tracing::warn!(job_id = %self.id, "spawn lock contended, waiting for peer worker");
            sleep(LOCK_STANDBY).await;
            for _ in 0..self.rt.init_tries {
                if let Some(pod) = self.find_live_pod().await? {
                    return self.adopt(pod).await;
                }
                sleep(self.rt.init_interval).await;
            }
            return Err(ProxyError::Resolve(
                "peer holds the spawn lock but no worker appeared".into(),
            ));
        };

        // lock held from here until return
        if let Some(pod) = self.find_live_pod().await? {
            tracing::info!(job_id = %self.id, pod = %pod.name, "adopting existing worker");
            return self.adopt(pod).await;
        }

        let job_name = format!("{}-{}", self.id, rand_suffix());
        let spec = self.build_job_spec(&job_name);
        tracing::info!(job_id = %self.id, job = %job_name, "creating worker job");
        self.cluster
            .create_job(&self.rt.namespace, &spec)
            .await
            .map_err(|e| ProxyError::Resolve(format!("failed to create job: {e}")))?;

        match self.wait_ready().await {
            Ok(pod) => self.to_location(pod),
            Err(e) => {
                let _ = self.cluster.delete_job(&self.rt.namespace, &job_name).await;
                Err(e)
            }
        }
    }

    /// A pod of this fingerprint that is ready, or becomes ready within the
    /// wait budget. `None` when every matching pod already finished.
    async fn find_live_pod(&self) -> Result<Option<Pod>> {
        let pods = self
            .cluster
            .list_pods(&self.rt.namespace, &self.selector())
            .await?;
        if let Some(ready) = pods.iter().find(|p| p.is_ready()) {
            return Ok(Some(ready.clone()));
        }
        if pods.iter().any(|p| !p.is_finished()) {
            return Ok(Some(self.wait_ready().await?));
        }
        Ok(None)
    }

    async fn adopt(&self, pod: Pod) -> Result<(Location, ExpiryHandle, String)> {
        let pod = if pod.is_ready() {
            pod
        } else {
            self.wait_ready().await?
        };
        self.to_location(pod)
    }

    async fn wait_ready(&self) -> Result<Pod> {
        let mut watch = self
            .cluster
            .watch_pods(&self.rt.namespace, &self.selector())
            .await?;
        timeout(self.rt.ready_wait, async move {
            while let Some(pod) = watch.next().await {
                if pod.is_ready() {
                    return Ok(pod);
                }
            }
            Err(ProxyError::Resolve(
                "pod watch ended before worker became ready".into(),
            ))
        })
        .await
        .map_err(|_| ProxyError::Resolve("timed out waiting for worker to become ready".into()))?
    }

    fn to_location(&self, pod: Pod) -> Result<(Location, ExpiryHandle, String)> {
        let ip = pod
            .ip
            .ok_or_else(|| ProxyError::Resolve(format!("ready pod {} has no ip", pod.name)))?;
        let (handle, exp) = expiry();
        let loc = Location {
            ip: Some(ip),
            ports: Ports {
                http: PORT_HTTP,
                probe: PORT_PROBE,
                grpc: Some(PORT_GRPC),
            },
            unavailable: false,
            expire: Some(exp),
        };
        Ok((loc, handle, pod.name))
    }

    /// Background watcher: polls the worker's liveness endpoint and follows
    /// the pod watch; fires the expiry on worker death so the reaper prunes
    /// the record.
    fn watch_liveness(self, ip: Option<IpAddr>, pod_name: String, handle: ExpiryHandle) {
        tokio::spawn(async move {
            let mut watch = self
                .cluster
                .watch_pods(&self.rt.namespace, &self.selector())
                .await
                .ok();
            let mut failures = 0u32;
            let mut ticker = tokio::time::interval(self.rt.liveness_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                let next_event = async {
                    match watch.as_mut() {
                        Some(w) => w.next().await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    event = next_event => match event {
                        Some(pod) if pod.name == pod_name && pod.is_finished() => {
                            tracing::info!(job_id = %self.id, pod = %pod_name, "worker finished");
                            break;
                        }
                        Some(_) => {}
                        // watch ended; the probe loop keeps running
                        None => watch = None,
                    },
                    _ = ticker.tick() => {
                        if self.liveness_ok(ip).await {
                            failures = 0;
                        } else {
                            failures += 1;
                            if failures >= LIVENESS_FAILURE_BUDGET {
                                tracing::warn!(job_id = %self.id, failures, "worker liveness lost");
                                break;
                            }
                        }
                    }
                }
            }

            handle.expire();
            self.reap().await;
        });
    }

    async fn liveness_ok(&self, ip: Option<IpAddr>) -> bool {
        let Some(ip) = ip else { return false };
        let url = format!("http://{}:{}{}", ip, PORT_PROBE, LIVENESS_PATH);
        match self.probe.get(&url).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }

    fn build_job_spec(&self, job_name: &str) -> JobSpec {
        let plain: Vec<(&str, String)> = vec![
            ("job-id", self.id.clone()),
            ("job-name", job_name.to_string()),
            ("job-type", self.cfg.name.clone()),
            ("info-hash", self.params.info_hash.clone()),
            ("file-path", self.params.path.clone()),
            ("origin-path", self.params.origin_path.clone()),
            ("source-url", self.params.source_url.clone()),
            ("extra", self.params.extra.clone()),
            ("grace", self.cfg.grace.to_string()),
            ("client", self.params.client.clone()),
        ];

        let prefix = &self.rt.label_prefix;
        let mut annotations: HashMap<String, String> = plain
            .iter()
            .map(|(k, v)| (format!("{prefix}{k}"), v.clone()))
            .collect();
        annotations.extend(
            self.cfg
                .labels
                .iter()
                .map(|(k, v)| (format!("{prefix}{k}"), v.clone())),
        );

        let labels: HashMap<String, String> = annotations
            .iter()
            .filter(|(_, v)| is_valid_label_value(v) && v.len() < 64)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut env: Vec<(String, String)> = Vec::new();
        if let Some(snap) = &self.cfg.snapshot {
            env.push(("USE_SNAPSHOT".into(), snap.use_snapshot.to_string()));
            env.push((
                "SNAPSHOT_START_THRESHOLD".into(),
                snap.start_threshold.to_string(),
            ));
            env.push((
                "SNAPSHOT_START_FULL_DOWNLOAD_THRESHOLD".into(),
                snap.start_full_download_threshold.to_string(),
            ));
            env.push((
                "SNAPSHOT_DOWNLOAD_RATIO".into(),
                snap.download_ratio.to_string(),
            ));
            env.push((
                "SNAPSHOT_TORRENT_SIZE_LIMIT".into(),
                snap.torrent_size_limit.to_string(),
            ));
        }
        if let Some(store) = &self.cfg.object_store {
            env.push(("AWS_ACCESS_KEY_ID".into(), store.access_key_id.clone()));
            env.push((
                "AWS_SECRET_ACCESS_KEY".into(),
                store.secret_access_key.clone(),
            ));
            env.push(("AWS_REGION".into(), store.region.clone()));
            env.push(("AWS_BUCKET".into(), store.bucket.clone()));
            env.push(("AWS_BUCKET_SPREAD".into(), store.bucket_spread.to_string()));
            env.push(("AWS_NO_SSL".into(), store.no_ssl.to_string()));
            env.push(("AWS_ENDPOINT".into(), store.endpoint.clone()));
        }
        for name in ["HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY"] {
            if let Ok(v) = std::env::var(name) {
                env.push((name.into(), v));
            }
        }
        for (k, v) in &plain {
            env.push((k.to_uppercase().replace('-', "_"), v.clone()));
        }
        env.extend(self.cfg.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut node_selector = HashMap::new();
        if !self.rt.affinity_key.is_empty() && !self.rt.affinity_value.is_empty() {
            node_selector.insert(self.rt.affinity_key.clone(), self.rt.affinity_value.clone());
        }

        JobSpec {
            name: job_name.to_string(),
            image: self.cfg.image.clone(),
            labels,
            annotations,
            env,
            cpu_requests: self.cfg.cpu_requests.clone(),
            cpu_limits: self.cfg.cpu_limits.clone(),
            memory_requests: self.cfg.memory_requests.clone(),
            memory_limits: self.cfg.memory_limits.clone(),
            node_selector,
            avoid_node_labels: vec![
                format!("{prefix}no-job"),
                format!("{prefix}no-{}", self.cfg.name),
            ],
            preferred_node: self
                .rt
                .request_affinity
                .then(|| self.rt.local_node.clone())
                .flatten(),
            colocate_with: Some(LabelSelector::new(
                format!("{prefix}info-hash"),
                self.params.info_hash.clone(),
            )),
            ports: vec![
                ("grpc".into(), PORT_GRPC),
                ("http".into(), PORT_HTTP),
                ("probe".into(), PORT_PROBE),
            ],
            liveness_path: LIVENESS_PATH.into(),
            readiness_path: READINESS_PATH.into(),
            ttl_seconds_after_finished: TTL_AFTER_FINISHED,
            backoff_limit: 0,
        }
    }
}
