use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("lock provider unavailable: {0}")]
    Unavailable(String),
}

/// Releases the lock when dropped.
pub struct LockHandle {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockHandle {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Serializes job spawns on the same fingerprint across proxy replicas.
/// `Ok(None)` means another holder has the lock; the caller backs off and
/// looks for the peer's pod instead of spawning its own.
#[async_trait]
pub trait LockProvider: Send + Sync + 'static {
    async fn obtain(&self, id: &str, ttl: Duration) -> Result<Option<LockHandle>, LockError>;
}

/// Single-replica lock provider. Multi-replica deployments plug in a
/// provider backed by their shared store; the TTL bounds how long a crashed
/// holder can block peers either way.
pub struct InProcessLockProvider {
    held: Arc<Mutex<HashMap<String, Holder>>>,
    next_token: Arc<Mutex<u64>>,
}

struct Holder {
    expires: Instant,
    token: u64,
}

impl InProcessLockProvider {
    pub fn new() -> Self {
        Self {
            held: Arc::new(Mutex::new(HashMap::new())),
            next_token: Arc::new(Mutex::new(0)),
        }
    }
}

impl Default for InProcessLockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockProvider for InProcessLockProvider {
    async fn obtain(&self, id: &str, ttl: Duration) -> Result<Option<LockHandle>, LockError> {
        let token = {
            let mut t = self.next_token.lock();
            *t += 1;
            *t
        };

        let now = Instant::now();
        let mut held = self.held.lock();
        held.retain(|_, holder| holder.expires > now);
        if held.contains_key(id) {
            return Ok(None);
        }
        held.insert(
            id.to_string(),
            Holder {
                expires: now + ttl,
                token,
            },
        );

        let map = self.held.clone();
        let key = id.to_string();
        // releasing only removes our own holdership; a peer that took over
        // after TTL expiry keeps its lock
        Ok(Some(LockHandle::new(move || {
            let mut held = map.lock();
            if held.get(&key).map(|h| h.token) == Some(token) {
                held.remove(&key);
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_obtain_contends() {
        let provider = InProcessLockProvider::new();
        let ttl = Duration::from_secs(30);

        let handle = provider.obtain("job-1", ttl).await.unwrap();
        assert!(handle.is_some());
        assert!(provider.obtain("job-1", ttl).await.unwrap().is_none());
        // a different id is independent
        assert!(provider.obtain("job-2", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn release_on_drop() {
        let provider = InProcessLockProvider::new();
        let ttl = Duration::from_secs(30);

        let handle = provider.obtain("job-1", ttl).await.unwrap();
        drop(handle);
        assert!(provider.obtain("job-1", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lock_can_be_retaken() {
        let provider = InProcessLockProvider::new();
        let handle = provider
            .obtain("job-1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        // TTL passed: a peer may take over even though the handle is alive
        let peer = provider
            .obtain("job-1", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(peer.is_some());

        // the stale handle's release must not free the peer's lock
        drop(handle);
        assert!(
            provider
                .obtain("job-1", Duration::from_secs(30))
                .await
                .unwrap()
                .is_none()
        );
    }
}
