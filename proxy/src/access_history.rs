use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const SLOT_LIMIT: usize = 5;
const ENTRY_TTL: Duration = Duration::from_secs(3 * 3600);

fn identity_key(ip: &str, ua: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(ip.as_bytes());
    hasher.update(ua.as_bytes());
    hex::encode(hasher.finalize())
}

struct Entry {
    created: Instant,
    seen: Vec<String>,
}

/// Sliding ledger of identity changes: a session token issued for one
/// `(ip, user-agent)` pair tolerates a bounded number of distinct new
/// identities before requests get rejected. Entries expire three hours
/// after creation.
pub struct AccessHistory {
    entries: Mutex<HashMap<String, Entry>>,
    limit: usize,
    ttl: Duration,
}

impl AccessHistory {
    pub fn new() -> Self {
        Self::with_limits(SLOT_LIMIT, ENTRY_TTL)
    }

    fn with_limits(limit: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            limit,
            ttl,
        }
    }

    /// Record that the identity originally bound to `(orig_ip, orig_ua)`
    /// now appears as `(new_ip, new_ua)`. Returns whether the request is
    /// accepted and how many identity slots remain.
    pub fn store(
        &self,
        orig_ip: &str,
        orig_ua: &str,
        new_ip: &str,
        new_ua: &str,
    ) -> (bool, usize) {
        let okey = identity_key(orig_ip, orig_ua);
        let nkey = identity_key(new_ip, new_ua);
        let now = Instant::now();

        let mut entries = self.entries.lock();
        entries.retain(|_, e| now.duration_since(e.created) < self.ttl);

        let entry = entries.entry(okey).or_insert_with(|| Entry {
            created: now,
            seen: Vec::new(),
        });
        if entry.seen.iter().any(|k| k == &nkey) {
            return (true, self.limit - entry.seen.len());
        }
        if entry.seen.len() >= self.limit {
            return (false, 0);
        }
        entry.seen.push(nkey);
        (true, self.limit - entry.seen.len())
    }
}

impl Default for AccessHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_new_identities_then_reject() {
        let history = AccessHistory::new();
        for (i, ip) in ["2.2.2.2", "3.3.3.3", "4.4.4.4", "5.5.5.5", "6.6.6.6"]
            .iter()
            .enumerate()
        {
            let (ok, remaining) = history.store("1.1.1.1", "A", ip, "A");
            assert!(ok, "identity {i} should be accepted");
            assert_eq!(remaining, 4 - i);
        }
        let (ok, remaining) = history.store("1.1.1.1", "A", "7.7.7.7", "A");
        assert!(!ok);
        assert_eq!(remaining, 0);
    }

    #[test]
    fn repeat_identity_is_free() {
        let history = AccessHistory::new();
        let (ok, remaining) = history.store("1.1.1.1", "A", "2.2.2.2", "A");
        assert!(ok);
        assert_eq!(remaining, 4);
        // same identity again does not consume a slot
        let (ok, remaining) = history.store("1.1.1.1", "A", "2.2.2.2", "A");
        assert!(ok);
        assert_eq!(remaining, 4);
    }

    #[test]
    fn different_origins_have_separate_budgets() {
        let history = AccessHistory::new();
        for ip in ["2.2.2.2", "3.3.3.3", "4.4.4.4", "5.5.5.5", "6.6.6.6"] {
            assert!(history.store("1.1.1.1", "A", ip, "A").0);
        }
        assert!(!history.store("1.1.1.1", "A", "7.7.7.7", "A").0);
        // a different origin identity still has a full budget
        assert!(history.store("9.9.9.9", "B", "7.7.7.7", "A").0);
    }

    #[test]
    fn expired_entries_reset_the_budget() {
        let history = AccessHistory::with_limits(1, Duration::from_millis(10));
        assert!(history.store("1.1.1.1", "A", "2.2.2.2", "A").0);
        assert!(!history.store("1.1.1.1", "A", "3.3.3.3", "A").0);

        std::thread::sleep(Duration::from_millis(20));
        assert!(history.store("1.1.1.1", "A", "3.3.3.3", "A").0);
    }

    #[test]
    fn ua_changes_count_as_new_identities() {
        let history = AccessHistory::new();
        let (_, r1) = history.store("1.1.1.1", "A", "1.1.1.1", "B");
        let (_, r2) = history.store("1.1.1.1", "A", "1.1.1.1", "C");
        assert_eq!(r1, 4);
        assert_eq!(r2, 3);
    }
}
