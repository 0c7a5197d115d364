use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserEntry {
    pub username: String,
    pub peer_addr: IpAddr,
    pub expires_at: Instant,
    pub generation: u64,
}

/// Local source ports mapped to the username that owns them.
///
/// Every operation touches a single shard of the map, so an insert, a take and a timer eviction
/// for the same port are serialized against each other and exactly one of them observes the entry.
pub struct UserRegistry {
    entries: DashMap<u16, UserEntry>,
    next_generation: AtomicU64,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Inserts or overwrites the entry for `local_port`. Returns the generation stamped on it.
    pub fn insert(&self, local_port: u16, username: String, peer_addr: IpAddr, ttl: Duration) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            local_port,
            UserEntry {
                username,
                peer_addr,
                expires_at: Instant::now() + ttl,
                generation,
            },
        );
        generation
    }

    /// Removes and returns the entry for `local_port` if it hasn't expired.
    pub fn take(&self, local_port: u16) -> Option<UserEntry> {
        let now = Instant::now();
        self.entries
            .remove_if(&local_port, |_, entry| entry.expires_at > now)
            .map(|(_, entry)| entry)
            .or_else(|| {
                // Expired but not evicted yet. Drop it so it can't linger.
                self.entries.remove_if(&local_port, |_, entry| entry.expires_at <= now);
                None
            })
    }

    /// Evicts the entry for `local_port` only if it is still the one stamped with `generation`.
    pub fn remove(&self, local_port: u16, generation: u64) -> bool {
        self.entries
            .remove_if(&local_port, |_, entry| entry.generation == generation)
            .is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for UserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
    const TTL: Duration = Duration::from_secs(180);

    #[test]
    fn take_is_one_shot() {
        let registry = UserRegistry::new();
        registry.insert(4241, "alice".to_string(), PEER, TTL);

        let entry = registry.take(4241).unwrap();
        assert_eq!(entry.username, "alice");
        assert_eq!(entry.peer_addr, PEER);
        assert!(registry.take(4241).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn later_insert_wins() {
        let registry = UserRegistry::new();
        registry.insert(4241, "alice".to_string(), PEER, TTL);
        registry.insert(4241, "bob".to_string(), PEER, TTL);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.take(4241).unwrap().username, "bob");
    }

    #[test]
    fn stale_generation_does_not_evict_overwrite() {
        let registry = UserRegistry::new();
        let first = registry.insert(4241, "alice".to_string(), PEER, TTL);
        let second = registry.insert(4241, "bob".to_string(), PEER, TTL);

        assert!(!registry.remove(4241, first));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(4241, second));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_after_take_is_a_no_op() {
        let registry = UserRegistry::new();
        let generation = registry.insert(4241, "alice".to_string(), PEER, TTL);
        assert!(registry.take(4241).is_some());
        assert!(!registry.remove(4241, generation));
    }

    #[test]
    fn expired_entry_is_unreachable() {
        let registry = UserRegistry::new();
        registry.insert(4241, "alice".to_string(), PEER, Duration::ZERO);

        assert!(registry.take(4241).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn clear_drops_everything() {
        let registry = UserRegistry::new();
        registry.insert(1, "a".to_string(), PEER, TTL);
        registry.insert(2, "b".to_string(), PEER, TTL);
        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_inserts_keep_distinct_ports() {
        let registry = Arc::new(UserRegistry::new());
        let handles: Vec<_> = (1..=64u16)
            .map(|port| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.insert(port, format!("user{port}"), PEER, TTL);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 64);
        for port in 1..=64u16 {
            assert_eq!(registry.take(port).unwrap().username, format!("user{port}"));
        }
    }

    #[test]
    fn racing_take_and_remove_resolve_once() {
        for _ in 0..100 {
            let registry = Arc::new(UserRegistry::new());
            let generation = registry.insert(4241, "alice".to_string(), PEER, TTL);

            let taker = {
                let registry = registry.clone();
                std::thread::spawn(move || registry.take(4241).is_some())
            };
            let remover = {
                let registry = registry.clone();
                std::thread::spawn(move || registry.remove(4241, generation))
            };
            let taken = taker.join().unwrap();
            let removed = remover.join().unwrap();

            assert!(taken ^ removed);
            assert!(registry.is_empty());
        }
    }
}
