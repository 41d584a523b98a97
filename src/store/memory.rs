//! In-process store with etcd lease semantics.
//!
//! Used by the test suites as the shared backing state for several
//! allocators at once. Leases expire on `tokio::time`, so paused-clock tests
//! can drive TTLs deterministically. Faults can be injected to exercise the
//! unavailable-store and lost-keep-alive paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{child_segment, dir_prefix, Condition, KeyMatch, KvEntry, KvStore, LeaseId};
use crate::error::{CniError, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

#[derive(Debug, Clone, Copy)]
struct LeaseSlot {
    ttl: i64,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseSlot>,
    next_lease: i64,
    unavailable: bool,
    closed_keep_alive: HashSet<LeaseId>,
    read_only: Option<String>,
}

impl Inner {
    fn expire(&mut self) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            self.drop_lease(id);
        }
    }

    fn check_writable(&self, key: &str) -> Result<()> {
        match &self.read_only {
            Some(prefix) if key.starts_with(prefix.as_str()) => Err(CniError::StoreUnavailable(
                format!("writes under {} are refused", prefix),
            )),
            _ => Ok(()),
        }
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let existed = self.leases.remove(&id).is_some();
        self.kvs.retain(|_, entry| entry.lease != Some(id));
        self.closed_keep_alive.remove(&id);
        existed
    }
}

/// Shared in-memory store. Clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        let mut inner = self.inner.lock();
        inner.expire();
        if inner.unavailable {
            return Err(CniError::StoreUnavailable("memory store is offline".into()));
        }
        f(&mut inner)
    }

    /// Make every call fail with `StoreUnavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    /// Refuse writes to keys under `prefix` with `StoreUnavailable`; `None`
    /// lifts the restriction.
    pub fn refuse_writes_under(&self, prefix: Option<&str>) {
        self.inner.lock().read_only = prefix.map(str::to_string);
    }

    /// Write `key` without a lease, outside the async API.
    pub fn insert(&self, key: &str, value: &str) {
        self.inner.lock().kvs.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease: None,
            },
        );
    }

    /// Make keep-alives for `lease` report a closed channel.
    pub fn close_keep_alive(&self, lease: LeaseId) {
        self.inner.lock().closed_keep_alive.insert(lease);
    }

    /// Expire `lease` immediately, as if its TTL ran out.
    pub fn expire_lease(&self, lease: LeaseId) {
        self.inner.lock().drop_lease(lease);
    }

    /// Current value of `key`
    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        inner.expire();
        inner.kvs.get(key).map(|e| e.value.clone())
    }

    /// Lease `key` is bound to
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let mut inner = self.inner.lock();
        inner.expire();
        inner.kvs.get(key).and_then(|e| e.lease)
    }

    /// Every key currently stored, in order
    pub fn keys(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        inner.expire();
        inner.kvs.keys().cloned().collect()
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.expire();
        inner.leases.len()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn connect(&self) -> Result<()> {
        self.with(|_| Ok(()))
    }

    async fn disconnect(&self) {}

    async fn list_child_keys(&self, prefix: &str) -> Result<BTreeSet<String>> {
        let dir = dir_prefix(prefix);
        self.with(|inner| {
            Ok(inner
                .kvs
                .range(dir.clone()..)
                .take_while(|(key, _)| key.starts_with(&dir))
                .filter_map(|(key, _)| child_segment(&dir, key).map(str::to_string))
                .collect())
        })
    }

    async fn list_entries(&self, key: &str, matching: KeyMatch) -> Result<Vec<KvEntry>> {
        self.with(|inner| {
            Ok(inner
                .kvs
                .iter()
                .filter(|(k, _)| match matching {
                    KeyMatch::Exact => k.as_str() == key,
                    KeyMatch::Prefix => k.starts_with(key),
                })
                .map(|(k, e)| KvEntry {
                    key: k.clone(),
                    value: e.value.clone(),
                    lease: e.lease,
                })
                .collect())
        })
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        self.with(|inner| {
            inner.check_writable(key)?;
            if let Some(id) = lease {
                if !inner.leases.contains_key(&id) {
                    return Err(CniError::StoreUnavailable(format!("lease {} not found", id)));
                }
            }
            inner.kvs.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    lease,
                },
            );
            Ok(())
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.with(|inner| Ok(inner.kvs.remove(key).is_some()))
    }

    async fn compare_and_put_all(
        &self,
        guard_key: &str,
        condition: Condition,
        writes: &[(String, String)],
        lease: LeaseId,
    ) -> Result<bool> {
        self.with(|inner| {
            let holds = match (condition, inner.kvs.get(guard_key)) {
                (Condition::Absent, existing) => existing.is_none(),
                (Condition::BoundTo(expected), Some(entry)) => entry.lease == Some(expected),
                (Condition::BoundTo(_), None) => false,
            };
            if !holds {
                return Ok(false);
            }
            if !inner.leases.contains_key(&lease) {
                return Err(CniError::StoreUnavailable(format!("lease {} not found", lease)));
            }
            for (key, _) in writes {
                inner.check_writable(key)?;
            }
            for (key, value) in writes {
                inner.kvs.insert(
                    key.clone(),
                    Entry {
                        value: value.clone(),
                        lease: Some(lease),
                    },
                );
            }
            Ok(true)
        })
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        self.with(|inner| {
            inner.next_lease += 1;
            let id = LeaseId(0x7e57_0000 + inner.next_lease);
            inner.leases.insert(
                id,
                LeaseSlot {
                    ttl: ttl_secs,
                    deadline: Instant::now() + Duration::from_secs(ttl_secs.max(0) as u64),
                },
            );
            Ok(id)
        })
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Option<i64>> {
        self.with(|inner| {
            if inner.closed_keep_alive.contains(&lease) {
                return Ok(None);
            }
            match inner.leases.get_mut(&lease) {
                Some(slot) => {
                    slot.deadline = Instant::now() + Duration::from_secs(slot.ttl.max(0) as u64);
                    Ok(Some(slot.ttl))
                }
                None => Ok(None),
            }
        })
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.with(|inner| {
            inner.drop_lease(lease);
            Ok(())
        })
    }

    async fn lease_time_to_live(&self, lease: LeaseId) -> Result<Option<i64>> {
        self.with(|inner| {
            Ok(inner.leases.get(&lease).map(|slot| {
                slot.deadline
                    .saturating_duration_since(Instant::now())
                    .as_secs()
                    .max(1) as i64
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn revoke_removes_bound_keys() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(10).await.unwrap();
        store.put("/ipam/a/1", "x", Some(lease)).await.unwrap();
        store.put("/ipam/a/2", "y", None).await.unwrap();

        store.revoke_lease(lease).await.unwrap();

        assert_eq!(store.keys(), vec!["/ipam/a/2".to_string()]);
        // Unknown leases revoke cleanly.
        store.revoke_lease(lease).await.unwrap();
    }

    #[tokio::test]
    async fn cas_respects_conditions() {
        let store = MemoryStore::new();
        let first = store.grant_lease(10).await.unwrap();
        let second = store.grant_lease(10).await.unwrap();

        assert!(store.compare_and_put("/k", "1", first, Condition::Absent).await.unwrap());
        assert!(!store.compare_and_put("/k", "2", second, Condition::Absent).await.unwrap());
        assert!(!store
            .compare_and_put("/k", "2", second, Condition::BoundTo(second))
            .await
            .unwrap());
        assert!(store
            .compare_and_put("/k", "2", second, Condition::BoundTo(first))
            .await
            .unwrap());
        assert_eq!(store.lease_of("/k"), Some(second));
    }

    #[tokio::test]
    async fn multi_put_is_all_or_nothing() {
        let store = MemoryStore::new();
        let first = store.grant_lease(10).await.unwrap();
        let second = store.grant_lease(10).await.unwrap();
        store.put("/ipam/a/1", "x", Some(first)).await.unwrap();
        let writes = vec![
            ("/ipam/a/1".to_string(), "y".to_string()),
            ("/ipam-owners/c/net1".to_string(), "{}".to_string()),
        ];

        store.refuse_writes_under(Some("/ipam-owners/"));
        assert!(store
            .compare_and_put_all("/ipam/a/1", Condition::BoundTo(first), &writes, second)
            .await
            .is_err());
        assert_eq!(store.lease_of("/ipam/a/1"), Some(first));
        assert_eq!(store.get("/ipam-owners/c/net1"), None);

        store.refuse_writes_under(None);
        assert!(store
            .compare_and_put_all("/ipam/a/1", Condition::BoundTo(first), &writes, second)
            .await
            .unwrap());
        assert_eq!(store.lease_of("/ipam/a/1"), Some(second));
        assert_eq!(store.lease_of("/ipam-owners/c/net1"), Some(second));
    }

    #[tokio::test(start_paused = true)]
    async fn leases_expire_on_ttl() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(10).await.unwrap();
        store.put("/ipam/a/1", "x", Some(lease)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(store.keep_alive(lease).await.unwrap(), Some(10));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(store.keys().is_empty());
        assert_eq!(store.lease_time_to_live(lease).await.unwrap(), None);
    }

    #[tokio::test]
    async fn child_keys_are_first_segments() {
        let store = MemoryStore::new();
        store.put("/ipam-meta/172.17.11.0/vlan", "100", None).await.unwrap();
        store.put("/ipam-meta/172.17.12.0/vlan", "200", None).await.unwrap();
        store.put("/ipam-metadata/x", "?", None).await.unwrap();

        let children = store.list_child_keys("/ipam-meta").await.unwrap();
        assert_eq!(
            children.into_iter().collect::<Vec<_>>(),
            vec!["172.17.11.0".to_string(), "172.17.12.0".to_string()]
        );
    }
}
