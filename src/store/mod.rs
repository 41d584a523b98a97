//! Key-value store abstraction
//!
//! The allocator only needs a handful of primitives from the shared store:
//! scoped reads, writes, leases and a compare-and-swap put. They
//! are expressed as the `KvStore` trait so the etcd client and the in-memory
//! store used by tests are interchangeable.

pub mod etcd;
pub mod memory;
pub mod proto;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::error::{CniError, Result};

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// Store-issued lease identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A key/value pair read from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
    /// Lease the key is bound to, if any
    pub lease: Option<LeaseId>,
}

/// How `list_entries` matches keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMatch {
    /// Only the key itself
    Exact,
    /// Every key starting with the given string
    Prefix,
}

/// Precondition of a compare-and-swap put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// The key must not exist
    Absent,
    /// The key must exist and be bound to this lease
    BoundTo(LeaseId),
}

/// Client of a distributed, lease-capable key-value store
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Open the connection. Idempotent.
    async fn connect(&self) -> Result<()>;

    /// Close the connection. Safe without a prior `connect`.
    async fn disconnect(&self);

    /// Immediate child segments of `prefix`, keys only.
    async fn list_child_keys(&self, prefix: &str) -> Result<BTreeSet<String>>;

    /// Key/value pairs matching `key`.
    async fn list_entries(&self, key: &str, matching: KeyMatch) -> Result<Vec<KvEntry>>;

    /// Unconditional write, optionally bound to a lease.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    /// Delete a single key, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Write every pair in `writes` bound to `lease` in one transaction, only
    /// if `condition` holds for `guard_key` at commit time.
    async fn compare_and_put_all(
        &self,
        guard_key: &str,
        condition: Condition,
        writes: &[(String, String)],
        lease: LeaseId,
    ) -> Result<bool>;

    /// Write `key` bound to `lease` only if `condition` holds at commit time.
    async fn compare_and_put(
        &self,
        key: &str,
        value: &str,
        lease: LeaseId,
        condition: Condition,
    ) -> Result<bool> {
        let writes = [(key.to_string(), value.to_string())];
        self.compare_and_put_all(key, condition, &writes, lease).await
    }

    /// Grant a lease with the given TTL in seconds.
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// Renew a lease once. `None` means the lease is gone or the keep-alive
    /// channel closed.
    async fn keep_alive(&self, lease: LeaseId) -> Result<Option<i64>>;

    /// Revoke a lease and every key bound to it. Revoking an unknown lease
    /// succeeds.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Remaining TTL of a lease, `None` if it has expired.
    async fn lease_time_to_live(&self, lease: LeaseId) -> Result<Option<i64>>;
}

/// Run a store call under a deadline, turning an overrun into a retryable
/// `StoreUnavailable`.
pub async fn with_deadline<T, F>(deadline: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(CniError::StoreUnavailable(format!(
            "{} timed out after {:?}",
            what, deadline
        ))),
    }
}

/// `prefix` with exactly one trailing slash
pub fn dir_prefix(prefix: &str) -> String {
    format!("{}/", prefix.trim_end_matches('/'))
}

/// First path segment of `key` below `dir`, where `dir` ends with '/'
pub fn child_segment<'a>(dir: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(dir)?;
    rest.split('/').next().filter(|s| !s.is_empty())
}

/// Smallest key greater than every key starting with `prefix`
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Prefix of all 0xff bytes: range to the end of the keyspace.
    vec![0]
}
