//! IPv4 address allocation from segmented pools
//!
//! Segments are /24-style prefixes registered in the store together with a
//! VLAN tag. An address is claimed by locking its key under the segment's
//! directory; the set of child keys of that directory is the used set.
//!
//! Store layout, all derived from one root (default `/ipam`):
//!
//! ```text
//! /ipam/<segment>/<address>          address ownership, lease-bound
//! /ipam-meta/<segment>/vlan          VLAN tag of the segment
//! /ipam-owners/<container>/<ifname>  AddressRecord, same lease as the address
//! ```

pub mod pool;

pub use pool::SegmentPool;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::config::{IpamConf, PoolRange};
use crate::error::{CniError, Result};
use crate::lock::{DistributedLock, LockGuard, LockOptions};
use crate::store::{KeyMatch, KvStore, LeaseId};

/// Key paths of the three store trees
#[derive(Debug, Clone)]
pub struct KeyLayout {
    addresses: String,
    meta: String,
    owners: String,
}

impl KeyLayout {
    pub fn new(root: &str) -> Self {
        let root = root.trim_end_matches('/');
        Self {
            addresses: root.to_string(),
            meta: format!("{}-meta", root),
            owners: format!("{}-owners", root),
        }
    }

    /// Directory whose children are the segment's used addresses
    pub fn segment_dir(&self, segment: &str) -> String {
        format!("{}/{}", self.addresses, segment)
    }

    pub fn address_key(&self, segment: &str, address: Ipv4Addr) -> String {
        format!("{}/{}/{}", self.addresses, segment, address)
    }

    /// Directory whose children are the registered segments
    pub fn meta_root(&self) -> &str {
        &self.meta
    }

    pub fn vlan_key(&self, segment: &str) -> String {
        format!("{}/{}/vlan", self.meta, segment)
    }

    pub fn owner_key(&self, container_id: &str, ifname: &str) -> String {
        format!("{}/{}/{}", self.owners, container_id, ifname)
    }
}

/// A parsed segment identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    id: String,
    network: Ipv4Network,
}

impl Segment {
    /// Parse a segment id such as `172.17.11.0`. The id has to be the
    /// network address of its prefix.
    pub fn parse(id: &str, range: &PoolRange) -> Result<Self> {
        let addr: Ipv4Addr = id
            .parse()
            .map_err(|_| CniError::Resolver(format!("segment {:?} is not an IPv4 address", id)))?;

        let network = Ipv4Network::new(addr, range.prefix_len)
            .map_err(|e| CniError::Resolver(format!("segment {}: {}", id, e)))?;

        if network.network() != addr {
            return Err(CniError::Resolver(format!(
                "segment {} is not the network address of {}/{}",
                id,
                network.network(),
                range.prefix_len
            )));
        }

        Ok(Self {
            id: id.to_string(),
            network,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network.network()
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.network.mask()
    }

    pub fn prefix_len(&self) -> u8 {
        self.network.prefix()
    }

    /// Address at `offset` from the network address
    pub fn address(&self, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()).wrapping_add(offset))
    }

    /// Offset of `addr` inside this segment, `None` for foreign addresses
    pub fn offset_of(&self, addr: Ipv4Addr) -> Option<u32> {
        self.network
            .contains(addr)
            .then(|| u32::from(addr) - u32::from(self.network()))
    }
}

/// Segment picked for an ADD before the interface exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    pub segment: String,
    pub vlan: u16,
}

/// An allocated address with its network parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationResult {
    pub address: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub prefix_len: u8,
    pub segment: String,
    pub vlan: u16,
}

impl AllocationResult {
    /// Address in CIDR notation, e.g. `172.17.11.11/24`
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }
}

/// A claimed address whose lock is still held
#[derive(Debug)]
pub struct Allocation {
    result: AllocationResult,
    guard: LockGuard,
}

impl Allocation {
    pub fn result(&self) -> &AllocationResult {
        &self.result
    }

    pub fn lease(&self) -> LeaseId {
        self.guard.lease()
    }

    pub fn is_held(&self) -> bool {
        self.guard.is_held()
    }

    /// Give the address back.
    pub async fn release(self) -> Result<()> {
        self.guard.unlock().await
    }
}

/// Durable record of a committed allocation, kept under the owners tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRecord {
    pub segment: String,
    pub address: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub prefix_len: u8,
    pub vlan: u16,
    /// Lease both the address key and this record are bound to
    pub lease: i64,
    pub container_id: String,
    pub ifname: String,
    /// Unix seconds
    pub created_at: u64,
}

impl AddressRecord {
    pub fn lease_id(&self) -> LeaseId {
        LeaseId(self.lease)
    }

    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }
}

/// Usage summary of a registered segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentUsage {
    pub segment: String,
    pub vlan: Option<u16>,
    pub used: usize,
    pub capacity: usize,
}

/// Allocates addresses from candidate segments against a shared store
pub struct IpamAllocator {
    store: Arc<dyn KvStore>,
    lock: DistributedLock,
    layout: KeyLayout,
    range: PoolRange,
    hold_ttl_secs: i64,
    retries: u32,
    backoff: Duration,
}

impl IpamAllocator {
    pub fn new(store: Arc<dyn KvStore>, conf: &IpamConf) -> Self {
        Self {
            lock: DistributedLock::new(store.clone(), LockOptions::from_conf(conf)),
            store,
            layout: KeyLayout::new(&conf.root),
            range: conf.range,
            hold_ttl_secs: conf.hold_ttl_secs,
            retries: conf.store_retries,
            backoff: conf.retry_backoff(),
        }
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    pub fn range(&self) -> &PoolRange {
        &self.range
    }

    /// Pick the segment an ADD will allocate from: the first known candidate
    /// that is not exhausted.
    pub async fn plan(&self, candidates: &[String]) -> Result<SegmentPlan> {
        ensure_candidates(candidates)?;

        for candidate in candidates {
            let segment = Segment::parse(candidate, &self.range)?;
            let vlan = self.require_vlan(&segment).await?;
            let used = self.used_addresses(&segment).await?;

            if SegmentPool::new(&self.range, &segment, &used).is_exhausted() {
                info!("Segment {} is exhausted ({} used), skipping", candidate, used.len());
                continue;
            }

            debug!("Planned segment {} (vlan {})", candidate, vlan);
            return Ok(SegmentPlan {
                segment: candidate.clone(),
                vlan,
            });
        }

        Err(CniError::PoolExhausted(candidates.join(", ")))
    }

    /// Claim the smallest free address of the first candidate segment that
    /// has room.
    pub async fn allocate(&self, candidates: &[String]) -> Result<Allocation> {
        ensure_candidates(candidates)?;

        for candidate in candidates {
            let segment = Segment::parse(candidate, &self.range)?;
            let vlan = self.require_vlan(&segment).await?;

            if let Some(allocation) = self.allocate_in(&segment, vlan).await? {
                info!(
                    "Allocated {} from segment {} (vlan {})",
                    allocation.result.address, candidate, vlan
                );
                return Ok(allocation);
            }
        }

        Err(CniError::PoolExhausted(candidates.join(", ")))
    }

    async fn allocate_in(&self, segment: &Segment, vlan: u16) -> Result<Option<Allocation>> {
        let mut contended = 0usize;

        loop {
            let used = self.used_addresses(segment).await?;
            let pool = SegmentPool::new(&self.range, segment, &used);

            if pool.is_exhausted() {
                info!("Segment {} is exhausted ({} used), skipping", segment.id(), pool.used_count());
                return Ok(None);
            }
            let Some(address) = pool.first_free() else {
                return Ok(None);
            };

            let key = self.layout.address_key(segment.id(), address);
            match self.with_retry("lock", || self.lock.lock(&key)).await {
                Ok(guard) => return self.confirm(segment, vlan, address, guard).await,
                Err(CniError::LockContention(_)) => {
                    contended += 1;
                    if contended >= self.range.size() {
                        return Err(CniError::LockContention(segment.id().to_string()));
                    }
                    debug!("Lost race for {}, re-reading segment {}", address, segment.id());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Re-read the used set now that we hold the lock. Concurrent allocators
    /// can race past the capacity threshold together; the one that finds the
    /// segment over capacity backs off.
    async fn confirm(
        &self,
        segment: &Segment,
        vlan: u16,
        address: Ipv4Addr,
        guard: LockGuard,
    ) -> Result<Option<Allocation>> {
        let used = match self.used_addresses(segment).await {
            Ok(used) => used,
            Err(e) => {
                release_quietly(guard).await;
                return Err(e);
            }
        };

        if used.len() > self.range.capacity {
            warn!(
                "Segment {} went over capacity ({} > {}), releasing {}",
                segment.id(),
                used.len(),
                self.range.capacity,
                address
            );
            release_quietly(guard).await;
            return Ok(None);
        }

        Ok(Some(Allocation {
            result: AllocationResult {
                address,
                gateway: segment.address(self.range.gateway),
                netmask: segment.netmask(),
                prefix_len: segment.prefix_len(),
                segment: segment.id().to_string(),
                vlan,
            },
            guard,
        }))
    }

    /// Make an allocation outlive this process and record its owner.
    ///
    /// The address key and the owner record move onto the hold lease in a
    /// single transaction, so a crash can never leave one without the other.
    pub async fn commit(
        &self,
        allocation: Allocation,
        container_id: &str,
        ifname: &str,
    ) -> Result<AddressRecord> {
        let result = allocation.result.clone();
        let mut record = AddressRecord {
            segment: result.segment,
            address: result.address,
            gateway: result.gateway,
            prefix_len: result.prefix_len,
            vlan: result.vlan,
            lease: 0,
            container_id: container_id.to_string(),
            ifname: ifname.to_string(),
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        };
        let owner_key = self.layout.owner_key(container_id, ifname);

        let hold = allocation
            .guard
            .persist_with(self.hold_ttl_secs, |hold| {
                let stamped = AddressRecord {
                    lease: hold.0,
                    ..record.clone()
                };
                let json = serde_json::to_string(&stamped)
                    .map_err(|e| CniError::decode("address record", e))?;
                Ok(vec![(owner_key.clone(), json)])
            })
            .await?;
        record.lease = hold.0;

        info!(
            "Committed {} to {}/{} on lease {}",
            record.address, container_id, ifname, hold
        );
        Ok(record)
    }

    /// Committed allocation of a container interface, if any
    pub async fn find_record(
        &self,
        container_id: &str,
        ifname: &str,
    ) -> Result<Option<AddressRecord>> {
        let key = self.layout.owner_key(container_id, ifname);
        let entries = self
            .with_retry("owner record", || self.store.list_entries(&key, KeyMatch::Exact))
            .await?;

        match entries.first() {
            Some(entry) => serde_json::from_str(&entry.value)
                .map(Some)
                .map_err(|e| CniError::decode(format!("address record {}", key), e)),
            None => Ok(None),
        }
    }

    /// Revoke the lease of a committed allocation, removing both the
    /// address key and the owner record.
    pub async fn release_record(&self, record: &AddressRecord) -> Result<()> {
        let lease = record.lease_id();
        self.with_retry("revoke", || self.store.revoke_lease(lease)).await?;
        info!("Released {} (lease {})", record.address, lease);
        Ok(())
    }

    /// Release the allocation of a container interface. Returns whether one
    /// existed.
    pub async fn release(&self, container_id: &str, ifname: &str) -> Result<bool> {
        match self.find_record(container_id, ifname).await? {
            Some(record) => {
                self.release_record(&record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Check that a committed allocation still owns its address.
    pub async fn verify_record(&self, record: &AddressRecord) -> Result<()> {
        let lease = record.lease_id();
        let ttl = self
            .with_retry("lease ttl", || self.store.lease_time_to_live(lease))
            .await?;
        if ttl.is_none() {
            return Err(CniError::Validation(format!(
                "lease {} of {} has expired",
                lease, record.address
            )));
        }

        let key = self.layout.address_key(&record.segment, record.address);
        let entries = self
            .with_retry("address key", || self.store.list_entries(&key, KeyMatch::Exact))
            .await?;
        match entries.first() {
            Some(entry) if entry.lease == Some(lease) => Ok(()),
            Some(_) => Err(CniError::Validation(format!(
                "{} is owned by another lease",
                record.address
            ))),
            None => Err(CniError::Validation(format!("{} is not allocated", record.address))),
        }
    }

    /// Register a segment with its VLAN tag
    pub async fn register_segment(&self, segment: &str, vlan: u16) -> Result<()> {
        let segment = Segment::parse(segment, &self.range)?;
        if !(1..=4094).contains(&vlan) {
            return Err(CniError::Config(format!("VLAN id {} out of range 1..=4094", vlan)));
        }

        let key = self.layout.vlan_key(segment.id());
        let value = vlan.to_string();
        self.with_retry("register", || self.store.put(&key, &value, None))
            .await?;
        info!("Registered segment {} on vlan {}", segment.id(), vlan);
        Ok(())
    }

    /// Remove a segment registration. Refused while addresses are in use.
    pub async fn remove_segment(&self, segment: &str) -> Result<()> {
        let usage = self.usage(segment).await?;
        if usage.vlan.is_none() {
            return Err(CniError::Resolver(format!("segment {} is not registered", segment)));
        }
        if usage.used > 0 {
            return Err(CniError::Config(format!(
                "segment {} still has {} address(es) in use",
                segment, usage.used
            )));
        }

        let key = self.layout.vlan_key(segment);
        self.with_retry("remove", || self.store.delete(&key)).await?;
        info!("Removed segment {}", segment);
        Ok(())
    }

    /// Usage of every registered segment
    pub async fn list_segments(&self) -> Result<Vec<SegmentUsage>> {
        let meta = self.layout.meta_root().to_string();
        let segments = self
            .with_retry("segments", || self.store.list_child_keys(&meta))
            .await?;

        let mut usages = Vec::with_capacity(segments.len());
        for segment in segments {
            usages.push(self.usage(&segment).await?);
        }
        Ok(usages)
    }

    pub async fn usage(&self, segment: &str) -> Result<SegmentUsage> {
        let parsed = Segment::parse(segment, &self.range)?;
        let vlan = self.vlan_of(&parsed).await?;
        let used = self.used_addresses(&parsed).await?;

        Ok(SegmentUsage {
            segment: segment.to_string(),
            vlan,
            used: used.len(),
            capacity: self.range.capacity,
        })
    }

    async fn used_addresses(&self, segment: &Segment) -> Result<BTreeSet<Ipv4Addr>> {
        let dir = self.layout.segment_dir(segment.id());
        let children = self
            .with_retry("used set", || self.store.list_child_keys(&dir))
            .await?;

        Ok(children
            .iter()
            .filter_map(|child| match child.parse() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    debug!("Ignoring non-address key {}/{}", dir, child);
                    None
                }
            })
            .collect())
    }

    async fn vlan_of(&self, segment: &Segment) -> Result<Option<u16>> {
        let key = self.layout.vlan_key(segment.id());
        let entries = self
            .with_retry("vlan", || self.store.list_entries(&key, KeyMatch::Exact))
            .await?;

        match entries.first() {
            Some(entry) => entry
                .value
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| CniError::decode(format!("vlan tag of {}", segment.id()), e)),
            None => Ok(None),
        }
    }

    async fn require_vlan(&self, segment: &Segment) -> Result<u16> {
        self.vlan_of(segment).await?.ok_or_else(|| {
            CniError::Resolver(format!("segment {} is not registered", segment.id()))
        })
    }

    /// Run a store operation, retrying `StoreUnavailable` with exponential
    /// backoff.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Err(CniError::StoreUnavailable(msg)) if attempt < self.retries => {
                    let delay = self.backoff.saturating_mul(1 << attempt.min(16));
                    warn!(
                        "Store call ({}) failed, retrying in {:?}: {}",
                        what, delay, msg
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn ensure_candidates(candidates: &[String]) -> Result<()> {
    if candidates.is_empty() {
        return Err(CniError::Config("no candidate segments for this workload".into()));
    }
    Ok(())
}

async fn release_quietly(guard: LockGuard) {
    let key = guard.key().to_string();
    if let Err(e) = guard.unlock().await {
        warn!("Failed to release {}: {}", key, e);
    }
}
