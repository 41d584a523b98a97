//! Lease-backed distributed locks
//!
//! A lock is a single key written with a compare-and-swap put conditioned on
//! the key being absent, bound to a freshly granted lease. The lease is kept
//! alive by a [`RenewalTask`] for as long as the guard lives. Revoking the
//! lease is the only way the key goes away, so a crashed holder loses the
//! lock after at most one TTL.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::IpamConf;
use crate::error::{CniError, Result};
use crate::store::{Condition, KeyMatch, KvStore, LeaseId};

/// Lease parameters for new locks
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    /// Lease TTL in seconds
    pub ttl_secs: i64,
    /// Keep-alive cadence, well under the TTL
    pub renew_interval: Duration,
}

impl LockOptions {
    pub fn from_conf(conf: &IpamConf) -> Self {
        Self {
            ttl_secs: conf.lease_ttl_secs,
            renew_interval: conf.renew_interval(),
        }
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl_secs: 10,
            renew_interval: Duration::from_secs(1),
        }
    }
}

/// Observable status of a lock's lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Lease is being renewed
    Held,
    /// A keep-alive failed or went unanswered; the key may already be gone
    Lost,
    /// Renewal was stopped by the owner
    Released,
}

/// Background keep-alive for one lease.
///
/// The task stops on its own after the first failed or missing keep-alive
/// response and reports [`LockState::Lost`]. [`RenewalTask::stop`] cancels
/// it and waits for it to finish, so a revoke issued afterwards can never
/// race a renewal.
pub struct RenewalTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<LockState>>,
    state: watch::Receiver<LockState>,
}

impl RenewalTask {
    pub fn spawn(store: Arc<dyn KvStore>, lease: LeaseId, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(LockState::Held);
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let final_state = loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break LockState::Released,
                    _ = ticker.tick() => {
                        match store.keep_alive(lease).await {
                            Ok(Some(ttl)) => debug!("Renewed lease {} (ttl {}s)", lease, ttl),
                            Ok(None) => {
                                warn!("Keep-alive for lease {} went unanswered, lock lost", lease);
                                break LockState::Lost;
                            }
                            Err(e) => {
                                warn!("Keep-alive for lease {} failed, lock lost: {}", lease, e);
                                break LockState::Lost;
                            }
                        }
                    }
                }
            };

            let _ = tx.send(final_state);
            final_state
        });

        Self {
            cancel,
            handle: Some(handle),
            state: rx,
        }
    }

    /// Current state without waiting
    pub fn state(&self) -> LockState {
        *self.state.borrow()
    }

    /// Wait until the task reports a state other than `Held`.
    pub async fn lost(&mut self) -> LockState {
        let _ = self.state.wait_for(|s| *s != LockState::Held).await;
        self.state()
    }

    /// Cancel renewal and wait for the task to exit, returning its final state.
    pub async fn stop(&mut self) -> LockState {
        self.cancel.cancel();
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or(LockState::Lost),
            None => self.state(),
        }
    }
}

impl Drop for RenewalTask {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Grants locks on keys of a shared store
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KvStore>,
    options: LockOptions,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KvStore>, options: LockOptions) -> Self {
        Self { store, options }
    }

    /// Take exclusive ownership of `key`.
    ///
    /// Fails with `LockContention` if the key already exists. There is no
    /// retry here; callers pick the next key themselves.
    pub async fn lock(&self, key: &str) -> Result<LockGuard> {
        let lease = self.store.grant_lease(self.options.ttl_secs).await?;
        let mut renewal = RenewalTask::spawn(self.store.clone(), lease, self.options.renew_interval);

        let claimed = self
            .store
            .compare_and_put(key, &lease.to_string(), lease, Condition::Absent)
            .await;

        match claimed {
            Ok(true) => {
                debug!("Locked {} with lease {}", key, lease);
                Ok(LockGuard {
                    store: self.store.clone(),
                    key: key.to_string(),
                    lease,
                    renewal,
                    released: false,
                })
            }
            Ok(false) => {
                renewal.stop().await;
                revoke_quietly(self.store.as_ref(), lease).await;
                Err(CniError::LockContention(key.to_string()))
            }
            Err(e) => {
                renewal.stop().await;
                revoke_quietly(self.store.as_ref(), lease).await;
                Err(e)
            }
        }
    }
}

/// Ownership of a locked key.
///
/// Dropping the guard without [`LockGuard::unlock`] stops renewal and leaves
/// the lease to expire on its TTL.
pub struct LockGuard {
    store: Arc<dyn KvStore>,
    key: String,
    lease: LeaseId,
    renewal: RenewalTask,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("lease", &self.lease)
            .field("state", &self.state())
            .finish()
    }
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    pub fn state(&self) -> LockState {
        self.renewal.state()
    }

    pub fn is_held(&self) -> bool {
        self.state() == LockState::Held
    }

    /// Wait until renewal stops, returning why.
    pub async fn lost(&mut self) -> LockState {
        self.renewal.lost().await
    }

    /// Re-check the lock against the store: renewal must still be running
    /// and the key must still be bound to our lease.
    pub async fn verify(&self) -> Result<()> {
        if !self.is_held() {
            return Err(CniError::LockContention(self.key.clone()));
        }

        let entries = self.store.list_entries(&self.key, KeyMatch::Exact).await?;
        match entries.first() {
            Some(entry) if entry.lease == Some(self.lease) => Ok(()),
            _ => Err(CniError::LockContention(self.key.clone())),
        }
    }

    /// Stop renewal, then revoke the lease. The key disappears with it.
    pub async fn unlock(mut self) -> Result<()> {
        self.released = true;
        self.renewal.stop().await;
        self.store.revoke_lease(self.lease).await?;
        debug!("Unlocked {} (lease {})", self.key, self.lease);
        Ok(())
    }

    /// Hand the key over to a long-lived hold lease and release the lock
    /// lease.
    ///
    /// The key is re-bound with a compare-and-swap conditioned on it still
    /// being bound to the lock lease, so a lock that was lost in the meantime
    /// fails with `LockContention` instead of overwriting a new owner.
    pub async fn persist(self, hold_ttl_secs: i64) -> Result<LeaseId> {
        self.persist_with(hold_ttl_secs, |_| Ok(Vec::new())).await
    }

    /// Like [`LockGuard::persist`], also writing the pairs returned by
    /// `companions` on the hold lease in the same transaction. Either the key
    /// and every companion land on the hold lease, or none of them do.
    pub async fn persist_with<F>(mut self, hold_ttl_secs: i64, companions: F) -> Result<LeaseId>
    where
        F: FnOnce(LeaseId) -> Result<Vec<(String, String)>>,
    {
        if !self.is_held() {
            self.abandon().await;
            return Err(CniError::LockContention(self.key.clone()));
        }

        let hold = match self.store.grant_lease(hold_ttl_secs).await {
            Ok(hold) => hold,
            Err(e) => {
                self.abandon().await;
                return Err(e);
            }
        };

        let mut writes = vec![(self.key.clone(), hold.to_string())];
        match companions(hold) {
            Ok(extra) => writes.extend(extra),
            Err(e) => {
                revoke_quietly(self.store.as_ref(), hold).await;
                self.abandon().await;
                return Err(e);
            }
        }

        let rebound = self
            .store
            .compare_and_put_all(&self.key, Condition::BoundTo(self.lease), &writes, hold)
            .await;

        match rebound {
            Ok(true) => {}
            Ok(false) => {
                revoke_quietly(self.store.as_ref(), hold).await;
                self.abandon().await;
                return Err(CniError::LockContention(self.key.clone()));
            }
            Err(e) => {
                revoke_quietly(self.store.as_ref(), hold).await;
                self.abandon().await;
                return Err(e);
            }
        }

        // The key no longer depends on the lock lease.
        self.abandon().await;
        debug!("Persisted {} on hold lease {}", self.key, hold);
        Ok(hold)
    }

    async fn abandon(&mut self) {
        self.released = true;
        self.renewal.stop().await;
        revoke_quietly(self.store.as_ref(), self.lease).await;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            debug!(
                "Lock on {} dropped without unlock, lease {} expires on its TTL",
                self.key, self.lease
            );
        }
    }
}

async fn revoke_quietly(store: &dyn KvStore, lease: LeaseId) {
    if let Err(e) = store.revoke_lease(lease).await {
        warn!("Failed to revoke lease {}: {}", lease, e);
    }
}
