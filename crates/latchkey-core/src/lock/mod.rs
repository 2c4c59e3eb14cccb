// Distributed mutual exclusion over the coordination store
// A lock is a store key holding the owner token of the current holder. Only the
// holder's token can release or renew it; the TTL bounds how long a crashed
// holder can block everyone else.

mod watchdog;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use latchkey_common::{DEFAULT_LOCK_SCENE, LatchError, LatchResult, scoped_key};
use latchkey_store::CoordinationStore;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default lease for watchdog-renewed locks
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Lock manager configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    pub scene: String,
    /// TTL written for watchdog locks and re-applied on every renewal
    pub default_lease: Duration,
    /// Renewal period; a third of `default_lease` when unset
    pub renew_interval: Option<Duration>,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            scene: DEFAULT_LOCK_SCENE.to_string(),
            default_lease: DEFAULT_LEASE,
            renew_interval: None,
            retry_initial_backoff: Duration::from_millis(50),
            retry_max_backoff: Duration::from_secs(1),
        }
    }
}

impl LockConfig {
    pub fn renew_interval(&self) -> Duration {
        self.renew_interval.unwrap_or(self.default_lease / 3)
    }

    pub fn validate(&self) -> LatchResult<()> {
        if self.scene.is_empty() {
            return Err(LatchError::Configuration(
                "lock scene must not be empty".to_string(),
            ));
        }
        if self.default_lease.is_zero()
            || Instant::now().checked_add(self.default_lease).is_none()
        {
            return Err(LatchError::Configuration(format!(
                "default lock lease {:?} must be non-zero and representable",
                self.default_lease
            )));
        }
        let interval = self.renew_interval();
        if interval.is_zero() || interval >= self.default_lease {
            return Err(LatchError::Configuration(format!(
                "renew interval {:?} must be non-zero and shorter than the lease {:?}",
                interval, self.default_lease
            )));
        }
        if self.retry_initial_backoff.is_zero()
            || self.retry_initial_backoff > self.retry_max_backoff
        {
            return Err(LatchError::Configuration(format!(
                "retry backoff must satisfy 0 < initial ({:?}) <= max ({:?})",
                self.retry_initial_backoff, self.retry_max_backoff
            )));
        }
        Ok(())
    }
}

/// How long an acquirer may wait for a held lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// One attempt, then fail
    FailFast,
    /// Retry with backoff until the budget runs out
    Bounded(Duration),
}

impl WaitPolicy {
    /// Zero or negative milliseconds mean fail-fast
    pub fn from_millis(wait_ms: i64) -> Self {
        if wait_ms <= 0 {
            WaitPolicy::FailFast
        } else {
            WaitPolicy::Bounded(Duration::from_millis(wait_ms as u64))
        }
    }
}

/// How the lock's lifetime is bounded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeasePolicy {
    /// Default lease, renewed by a watchdog until release
    Watchdog,
    /// Fixed TTL, never renewed
    Fixed(Duration),
}

impl LeasePolicy {
    /// Zero or negative milliseconds mean watchdog renewal
    pub fn from_millis(lease_ms: i64) -> Self {
        if lease_ms <= 0 {
            LeasePolicy::Watchdog
        } else {
            LeasePolicy::Fixed(Duration::from_millis(lease_ms as u64))
        }
    }
}

/// Observable state of a lock handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Held,
    Released,
    /// The lease ran out or another owner took the key
    Expired,
}

const STATE_HELD: u8 = 0;
const STATE_RELEASED: u8 = 1;
const STATE_LOST: u8 = 2;

/// State shared between a handle and its watchdog
pub(crate) struct HandleShared {
    pub(crate) key: String,
    pub(crate) owner_token: String,
    pub(crate) state: AtomicU8,
    pub(crate) lease_expiry: Mutex<Instant>,
    pub(crate) renewing: AtomicBool,
    pub(crate) renewals: AtomicU64,
    /// Serializes renewal against release so no renewal runs after release starts
    pub(crate) gate: tokio::sync::Mutex<()>,
}

impl HandleShared {
    pub(crate) fn is_held(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_HELD
    }

    /// Record that the key no longer belongs to this owner
    pub(crate) fn mark_lost(&self) {
        let _ = self.state.compare_exchange(
            STATE_HELD,
            STATE_LOST,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Proof of a successful acquisition
///
/// Dropping a handle that is still held stops its watchdog and makes a
/// best-effort release on the current runtime.
pub struct LockHandle {
    shared: Arc<HandleShared>,
    store: Arc<dyn CoordinationStore>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl LockHandle {
    /// Store key of the lock, including its scene
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn owner_token(&self) -> &str {
        &self.shared.owner_token
    }

    /// When the lease runs out unless renewed
    pub fn lease_expiry(&self) -> Instant {
        *self.shared.lease_expiry.lock()
    }

    pub fn is_renewing(&self) -> bool {
        self.shared.renewing.load(Ordering::Acquire)
    }

    /// Number of successful watchdog renewals
    pub fn renewal_count(&self) -> u64 {
        self.shared.renewals.load(Ordering::Acquire)
    }

    pub fn state(&self) -> LockState {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_RELEASED => LockState::Released,
            STATE_LOST => LockState::Expired,
            _ if Instant::now() >= self.lease_expiry() => LockState::Expired,
            _ => LockState::Held,
        }
    }

    /// Ask the store whether it still records this handle as the owner
    pub async fn is_held_in_store(&self) -> LatchResult<bool> {
        let current = self.store.get(&self.shared.key).await?;
        Ok(current.is_some_and(|value| value.as_ref() == self.shared.owner_token.as_bytes()))
    }

    /// Release the lock if this handle still owns it.
    ///
    /// Idempotent: returns `Ok(true)` when this call deleted the key and
    /// `Ok(false)` when the handle was already released or the key has
    /// expired or moved to another owner. On a store error the watchdog stays
    /// stopped and the handle remains releasable, so the call can be retried.
    pub async fn release(&self) -> LatchResult<bool> {
        self.stop_watchdog();

        let _gate = self.shared.gate.lock().await;
        if self.shared.state.load(Ordering::Acquire) == STATE_RELEASED {
            return Ok(false);
        }
        let deleted = match self
            .store
            .check_and_delete(&self.shared.key, self.shared.owner_token.as_bytes())
            .await
        {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(key = %self.shared.key, error = %e, "Lock release failed, handle can be released again");
                return Err(e.into());
            }
        };
        self.shared.state.store(STATE_RELEASED, Ordering::Release);
        match deleted {
            Some(_) => {
                debug!(key = %self.shared.key, owner = %self.shared.owner_token, "Lock released");
                Ok(true)
            }
            None => {
                warn!(
                    key = %self.shared.key,
                    owner = %self.shared.owner_token,
                    "Lock was no longer owned at release, lease expired or taken over"
                );
                Ok(false)
            }
        }
    }

    fn stop_watchdog(&self) {
        if let Some(task) = self.watchdog.lock().take() {
            task.abort();
        }
        self.shared.renewing.store(false, Ordering::Release);
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.shared.state.swap(STATE_RELEASED, Ordering::AcqRel) != STATE_HELD {
            return;
        }
        self.stop_watchdog();
        warn!(
            key = %self.shared.key,
            owner = %self.shared.owner_token,
            "Lock handle dropped without release"
        );

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            let shared = self.shared.clone();
            runtime.spawn(async move {
                if let Err(e) = store
                    .check_and_delete(&shared.key, shared.owner_token.as_bytes())
                    .await
                {
                    warn!(key = %shared.key, error = %e, "Release of dropped lock failed, lease will lapse");
                }
            });
        }
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.shared.key)
            .field("owner_token", &self.shared.owner_token)
            .field("state", &self.state())
            .field("renewals", &self.renewal_count())
            .finish()
    }
}

/// Acquires and releases locks on a coordination store
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn CoordinationStore>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(store: Arc<dyn CoordinationStore>, config: LockConfig) -> LatchResult<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire `key` in the configured scene
    pub async fn acquire(
        &self,
        key: &str,
        wait: WaitPolicy,
        lease: LeasePolicy,
    ) -> LatchResult<LockHandle> {
        self.acquire_in(&self.config.scene, key, wait, lease).await
    }

    /// Acquire `key` in an explicit scene.
    ///
    /// Store errors are returned as they occur; only contention is retried.
    pub async fn acquire_in(
        &self,
        scene: &str,
        key: &str,
        wait: WaitPolicy,
        lease: LeasePolicy,
    ) -> LatchResult<LockHandle> {
        if key.is_empty() {
            return Err(LatchError::Configuration(
                "lock key must not be empty".to_string(),
            ));
        }
        let ttl = match lease {
            LeasePolicy::Watchdog => self.config.default_lease,
            LeasePolicy::Fixed(ttl) if ttl.is_zero() => {
                return Err(LatchError::Configuration(
                    "fixed lock lease must not be zero".to_string(),
                ));
            }
            LeasePolicy::Fixed(ttl) => ttl,
        };

        let store_key = scoped_key(scene, key);
        let owner_token = Uuid::new_v4().simple().to_string();
        let value = Bytes::from(owner_token.clone());

        let started = Instant::now();
        let deadline = match wait {
            WaitPolicy::FailFast => None,
            WaitPolicy::Bounded(budget) => Some(started.checked_add(budget).ok_or_else(|| {
                LatchError::Configuration(format!("lock wait budget {:?} is out of range", budget))
            })?),
        };
        let mut backoff = self.config.retry_initial_backoff;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let attempted_at = Instant::now();
            let lease_expiry = attempted_at.checked_add(ttl).ok_or_else(|| {
                LatchError::Configuration(format!("lock lease {:?} is out of range", ttl))
            })?;
            if self
                .store
                .set_if_absent(&store_key, value.clone(), ttl)
                .await?
            {
                debug!(key = %store_key, owner = %owner_token, attempts, "Lock acquired");
                return Ok(self.grant(store_key, owner_token, ttl, lease_expiry, lease));
            }

            let Some(deadline) = deadline else {
                return Err(LatchError::lock_timeout(
                    store_key,
                    "lock is held by another owner",
                ));
            };
            let now = Instant::now();
            if now >= deadline {
                return Err(LatchError::lock_timeout(
                    store_key,
                    format!(
                        "not acquired within {:?} after {} attempts",
                        deadline - started,
                        attempts
                    ),
                ));
            }

            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = backoff
                .saturating_mul(2)
                .min(self.config.retry_max_backoff);
        }
    }

    /// Fail-fast acquisition in the configured scene
    pub async fn try_acquire(&self, key: &str, lease: LeasePolicy) -> LatchResult<LockHandle> {
        self.acquire(key, WaitPolicy::FailFast, lease).await
    }

    /// Acquire with millisecond settings, where `<= 0` means fail-fast wait
    /// or watchdog lease respectively
    pub async fn acquire_millis(
        &self,
        key: &str,
        wait_ms: i64,
        lease_ms: i64,
    ) -> LatchResult<LockHandle> {
        self.acquire(
            key,
            WaitPolicy::from_millis(wait_ms),
            LeasePolicy::from_millis(lease_ms),
        )
        .await
    }

    pub async fn release(&self, handle: &LockHandle) -> LatchResult<bool> {
        handle.release().await
    }

    /// Run `op` while holding `key`, releasing afterwards whatever the outcome
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        key: &str,
        wait: WaitPolicy,
        lease: LeasePolicy,
        op: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LatchError>,
    {
        let handle = self.acquire(key, wait, lease).await?;
        let result = op().await;
        if let Err(e) = handle.release().await {
            warn!(key = %handle.key(), error = %e, "Failed to release lock after operation");
        }
        result
    }

    /// Whether any owner currently holds `key` in the configured scene
    pub async fn is_locked(&self, key: &str) -> LatchResult<bool> {
        let store_key = scoped_key(&self.config.scene, key);
        Ok(self.store.get(&store_key).await?.is_some())
    }

    fn grant(
        &self,
        key: String,
        owner_token: String,
        ttl: Duration,
        lease_expiry: Instant,
        lease: LeasePolicy,
    ) -> LockHandle {
        let shared = Arc::new(HandleShared {
            key,
            owner_token,
            state: AtomicU8::new(STATE_HELD),
            lease_expiry: Mutex::new(lease_expiry),
            renewing: AtomicBool::new(false),
            renewals: AtomicU64::new(0),
            gate: tokio::sync::Mutex::new(()),
        });

        let watchdog = match lease {
            LeasePolicy::Watchdog => {
                shared.renewing.store(true, Ordering::Release);
                Some(watchdog::spawn(
                    shared.clone(),
                    self.store.clone(),
                    ttl,
                    self.config.renew_interval(),
                ))
            }
            LeasePolicy::Fixed(_) => None,
        };

        LockHandle {
            shared,
            store: self.store.clone(),
            watchdog: Mutex::new(watchdog),
        }
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("store", &self.store.name())
            .field("config", &self.config)
            .finish()
    }
}
