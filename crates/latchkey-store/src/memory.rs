// In-process coordination store
// Every contract operation runs under the DashMap shard lock of its key, so each
// call is one atomic step for all tasks sharing the store.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as DashEntry;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::store::{CoordinationEntry, CoordinationStore, RateWindow, WindowAlgorithm};

#[derive(Debug)]
enum Slot {
    Value(Bytes),
    Counter {
        count: u64,
        limit: u64,
    },
    Log {
        hits: VecDeque<Instant>,
        limit: u64,
        window: Duration,
    },
}

impl Slot {
    fn to_bytes(&self) -> Bytes {
        match self {
            Slot::Value(value) => value.clone(),
            Slot::Counter { count, .. } => Bytes::from(count.to_string()),
            Slot::Log { hits, .. } => Bytes::from(hits.len().to_string()),
        }
    }

    fn matches(&self, expected: &[u8]) -> bool {
        matches!(self, Slot::Value(value) if value.as_ref() == expected)
    }
}

fn expiry(key: &str, now: Instant, ttl: Duration) -> StoreResult<Instant> {
    now.checked_add(ttl).ok_or_else(|| StoreError::TtlOutOfRange {
        key: key.to_string(),
        ttl,
    })
}

/// A stored key with its absolute expiry
#[derive(Debug)]
struct StoredEntry {
    slot: Slot,
    expires_at: Instant,
}

impl StoredEntry {
    fn value(key: &str, value: Bytes, ttl: Duration, now: Instant) -> StoreResult<Self> {
        Ok(Self {
            slot: Slot::Value(value),
            expires_at: expiry(key, now, ttl)?,
        })
    }

    fn window(key: &str, window: RateWindow, now: Instant) -> StoreResult<Self> {
        let slot = match window.algorithm {
            WindowAlgorithm::FixedWindow => Slot::Counter {
                count: 0,
                limit: window.limit,
            },
            WindowAlgorithm::SlidingLog => Slot::Log {
                hits: VecDeque::new(),
                limit: window.limit,
                window: window.window,
            },
        };
        Ok(Self {
            slot,
            expires_at: expiry(key, now, window.window)?,
        })
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn snapshot(&self, key: &str, now: Instant) -> Option<CoordinationEntry> {
        if self.is_expired(now) {
            return None;
        }
        Some(CoordinationEntry {
            key: key.to_string(),
            value: self.slot.to_bytes(),
            ttl: self.expires_at.duration_since(now),
        })
    }

    /// Count one call against window state; the stored limit and window win
    fn admit(&mut self, key: &str, now: Instant) -> StoreResult<bool> {
        match &mut self.slot {
            Slot::Counter { count, limit } => {
                if *count < *limit {
                    *count += 1;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Slot::Log {
                hits,
                limit,
                window,
            } => {
                while hits
                    .front()
                    .is_some_and(|hit| now.duration_since(*hit) >= *window)
                {
                    hits.pop_front();
                }
                if (hits.len() as u64) < *limit {
                    self.expires_at = expiry(key, now, *window)?;
                    hits.push_back(now);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Slot::Value(_) => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "window",
                found: "value",
            }),
        }
    }
}

/// In-process coordination store using DashMap
///
/// Expired keys are invisible to every operation and removed lazily on
/// access; [`MemoryCoordinationStore::spawn_sweeper`] additionally purges
/// them in the background.
#[derive(Debug, Default)]
pub struct MemoryCoordinationStore {
    entries: DashMap<String, StoredEntry>,
}

impl MemoryCoordinationStore {
    /// Create an empty store without a background sweeper
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared store with a background task purging expired keys
    pub fn with_sweeper(interval: Duration) -> StoreResult<Arc<Self>> {
        let store = Arc::new(Self::new());
        store.spawn_sweeper(interval)?;
        Ok(store)
    }

    /// Start a background task that purges expired keys every `interval`.
    ///
    /// The task holds only a weak reference and exits once the store is dropped.
    /// A zero interval is rejected.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> StoreResult<JoinHandle<()>> {
        if interval.is_zero() {
            return Err(StoreError::InvalidArgument(
                "sweep interval must not be zero".to_string(),
            ));
        }
        let store = Arc::downgrade(self);
        info!(interval_ms = interval.as_millis() as u64, "Memory store sweeper started");

        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    debug!("Memory store dropped, sweeper exiting");
                    break;
                };
                let removed = store.purge_expired();
                if removed > 0 {
                    debug!(count = removed, "Purged expired coordination entries");
                }
            }
        }))
    }

    /// Remove every expired key, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        Ok(self.entry(key).await?.map(|entry| entry.value))
    }

    async fn entry(&self, key: &str) -> StoreResult<Option<CoordinationEntry>> {
        let now = Instant::now();
        let snapshot = self
            .entries
            .get(key)
            .and_then(|entry| entry.snapshot(key, now));
        if snapshot.is_none() {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Ok(snapshot)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> StoreResult<()> {
        let entry = StoredEntry::value(key, value, ttl, Instant::now())?;
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let fresh = StoredEntry::value(key, value, ttl, now)?;
        match self.entries.entry(key.to_string()) {
            DashEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            DashEntry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn check_and_delete(&self, key: &str, expected: &[u8]) -> StoreResult<Option<Bytes>> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, entry| {
                !entry.is_expired(now) && entry.slot.matches(expected)
            })
            .map(|(_, entry)| entry.slot.to_bytes()))
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) && entry.slot.matches(expected) => {
                entry.expires_at = expiry(key, now, ttl)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_acquire(&self, key: &str, window: RateWindow) -> StoreResult<bool> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            DashEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    let mut fresh = StoredEntry::window(key, window, now)?;
                    let admitted = fresh.admit(key, now)?;
                    occupied.insert(fresh);
                    Ok(admitted)
                } else {
                    occupied.get_mut().admit(key, now)
                }
            }
            DashEntry::Vacant(vacant) => {
                let mut fresh = StoredEntry::window(key, window, now)?;
                let admitted = fresh.admit(key, now)?;
                vacant.insert(fresh);
                Ok(admitted)
            }
        }
    }
}
