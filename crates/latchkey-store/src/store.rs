//! The coordination store contract
//!
//! Implementations must execute every method as one atomic step with no
//! intermediate state visible to other callers. The lock manager, rate
//! limiter and token guard rely on that for correctness without any
//! client-side locking.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

/// Algorithm used by the store-side rate limit primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowAlgorithm {
    /// Counter that resets when the window key expires. Bursts at a window
    /// boundary can admit up to twice the limit within one window length.
    #[default]
    FixedWindow,
    /// Log of admission instants. Never admits more than the limit within
    /// any window-length interval.
    SlidingLog,
}

/// Rate limit configuration passed on every admission call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub limit: u64,
    pub window: Duration,
    pub algorithm: WindowAlgorithm,
}

impl RateWindow {
    pub fn fixed(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            algorithm: WindowAlgorithm::FixedWindow,
        }
    }

    pub fn sliding(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            algorithm: WindowAlgorithm::SlidingLog,
        }
    }
}

/// Snapshot of one stored key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationEntry {
    pub key: String,
    pub value: Bytes,
    /// Remaining time to live when the snapshot was taken
    pub ttl: Duration,
}

/// Shared key-value store with per-key TTL and atomic check-and-act operations
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Store name used in logs
    fn name(&self) -> &str;

    /// Read the current value of a key
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>>;

    /// Read a key together with its remaining TTL
    async fn entry(&self, key: &str) -> StoreResult<Option<CoordinationEntry>>;

    /// Write a key unconditionally, replacing any previous value and TTL
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> StoreResult<()>;

    /// Write a key only if it is absent (or expired).
    ///
    /// Returns `true` if this call created the key.
    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> StoreResult<bool>;

    /// Delete a key. Returns `true` if a live key was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Delete a key only if its current value equals `expected`.
    ///
    /// Returns the deleted value, or `None` without side effects when the key
    /// is absent or holds a different value.
    async fn check_and_delete(&self, key: &str, expected: &[u8]) -> StoreResult<Option<Bytes>>;

    /// Reset the TTL of a key only if its current value equals `expected`.
    ///
    /// Returns `true` if the TTL was extended.
    async fn compare_and_expire(&self, key: &str, expected: &[u8], ttl: Duration)
    -> StoreResult<bool>;

    /// Record one call against the window stored at `key`.
    ///
    /// Returns `true` if the call is admitted. While window state for the key
    /// is live, the limit and window stored with it take precedence over the
    /// ones passed in.
    async fn try_acquire(&self, key: &str, window: RateWindow) -> StoreResult<bool>;

    /// Remaining TTL of a key
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        Ok(self.entry(key).await?.map(|entry| entry.ttl))
    }
}
