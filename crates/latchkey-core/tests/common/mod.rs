//! Shared fixtures for latchkey-core integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use latchkey_common::TokenCipher;
use latchkey_core::{
    LockConfig, LockManager, RateLimiter, RateLimiterConfig, TokenGuard, TokenGuardConfig,
};
use latchkey_store::{
    CoordinationEntry, CoordinationStore, MemoryCoordinationStore, RateWindow, StoreError,
    StoreResult,
};

/// Store wrapper that fails every call while switched off
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryCoordinationStore,
    down: AtomicBool,
    failed_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn failed_calls(&self) -> usize {
        self.failed_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> StoreResult<()> {
        if self.down.load(Ordering::SeqCst) {
            self.failed_calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CoordinationStore for FlakyStore {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn entry(&self, key: &str) -> StoreResult<Option<CoordinationEntry>> {
        self.check()?;
        self.inner.entry(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> StoreResult<()> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn check_and_delete(&self, key: &str, expected: &[u8]) -> StoreResult<Option<Bytes>> {
        self.check()?;
        self.inner.check_and_delete(key, expected).await
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.check()?;
        self.inner.compare_and_expire(key, expected, ttl).await
    }

    async fn try_acquire(&self, key: &str, window: RateWindow) -> StoreResult<bool> {
        self.check()?;
        self.inner.try_acquire(key, window).await
    }
}

pub fn memory_store() -> Arc<dyn CoordinationStore> {
    Arc::new(MemoryCoordinationStore::new())
}

pub fn lock_manager(store: Arc<dyn CoordinationStore>) -> Arc<LockManager> {
    Arc::new(LockManager::new(store, LockConfig::default()).expect("default lock config is valid"))
}

pub fn rate_limiter(store: Arc<dyn CoordinationStore>) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(store, RateLimiterConfig::default()))
}

pub fn token_guard(store: Arc<dyn CoordinationStore>) -> TokenGuard {
    let key = TokenCipher::generate_key(256).expect("256-bit key");
    let cipher = TokenCipher::new(&key).expect("valid key");
    TokenGuard::new(store, Arc::new(cipher), TokenGuardConfig::default())
}
