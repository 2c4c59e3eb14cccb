//! Declarative guards around business operations
//!
//! A decoration is plain data (it can come from configuration) describing how
//! a call is protected. It is validated into a rule once, at setup time, and
//! the resulting guard runs the operation only after the rule admits the call:
//!
//! ```text
//! LockDecoration ──validate──> LockRule ──> LockGuard::run(args, op)
//!                                              │ resolve key
//!                                              │ acquire  (fail: LockAcquisitionTimeout)
//!                                              │ op()
//!                                              └ release  (always)
//! ```

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use latchkey_common::{DEFAULT_LOCK_SCENE, LatchError, LatchResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::key::{KeyArgs, KeySpec, KeyTemplate};
use crate::lock::{LeasePolicy, LockHandle, LockManager, WaitPolicy};
use crate::rate_limit::RateLimiter;

/// Lock decoration as declared next to a business operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockDecoration {
    pub scene: String,
    /// Fixed key; exclusive with `key_template`
    pub key: Option<String>,
    /// Template over the call's arguments; exclusive with `key`
    pub key_template: Option<String>,
    /// `-1` selects the watchdog
    pub lease_time_ms: i64,
    /// `-1` selects fail-fast
    pub wait_time_ms: i64,
    pub on_failure_message: String,
}

impl Default for LockDecoration {
    fn default() -> Self {
        Self {
            scene: DEFAULT_LOCK_SCENE.to_string(),
            key: None,
            key_template: None,
            lease_time_ms: -1,
            wait_time_ms: -1,
            on_failure_message: String::new(),
        }
    }
}

/// Validated lock decoration
#[derive(Debug, Clone)]
pub struct LockRule {
    pub scene: String,
    pub key: KeySpec,
    pub wait: WaitPolicy,
    pub lease: LeasePolicy,
    /// Replaces the acquisition failure message when set
    pub on_failure_message: Option<String>,
}

impl TryFrom<LockDecoration> for LockRule {
    type Error = LatchError;

    fn try_from(decoration: LockDecoration) -> Result<Self, Self::Error> {
        if decoration.scene.is_empty() {
            return Err(LatchError::Configuration(
                "lock decoration scene must not be empty".to_string(),
            ));
        }
        let key = match (decoration.key, decoration.key_template) {
            (Some(key), None) => KeySpec::literal(key)?,
            (None, Some(template)) => KeySpec::template(&template)?,
            (Some(_), Some(_)) => {
                return Err(LatchError::Configuration(
                    "lock decoration sets both key and keyTemplate".to_string(),
                ));
            }
            (None, None) => {
                return Err(LatchError::Configuration(
                    "lock decoration sets neither key nor keyTemplate".to_string(),
                ));
            }
        };
        let on_failure_message =
            Some(decoration.on_failure_message).filter(|message| !message.is_empty());

        Ok(Self {
            scene: decoration.scene,
            key,
            wait: WaitPolicy::from_millis(decoration.wait_time_ms),
            lease: LeasePolicy::from_millis(decoration.lease_time_ms),
            on_failure_message,
        })
    }
}

/// Rate limit decoration; `key` may contain template placeholders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecoration {
    pub key: String,
    pub limit: u64,
    pub window_seconds: u64,
}

/// Validated rate limit decoration
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    pub key: KeySpec,
    pub limit: u64,
    pub window_secs: u64,
}

impl TryFrom<RateLimitDecoration> for RateLimitRule {
    type Error = LatchError;

    fn try_from(decoration: RateLimitDecoration) -> Result<Self, Self::Error> {
        if decoration.window_seconds == 0 {
            return Err(LatchError::Configuration(format!(
                "rate limit '{}' needs a window of at least one second",
                decoration.key
            )));
        }
        Ok(Self {
            key: KeySpec::Template(KeyTemplate::parse(&decoration.key)?),
            limit: decoration.limit,
            window_secs: decoration.window_seconds,
        })
    }
}

/// Permission to run one guarded call
///
/// Holds whatever must be undone once the call finishes.
#[derive(Debug, Default)]
pub struct Admission {
    lock: Option<LockHandle>,
}

impl Admission {
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Undo the admission; failures are logged and the lease left to lapse
    pub async fn finish(self) {
        if let Some(handle) = self.lock
            && let Err(e) = handle.release().await
        {
            warn!(key = %handle.key(), error = %e, "Failed to release lock after guarded call");
        }
    }
}

/// Something that decides whether a call may run
pub trait CallGuard: Send + Sync {
    fn admit<'a>(&'a self, args: &'a KeyArgs) -> BoxFuture<'a, LatchResult<Admission>>;
}

/// Run `op` under `guard`, finishing the admission whatever `op` returns
pub async fn run_guarded<G, T, E, F, Fut>(guard: &G, args: &KeyArgs, op: F) -> Result<T, E>
where
    G: CallGuard + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<LatchError>,
{
    let admission = guard.admit(args).await?;
    let result = op().await;
    admission.finish().await;
    result
}

/// Wrap `op` so every invocation goes through `guard` first
pub fn guarded<G, T, E, F, Fut>(
    guard: Arc<G>,
    op: F,
) -> impl Fn(KeyArgs) -> BoxFuture<'static, Result<T, E>> + Send + Sync
where
    G: CallGuard + ?Sized + 'static,
    F: Fn(KeyArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<LatchError> + Send + 'static,
{
    let op = Arc::new(op);
    move |args: KeyArgs| {
        let guard = guard.clone();
        let op = op.clone();
        async move {
            let admission = guard.admit(&args).await?;
            let result = op(args).await;
            admission.finish().await;
            result
        }
        .boxed()
    }
}

/// Mutual exclusion around a business operation
#[derive(Debug, Clone)]
pub struct LockGuard {
    manager: Arc<LockManager>,
    rule: LockRule,
}

impl LockGuard {
    pub fn new(manager: Arc<LockManager>, rule: LockRule) -> Self {
        Self { manager, rule }
    }

    /// Validate `decoration` and build the guard
    pub fn from_decoration(
        manager: Arc<LockManager>,
        decoration: LockDecoration,
    ) -> LatchResult<Self> {
        Ok(Self::new(manager, decoration.try_into()?))
    }

    pub fn rule(&self) -> &LockRule {
        &self.rule
    }

    /// Resolve the key this call would lock, without the scene prefix
    pub fn resolve_key(&self, args: &KeyArgs) -> LatchResult<String> {
        self.rule.key.resolve(args)
    }

    pub async fn run<T, E, F, Fut>(&self, args: &KeyArgs, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LatchError>,
    {
        run_guarded(self, args, op).await
    }

    async fn acquire(&self, args: &KeyArgs) -> LatchResult<Admission> {
        let key = self.resolve_key(args)?;
        let handle = self
            .manager
            .acquire_in(&self.rule.scene, &key, self.rule.wait, self.rule.lease)
            .await
            .map_err(|e| match (e, &self.rule.on_failure_message) {
                (LatchError::LockAcquisitionTimeout { key, .. }, Some(message)) => {
                    LatchError::lock_timeout(key, message.clone())
                }
                (e, _) => e,
            })?;
        Ok(Admission { lock: Some(handle) })
    }
}

impl CallGuard for LockGuard {
    fn admit<'a>(&'a self, args: &'a KeyArgs) -> BoxFuture<'a, LatchResult<Admission>> {
        self.acquire(args).boxed()
    }
}

/// Rate limit in front of a business operation
#[derive(Debug, Clone)]
pub struct RateLimitGuard {
    limiter: Arc<RateLimiter>,
    rule: RateLimitRule,
}

impl RateLimitGuard {
    pub fn new(limiter: Arc<RateLimiter>, rule: RateLimitRule) -> Self {
        Self { limiter, rule }
    }

    pub fn from_decoration(
        limiter: Arc<RateLimiter>,
        decoration: RateLimitDecoration,
    ) -> LatchResult<Self> {
        Ok(Self::new(limiter, decoration.try_into()?))
    }

    pub fn rule(&self) -> &RateLimitRule {
        &self.rule
    }

    pub async fn run<T, E, F, Fut>(&self, args: &KeyArgs, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LatchError>,
    {
        run_guarded(self, args, op).await
    }

    async fn check(&self, args: &KeyArgs) -> LatchResult<Admission> {
        let key = self.rule.key.resolve(args)?;
        self.limiter
            .check(&key, self.rule.limit, self.rule.window_secs)
            .await?;
        debug!(key = %key, "Guarded call admitted by rate limit");
        Ok(Admission::default())
    }
}

impl CallGuard for RateLimitGuard {
    fn admit<'a>(&'a self, args: &'a KeyArgs) -> BoxFuture<'a, LatchResult<Admission>> {
        self.check(args).boxed()
    }
}
