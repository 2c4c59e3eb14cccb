//! Latchkey Core - distributed coordination primitives
//!
//! Three independent primitives over a shared [`CoordinationStore`]:
//! - [`LockManager`]: mutual exclusion with owner tokens, bounded waiting and
//!   watchdog lease renewal
//! - [`RateLimiter`]: fixed-window or sliding-log admission per key
//! - [`TokenGuard`]: encrypted single-use tokens against duplicate submission
//!
//! The [`guard`] module wraps business operations with declarative rules whose
//! keys are resolved from call arguments by [`key`].
//!
//! [`CoordinationStore`]: latchkey_store::CoordinationStore

pub mod guard;
pub mod key;
pub mod lock;
pub mod logging;
pub mod rate_limit;
pub mod settings;
pub mod token;

pub use guard::{
    Admission, CallGuard, LockDecoration, LockGuard, LockRule, RateLimitDecoration,
    RateLimitGuard, RateLimitRule, guarded, run_guarded,
};
pub use key::{KeyArgs, KeySpec, KeyTemplate};
pub use lock::{LeasePolicy, LockConfig, LockHandle, LockManager, LockState, WaitPolicy};
pub use rate_limit::{RateLimiter, RateLimiterConfig, StoreFailurePolicy};
pub use settings::Settings;
pub use token::{TokenGuard, TokenGuardConfig};

pub use latchkey_common::{LatchError, LatchResult};
