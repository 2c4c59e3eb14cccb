//! Layered settings: optional config file overlaid by `LATCHKEY__*` env vars
//!
//! ```yaml
//! lock:
//!   default_lease_ms: 30000
//!   retry_initial_backoff_ms: 50
//! rate_limit:
//!   algorithm: sliding_log
//!   store_failure: fail_closed
//! token:
//!   secret: "<base64 key>"
//!   ttl_secs: 1800
//! ```
//!
//! `LATCHKEY__TOKEN__SECRET=...` overrides `token.secret`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, Environment, File};
use latchkey_common::{
    DEFAULT_LOCK_SCENE, DEFAULT_RATE_LIMIT_SCENE, DEFAULT_TOKEN_SCENE, LatchError, LatchResult,
    TokenCipher,
};
use latchkey_store::WindowAlgorithm;
use serde::{Deserialize, Serialize};

use crate::lock::LockConfig;
use crate::rate_limit::{RateLimiterConfig, StoreFailurePolicy};
use crate::token::TokenGuardConfig;

/// Settings file read when no explicit path is given (any supported extension)
pub const DEFAULT_SETTINGS_FILE: &str = "conf/latchkey";

pub const ENV_PREFIX: &str = "LATCHKEY";
pub const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub scene: String,
    pub default_lease_ms: u64,
    /// Defaults to a third of `default_lease_ms`
    pub renew_interval_ms: Option<u64>,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            scene: DEFAULT_LOCK_SCENE.to_string(),
            default_lease_ms: 30_000,
            renew_interval_ms: None,
            retry_initial_backoff_ms: 50,
            retry_max_backoff_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub scene: String,
    pub algorithm: WindowAlgorithm,
    pub store_failure: StoreFailurePolicy,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            scene: DEFAULT_RATE_LIMIT_SCENE.to_string(),
            algorithm: WindowAlgorithm::FixedWindow,
            store_failure: StoreFailurePolicy::FailClosed,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    pub scene: String,
    /// Base64 of a 16, 24 or 32 byte key
    pub secret: Option<String>,
    pub ttl_secs: u64,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            scene: DEFAULT_TOKEN_SCENE.to_string(),
            secret: None,
            ttl_secs: 1800,
        }
    }
}

impl std::fmt::Debug for TokenSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSettings")
            .field("scene", &self.scene)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub sweep_interval_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 5_000,
        }
    }
}

/// Logging section; `LATCHKEY_LOG_*` variables still win, see `logging`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub dir: Option<String>,
    pub level: Option<String>,
    pub console: Option<bool>,
    pub file: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub lock: LockSettings,
    pub rate_limit: RateLimitSettings,
    pub token: TokenSettings,
    pub store: StoreSettings,
    pub log: LogSettings,
}

impl Settings {
    /// Load from `path` (or the default settings file, if present) and the
    /// process environment
    pub fn load(path: Option<&Path>) -> LatchResult<Self> {
        Self::build(path, Self::environment())
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
    }

    fn build(path: Option<&Path>, env: Environment) -> LatchResult<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_SETTINGS_FILE).required(false),
        };

        let settings: Self = Config::builder()
            .add_source(file)
            .add_source(env)
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| LatchError::Configuration(format!("failed to load settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values no component could start with
    pub fn validate(&self) -> LatchResult<()> {
        if self.store.sweep_interval_ms == 0 {
            return Err(LatchError::Configuration(
                "store.sweep_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.token.ttl_secs == 0 {
            return Err(LatchError::Configuration(
                "token.ttl_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            scene: self.lock.scene.clone(),
            default_lease: Duration::from_millis(self.lock.default_lease_ms),
            renew_interval: self.lock.renew_interval_ms.map(Duration::from_millis),
            retry_initial_backoff: Duration::from_millis(self.lock.retry_initial_backoff_ms),
            retry_max_backoff: Duration::from_millis(self.lock.retry_max_backoff_ms),
        }
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            scene: self.rate_limit.scene.clone(),
            algorithm: self.rate_limit.algorithm,
            store_failure: self.rate_limit.store_failure,
        }
    }

    pub fn token_guard_config(&self) -> TokenGuardConfig {
        TokenGuardConfig {
            scene: self.token.scene.clone(),
            ttl: Duration::from_secs(self.token.ttl_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.store.sweep_interval_ms)
    }

    /// Build the process-wide token cipher from `token.secret`
    pub fn token_cipher(&self) -> LatchResult<Arc<TokenCipher>> {
        let secret = self.token.secret.as_deref().ok_or_else(|| {
            LatchError::Configuration(format!(
                "token.secret is not set (env {}{}TOKEN{}SECRET)",
                ENV_PREFIX, ENV_SEPARATOR, ENV_SEPARATOR
            ))
        })?;
        TokenCipher::from_base64_key(secret)
            .map(Arc::new)
            .map_err(|e| LatchError::Configuration(format!("token.secret: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let source = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::environment().source(Some(source))
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::build(None, env(&[])).unwrap();
        assert_eq!(settings, Settings::default());

        let lock = settings.lock_config();
        assert_eq!(lock.default_lease, Duration::from_secs(30));
        assert_eq!(lock.renew_interval(), Duration::from_secs(10));
        assert!(lock.validate().is_ok());
        assert_eq!(settings.token_guard_config().ttl, Duration::from_secs(1800));
        assert_eq!(settings.sweep_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_file_then_env_override() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(
            file,
            "lock:\n  default_lease_ms: 9000\n  scene: jobs\nrate_limit:\n  algorithm: sliding_log\ntoken:\n  ttl_secs: 60"
        )
        .unwrap();

        let settings = Settings::build(
            Some(file.path()),
            env(&[
                ("LATCHKEY__TOKEN__TTL_SECS", "120"),
                ("LATCHKEY__RATE_LIMIT__STORE_FAILURE", "fail_open"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.lock.default_lease_ms, 9000);
        assert_eq!(settings.lock.scene, "jobs");
        assert_eq!(settings.lock_config().renew_interval(), Duration::from_secs(3));
        assert_eq!(settings.rate_limit.algorithm, WindowAlgorithm::SlidingLog);
        assert_eq!(
            settings.rate_limiter_config().store_failure,
            StoreFailurePolicy::FailOpen
        );
        assert_eq!(settings.token.ttl_secs, 120);
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let err = Settings::build(None, env(&[("LATCHKEY__STORE__SWEEP_INTERVAL_MS", "0")]))
            .unwrap_err();
        assert!(matches!(err, LatchError::Configuration(ref m) if m.contains("sweep_interval_ms")));

        let mut settings = Settings::default();
        settings.token.ttl_secs = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let err = Settings::build(Some(Path::new("/nonexistent/latchkey.yml")), env(&[]))
            .unwrap_err();
        assert!(matches!(err, LatchError::Configuration(_)));
    }

    #[test]
    fn test_token_cipher() {
        let settings = Settings::default();
        assert!(matches!(
            settings.token_cipher(),
            Err(LatchError::Configuration(_))
        ));

        let key = TokenCipher::generate_base64_key(192).unwrap();
        let settings = Settings::build(None, env(&[("LATCHKEY__TOKEN__SECRET", key.as_str())])).unwrap();
        assert_eq!(settings.token_cipher().unwrap().key_bits(), 192);

        let settings =
            Settings::build(None, env(&[("LATCHKEY__TOKEN__SECRET", "c2hvcnQ=")])).unwrap();
        assert!(settings.token_cipher().is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let mut settings = Settings::default();
        settings.token.secret = Some("c3VwZXItc2VjcmV0".to_string());
        let printed = format!("{:?}", settings);
        assert!(!printed.contains("c3VwZXItc2VjcmV0"));
        assert!(printed.contains("<redacted>"));
    }
}
