//! Scenario runners over the in-process store

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use latchkey_common::{LatchError, TokenCipher};
use latchkey_core::{
    LeasePolicy, LockManager, RateLimiter, Settings, TokenGuard, WaitPolicy,
};
use latchkey_store::{CoordinationStore, MemoryCoordinationStore};
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Args)]
pub struct SimulateArgs {
    #[command(subcommand)]
    pub scenario: Scenario,
}

#[derive(Subcommand)]
pub enum Scenario {
    /// Contenders race for one lock; the winner holds it for a while
    Lock {
        #[arg(long, default_value = "order:42")]
        key: String,
        #[arg(long, default_value_t = 3)]
        contenders: usize,
        /// How long the winner holds the lock
        #[arg(long, default_value_t = 2000)]
        hold_ms: u64,
        /// Wait budget per contender; -1 fails fast
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        wait_ms: i64,
        /// Fixed lease; -1 renews with the watchdog
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        lease_ms: i64,
    },
    /// Fire calls at one rate-limited key
    Rate {
        #[arg(long, default_value = "k")]
        key: String,
        #[arg(long, default_value_t = 3)]
        limit: u64,
        #[arg(long, default_value_t = 5)]
        window_secs: u64,
        #[arg(long, default_value_t = 4)]
        calls: usize,
        /// Pause between calls
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
    /// Issue a token and replay it concurrently
    Token {
        #[arg(long, default_value = "pay:1001")]
        business_key: String,
        #[arg(long, default_value_t = 2)]
        replays: usize,
    },
}

pub async fn run(args: SimulateArgs, settings: &Settings) -> Result<()> {
    let store: Arc<dyn CoordinationStore> =
        MemoryCoordinationStore::with_sweeper(settings.sweep_interval())?;

    match args.scenario {
        Scenario::Lock {
            key,
            contenders,
            hold_ms,
            wait_ms,
            lease_ms,
        } => {
            let manager = Arc::new(LockManager::new(store, settings.lock_config())?);
            simulate_lock(manager, key, contenders, hold_ms, wait_ms, lease_ms).await
        }
        Scenario::Rate {
            key,
            limit,
            window_secs,
            calls,
            interval_ms,
        } => {
            let limiter = RateLimiter::new(store, settings.rate_limiter_config());
            simulate_rate(&limiter, &key, limit, window_secs, calls, interval_ms).await
        }
        Scenario::Token {
            business_key,
            replays,
        } => {
            let cipher = match settings.token_cipher() {
                Ok(cipher) => cipher,
                Err(e) => {
                    warn!(error = %e, "No usable token secret configured, using a throwaway key");
                    Arc::new(TokenCipher::new(&TokenCipher::generate_key(256)?)?)
                }
            };
            let guard = TokenGuard::new(store, cipher, settings.token_guard_config());
            simulate_token(guard, &business_key, replays).await
        }
    }
}

async fn simulate_lock(
    manager: Arc<LockManager>,
    key: String,
    contenders: usize,
    hold_ms: u64,
    wait_ms: i64,
    lease_ms: i64,
) -> Result<()> {
    let started = Instant::now();
    let mut tasks = Vec::with_capacity(contenders);
    for contender in 0..contenders {
        let manager = manager.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            let handle = match manager.acquire_millis(&key, wait_ms, lease_ms).await {
                Ok(handle) => handle,
                Err(e) => return (contender, Err(e)),
            };
            tokio::time::sleep(Duration::from_millis(hold_ms)).await;
            let renewals = handle.renewal_count();
            let released = handle.release().await;
            (contender, released.map(|_| renewals))
        }));
    }

    for task in futures::future::join_all(tasks).await {
        let (contender, outcome) = task.context("contender task panicked")?;
        match outcome {
            Ok(renewals) => println!(
                "contender {contender}: acquired, held {hold_ms}ms, {renewals} renewals, released"
            ),
            Err(LatchError::LockAcquisitionTimeout { message, .. }) => {
                println!("contender {contender}: not acquired ({message})")
            }
            Err(e) => return Err(e.into()),
        }
    }
    info!(key = %key, elapsed_ms = started.elapsed().as_millis() as u64, "Lock scenario finished");
    Ok(())
}

async fn simulate_rate(
    limiter: &RateLimiter,
    key: &str,
    limit: u64,
    window_secs: u64,
    calls: usize,
    interval_ms: u64,
) -> Result<()> {
    let mut outcomes = Vec::with_capacity(calls);
    for call in 0..calls {
        if call > 0 && interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
        outcomes.push(limiter.try_acquire(key, limit, window_secs).await?);
    }
    println!("{key} ({limit} per {window_secs}s): {outcomes:?}");
    Ok(())
}

async fn simulate_token(guard: TokenGuard, business_key: &str, replays: usize) -> Result<()> {
    let token = guard.issue(business_key).await?;
    println!("issued: {token}");

    let attempts = (0..replays).map(|_| {
        let guard = guard.clone();
        let token = token.clone();
        async move { guard.validate(&token).await }
    });

    for (attempt, outcome) in futures::future::join_all(attempts).await.into_iter().enumerate() {
        match outcome {
            Ok(key) => println!("attempt {attempt}: accepted for {key}"),
            Err(LatchError::TokenInvalid(reason)) => println!("attempt {attempt}: rejected ({reason})"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
