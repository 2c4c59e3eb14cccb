// Lease renewal for locks acquired without a fixed lease
// Runs until the handle is released, dropped, or the key is found to belong to
// someone else. A failed store call is retried on the next tick; the lock is at
// risk of lapsing if failures outlast the lease.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use latchkey_store::CoordinationStore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::HandleShared;

pub(crate) fn spawn(
    shared: Arc<HandleShared>,
    store: Arc<dyn CoordinationStore>,
    lease: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            key = %shared.key,
            owner = %shared.owner_token,
            lease_ms = lease.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            "Lock watchdog started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let _gate = shared.gate.lock().await;
            if !shared.is_held() {
                break;
            }

            match store
                .compare_and_expire(&shared.key, shared.owner_token.as_bytes(), lease)
                .await
            {
                Ok(true) => {
                    if let Some(expiry) = Instant::now().checked_add(lease) {
                        *shared.lease_expiry.lock() = expiry;
                    }
                    let renewals = shared.renewals.fetch_add(1, Ordering::AcqRel) + 1;
                    debug!(key = %shared.key, renewals, "Lock lease renewed");
                }
                Ok(false) => {
                    shared.mark_lost();
                    warn!(
                        key = %shared.key,
                        owner = %shared.owner_token,
                        "Lock lost before release, lease expired or key taken by another owner"
                    );
                    break;
                }
                Err(e) => {
                    warn!(
                        key = %shared.key,
                        error = %e,
                        expires_in_ms = shared
                            .lease_expiry
                            .lock()
                            .saturating_duration_since(Instant::now())
                            .as_millis() as u64,
                        "Lock renewal failed, lock at risk of expiring"
                    );
                }
            }
        }

        shared.renewing.store(false, Ordering::Release);
        info!(key = %shared.key, "Lock watchdog stopped");
    })
}
