//! Sync cadence constants and the periodic driver task.

use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use super::SyncEngine;

/// Foreground reconciliation cadence in seconds.
pub const SYNC_FOREGROUND_INTERVAL_SECS: u64 = 30;

/// Exponential backoff in seconds with cap, keyed on the failure streak.
pub fn backoff_seconds(consecutive_failures: i32) -> i64 {
    const MAX_EXPONENT: i32 = 8;
    const BASE_DELAY_SECONDS: i64 = 5;

    let capped = i64::from(consecutive_failures.clamp(0, MAX_EXPONENT));
    2_i64.pow(capped as u32) * BASE_DELAY_SECONDS
}

/// Drive full passes on a fixed interval. Failed passes extend the wait by
/// the backoff for the current failure streak; a pass requested while one is
/// in flight is a no-op inside the engine itself.
pub fn run_periodic(engine: Arc<SyncEngine>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match engine.sync_pass().await {
                Ok(outcome) => {
                    debug!(
                        "periodic sync pass done: pushed={} pulled={} skipped={:?}",
                        outcome.pushed, outcome.pulled, outcome.skipped
                    );
                }
                Err(err) => {
                    let streak = engine
                        .status()
                        .await
                        .map(|s| s.consecutive_failures)
                        .unwrap_or(1);
                    let delay = backoff_seconds(streak);
                    warn!("periodic sync pass failed (streak {streak}), backing off {delay}s: {err}");
                    tokio::time::sleep(Duration::from_secs(delay as u64)).await;
                }
            }
        }
    })
}
