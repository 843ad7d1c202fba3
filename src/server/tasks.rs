use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::auth::{AttemptGuard, SessionCache};

/// Clears the attempt counters and sweeps expired sessions.
pub fn reset_tick(guard: &AttemptGuard, sessions: &SessionCache) {
    guard.reset();
    match sessions.sweep(Utc::now()) {
        Ok(0) => {}
        Ok(swept) => tracing::info!(swept, "Expired sessions removed"),
        Err(e) => tracing::error!("Session sweep failed: {e}"),
    }
}

async fn reset_loop(guard: Arc<AttemptGuard>, sessions: Arc<SessionCache>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        reset_tick(&guard, &sessions);
    }
}

/// Runs the reset loop for the life of the process, starting it again if
/// it panics.
pub fn spawn_reset_supervisor(
    guard: Arc<AttemptGuard>,
    sessions: Arc<SessionCache>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let task = tokio::spawn(reset_loop(guard.clone(), sessions.clone(), interval));
            match task.await {
                Err(e) if e.is_panic() => {
                    tracing::error!("Reset task panicked, restarting");
                }
                _ => return,
            }
        }
    })
}
