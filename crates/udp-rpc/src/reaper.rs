//! Background sweep evicting idle sessions.

use crate::session::SessionTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Lower bound on the pause between sweeps.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Sweep `sessions` every `max_lifetime` until `shutdown` fires.
///
/// The pause after each pass is the lifetime minus the time the pass took.
pub async fn run(sessions: Arc<SessionTable>, max_lifetime: Duration, shutdown: CancellationToken) {
    info!("Idle reaper running with lifetime {:?}", max_lifetime);

    loop {
        let started = Instant::now();
        let evicted = sessions.sweep(started, max_lifetime);
        if evicted > 0 {
            debug!(evicted, remaining = sessions.len(), "Swept idle sessions");
        }

        let pause = max_lifetime
            .saturating_sub(started.elapsed())
            .max(MIN_SWEEP_INTERVAL);

        tokio::select! {
            () = shutdown.cancelled() => break,
            () = sleep(pause) => {}
        }
    }

    debug!("Idle reaper stopped");
}
