use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Background task that periodically sends reminders for approved bookings
/// about to start. The `notified` flag on each booking de-duplicates across
/// sweeps and restarts.
pub async fn run_reminder_sweep(engine: Arc<Engine>, lead: chrono::Duration) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let due = engine.collect_due_reminders(Utc::now(), lead);
        for booking_id in due {
            match engine.mark_reminded(booking_id).await {
                Ok(()) => info!("reminder sent for booking {booking_id}"),
                Err(e) => {
                    // May have been cancelled or deleted since the scan
                    debug!("reminder skip {booking_id}: {e}");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("WAL compacted"),
                Err(e) => warn!("WAL compaction failed: {e}"),
            }
        }
    }
}
