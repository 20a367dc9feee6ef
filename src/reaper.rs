use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::observability::WAL_COMPACTIONS_TOTAL;
use crate::store::WalRecordStore;

/// Background task that rewrites the WAL once enough appends have piled up.
pub async fn run_compactor(store: Arc<WalRecordStore>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let appends = store.appends_since_compact().await;
        if appends < threshold {
            debug!(appends, threshold, "compaction not due");
            continue;
        }
        match store.compact().await {
            Ok(()) => {
                metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "ok").increment(1);
                info!(appends, "WAL compacted");
            }
            Err(e) => {
                metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "error").increment(1);
                error!("WAL compaction failed: {e}");
            }
        }
    }
}
