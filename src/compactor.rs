use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::store::LocalStore;

const COMPACT_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that rewrites the WAL once enough appends have piled up.
pub async fn run_compactor(store: Arc<LocalStore>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&store, threshold).await;
    }
}

/// One compactor pass. Returns whether the WAL was rewritten.
pub async fn compact_if_needed(store: &LocalStore, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compactor skip: {appends} appends since last compaction");
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}
