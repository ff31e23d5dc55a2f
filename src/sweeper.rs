use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::model::Ms;
use crate::store::WalStore;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const NO_SHOW_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Rewrite the WAL once enough records have been appended since the last rewrite.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// One compactor tick. Returns whether a compaction ran.
pub async fn compact_if_due(store: &WalStore, threshold: u64) -> bool {
    let appended = store.appends_since_compact().await;
    if appended < threshold {
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            info!(
                "compacted WAL for {} after {appended} appends ({} classes)",
                store.organization_id(),
                store.class_count()
            );
            true
        }
        Err(e) => {
            warn!("compaction failed for {}: {e}", store.organization_id());
            false
        }
    }
}

/// Periodically mark confirmed bookings of finished classes as no-shows.
pub async fn run_no_show_sweeper(engine: Arc<Engine>, organization_id: String, grace: Ms) {
    let mut interval = tokio::time::interval(NO_SHOW_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let marked = engine.sweep_no_shows(&organization_id, grace).await;
        if marked > 0 {
            info!("marked {marked} no-shows for {organization_id}");
        } else {
            debug!("no-show sweep for {organization_id}: nothing to mark");
        }
    }
}
