use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{EngineError, Studio};

/// Compact once `threshold` appends have piled up since the last rewrite.
/// Returns the number of events kept, or `None` if below the threshold.
pub async fn compact_if_due(studio: &Studio, threshold: u64) -> Result<Option<usize>, EngineError> {
    let appends = studio.wal_appends_since_compact().await?;
    if appends < threshold.max(1) {
        return Ok(None);
    }
    let kept = studio.compact_wal().await?;
    info!("compacted WAL after {appends} appends, {kept} events kept");
    Ok(Some(kept))
}

/// Background task that periodically checks whether the WAL needs compacting.
pub async fn run_compactor(studio: Arc<Studio>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&studio, threshold).await {
            tracing::warn!("compaction skipped: {e}");
        }
    }
}
