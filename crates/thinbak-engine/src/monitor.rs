//! Monitor tick: fold fresh diff output into the persisted
//! changed-chunk set. Cheap enough to run every few minutes; never
//! touches chunk data.

use tracing::{info, warn};

use thinbak_chunk::chunk_count;
use thinbak_lock::VolumeLock;
use thinbak_store::ChunkStore;

use crate::source::{DiffSource, SourceError};
use crate::{EngineError, Result};

/// What one tick did to one volume.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub volume: String,
    /// Chunk indices newly marked changed by this tick.
    pub added: usize,
    /// Total indices pending for the next session.
    pub pending: usize,
    pub volume_size: u64,
    /// True when a stale checkpoint forced a full-volume diff.
    pub full_fallback: bool,
}

/// Run one monitor tick for `volume`.
///
/// Ticks are idempotent-additive: the changed-chunk set only grows
/// (union), and re-observing the same change is a no-op. The new
/// checkpoint and the grown set are committed in one state write; any
/// failure before that leaves the persisted state untouched.
///
/// A held volume lock is [`EngineError::Busy`]; callers skip and retry
/// next tick.
pub fn tick(
    store: &ChunkStore,
    source: &dyn DiffSource,
    volume: &str,
    chunk_size: u64,
) -> Result<TickReport> {
    let _lock = VolumeLock::try_acquire(&store.volume_dir(volume))
        .map_err(|e| EngineError::from_lock(e, volume))?;

    let mut state = store.load(volume)?;
    // A chain fixes the chunk size for the volume's lifetime.
    let chunk_size = state
        .latest_session()
        .map(|s| s.chunk_size)
        .unwrap_or(chunk_size);

    let mut full_fallback = false;
    let diff = match source.diff(volume, state.checkpoint.as_deref(), false) {
        Ok(diff) => diff,
        Err(SourceError::NoBaseline) => return Err(EngineError::NoBaseline(volume.to_string())),
        Err(SourceError::CheckpointStale(cp)) => {
            warn!(volume, checkpoint = %cp, "checkpoint stale, falling back to full-volume diff");
            full_fallback = true;
            source.diff(volume, None, true)?
        }
        Err(e) => return Err(e.into()),
    };

    let before = state.changed.len();
    for extent in diff.extents {
        state.changed.insert_extent(extent?, chunk_size);
    }
    state.changed.truncate_to(chunk_count(diff.volume_size, chunk_size));
    state.volume_size = diff.volume_size;

    // Rotate the source-side checkpoint first: if the state commit then
    // fails, the stored checkpoint goes stale and the next tick
    // over-reports via the full fallback, never under-reports.
    source.commit_checkpoint(volume, &diff.checkpoint)?;
    state.checkpoint = Some(diff.checkpoint);
    store.commit(volume, &mut state, None)?;

    let report = TickReport {
        volume: volume.to_string(),
        added: state.changed.len().saturating_sub(before),
        pending: state.changed.len(),
        volume_size: state.volume_size,
        full_fallback,
    };
    info!(
        volume,
        added = report.added,
        pending = report.pending,
        "monitor tick complete"
    );
    Ok(report)
}
