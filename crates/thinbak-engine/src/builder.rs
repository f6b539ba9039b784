//! Session builder: turn the accumulated changed-chunk set into an
//! immutable session directory.
//!
//! The build stages everything under a `-tmp` directory and hands the
//! result to the store's atomic commit. Registration, clearing the
//! changed set, and (for full sessions) advancing the checkpoint happen
//! in that single commit; a failure at any earlier point leaves the
//! volume state exactly as it was.

use tracing::info;

use thinbak_chunk::{chunk_count, ChunkSet};
use thinbak_lock::VolumeLock;
use thinbak_store::{ChunkStore, SessionInfo};

use crate::source::DiffSource;
use crate::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Every chunk written with real data. Establishes the baseline;
    /// refused when a chain already exists unless `force` is set.
    Full { force: bool },
    /// Changed chunks from the accumulated set; everything else a
    /// placeholder. Requires a prior chain.
    Incremental,
}

/// Build and commit one session for `volume`.
///
/// `token` is the session's `YYYYMMDD-HHMMSS` UTC stamp; callers
/// generate it from the clock, tests pass fixed values. An incremental
/// with an empty changed set still produces an (all-placeholder)
/// session, so the chain stays dense and every stamp is auditable.
///
/// Chunk data is read from the checkpoint's snapshot, so the session is
/// bit-identical to the volume at the checkpoint regardless of writes
/// landing on the live device during the build.
pub fn build(
    store: &ChunkStore,
    source: &dyn DiffSource,
    volume: &str,
    mode: BuildMode,
    token: &str,
    chunk_size: u64,
) -> Result<SessionInfo> {
    let _lock = VolumeLock::try_acquire(&store.volume_dir(volume))
        .map_err(|e| EngineError::from_lock(e, volume))?;

    let mut state = store.load(volume)?;

    let (chunk_size, read, changed, new_checkpoint) = match mode {
        BuildMode::Full { force } => {
            if state.has_chain() && !force {
                return Err(EngineError::ChainExists(volume.to_string()));
            }
            // The full diff also plants the snapshot the next
            // incremental will diff against.
            let diff = source.diff(volume, state.checkpoint.as_deref(), true)?;
            for extent in diff.extents {
                extent?;
            }
            let chunk_size = state
                .latest_session()
                .map(|s| s.chunk_size)
                .unwrap_or(chunk_size);
            let read = source.reader(volume, &diff.checkpoint)?;
            let total = chunk_count(diff.volume_size, chunk_size);
            let mut changed = ChunkSet::new();
            changed.insert_index_range(0, total);
            (chunk_size, read, changed, Some(diff.checkpoint))
        }
        BuildMode::Incremental => {
            let prev = state
                .latest_session()
                .ok_or_else(|| EngineError::PriorChainMissing(volume.to_string()))?
                .clone();
            let checkpoint = state
                .checkpoint
                .as_deref()
                .ok_or_else(|| EngineError::NoBaseline(volume.to_string()))?;
            let chunk_size = prev.chunk_size;
            let read = source.reader(volume, checkpoint)?;
            let volume_size = read.len()?;
            let total = chunk_count(volume_size, chunk_size);

            let mut changed = state.changed.clone();
            changed.truncate_to(total);
            if volume_size > prev.volume_size {
                // The grown tail has no diff history; send it whole,
                // including the previously partial last chunk.
                changed.insert_index_range(prev.volume_size / chunk_size, total);
            }
            (chunk_size, read, changed, None)
        }
    };
    let volume_size = read.len()?;

    let total = chunk_count(volume_size, chunk_size);
    let info = SessionInfo {
        sequence: state.next_sequence(),
        token: token.to_string(),
        chunk_size,
        volume_size,
        chunks_written: 0,
    };
    let mut writer = store.stage_session(volume, info)?;

    let mut buf = vec![0u8; chunk_size as usize];
    for index in 0..total {
        if !changed.contains(index) {
            writer.write_placeholder(index)?;
            continue;
        }
        let offset = index * chunk_size;
        // The last chunk of an unaligned volume is short on disk;
        // stored zero-padded to exactly chunk_size.
        let take = chunk_size.min(volume_size - offset) as usize;
        buf.fill(0);
        read.read_exact_at(offset, &mut buf[..take])?;
        writer.write_chunk(index, &buf)?;
    }
    let staged = writer.finish()?;
    let built = staged.info().clone();

    if let Some(checkpoint) = new_checkpoint {
        source.commit_checkpoint(volume, &checkpoint)?;
        state.checkpoint = Some(checkpoint);
    }
    state.changed = ChunkSet::new();
    state.volume_size = volume_size;
    store.commit(volume, &mut state, Some(staged))?;

    info!(
        volume,
        session = %built.token,
        sequence = built.sequence,
        chunks = built.chunks_written,
        total,
        "session committed"
    );
    Ok(built)
}
