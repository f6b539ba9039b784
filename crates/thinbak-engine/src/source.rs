//! Traits the engine uses to observe and read a volume.
//!
//! [`DiffSource`] answers "which byte ranges changed since this
//! checkpoint" and opens readers over checkpoint snapshots;
//! [`ReadSource`] provides the positional reads. Splitting the two
//! keeps the engine free of any LVM knowledge and lets tests drive
//! both from memory.

use std::fs::File;
use std::io;
use std::path::Path;

use thiserror::Error;

use thinbak_chunk::Extent;

#[derive(Error, Debug)]
pub enum SourceError {
    /// No checkpoint exists and a non-full diff was requested.
    #[error("no baseline checkpoint for this volume")]
    NoBaseline,

    /// The checkpoint names retained history that no longer exists.
    /// Callers fall back to a full-volume extent; change is never
    /// silently under-reported.
    #[error("checkpoint {0} is stale: retained history is gone")]
    CheckpointStale(String),

    /// The volume or its snapshot machinery is not usable right now.
    /// The checkpoint has not been advanced.
    #[error("diff source unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One diff observation: what changed, as of when, and how big the
/// volume is now.
pub struct Diff {
    /// Half-open byte extents, non-overlapping and ascending. Lazy; an
    /// item-level error aborts the pass without committing anything.
    pub extents: Box<dyn Iterator<Item = Result<Extent, SourceError>> + Send>,
    /// Token for this observation point. Stored as the volume checkpoint
    /// once the pass commits.
    pub checkpoint: String,
    /// Current volume size in bytes.
    pub volume_size: u64,
}

/// Computes changed byte extents for a volume.
pub trait DiffSource {
    /// Diff the volume against `checkpoint`.
    ///
    /// `full == true` yields a single extent covering the whole volume
    /// and needs no checkpoint. `full == false` with no checkpoint is
    /// [`SourceError::NoBaseline`].
    fn diff(&self, volume: &str, checkpoint: Option<&str>, full: bool)
        -> Result<Diff, SourceError>;

    /// Make `checkpoint` the new retained observation point, releasing
    /// whatever the previous checkpoint retained.
    ///
    /// Called after the extents have been consumed, before the state
    /// commit. If the process dies in between, the stored checkpoint
    /// goes stale and the next pass falls back to a full diff.
    fn commit_checkpoint(&self, volume: &str, checkpoint: &str) -> Result<(), SourceError>;

    /// Open a positional read source pinned to `checkpoint`'s snapshot.
    ///
    /// Session data must come from here, never from the live volume:
    /// the changed-chunk set describes the volume as of the checkpoint,
    /// and reading the live device would mix post-checkpoint bytes into
    /// chunks the set marks changed while leaving the rest old, a torn
    /// image matching no point in time.
    fn reader(&self, volume: &str, checkpoint: &str)
        -> Result<Box<dyn ReadSource>, SourceError>;
}

/// Positional reads of a volume image.
pub trait ReadSource {
    /// Fill `buf` from byte `offset`. Short reads past the end of the
    /// volume are the caller's error; the builder never reads past
    /// `len()`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Current volume size in bytes.
    fn len(&self) -> io::Result<u64>;
}

/// [`ReadSource`] over a block device or regular file.
pub struct FileReadSource {
    file: File,
}

impl FileReadSource {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
        })
    }
}

impl ReadSource for FileReadSource {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    fn len(&self) -> io::Result<u64> {
        use std::io::{Seek, SeekFrom};
        // Works for both regular files and block devices, unlike
        // metadata().len() which is 0 for devices.
        let mut f = self.file.try_clone()?;
        f.seek(SeekFrom::End(0))
    }
}
