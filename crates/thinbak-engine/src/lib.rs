//! # thinbak-engine
//!
//! The backup passes: monitor ticks that accumulate change metadata, and
//! session builds that materialize chunk data.
//!
//! The engine talks to the block layer only through the [`DiffSource`]
//! and [`ReadSource`] traits. The LVM thin-pool adapter in [`thinlvm`]
//! implements them for production; tests script them in memory.

pub mod builder;
pub mod monitor;
pub mod source;
pub mod thinlvm;

pub use builder::{build, BuildMode};
pub use monitor::{tick, TickReport};
pub use source::{Diff, DiffSource, FileReadSource, ReadSource, SourceError};
pub use thinlvm::ThinDeltaSource;

use std::io;

use thiserror::Error;

use thinbak_lock::LockError;
use thinbak_store::StoreError;

/// Errors from a monitor tick or session build against one volume.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Another pass holds the volume lock. A monitor tick treats this as
    /// a skip; a send pass treats it as a failure.
    #[error("volume {0} is busy: another pass is running")]
    Busy(String),

    /// No checkpoint and no session chain: nothing to diff against.
    #[error("volume {0} has no baseline; run `thinbak send --full` first")]
    NoBaseline(String),

    /// Incremental session requested for a volume with no chain.
    #[error("volume {0} has no prior session chain for an incremental")]
    PriorChainMissing(String),

    /// Full session requested for a volume that already has a chain.
    #[error("volume {0} already has a session chain; full send refused")]
    ChainExists(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub(crate) fn from_lock(err: LockError, volume: &str) -> Self {
        match err {
            LockError::Busy(_) => EngineError::Busy(volume.to_string()),
            LockError::Io(e) => EngineError::Io(e),
        }
    }

    /// True for the lock-contention case, which monitor callers report
    /// and skip rather than fail on.
    pub fn is_busy(&self) -> bool {
        matches!(self, EngineError::Busy(_))
    }
}
