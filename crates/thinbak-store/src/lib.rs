//! # thinbak-store
//!
//! On-disk chunk store for thinbak archives.
//!
//! ## Directory layout
//!
//! ```text
//! <backup_root>/
//! └── <volume_name>/
//!     ├── state.json            # checkpoint, changed-chunk set, session chain
//!     ├── .lock                 # advisory lock (thinbak-lock)
//!     └── S_20260823-101500/    # one session
//!         ├── 000000000         # chunk file: exactly chunk_size bytes (real data)
//!         ├── 000000001         # ... or 0 bytes (placeholder: inherit or zero)
//!         ├── manifest          # "<blake3-hex>|0 <chunk-file>" per line
//!         └── info.json         # session metadata (self-describing archive)
//! ```
//!
//! The state file is the single source of truth for the session chain.
//! Every mutation goes through [`ChunkStore::commit`], which is one
//! write-temp-then-rename operation: a crash mid-pass leaves either the old
//! state or the new state, never a mix, and a session directory that was
//! renamed into place but never registered is invisible to readers.

mod restore;
mod session;

pub use restore::{ChunkOrigin, Resolution, VerifyReport};
pub use session::{
    chunk_file_name, session_dir_name, SessionInfo, SessionWriter, StagedSession,
    INFO_FILE_NAME, MANIFEST_FILE_NAME,
};

use std::fs;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use thinbak_chunk::ChunkSet;

/// Per-volume state file name.
pub const STATE_FILE_NAME: &str = "state.json";

/// Current archive format version.
pub const FORMAT_VERSION: u32 = 1;

/// Errors that can occur during chunk store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Persisted state failed validation. Fatal for the volume; operator
    /// intervention required, never auto-repaired.
    #[error("corrupt state for volume {volume}: {reason}")]
    CorruptState { volume: String, reason: String },

    #[error("no session {token} in the chain for volume {volume}")]
    UnknownSession { volume: String, token: String },

    #[error("chunk digest mismatch in {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistent per-volume state: checkpoint, accumulated changed-chunk set,
/// and the session chain (oldest to newest, append-only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeState {
    pub format_version: u32,
    /// Opaque diff-source token identifying the last observed point in
    /// time. `None` until the first full session establishes a baseline.
    pub checkpoint: Option<String>,
    /// Chunk indices changed since the last session. Grows monotonically
    /// between sessions; cleared exactly once, atomically, at commit.
    pub changed: ChunkSet,
    /// Volume size observed at the last pass, in bytes.
    pub volume_size: u64,
    pub sessions: Vec<SessionInfo>,
}

impl VolumeState {
    pub fn new() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            checkpoint: None,
            changed: ChunkSet::new(),
            volume_size: 0,
            sessions: Vec::new(),
        }
    }

    pub fn latest_session(&self) -> Option<&SessionInfo> {
        self.sessions.last()
    }

    pub fn next_sequence(&self) -> u64 {
        self.sessions.last().map(|s| s.sequence + 1).unwrap_or(0)
    }

    pub fn has_chain(&self) -> bool {
        !self.sessions.is_empty()
    }

    fn validate(&self, volume: &str) -> Result<()> {
        let corrupt = |reason: String| StoreError::CorruptState {
            volume: volume.to_string(),
            reason,
        };
        if self.format_version > FORMAT_VERSION {
            return Err(corrupt(format!(
                "format version {} is newer than supported {FORMAT_VERSION}",
                self.format_version
            )));
        }
        let mut chunk_size = None;
        for pair in self.sessions.windows(2) {
            if pair[1].sequence != pair[0].sequence + 1 {
                return Err(corrupt(format!(
                    "session sequence jumps from {} to {}",
                    pair[0].sequence, pair[1].sequence
                )));
            }
            if pair[1].token <= pair[0].token {
                return Err(corrupt(format!(
                    "session token {} does not sort after {}",
                    pair[1].token, pair[0].token
                )));
            }
        }
        for ses in &self.sessions {
            if ses.chunk_size == 0 || !ses.chunk_size.is_power_of_two() {
                return Err(corrupt(format!(
                    "session {} has invalid chunk size {}",
                    ses.token, ses.chunk_size
                )));
            }
            if *chunk_size.get_or_insert(ses.chunk_size) != ses.chunk_size {
                return Err(corrupt(format!(
                    "session {} changes chunk size mid-chain",
                    ses.token
                )));
            }
        }
        Ok(())
    }
}

impl Default for VolumeState {
    fn default() -> Self {
        Self::new()
    }
}

/// The chunk store owns everything under the backup root. No other
/// component writes state files or session directories directly.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    /// Open (and create if missing) a store rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn volume_dir(&self, volume: &str) -> PathBuf {
        self.root.join(volume)
    }

    pub fn session_dir(&self, volume: &str, token: &str) -> PathBuf {
        self.volume_dir(volume).join(session_dir_name(token))
    }

    /// Load a volume's persisted state.
    ///
    /// A missing state file means the volume has never been touched and
    /// yields a fresh empty state. The state file is authoritative:
    /// leftover `-tmp` build directories and finalized session
    /// directories the chain does not reference (a crash between the
    /// directory rename and the state commit) are both discarded here,
    /// so aborted passes never accumulate on disk. Session directories
    /// with no state file at all are corruption, not sweepable.
    pub fn load(&self, volume: &str) -> Result<VolumeState> {
        let dir = self.volume_dir(volume);
        fs::create_dir_all(&dir)?;
        self.sweep_stale(volume, &dir)?;

        let path = dir.join(STATE_FILE_NAME);
        if !path.exists() {
            if self.session_dirs(&dir)?.next().is_some() {
                return Err(StoreError::CorruptState {
                    volume: volume.to_string(),
                    reason: "session directories exist but the state file is missing".to_string(),
                });
            }
            return Ok(VolumeState::new());
        }

        let file = fs::File::open(&path)?;
        let state: VolumeState =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                StoreError::CorruptState {
                    volume: volume.to_string(),
                    reason: format!("unreadable state file: {e}"),
                }
            })?;
        state.validate(volume)?;

        for entry in self.session_dirs(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy().into_owned();
            let token = name.trim_start_matches("S_");
            if !state.sessions.iter().any(|s| s.token == token) {
                warn!(volume, session = %name, "discarding unregistered session directory from an aborted pass");
                fs::remove_dir_all(entry.path())?;
            }
        }

        Ok(state)
    }

    /// Finalized `S_<token>` directories under a volume directory.
    fn session_dirs(
        &self,
        dir: &Path,
    ) -> Result<impl Iterator<Item = std::io::Result<fs::DirEntry>>> {
        Ok(fs::read_dir(dir)?.filter(|entry| match entry {
            Ok(e) => {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with("S_") && !name.ends_with("-tmp") && e.path().is_dir()
            }
            Err(_) => true,
        }))
    }

    /// Commit a volume's state, optionally registering a newly staged
    /// session, as one atomic operation.
    ///
    /// When a staged session is supplied its directory is renamed from
    /// `-tmp` to its final name first, then the state file (with the
    /// session appended to the chain) replaces the old one via a temp-file
    /// rename. Only the state rename registers anything: a crash between
    /// the two renames leaves an orphan directory and an untouched state,
    /// and the next load discards the orphan.
    ///
    /// A staged session must extend the chain: its sequence follows the
    /// head and its token sorts after the head's. Anything else is
    /// rejected here, before the directory rename, so a bad session can
    /// never poison a chain that loads fine today.
    ///
    /// Any subsequent [`ChunkStore::load`] sees the committed state.
    pub fn commit(
        &self,
        volume: &str,
        state: &mut VolumeState,
        new_session: Option<StagedSession>,
    ) -> Result<()> {
        let dir = self.volume_dir(volume);
        fs::create_dir_all(&dir)?;

        if let Some(mut staged) = new_session {
            if staged.info().sequence != state.next_sequence() {
                return Err(StoreError::CorruptState {
                    volume: volume.to_string(),
                    reason: format!(
                        "staged session sequence {} does not follow chain head (expected {})",
                        staged.info().sequence,
                        state.next_sequence()
                    ),
                });
            }
            if let Some(last) = state.latest_session() {
                if staged.info().token <= last.token {
                    return Err(StoreError::CorruptState {
                        volume: volume.to_string(),
                        reason: format!(
                            "staged session token {} does not sort after {}",
                            staged.info().token,
                            last.token
                        ),
                    });
                }
            }
            staged.finalize()?;
            state.sessions.push(staged.into_info());
        }

        state.format_version = FORMAT_VERSION;
        // A state that would fail the next load must never be written.
        state.validate(volume)?;
        self.write_state(volume, &dir, state)?;
        debug!(volume, sessions = state.sessions.len(), "state committed");
        Ok(())
    }

    fn write_state(&self, volume: &str, dir: &Path, state: &VolumeState) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, state).map_err(|e| StoreError::CorruptState {
            volume: volume.to_string(),
            reason: format!("state serialization failed: {e}"),
        })?;
        tmp.as_file().sync_all()?;
        tmp.persist(dir.join(STATE_FILE_NAME))
            .map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    /// Begin building a session into a `-tmp` directory.
    ///
    /// Nothing is registered until the returned writer is finished and
    /// passed to [`ChunkStore::commit`]; dropping it discards the build.
    pub fn stage_session(&self, volume: &str, info: SessionInfo) -> Result<SessionWriter> {
        SessionWriter::create(&self.volume_dir(volume), info)
    }

    /// Ordered session chain, oldest to newest.
    pub fn list_sessions<'a>(&self, state: &'a VolumeState) -> &'a [SessionInfo] {
        &state.sessions
    }

    /// Remove `-tmp` session directories left behind by an aborted build.
    fn sweep_stale(&self, volume: &str, dir: &Path) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("S_") && name.ends_with("-tmp") && entry.path().is_dir() {
                warn!(volume, dir = %name, "sweeping stale session build directory");
                fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ChunkStore) {
        let tmp = TempDir::new().unwrap();
        let store = ChunkStore::open(tmp.path()).unwrap();
        (tmp, store)
    }

    fn staged(
        store: &ChunkStore,
        state: &VolumeState,
        token: &str,
        chunk_size: u64,
        volume_size: u64,
    ) -> StagedSession {
        let info = SessionInfo {
            sequence: state.next_sequence(),
            token: token.to_string(),
            chunk_size,
            volume_size,
            chunks_written: 0,
        };
        let mut writer = store.stage_session("vol1", info).unwrap();
        let total = thinbak_chunk::chunk_count(volume_size, chunk_size);
        for index in 0..total {
            writer.write_placeholder(index).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_load_fresh_volume() {
        let (_tmp, store) = store();
        let state = store.load("vol1").unwrap();
        assert!(state.checkpoint.is_none());
        assert!(state.changed.is_empty());
        assert!(!state.has_chain());
        assert_eq!(state.next_sequence(), 0);
    }

    #[test]
    fn test_commit_then_load_roundtrip() {
        let (_tmp, store) = store();
        let mut state = store.load("vol1").unwrap();
        state.checkpoint = Some("tick-1".to_string());
        state.changed.insert(7);
        state.volume_size = 4096;
        store.commit("vol1", &mut state, None).unwrap();

        let loaded = store.load("vol1").unwrap();
        assert_eq!(loaded.checkpoint.as_deref(), Some("tick-1"));
        assert!(loaded.changed.contains(7));
        assert_eq!(loaded.volume_size, 4096);
    }

    #[test]
    fn test_commit_registers_session() {
        let (_tmp, store) = store();
        let mut state = store.load("vol1").unwrap();
        let staged = staged(&store, &state, "20260823-101500", 4, 20);
        store.commit("vol1", &mut state, Some(staged)).unwrap();

        let loaded = store.load("vol1").unwrap();
        assert_eq!(loaded.sessions.len(), 1);
        assert_eq!(loaded.sessions[0].sequence, 0);
        assert!(store.session_dir("vol1", "20260823-101500").exists());
        assert_eq!(loaded.next_sequence(), 1);
    }

    #[test]
    fn test_dropped_writer_leaves_state_untouched() {
        let (_tmp, store) = store();
        let mut state = store.load("vol1").unwrap();
        let s = staged(&store, &state, "20260823-101500", 4, 20);
        store.commit("vol1", &mut state, Some(s)).unwrap();

        // Simulated failure after partial chunk writes, before commit:
        // the staged session is dropped instead of committed.
        let info = SessionInfo {
            sequence: state.next_sequence(),
            token: "20260823-110000".to_string(),
            chunk_size: 4,
            volume_size: 20,
            chunks_written: 0,
        };
        let mut writer = store.stage_session("vol1", info).unwrap();
        writer.write_chunk(0, &[1, 2, 3, 4]).unwrap();
        drop(writer);

        let loaded = store.load("vol1").unwrap();
        assert_eq!(loaded.sessions.len(), 1, "no session with the new token registered");
        assert!(!store.session_dir("vol1", "20260823-110000").exists());
    }

    #[test]
    fn test_stale_tmp_dir_swept_on_load() {
        let (_tmp, store) = store();
        let dir = store.volume_dir("vol1").join("S_20260823-101500-tmp");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("000000000"), b"part").unwrap();

        store.load("vol1").unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_corrupt_state_file_rejected() {
        let (_tmp, store) = store();
        let dir = store.volume_dir("vol1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(STATE_FILE_NAME), b"{ not json").unwrap();

        let err = store.load("vol1").unwrap_err();
        assert!(matches!(err, StoreError::CorruptState { .. }));
    }

    #[test]
    fn test_newer_format_version_rejected() {
        let (_tmp, store) = store();
        let mut state = VolumeState::new();
        state.format_version = FORMAT_VERSION + 1;
        let dir = store.volume_dir("vol1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(STATE_FILE_NAME),
            serde_json::to_vec(&state).unwrap(),
        )
        .unwrap();

        let err = store.load("vol1").unwrap_err();
        assert!(matches!(err, StoreError::CorruptState { .. }));
    }

    #[test]
    fn test_out_of_order_sequence_rejected_at_commit() {
        let (_tmp, store) = store();
        let mut state = store.load("vol1").unwrap();
        let info = SessionInfo {
            sequence: 5, // chain head expects 0
            token: "20260823-101500".to_string(),
            chunk_size: 4,
            volume_size: 20,
            chunks_written: 0,
        };
        let writer = store.stage_session("vol1", info).unwrap();
        let staged = writer.finish().unwrap();
        let err = store.commit("vol1", &mut state, Some(staged)).unwrap_err();
        assert!(matches!(err, StoreError::CorruptState { .. }));
        assert!(store.load("vol1").unwrap().sessions.is_empty());
    }

    #[test]
    fn test_non_ascending_token_rejected_at_commit() {
        let (_tmp, store) = store();
        let mut state = store.load("vol1").unwrap();
        let s = staged(&store, &state, "20260823-101500", 4, 20);
        store.commit("vol1", &mut state, Some(s)).unwrap();

        // Correct sequence, but the token sorts before the chain head
        // (a clock that stepped backwards).
        let s = staged(&store, &state, "20260823-090000", 4, 20);
        let err = store.commit("vol1", &mut state, Some(s)).unwrap_err();
        assert!(matches!(err, StoreError::CorruptState { .. }));

        // The chain is untouched and still loads.
        let loaded = store.load("vol1").unwrap();
        assert_eq!(loaded.sessions.len(), 1);
        assert_eq!(loaded.sessions[0].token, "20260823-101500");
        assert!(!store.session_dir("vol1", "20260823-090000").exists());
    }

    #[test]
    fn test_orphan_session_dir_discarded_on_load() {
        let (_tmp, store) = store();
        let mut state = store.load("vol1").unwrap();
        let s = staged(&store, &state, "20260823-101500", 4, 20);
        store.commit("vol1", &mut state, Some(s)).unwrap();

        // Crash between the directory rename and the state write: the
        // directory exists under its final name but the chain never
        // registered it.
        let orphan = store.session_dir("vol1", "20260823-110000");
        fs::create_dir_all(&orphan).unwrap();
        fs::write(orphan.join("000000000"), b"data").unwrap();

        let loaded = store.load("vol1").unwrap();
        assert_eq!(loaded.sessions.len(), 1);
        assert!(!orphan.exists(), "unregistered session directory removed");
        assert!(store.session_dir("vol1", "20260823-101500").exists());
    }

    #[test]
    fn test_sessions_without_state_file_rejected() {
        let (_tmp, store) = store();
        let dir = store.volume_dir("vol1").join("S_20260823-101500");
        fs::create_dir_all(&dir).unwrap();

        // A lost state file is corruption, not a fresh volume: the
        // session data must not be silently discarded or shadowed.
        let err = store.load("vol1").unwrap_err();
        assert!(matches!(err, StoreError::CorruptState { .. }));
        assert!(dir.exists());
    }

    #[test]
    fn test_broken_chain_in_state_rejected() {
        let (_tmp, store) = store();
        let mut state = VolumeState::new();
        for (seq, token) in [(0u64, "20260801-000000"), (2, "20260802-000000")] {
            state.sessions.push(SessionInfo {
                sequence: seq,
                token: token.to_string(),
                chunk_size: 4,
                volume_size: 20,
                chunks_written: 0,
            });
        }
        let dir = store.volume_dir("vol1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(STATE_FILE_NAME),
            serde_json::to_vec(&state).unwrap(),
        )
        .unwrap();

        let err = store.load("vol1").unwrap_err();
        assert!(matches!(err, StoreError::CorruptState { .. }));
    }
}
