//! Session directories and the staged-build writer.
//!
//! A session is built under `S_<token>-tmp`, fully populated and synced,
//! and only then renamed to `S_<token>` and registered in the volume state
//! by [`crate::ChunkStore::commit`].

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Result, StoreError};

/// Per-session manifest file: one line per chunk,
/// `<blake3-hex> <chunk-file>` for real data, `0 <chunk-file>` for
/// placeholders.
pub const MANIFEST_FILE_NAME: &str = "manifest";

/// Per-session metadata copy, so a session directory is self-describing
/// even without the volume state file.
pub const INFO_FILE_NAME: &str = "info.json";

/// Width of zero-padded decimal chunk file names.
const CHUNK_NAME_WIDTH: usize = 9;

/// Directory name for a session token, e.g. `S_20260823-101500`.
pub fn session_dir_name(token: &str) -> String {
    format!("S_{token}")
}

/// Chunk file name for a logical chunk index: zero-padded decimal, so
/// lexicographic order equals index order.
pub fn chunk_file_name(index: u64) -> String {
    format!("{index:0width$}", width = CHUNK_NAME_WIDTH)
}

/// Immutable record of one completed backup session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Monotonically increasing per volume, starting at 0.
    pub sequence: u64,
    /// Ordering key, `YYYYMMDD-HHMMSS` UTC. Lexicographic order is
    /// chronological order.
    pub token: String,
    pub chunk_size: u64,
    /// Volume size in bytes at capture time.
    pub volume_size: u64,
    /// Number of real-data chunk files in this session.
    pub chunks_written: u64,
}

/// Writes one session's chunk files into a temporary directory.
///
/// Chunk indices must be fed in ascending order, one call per index in
/// `[0, total_chunks)`. Dropping the writer (or the staged session it
/// produces) before commit removes the temporary directory.
#[derive(Debug)]
pub struct SessionWriter {
    tmp_dir: PathBuf,
    final_dir: PathBuf,
    manifest: BufWriter<File>,
    info: SessionInfo,
    next_index: u64,
    finished: bool,
}

impl SessionWriter {
    pub(crate) fn create(volume_dir: &Path, info: SessionInfo) -> Result<Self> {
        let final_dir = volume_dir.join(session_dir_name(&info.token));
        let tmp_dir = volume_dir.join(format!("S_{}-tmp", info.token));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;
        let manifest = BufWriter::new(File::create(tmp_dir.join(MANIFEST_FILE_NAME))?);
        debug!(session = %tmp_dir.display(), "session build started");
        Ok(Self {
            tmp_dir,
            final_dir,
            manifest,
            info,
            next_index: 0,
            finished: false,
        })
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Write a real-data chunk file. `data` must be exactly `chunk_size`
    /// bytes; the session builder zero-pads the volume tail before calling.
    pub fn write_chunk(&mut self, index: u64, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len() as u64, self.info.chunk_size);
        debug_assert_eq!(index, self.next_index, "chunk indices must be ascending");
        self.next_index = index + 1;

        let name = chunk_file_name(index);
        let file_path = self.tmp_dir.join(&name);
        let mut file = File::create(&file_path)?;
        file.write_all(data)?;
        file.sync_all()?;

        let digest = blake3::hash(data);
        writeln!(self.manifest, "{} {name}", digest.to_hex())?;
        self.info.chunks_written += 1;
        Ok(())
    }

    /// Write a zero-length placeholder: "unchanged, inherit from an older
    /// session or read as zeros".
    pub fn write_placeholder(&mut self, index: u64) -> Result<()> {
        debug_assert_eq!(index, self.next_index, "chunk indices must be ascending");
        self.next_index = index + 1;

        let name = chunk_file_name(index);
        File::create(self.tmp_dir.join(&name))?;
        writeln!(self.manifest, "0 {name}")?;
        Ok(())
    }

    /// Flush and sync everything; the build is complete but unregistered.
    pub fn finish(mut self) -> Result<StagedSession> {
        self.manifest.flush()?;
        self.manifest.get_ref().sync_all()?;

        let info_file = File::create(self.tmp_dir.join(INFO_FILE_NAME))?;
        serde_json::to_writer_pretty(&info_file, &self.info).map_err(|e| {
            StoreError::CorruptState {
                volume: String::new(),
                reason: format!("session info serialization failed: {e}"),
            }
        })?;
        info_file.sync_all()?;

        // Make the directory entries durable before the commit rename.
        File::open(&self.tmp_dir)?.sync_all()?;

        self.finished = true;
        Ok(StagedSession {
            tmp_dir: self.tmp_dir.clone(),
            final_dir: self.final_dir.clone(),
            info: self.info.clone(),
            committed: false,
        })
    }
}

impl Drop for SessionWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = fs::remove_dir_all(&self.tmp_dir);
        }
    }
}

/// A fully built, synced, not-yet-registered session directory.
#[derive(Debug)]
pub struct StagedSession {
    tmp_dir: PathBuf,
    final_dir: PathBuf,
    info: SessionInfo,
    committed: bool,
}

impl StagedSession {
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub(crate) fn into_info(self) -> SessionInfo {
        debug_assert!(self.committed, "into_info before finalize");
        self.info.clone()
    }

    /// Rename the build directory to its final name. An orphan directory
    /// with the same name can only be left over from a pass that died
    /// between its rename and its state commit; it was never registered,
    /// so replacing it is safe.
    pub(crate) fn finalize(&mut self) -> Result<()> {
        if self.final_dir.exists() {
            fs::remove_dir_all(&self.final_dir)?;
        }
        fs::rename(&self.tmp_dir, &self.final_dir)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedSession {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_dir_all(&self.tmp_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info(token: &str) -> SessionInfo {
        SessionInfo {
            sequence: 0,
            token: token.to_string(),
            chunk_size: 4,
            volume_size: 20,
            chunks_written: 0,
        }
    }

    #[test]
    fn test_chunk_file_name_width() {
        assert_eq!(chunk_file_name(0), "000000000");
        assert_eq!(chunk_file_name(42), "000000042");
        assert_eq!(chunk_file_name(123_456_789), "123456789");
    }

    #[test]
    fn test_writer_produces_chunks_manifest_and_info() {
        let dir = TempDir::new().unwrap();
        let mut w = SessionWriter::create(dir.path(), info("20260823-101500")).unwrap();
        w.write_chunk(0, b"abcd").unwrap();
        w.write_placeholder(1).unwrap();
        w.write_chunk(2, b"wxyz").unwrap();
        let staged = w.finish().unwrap();

        let tmp = dir.path().join("S_20260823-101500-tmp");
        assert_eq!(fs::metadata(tmp.join("000000000")).unwrap().len(), 4);
        assert_eq!(fs::metadata(tmp.join("000000001")).unwrap().len(), 0);

        let manifest = fs::read_to_string(tmp.join(MANIFEST_FILE_NAME)).unwrap();
        let lines: Vec<&str> = manifest.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], format!("{} 000000000", blake3::hash(b"abcd").to_hex()));
        assert_eq!(lines[1], "0 000000001");

        let loaded: SessionInfo =
            serde_json::from_str(&fs::read_to_string(tmp.join(INFO_FILE_NAME)).unwrap()).unwrap();
        assert_eq!(loaded.chunks_written, 2);
        assert_eq!(staged.info().chunks_written, 2);
    }

    #[test]
    fn test_dropped_writer_removes_tmp_dir() {
        let dir = TempDir::new().unwrap();
        let mut w = SessionWriter::create(dir.path(), info("20260823-101500")).unwrap();
        w.write_chunk(0, b"abcd").unwrap();
        drop(w);
        assert!(!dir.path().join("S_20260823-101500-tmp").exists());
    }

    #[test]
    fn test_dropped_staged_session_removes_tmp_dir() {
        let dir = TempDir::new().unwrap();
        let w = SessionWriter::create(dir.path(), info("20260823-101500")).unwrap();
        let staged = w.finish().unwrap();
        drop(staged);
        assert!(!dir.path().join("S_20260823-101500-tmp").exists());
    }
}
