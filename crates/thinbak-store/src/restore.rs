//! Resolving chunk values across a session chain.
//!
//! A placeholder (zero-length) chunk file means "unchanged": its value is
//! the nearest older session's real-data file at the same index, or
//! all-zero bytes if no session in the chain has one. Resolution is a pure
//! newest-to-oldest fold over the chain by path and index, never by live
//! references into session directories.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::info;

use thinbak_chunk::chunk_count;

use crate::session::{chunk_file_name, MANIFEST_FILE_NAME};
use crate::{ChunkStore, Result, StoreError, VolumeState};

/// Where one logical chunk's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOrigin {
    /// No session in the chain carries data for this index: all zeros.
    Zero,
    /// Real data in the session with this token.
    Session { sequence: u64, token: String },
}

/// Fully resolved view of a volume as of one session.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub token: String,
    pub volume_size: u64,
    pub chunk_size: u64,
    /// One origin per chunk index in `0..chunk_count(volume_size)`.
    pub origins: Vec<ChunkOrigin>,
}

/// Outcome of verifying one session directory against its manifest.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub token: String,
    pub data_chunks: u64,
    pub placeholders: u64,
}

impl ChunkStore {
    fn target_session<'a>(
        &self,
        volume: &str,
        state: &'a VolumeState,
        token: Option<&str>,
    ) -> Result<usize> {
        match token {
            Some(t) => state
                .sessions
                .iter()
                .position(|s| s.token == t)
                .ok_or_else(|| StoreError::UnknownSession {
                    volume: volume.to_string(),
                    token: t.to_string(),
                }),
            None => {
                if state.sessions.is_empty() {
                    Err(StoreError::UnknownSession {
                        volume: volume.to_string(),
                        token: "(latest)".to_string(),
                    })
                } else {
                    Ok(state.sessions.len() - 1)
                }
            }
        }
    }

    /// Resolve every chunk index of `volume` as of the given session
    /// (latest when `token` is `None`).
    ///
    /// Walks the chain newest to oldest per index and stops at the first
    /// real-data file; an exhausted chain resolves to zeros. A chunk file
    /// that is neither empty nor exactly `chunk_size` bytes is corruption.
    pub fn resolve(
        &self,
        volume: &str,
        state: &VolumeState,
        token: Option<&str>,
    ) -> Result<Resolution> {
        let target = self.target_session(volume, state, token)?;
        let chain = &state.sessions[..=target];
        let head = &chain[target];
        let total = chunk_count(head.volume_size, head.chunk_size);

        let mut origins = Vec::with_capacity(total as usize);
        for index in 0..total {
            let mut origin = ChunkOrigin::Zero;
            for ses in chain.iter().rev() {
                let path = self
                    .session_dir(volume, &ses.token)
                    .join(chunk_file_name(index));
                let len = match fs::metadata(&path) {
                    Ok(meta) => meta.len(),
                    // Absent file: this session predates the chunk (the
                    // volume was smaller then); keep walking.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(StoreError::Io(e)),
                };
                if len == 0 {
                    continue;
                }
                if len != head.chunk_size {
                    return Err(StoreError::CorruptState {
                        volume: volume.to_string(),
                        reason: format!(
                            "chunk file {} has size {len}, expected 0 or {}",
                            path.display(),
                            head.chunk_size
                        ),
                    });
                }
                origin = ChunkOrigin::Session {
                    sequence: ses.sequence,
                    token: ses.token.clone(),
                };
                break;
            }
            origins.push(origin);
        }

        Ok(Resolution {
            token: head.token.clone(),
            volume_size: head.volume_size,
            chunk_size: head.chunk_size,
            origins,
        })
    }

    /// Materialize a session's volume image into `dest`, bit-exact.
    ///
    /// Zero-origin chunks are skipped; the destination is sized to the
    /// volume first, so skipped ranges read back as zeros.
    pub fn restore_to_file(
        &self,
        volume: &str,
        state: &VolumeState,
        token: Option<&str>,
        dest: &Path,
    ) -> Result<u64> {
        let resolution = self.resolve(volume, state, token)?;
        let chunk_size = resolution.chunk_size;

        let mut out = File::create(dest)?;
        out.set_len(resolution.volume_size)?;

        let mut buf = vec![0u8; chunk_size as usize];
        for (index, origin) in resolution.origins.iter().enumerate() {
            let ChunkOrigin::Session { token, .. } = origin else {
                continue;
            };
            let offset = index as u64 * chunk_size;
            let path = self
                .session_dir(volume, token)
                .join(chunk_file_name(index as u64));
            File::open(&path)?.read_exact(&mut buf)?;

            // The final chunk is stored zero-padded to chunk_size; only
            // the bytes inside the volume are written back.
            let take = chunk_size.min(resolution.volume_size - offset) as usize;
            out.seek(SeekFrom::Start(offset))?;
            out.write_all(&buf[..take])?;
        }
        out.sync_all()?;

        info!(
            volume,
            session = %resolution.token,
            bytes = resolution.volume_size,
            dest = %dest.display(),
            "volume restored"
        );
        Ok(resolution.volume_size)
    }

    /// Check one session directory against its manifest: placeholder
    /// files must be empty, real-data files must match their recorded
    /// BLAKE3 digest, and the manifest must cover every chunk index.
    pub fn verify_session(
        &self,
        volume: &str,
        state: &VolumeState,
        token: Option<&str>,
    ) -> Result<VerifyReport> {
        let target = self.target_session(volume, state, token)?;
        let ses = &state.sessions[target];
        let dir = self.session_dir(volume, &ses.token);
        let corrupt = |reason: String| StoreError::CorruptState {
            volume: volume.to_string(),
            reason,
        };

        let manifest = fs::read_to_string(dir.join(MANIFEST_FILE_NAME))?;
        let mut data_chunks = 0u64;
        let mut placeholders = 0u64;
        let mut lines = 0u64;

        for (lineno, line) in manifest.lines().enumerate() {
            let (digest, name) = line
                .split_once(' ')
                .ok_or_else(|| corrupt(format!("manifest line {} malformed", lineno + 1)))?;
            let path = dir.join(name);
            lines += 1;

            if digest == "0" {
                if fs::metadata(&path)?.len() != 0 {
                    return Err(corrupt(format!(
                        "placeholder {} is not empty",
                        path.display()
                    )));
                }
                placeholders += 1;
                continue;
            }

            let data = fs::read(&path)?;
            if data.len() as u64 != ses.chunk_size {
                return Err(corrupt(format!(
                    "chunk file {} has size {}, expected {}",
                    path.display(),
                    data.len(),
                    ses.chunk_size
                )));
            }
            let actual = blake3::hash(&data).to_hex().to_string();
            if actual != digest {
                return Err(StoreError::DigestMismatch {
                    path,
                    expected: digest.to_string(),
                    actual,
                });
            }
            data_chunks += 1;
        }

        let total = chunk_count(ses.volume_size, ses.chunk_size);
        if lines != total {
            return Err(corrupt(format!(
                "manifest covers {lines} chunks, volume has {total}"
            )));
        }
        if data_chunks != ses.chunks_written {
            return Err(corrupt(format!(
                "manifest has {data_chunks} data chunks, session recorded {}",
                ses.chunks_written
            )));
        }

        Ok(VerifyReport {
            token: ses.token.clone(),
            data_chunks,
            placeholders,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SessionInfo, VolumeState};
    use tempfile::TempDir;

    const C: u64 = 4;

    fn build_session(
        store: &ChunkStore,
        state: &mut VolumeState,
        token: &str,
        volume_size: u64,
        chunks: &[(u64, &[u8])],
    ) {
        let info = SessionInfo {
            sequence: state.next_sequence(),
            token: token.to_string(),
            chunk_size: C,
            volume_size,
            chunks_written: 0,
        };
        let mut w = store.stage_session("vol1", info).unwrap();
        let total = chunk_count(volume_size, C);
        for index in 0..total {
            match chunks.iter().find(|(i, _)| *i == index) {
                Some((_, data)) => {
                    let mut padded = data.to_vec();
                    padded.resize(C as usize, 0);
                    w.write_chunk(index, &padded).unwrap()
                }
                None => w.write_placeholder(index).unwrap(),
            }
        }
        let staged = w.finish().unwrap();
        store.commit("vol1", state, Some(staged)).unwrap();
    }

    /// The worked example: 20-byte volume, 5 chunks, full session then an
    /// incremental with chunks 1 and 2 changed.
    fn example_chain(store: &ChunkStore) -> VolumeState {
        let mut state = store.load("vol1").unwrap();
        build_session(
            store,
            &mut state,
            "20260823-100000",
            20,
            &[
                (0, b"AAAA"),
                (1, b"BBBB"),
                (2, b"CCCC"),
                (3, b"DDDD"),
                (4, b"EEEE"),
            ],
        );
        build_session(
            store,
            &mut state,
            "20260823-110000",
            20,
            &[(1, b"bbbb"), (2, b"cccc")],
        );
        state
    }

    #[test]
    fn test_resolve_example_scenario() {
        let tmp = TempDir::new().unwrap();
        let store = ChunkStore::open(tmp.path()).unwrap();
        let state = example_chain(&store);

        let res = store.resolve("vol1", &state, None).unwrap();
        assert_eq!(res.origins.len(), 5);
        let tokens: Vec<&str> = res
            .origins
            .iter()
            .map(|o| match o {
                ChunkOrigin::Session { token, .. } => token.as_str(),
                ChunkOrigin::Zero => "zero",
            })
            .collect();
        assert_eq!(
            tokens,
            vec![
                "20260823-100000",
                "20260823-110000",
                "20260823-110000",
                "20260823-100000",
                "20260823-100000"
            ]
        );
    }

    #[test]
    fn test_restore_is_bit_exact() {
        let tmp = TempDir::new().unwrap();
        let store = ChunkStore::open(tmp.path()).unwrap();
        let state = example_chain(&store);

        let dest = tmp.path().join("restored.img");
        let bytes = store
            .restore_to_file("vol1", &state, None, &dest)
            .unwrap();
        assert_eq!(bytes, 20);
        assert_eq!(fs::read(&dest).unwrap(), b"AAAAbbbbccccDDDDEEEE");

        // Restoring the older session reproduces the original image.
        let dest1 = tmp.path().join("restored1.img");
        store
            .restore_to_file("vol1", &state, Some("20260823-100000"), &dest1)
            .unwrap();
        assert_eq!(fs::read(&dest1).unwrap(), b"AAAABBBBCCCCDDDDEEEE");
    }

    #[test]
    fn test_chain_completeness_resolves_to_zero_without_data() {
        let tmp = TempDir::new().unwrap();
        let store = ChunkStore::open(tmp.path()).unwrap();
        let mut state = store.load("vol1").unwrap();
        // A chain whose only session has no data at all: every index must
        // still resolve (to zeros).
        build_session(&store, &mut state, "20260823-100000", 12, &[]);

        let res = store.resolve("vol1", &state, None).unwrap();
        assert_eq!(res.origins, vec![ChunkOrigin::Zero; 3]);

        let dest = tmp.path().join("zeros.img");
        store.restore_to_file("vol1", &state, None, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), vec![0u8; 12]);
    }

    #[test]
    fn test_resolve_after_growth() {
        let tmp = TempDir::new().unwrap();
        let store = ChunkStore::open(tmp.path()).unwrap();
        let mut state = store.load("vol1").unwrap();
        build_session(&store, &mut state, "20260823-100000", 8, &[(0, b"AAAA"), (1, b"BBBB")]);
        // Volume grew to 16 bytes; the new tail chunks carry real data,
        // chunk 0 is unchanged, chunk 1 rewritten.
        build_session(
            &store,
            &mut state,
            "20260823-110000",
            16,
            &[(1, b"bbbb"), (2, b"NEW1"), (3, b"NEW2")],
        );

        let dest = tmp.path().join("grown.img");
        store.restore_to_file("vol1", &state, None, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"AAAAbbbbNEW1NEW2");
    }

    #[test]
    fn test_verify_clean_session() {
        let tmp = TempDir::new().unwrap();
        let store = ChunkStore::open(tmp.path()).unwrap();
        let state = example_chain(&store);

        let report = store.verify_session("vol1", &state, None).unwrap();
        assert_eq!(report.data_chunks, 2);
        assert_eq!(report.placeholders, 3);
    }

    #[test]
    fn test_verify_detects_flipped_bits() {
        let tmp = TempDir::new().unwrap();
        let store = ChunkStore::open(tmp.path()).unwrap();
        let state = example_chain(&store);

        let victim = store
            .session_dir("vol1", "20260823-110000")
            .join(chunk_file_name(1));
        fs::write(&victim, b"Xbbb").unwrap();

        let err = store
            .verify_session("vol1", &state, Some("20260823-110000"))
            .unwrap_err();
        assert!(matches!(err, StoreError::DigestMismatch { .. }));
    }

    #[test]
    fn test_unknown_session_token() {
        let tmp = TempDir::new().unwrap();
        let store = ChunkStore::open(tmp.path()).unwrap();
        let state = example_chain(&store);
        let err = store.resolve("vol1", &state, Some("19990101-000000")).unwrap_err();
        assert!(matches!(err, StoreError::UnknownSession { .. }));
    }
}
