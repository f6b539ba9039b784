//! LVM thin-pool diff source.
//!
//! Change tracking rides on thin snapshots: the checkpoint is a retained
//! read-only snapshot `<volume>.tick`, each diff takes a fresh
//! `<volume>.tock` and runs `thin_delta` between the two thin ids over a
//! reserved metadata snapshot. Committing the checkpoint rotates
//! `.tock` into `.tick`.
//!
//! The checkpoint token is the tock snapshot's LV UUID, so a tick that
//! was removed or recreated behind our back shows up as
//! [`SourceError::CheckpointStale`] instead of a silent under-report.
//!
//! Everything that shells out lives here; the rest of the engine only
//! sees the [`DiffSource`] trait.

use std::process::Command;

use tracing::{debug, warn};

use thinbak_chunk::Extent;

use crate::source::{Diff, DiffSource, FileReadSource, ReadSource, SourceError};

/// Sector size thin tools count in. `thin_delta` block units are
/// `data_block_size` sectors of this many bytes.
const SECTOR_SIZE: u64 = 512;

const TICK_SUFFIX: &str = ".tick";
const TOCK_SUFFIX: &str = ".tock";

pub struct ThinDeltaSource {
    volume_group: String,
    thin_pool: String,
}

impl ThinDeltaSource {
    pub fn new(volume_group: impl Into<String>, thin_pool: impl Into<String>) -> Self {
        Self {
            volume_group: volume_group.into(),
            thin_pool: thin_pool.into(),
        }
    }

    fn qualify(&self, lv: &str) -> String {
        format!("{}/{}", self.volume_group, lv)
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String, SourceError> {
        debug!(program, ?args, "running");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| SourceError::Unavailable(format!("cannot run {program}: {e}")))?;
        if !output.status.success() {
            return Err(SourceError::Unavailable(format!(
                "{program} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn lv_exists(&self, lv: &str) -> bool {
        Command::new("lvs")
            .args(["--noheadings", &self.qualify(lv)])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn lv_field(&self, lv: &str, field: &str) -> Result<String, SourceError> {
        let out = self.run(
            "lvs",
            &[
                "--noheadings",
                "--units",
                "b",
                "--nosuffix",
                "-o",
                field,
                &self.qualify(lv),
            ],
        )?;
        Ok(out.trim().to_string())
    }

    fn volume_size(&self, volume: &str) -> Result<u64, SourceError> {
        let raw = self.lv_field(volume, "lv_size")?;
        raw.parse().map_err(|_| {
            SourceError::Unavailable(format!("unparsable lv_size {raw:?} for {volume}"))
        })
    }

    /// Create a fresh read-only tock snapshot, replacing any stale one.
    fn take_tock(&self, volume: &str) -> Result<(), SourceError> {
        let tock = format!("{volume}{TOCK_SUFFIX}");
        if self.lv_exists(&tock) {
            warn!(volume, "removing stale tock snapshot from an aborted pass");
            self.run("lvremove", &["-f", &self.qualify(&tock)])?;
        }
        self.run(
            "lvcreate",
            &[
                "-pr",
                "-kn",
                "-ay",
                "-s",
                &self.qualify(volume),
                "-n",
                &tock,
            ],
        )?;
        Ok(())
    }

    fn tpool_message(&self, message: &str) -> Result<String, SourceError> {
        let tpool = format!("{}-{}-tpool", self.volume_group, self.thin_pool);
        self.run("dmsetup", &["message", &tpool, "0", message])
    }

    fn thin_delta(&self, tick: &str, tock: &str) -> Result<String, SourceError> {
        let tick_id = self.lv_field(tick, "thin_id")?;
        let tock_id = self.lv_field(tock, "thin_id")?;
        let tmeta = format!(
            "/dev/mapper/{}-{}_tmeta",
            self.volume_group, self.thin_pool
        );

        // A leftover reservation from a crashed pass blocks the new one.
        let _ = self.tpool_message("release_metadata_snap");
        self.tpool_message("reserve_metadata_snap")?;
        let result = self.run(
            "thin_delta",
            &[
                "-m",
                &format!("--thin1={tick_id}"),
                &format!("--thin2={tock_id}"),
                &tmeta,
            ],
        );
        let _ = self.tpool_message("release_metadata_snap");
        result
    }
}

impl DiffSource for ThinDeltaSource {
    fn diff(
        &self,
        volume: &str,
        checkpoint: Option<&str>,
        full: bool,
    ) -> Result<Diff, SourceError> {
        if !self.lv_exists(volume) {
            return Err(SourceError::Unavailable(format!(
                "volume {} does not exist",
                self.qualify(volume)
            )));
        }
        let volume_size = self.volume_size(volume)?;
        let tick = format!("{volume}{TICK_SUFFIX}");
        let tock = format!("{volume}{TOCK_SUFFIX}");

        let extents: Vec<Extent> = if full {
            self.take_tock(volume)?;
            vec![Extent::new(0, volume_size)]
        } else {
            let checkpoint = checkpoint.ok_or(SourceError::NoBaseline)?;
            if !self.lv_exists(&tick) {
                return Err(SourceError::CheckpointStale(checkpoint.to_string()));
            }
            if self.lv_field(&tick, "lv_uuid")? != checkpoint {
                return Err(SourceError::CheckpointStale(checkpoint.to_string()));
            }
            self.take_tock(volume)?;
            let xml = self.thin_delta(&tick, &tock)?;
            parse_thin_delta(&xml, volume_size)?
        };

        // The tock becomes the tick at commit; its UUID is the token.
        let new_checkpoint = self.lv_field(&tock, "lv_uuid")?;
        Ok(Diff {
            extents: Box::new(extents.into_iter().map(Ok)),
            checkpoint: new_checkpoint,
            volume_size,
        })
    }

    /// Rotate `.tock` into `.tick`, releasing the previous tick.
    fn commit_checkpoint(&self, volume: &str, checkpoint: &str) -> Result<(), SourceError> {
        let tick = format!("{volume}{TICK_SUFFIX}");
        let tock = format!("{volume}{TOCK_SUFFIX}");
        if !self.lv_exists(&tock) || self.lv_field(&tock, "lv_uuid")? != checkpoint {
            return Err(SourceError::Unavailable(format!(
                "tock snapshot for {volume} is missing or not the one just diffed"
            )));
        }
        if self.lv_exists(&tick) {
            self.run("lvremove", &["-f", &self.qualify(&tick)])?;
        }
        self.run(
            "lvrename",
            &[&self.qualify(&tock), &self.qualify(&tick)],
        )?;
        debug!(volume, checkpoint, "checkpoint rotated");
        Ok(())
    }

    /// Open the snapshot device holding the image as of `checkpoint`.
    ///
    /// Before rotation that snapshot is the `.tock`, afterwards the
    /// `.tick`; the LV UUID survives the rename, so whichever of the
    /// two carries the token is the right one.
    fn reader(
        &self,
        volume: &str,
        checkpoint: &str,
    ) -> Result<Box<dyn ReadSource>, SourceError> {
        let snap = [TOCK_SUFFIX, TICK_SUFFIX]
            .iter()
            .map(|suffix| format!("{volume}{suffix}"))
            .find(|snap| {
                self.lv_exists(snap)
                    && matches!(self.lv_field(snap, "lv_uuid"), Ok(uuid) if uuid == checkpoint)
            })
            .ok_or_else(|| SourceError::CheckpointStale(checkpoint.to_string()))?;

        let path = self.lv_field(&snap, "lv_path")?;
        let source = FileReadSource::open(std::path::Path::new(&path))?;
        Ok(Box::new(source))
    }
}

/// Parse `thin_delta` output into byte extents.
///
/// The output is one element per line: a `<superblock ...>` header
/// carrying `data_block_size` (in 512-byte sectors), then
/// `<different|right_only|left_only|same begin=".." length=".."/>`
/// records in block units. `same` records contribute nothing;
/// `left_only` (deallocated, now reads as zeros) counts as changed.
fn parse_thin_delta(output: &str, volume_size: u64) -> Result<Vec<Extent>, SourceError> {
    let mut block_bytes = None;
    let mut extents = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("<superblock") {
            let dbs: u64 = attr(line, "data_block_size")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| {
                    SourceError::Unavailable("thin_delta output lacks data_block_size".into())
                })?;
            block_bytes = Some(dbs * SECTOR_SIZE);
            continue;
        }
        let changed = line.starts_with("<different")
            || line.starts_with("<right_only")
            || line.starts_with("<left_only");
        if !changed {
            continue;
        }
        let block_bytes = block_bytes.ok_or_else(|| {
            SourceError::Unavailable("thin_delta record before superblock header".into())
        })?;
        let begin: u64 = attr(line, "begin")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| SourceError::Unavailable(format!("bad thin_delta record: {line}")))?;
        let length: u64 = attr(line, "length")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| SourceError::Unavailable(format!("bad thin_delta record: {line}")))?;

        let start = begin * block_bytes;
        let end = ((begin + length) * block_bytes).min(volume_size);
        if start < end {
            extents.push(Extent::new(start, end));
        }
    }
    Ok(extents)
}

/// Pull `name="value"` out of a single-element line.
fn attr<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let key = format!("{name}=\"");
    let rest = &line[line.find(&key)? + key.len()..];
    rest.split('"').next()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<superblock uuid="" time="4" transaction="7" data_block_size="128" nr_data_blocks="0">
  <diff left="2" right="3">
    <same begin="0" length="64"/>
    <different begin="64" length="2"/>
    <right_only begin="100" length="1"/>
    <left_only begin="200" length="4"/>
  </diff>
</superblock>"#;

    #[test]
    fn test_parse_sample_delta() {
        // data_block_size 128 sectors = 65536 bytes per block
        let extents = parse_thin_delta(SAMPLE, u64::MAX).unwrap();
        assert_eq!(
            extents,
            vec![
                Extent::new(64 * 65536, 66 * 65536),
                Extent::new(100 * 65536, 101 * 65536),
                Extent::new(200 * 65536, 204 * 65536),
            ]
        );
    }

    #[test]
    fn test_parse_clamps_to_volume_size() {
        let extents = parse_thin_delta(SAMPLE, 65 * 65536).unwrap();
        assert_eq!(extents, vec![Extent::new(64 * 65536, 65 * 65536)]);
    }

    #[test]
    fn test_parse_requires_superblock() {
        let err = parse_thin_delta(r#"<different begin="0" length="1"/>"#, 1 << 20).unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
    }

    #[test]
    fn test_attr_extraction() {
        assert_eq!(attr(r#"<x begin="12" length="3"/>"#, "begin"), Some("12"));
        assert_eq!(attr(r#"<x begin="12"/>"#, "length"), None);
    }
}
