//! # thinbak-config
//!
//! Archive configuration for thinbak.
//!
//! Loads configuration from:
//! 1. The path given on the command line (`--config`), or
//! 2. `$THINBAK_CONFIG`, or
//! 3. `/etc/thinbak/archive.toml`, or
//! 4. `~/.config/thinbak/archive.toml`
//!
//! `$THINBAK_ROOT` overrides the backup root regardless of the file used.
//!
//! A configuration problem is fatal: it aborts the run before any volume
//! is touched.

pub mod logging;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// System-wide default config location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/thinbak/archive.toml";

/// Default chunk size: 128 KiB, the granularity of dedup and chunk I/O.
pub const DEFAULT_CHUNK_SIZE: u64 = 128 * 1024;

/// Largest supported chunk size (matches the archive format limit).
pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Volume names become directory names under the backup root.
const VOLUME_NAME_MAX: usize = 112;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("no configuration file found (tried --config, $THINBAK_CONFIG, {SYSTEM_CONFIG_PATH}, ~/.config/thinbak/archive.toml)")]
    NotFound,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level archive configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where per-volume state and session chains are persisted.
    pub backup_root: PathBuf,
    /// Chunk size in bytes. Power of two; fixed for the archive's lifetime.
    pub chunk_size: u64,
    pub pool: PoolConfig,
    pub volumes: Vec<VolumeConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from("/var/lib/thinbak/default"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            pool: PoolConfig::default(),
            volumes: Vec::new(),
        }
    }
}

/// The LVM volume group / thin pool the monitored volumes live in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub volume_group: String,
    pub thin_pool: String,
}

/// One monitored volume. Chunk data is read from the volume's
/// checkpoint snapshots, so no device path is configured here; the
/// name resolves inside the configured volume group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub name: String,
    /// Disabled volumes stay configured but are skipped by every pass.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Config {
    /// Load configuration, trying `explicit` first, then the standard
    /// locations.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_path(explicit)?;
        debug!(config = %path.display(), "loading archive configuration");
        let contents = std::fs::read_to_string(&path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(p) = explicit {
            return Ok(p.to_path_buf());
        }
        if let Ok(p) = std::env::var("THINBAK_CONFIG") {
            return Ok(PathBuf::from(p));
        }
        let system = Path::new(SYSTEM_CONFIG_PATH);
        if system.exists() {
            return Ok(system.to_path_buf());
        }
        if let Some(user) = Self::user_config_path() {
            if user.exists() {
                return Ok(user);
            }
        }
        Err(ConfigError::NotFound)
    }

    /// Per-user config path: `~/.config/thinbak/archive.toml`.
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("thinbak/archive.toml"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("THINBAK_ROOT") {
            self.backup_root = PathBuf::from(root);
        }
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !self.chunk_size.is_power_of_two() || self.chunk_size == 0 {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} is not a power of two",
                self.chunk_size
            )));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} exceeds the {MAX_CHUNK_SIZE} byte limit",
                self.chunk_size
            )));
        }
        for vol in &self.volumes {
            validate_volume_name(&vol.name)?;
        }
        Ok(())
    }

    /// Enabled volumes, optionally filtered to an explicit selection.
    /// The returned references borrow from the config, not from the
    /// selection list.
    pub fn selected_volumes<'a>(&'a self, names: &[String]) -> Vec<&'a VolumeConfig> {
        self.volumes
            .iter()
            .filter(|v| v.enabled && (names.is_empty() || names.iter().any(|n| n == &v.name)))
            .collect()
    }
}

fn validate_volume_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > VOLUME_NAME_MAX {
        return Err(ConfigError::Invalid(format!(
            "volume name {name:?} must be 1..={VOLUME_NAME_MAX} characters"
        )));
    }
    // Names land on disk as directories; keep the charset tight.
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '_' | '-'))
    {
        return Err(ConfigError::Invalid(format!(
            "volume name {name:?} may only contain A-Z a-z 0-9 . + _ -"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> Result<Config> {
        let config: Config = toml::from_str(body)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_full_config_parses() {
        let config = parse(
            r#"
            backup_root = "/var/lib/thinbak/default"
            chunk_size = 131072

            [pool]
            volume_group = "vg_main"
            thin_pool = "pool00"

            [[volumes]]
            name = "vm-work-private"

            [[volumes]]
            name = "vm-mail-private"
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.chunk_size, 131072);
        assert_eq!(config.pool.volume_group, "vg_main");
        assert_eq!(config.volumes.len(), 2);
        // Disabled volumes are filtered out.
        let selected = config.selected_volumes(&[]);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "vm-work-private");
    }

    #[test]
    fn test_rejects_bad_chunk_size() {
        let err = parse("chunk_size = 100000").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = parse("chunk_size = 33554432").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_bad_volume_name() {
        let err = parse(
            r#"
            [[volumes]]
            name = "bad/name"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_selection_filter() {
        let config = parse(
            r#"
            [[volumes]]
            name = "a"
            [[volumes]]
            name = "b"
            "#,
        )
        .unwrap();
        // The selection may be a temporary; picked borrows the config.
        let picked = config.selected_volumes(&["b".to_string()]);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "b");
    }
}
