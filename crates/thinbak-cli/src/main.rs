//! # thinbak CLI
//!
//! Backup passes for thin-provisioned logical volumes.
//!
//! With no subcommand, runs one monitor tick over every configured
//! volume. Exit status: 0 on success, 1 on a fatal configuration
//! problem, 2 when some volumes failed but others were processed.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use thinbak_config::logging::{init_logging, LogLevel};
use thinbak_config::Config;
use thinbak_engine::{build, tick, BuildMode, EngineError, ThinDeltaSource};
use thinbak_store::ChunkStore;

/// Incremental chunk backups for LVM thin volumes.
#[derive(Parser)]
#[command(name = "thinbak")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: $THINBAK_CONFIG, then
    /// /etc/thinbak/archive.toml, then ~/.config/thinbak/archive.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Restrict the pass to these volumes (default: all enabled)
    #[arg(long = "volume", global = true, value_name = "NAME")]
    volumes: Vec<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one monitor tick: record changed chunks, move no data
    Monitor,

    /// Build a backup session from the accumulated changes
    Send {
        /// Write every chunk; establishes the baseline session
        #[arg(long)]
        full: bool,

        /// With --full: append a full session even if a chain exists
        #[arg(long, requires = "full")]
        force: bool,
    },

    /// Show the session chain for each volume
    List,

    /// Check a session's chunk files against its manifest
    Verify {
        volume: String,

        /// Session token, e.g. 20260823-101500 (default: latest)
        #[arg(long)]
        session: Option<String>,
    },

    /// Materialize a session into a disk image file
    Restore {
        volume: String,

        /// Destination image path
        #[arg(long)]
        save_to: PathBuf,

        /// Session token (default: latest)
        #[arg(long)]
        session: Option<String>,
    },
}

fn main() -> ExitCode {
    init_logging(LogLevel::Info);

    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    match run(&cli, &config) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(failed) => {
            error!("{failed} volume(s) failed");
            ExitCode::from(2)
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

/// Dispatch one command; returns the number of volumes that failed.
fn run(cli: &Cli, config: &Config) -> Result<usize> {
    let store = ChunkStore::open(&config.backup_root)
        .with_context(|| format!("cannot open backup root {}", config.backup_root.display()))?;
    let source = ThinDeltaSource::new(
        config.pool.volume_group.clone(),
        config.pool.thin_pool.clone(),
    );

    let selected = config.selected_volumes(&cli.volumes);
    if selected.is_empty() {
        bail!("no enabled volumes selected; check [[volumes]] in the configuration");
    }

    match &cli.command {
        None | Some(Commands::Monitor) => {
            let mut failed = 0;
            for vol in &selected {
                match tick(&store, &source, &vol.name, config.chunk_size) {
                    Ok(report) => info!(
                        volume = %vol.name,
                        pending = report.pending,
                        "tick ok"
                    ),
                    Err(e) if e.is_busy() => {
                        info!(volume = %vol.name, "busy, skipped this tick")
                    }
                    Err(e) => {
                        error!(volume = %vol.name, "monitor failed: {e}");
                        failed += 1;
                    }
                }
            }
            Ok(failed)
        }

        Some(Commands::Send { full, force }) => {
            let mode = if *full {
                BuildMode::Full { force: *force }
            } else {
                BuildMode::Incremental
            };
            let mut failed = 0;
            for vol in &selected {
                if let Err(e) = send_volume(&store, &source, config, vol, mode) {
                    error!(volume = %vol.name, "send failed: {e}");
                    failed += 1;
                }
            }
            Ok(failed)
        }

        Some(Commands::List) => {
            for vol in &selected {
                let state = store.load(&vol.name)?;
                println!("{}:", vol.name);
                for ses in store.list_sessions(&state) {
                    println!(
                        "  S_{}  seq {:>4}  {:>10} bytes  {} data chunks",
                        ses.token, ses.sequence, ses.volume_size, ses.chunks_written
                    );
                }
                if state.sessions.is_empty() {
                    println!("  (no sessions)");
                }
                if !state.changed.is_empty() {
                    println!("  {} chunk(s) pending for the next session", state.changed.len());
                }
            }
            Ok(0)
        }

        Some(Commands::Verify { volume, session }) => {
            let state = store.load(volume)?;
            let report = store.verify_session(volume, &state, session.as_deref())?;
            println!(
                "S_{} ok: {} data chunks, {} placeholders",
                report.token, report.data_chunks, report.placeholders
            );
            Ok(0)
        }

        Some(Commands::Restore {
            volume,
            save_to,
            session,
        }) => {
            let state = store.load(volume)?;
            let bytes = store
                .restore_to_file(volume, &state, session.as_deref(), save_to)
                .with_context(|| format!("restoring {volume}"))?;
            println!("wrote {bytes} bytes to {}", save_to.display());
            Ok(0)
        }
    }
}

fn send_volume(
    store: &ChunkStore,
    source: &ThinDeltaSource,
    config: &Config,
    vol: &thinbak_config::VolumeConfig,
    mode: BuildMode,
) -> Result<()> {
    // Fold in changes up to this moment before materializing, so the
    // session reflects "now" rather than the last scheduled tick. The
    // build then reads from that tick's snapshot.
    if mode == BuildMode::Incremental {
        tick(store, source, &vol.name, config.chunk_size)?;
    }

    let token = session_token(store, &vol.name)?;
    match build(store, source, &vol.name, mode, &token, config.chunk_size) {
        Ok(info) => {
            println!(
                "{}: session S_{} committed ({} data chunks)",
                vol.name, info.token, info.chunks_written
            );
            Ok(())
        }
        Err(EngineError::ChainExists(v)) => {
            bail!("{v} already has sessions; drop --full or add --force")
        }
        Err(e) => Err(e.into()),
    }
}

/// Session tokens are second-granularity UTC stamps and must sort after
/// the chain head.
fn session_token(store: &ChunkStore, volume: &str) -> Result<String> {
    let token = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let state = store.load(volume)?;
    if let Some(last) = state.latest_session() {
        if token <= last.token {
            warn!(volume, last = %last.token, "clock has not advanced past the last session");
            bail!("session token {token} does not sort after S_{}; retry in a moment", last.token);
        }
    }
    Ok(token)
}
