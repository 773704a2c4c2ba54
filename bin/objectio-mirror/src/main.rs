#![allow(clippy::result_large_err)]
//! ObjectIO Mirror
//!
//! Mirrors one raw volume image onto another with the live mirroring engine,
//! prints progress once per second and completes once the target is in sync.

mod file;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::Parser;
use objectio_mirror::{
    ErrorAction, JobOutcome, JobStatus, MirrorConfig, MirrorJob, MirrorPhase, MirrorResult,
    StorageGraph, SyncMode,
};
use serde::de::DeserializeOwned;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::file::FileDevice;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "objectio-mirror", about = "ObjectIO live volume mirror")]
struct Args {
    /// Source image
    #[arg(long)]
    source: PathBuf,

    /// Target image, same size as the source
    #[arg(long)]
    target: PathBuf,

    /// Chunk granularity in bytes (power of two)
    #[arg(long)]
    granularity: Option<u64>,

    /// Buffer pool size in bytes
    #[arg(long)]
    buf_size: Option<u64>,

    /// Speed limit in bytes per second (0 = unlimited)
    #[arg(long)]
    speed: Option<u64>,

    /// full / since-base / top / none
    #[arg(long, value_parser = parse_enum::<SyncMode>)]
    sync_mode: Option<SyncMode>,

    /// report / ignore / stop
    #[arg(long, value_parser = parse_enum::<ErrorAction>)]
    on_source_error: Option<ErrorAction>,

    /// report / ignore / stop
    #[arg(long, value_parser = parse_enum::<ErrorAction>)]
    on_target_error: Option<ErrorAction>,

    /// Allow zero writes to unmap target ranges
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    unmap: Option<bool>,

    /// JSON job configuration; command line flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Keep mirroring after the target is in sync until Ctrl-C
    #[arg(long)]
    no_complete: bool,
}

fn parse_enum<T: DeserializeOwned>(value: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string())).map_err(|e| e.to_string())
}

impl Args {
    fn job_config(&self) -> Result<MirrorConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("read config {}", path.display()))?;
                MirrorConfig::from_json(&json)
                    .with_context(|| format!("parse config {}", path.display()))?
            }
            None => MirrorConfig::default(),
        };

        if self.granularity.is_some() {
            config.granularity = self.granularity;
        }
        if self.buf_size.is_some() {
            config.buf_size = self.buf_size;
        }
        if let Some(speed) = self.speed {
            config.speed = speed;
        }
        if let Some(mode) = self.sync_mode {
            config.sync_mode = mode;
        }
        if let Some(action) = self.on_source_error {
            config.on_source_error = action;
        }
        if let Some(action) = self.on_target_error {
            config.on_target_error = action;
        }
        if let Some(unmap) = self.unmap {
            config.unmap = unmap;
        }
        if self.no_complete {
            config.auto_complete = false;
        }

        config.validate().context("invalid job configuration")?;
        Ok(config)
    }

    /// Open the images; the source is only ever read
    fn open_devices(&self) -> Result<(Arc<FileDevice>, Arc<FileDevice>)> {
        let source = FileDevice::open(&self.source, false)
            .with_context(|| format!("open source {}", self.source.display()))?;
        let target = FileDevice::open(&self.target, true)
            .with_context(|| format!("open target {}", self.target.display()))?;
        Ok((Arc::new(source), Arc::new(target)))
    }
}

// ── Storage graph ─────────────────────────────────────────────────────────────

/// Image files have no node graph; the switch-over is only logged
struct LoggingGraph;

#[async_trait]
impl StorageGraph for LoggingGraph {
    async fn splice(&self, source: &str, target: &str) -> MirrorResult<()> {
        info!(source, target, "target now holds a consistent copy of source");
        Ok(())
    }

    async fn restore(&self, source: &str) -> MirrorResult<()> {
        info!(source, "source left in place");
        Ok(())
    }
}

fn print_progress(status: &JobStatus) {
    let percent = if status.bytes_total == 0 {
        100.0
    } else {
        status.bytes_done as f64 * 100.0 / status.bytes_total as f64
    };
    println!(
        "{:<12} {:>6.1}%  done {} / {} bytes, {} remaining, {} in flight{}",
        status.phase.as_str(),
        percent,
        status.bytes_done,
        status.bytes_total,
        status.bytes_remaining,
        status.in_flight,
        if status.paused { " (paused)" } else { "" },
    );
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = args.job_config()?;
    info!(job = %config.job_id, "Starting ObjectIO mirror");

    let (source, target) = args.open_devices()?;
    let job = MirrorJob::start(config, source, target, Arc::new(LoggingGraph))
        .await
        .context("start mirror job")?;

    let mut status_rx = job.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut completion_requested = false;

    let outcome = loop {
        tokio::select! {
            outcome = job.wait() => break outcome,
            _ = ticker.tick() => print_progress(&job.status()),
            changed = status_rx.changed() => {
                if changed.is_err() {
                    continue;
                }
                let phase = status_rx.borrow_and_update().phase;
                if phase == MirrorPhase::Ready && !args.no_complete && !completion_requested {
                    job.request_complete().context("request completion")?;
                    completion_requested = true;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling mirror job");
                job.cancel();
            }
        }
    };

    print_progress(&job.status());
    match outcome {
        JobOutcome::Completed => {
            info!("Mirror completed");
            Ok(())
        }
        JobOutcome::Cancelled => {
            info!("Mirror cancelled");
            Ok(())
        }
        JobOutcome::Failed(err) => bail!("mirror job failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objectio_mirror::{BlockDevice, IoVec};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn image(len: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; len]).unwrap();
        file
    }

    #[tokio::test]
    async fn test_source_is_opened_read_only() {
        let source = image(4096);
        let target = image(4096);
        let args = Args::parse_from([
            "objectio-mirror",
            "--source",
            source.path().to_str().unwrap(),
            "--target",
            target.path().to_str().unwrap(),
        ]);

        let (source, target) = args.open_devices().unwrap();
        let data = IoVec::from_slice(&[1u8; 512]);
        assert!(source.write(0, &data).await.is_err());
        target.write(0, &data).await.unwrap();
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "objectio-mirror",
            "--source",
            "a.img",
            "--target",
            "b.img",
            "--sync-mode",
            "top",
            "--speed",
            "1048576",
            "--no-complete",
        ]);
        let config = args.job_config().unwrap();
        assert_eq!(config.sync_mode, SyncMode::TopLayerOnly);
        assert_eq!(config.speed, 1024 * 1024);
        assert!(!config.auto_complete);
    }
}
