//! Narrow collaborator traits at the restore driver's outer seams (§9's
//! "operator input as a capability" principle extended to the other
//! external dependencies the driver touches but doesn't own): fetching
//! the bundle, producing it in the first place for `backup`, notifying an
//! operator-configured channel, and exporting metrics. Kept separate from
//! `capability` because these are restore-domain collaborators, not
//! process-wide side-effect primitives.

use crate::capability::Capabilities;
use crate::capability::Runner;
use crate::capability::process::{CmdSpec, Pipeline};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Produces a backup bundle; implemented by the `backup` subcommand's
/// pipeline, consumed here only for the `decrypt`/`restore --fetch-only`
/// bootstrapping paths that re-run a subset of it.
pub trait BackupProducer: Send + Sync {
    fn produce(&self, dest_dir: &Path) -> Result<PathBuf>;
}

/// Fetches a bundle (and its manifest) from wherever it's stored into a
/// local scratch path the archive reader can open.
pub trait StorageFetcher: Send + Sync {
    fn fetch(&self, remote_ref: &str, dest_dir: &Path) -> Result<PathBuf>;
}

pub trait Notifier: Send + Sync {
    fn notify(&self, subject: &str, body: &str);
}

pub trait MetricsExporter: Send + Sync {
    fn record_phase(&self, phase: &str, ok: bool);
}

pub struct LocalStorageFetcher;

impl StorageFetcher for LocalStorageFetcher {
    fn fetch(&self, remote_ref: &str, dest_dir: &Path) -> Result<PathBuf> {
        let src = Path::new(remote_ref);
        let name = src
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("fetch source '{remote_ref}' has no file name"))?;
        let dest = dest_dir.join(name);
        std::fs::copy(src, &dest).with_context(|| format!("copy {remote_ref} to {}", dest.display()))?;
        Ok(dest)
    }
}

/// Fetches over `rclone copy`; a thin wrapper until a remote target is
/// configured, since rclone already speaks every backend this tool would
/// otherwise need its own client for.
pub struct RcloneStorageFetcher<'a> {
    pub caps: &'a Capabilities,
    pub remote_name: String,
}

impl StorageFetcher for RcloneStorageFetcher<'_> {
    fn fetch(&self, remote_ref: &str, dest_dir: &Path) -> Result<PathBuf> {
        let src = format!("{}:{}", self.remote_name, remote_ref);
        self.caps
            .runner
            .run(&Pipeline::single(
                CmdSpec::new("rclone")
                    .arg("copy")
                    .arg(&src)
                    .arg(dest_dir.to_string_lossy().into_owned()),
            ))
            .with_context(|| format!("rclone copy {src}"))?;
        let name = Path::new(remote_ref)
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("remote ref '{remote_ref}' has no file name"))?;
        Ok(dest_dir.join(name))
    }
}

pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, subject: &str, body: &str) {
        tracing::info!("[notify] {subject}: {body}");
    }
}

pub struct TracingMetricsExporter;

impl MetricsExporter for TracingMetricsExporter {
    fn record_phase(&self, phase: &str, ok: bool) {
        tracing::info!("[metrics] phase={phase} ok={ok}");
    }
}
