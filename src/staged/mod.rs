//! Staged-apply engines (§4.7): translate files under a staging tree into
//! either atomic installs under `/etc/...` or `pvesh` /
//! `proxmox-backup-manager` API calls. Every engine shares the same gate
//! and read-or-remove shape; [`engine`] factors that out.

pub mod datastore;
pub mod engine;
pub mod mappings;
pub mod network_install;
pub mod notifications;
pub mod pbs_objects;
pub mod pools;

use crate::capability::Capabilities;
use crate::capability::system::SystemInfo;
use std::path::Path;

pub struct StagedContext<'a> {
    pub caps: &'a Capabilities,
    pub stage_root: &'a Path,
    pub dest_root: &'a Path,
    pub dry_run: bool,
}

impl<'a> StagedContext<'a> {
    pub fn new(caps: &'a Capabilities, stage_root: &'a Path, dest_root: &'a Path, dry_run: bool) -> Self {
        Self {
            caps,
            stage_root,
            dest_root,
            dry_run,
        }
    }

    pub fn stage_path(&self, rel: &str) -> std::path::PathBuf {
        self.stage_root.join(rel.trim_start_matches('/'))
    }

    pub fn dest_path(&self, rel: &str) -> std::path::PathBuf {
        self.dest_root.join(rel.trim_start_matches('/'))
    }
}

/// Gate shared by every engine (§4.7 step 1): requires `destRoot="/"`,
/// `euid==0`, not a dry run. Real-FS is implied by `destRoot=="/"` in this
/// implementation — there is no separate statfs probe.
pub fn gate(ctx: &StagedContext) -> bool {
    !ctx.dry_run && ctx.dest_root == Path::new("/") && ctx.caps.system().geteuid() == 0
}

#[derive(Debug, Clone, Default)]
pub struct StagedOutcome {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    pub warnings: Vec<String>,
}

impl StagedOutcome {
    pub fn merge(&mut self, other: StagedOutcome) {
        self.applied.extend(other.applied);
        self.skipped.extend(other.skipped);
        self.warnings.extend(other.warnings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::test_support::{FakeRunner, fake_caps};

    #[test]
    fn gate_rejects_non_root_destroot() {
        let caps = fake_caps(FakeRunner::new());
        let ctx = StagedContext::new(&caps, Path::new("/stage"), Path::new("/mnt/alt"), false);
        assert!(!gate(&ctx));
    }

    #[test]
    fn gate_rejects_dry_run() {
        let caps = fake_caps(FakeRunner::new());
        let ctx = StagedContext::new(&caps, Path::new("/stage"), Path::new("/"), true);
        assert!(!gate(&ctx));
    }
}
