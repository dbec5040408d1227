//! Network staged install (§4.7, "Network staged install" rule): copy
//! `/etc/network/*` plus a curated extras list into place. `/etc/resolv.conf`
//! is deliberately never touched here — it's repaired separately once DHCP
//! or the restored interfaces config is live (§4.12 step 15).

use super::{StagedContext, StagedOutcome};
use crate::capability::fs::{EntryKind, Fs};
use anyhow::{Context, Result};
use std::path::Path;

const CURATED_EXTRAS: &[&str] = &["etc/hosts", "etc/hostname", "etc/nsswitch.conf", "etc/hosts.allow", "etc/hosts.deny"];

fn copy_tree(ctx: &StagedContext, dir: &Path, rel_prefix: &str, outcome: &mut StagedOutcome) -> Result<()> {
    for entry in ctx.caps.fs.read_dir(dir)? {
        let name = entry
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let rel = format!("{rel_prefix}/{name}");
        let stat = ctx.caps.fs.stat(&entry)?;
        match stat.kind {
            EntryKind::Dir => copy_tree(ctx, &entry, &rel, outcome)?,
            EntryKind::File => {
                if rel.ends_with("resolv.conf") {
                    continue;
                }
                let body = ctx.caps.fs.read(&entry).with_context(|| format!("read staged {}", entry.display()))?;
                ctx.caps.fs.write_atomic(&ctx.dest_path(&rel), &body, stat.mode)?;
                outcome.applied.push(rel);
            }
            EntryKind::Symlink | EntryKind::Missing => {}
        }
    }
    Ok(())
}

pub fn install(ctx: &StagedContext) -> Result<StagedOutcome> {
    let mut outcome = StagedOutcome::default();
    if !super::gate(ctx) {
        outcome.warnings.push("network install: staged-apply gate not satisfied, skipping".into());
        return Ok(outcome);
    }

    let net_dir = ctx.stage_path("etc/network");
    if ctx.caps.fs.exists(&net_dir) {
        copy_tree(ctx, &net_dir, "etc/network", &mut outcome)?;
    }

    for extra in CURATED_EXTRAS {
        let src = ctx.stage_path(extra);
        if !ctx.caps.fs.exists(&src) {
            continue;
        }
        let stat = ctx.caps.fs.stat(&src)?;
        let body = ctx.caps.fs.read(&src).with_context(|| format!("read staged {}", src.display()))?;
        ctx.caps.fs.write_atomic(&ctx.dest_path(extra), &body, stat.mode)?;
        outcome.applied.push((*extra).to_string());
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::test_support::{FakeRunner, fake_caps};

    #[test]
    fn copy_tree_skips_resolv_conf() {
        let stage = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(stage.path().join("etc/network")).unwrap();
        std::fs::write(stage.path().join("etc/network/interfaces"), "auto lo\n").unwrap();
        std::fs::write(stage.path().join("etc/network/resolv.conf"), "nameserver 1.1.1.1\n").unwrap();

        let caps = fake_caps(FakeRunner::new());
        let ctx = StagedContext::new(&caps, stage.path(), dest.path(), false);
        let mut outcome = StagedOutcome::default();
        copy_tree(&ctx, &stage.path().join("etc/network"), "etc/network", &mut outcome).unwrap();

        assert!(outcome.applied.iter().any(|p| p.ends_with("interfaces")));
        assert!(!outcome.applied.iter().any(|p| p.ends_with("resolv.conf")));
        assert!(dest.path().join("etc/network/interfaces").exists());
        assert!(!dest.path().join("etc/network/resolv.conf").exists());
    }

    #[test]
    fn curated_extras_never_include_resolv_conf() {
        assert!(!CURATED_EXTRAS.contains(&"etc/resolv.conf"));
    }
}
