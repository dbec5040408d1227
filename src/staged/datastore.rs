//! PBS `datastore.cfg` staged apply (§4.7, PBS datastore rule).
//!
//! Normalizes indentation, parses into `{name, path, lines}` blocks,
//! rejects blocks whose path would silently alias rootfs, and either
//! writes the accepted blocks back (file mode) or diffs them against the
//! live datastore list via `proxmox-backup-manager` (API mode).

use super::{StagedContext, StagedOutcome, engine};
use crate::capability::Runner;
use crate::plan::PbsRestoreBehavior;
use anyhow::{Context, Result};
use serde_json::Value;

const DEST_REL: &str = "etc/proxmox-backup/datastore.cfg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastoreBlock {
    pub name: String,
    pub path: String,
    pub lines: Vec<String>,
}

/// Re-indent section property lines to exactly four spaces, the shape
/// `proxmox-backup-manager` expects; a staged file copied from a backup
/// taken with a different editor's tabs/indentation would otherwise be
/// rejected by the daemon's parser.
pub fn normalize_indentation(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    for line in body.lines() {
        if line.starts_with("datastore:") || line.trim().is_empty() {
            out.push_str(line);
        } else {
            out.push_str("    ");
            out.push_str(line.trim_start());
        }
        out.push('\n');
    }
    out
}

pub fn parse_blocks(body: &str) -> Vec<DatastoreBlock> {
    let mut out = Vec::new();
    let mut current: Option<DatastoreBlock> = None;
    for line in body.lines() {
        if let Some(rest) = line.strip_prefix("datastore: ") {
            if let Some(b) = current.take() {
                out.push(b);
            }
            current = Some(DatastoreBlock {
                name: rest.trim().to_string(),
                path: String::new(),
                lines: Vec::new(),
            });
        } else if let Some(block) = current.as_mut() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(p) = trimmed.strip_prefix("path ") {
                block.path = p.trim().to_string();
            }
            block.lines.push(line.to_string());
        }
    }
    if let Some(b) = current {
        out.push(b);
    }
    out
}

fn render_blocks(blocks: &[DatastoreBlock]) -> String {
    let mut out = String::new();
    for b in blocks {
        out.push_str(&format!("datastore: {}\n", b.name));
        for l in &b.lines {
            out.push_str("    ");
            out.push_str(l.trim_start());
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

/// A block is deferred when its path looks like a mount point (matches a
/// [`crate::mountguard::conservative_root`]-style prefix) that the restore
/// driver's mount-guard pass did not find protected — neither an already
/// real mount nor a guard bind-mount stands between that path and rootfs,
/// so writing the block verbatim could point the datastore at whatever
/// happens to live on the root filesystem. A path the mount-guard pass
/// already handled (real mount or guard) is applied verbatim even when it
/// has no `.chunks` directory yet, since the guard is what makes that safe,
/// not the marker.
fn looks_like_unprotected_mount(block: &DatastoreBlock, protected_paths: &[String]) -> bool {
    if block.path.is_empty() {
        return false;
    }
    let first = block.path.trim_start_matches('/').split('/').next().unwrap_or("");
    let mount_like = matches!(first, "mnt" | "media") || block.path.starts_with("/run/media/");
    if !mount_like {
        return false;
    }
    !protected_paths.iter().any(|p| p == &block.path)
}

/// Query the host's current datastore list so a corrupted staged block
/// missing its `path` line can recover it by name via
/// [`recover_path_from_inventory`], wrapped to match that function's
/// `{"datastores": [...]}` shape.
pub fn live_datastore_inventory(ctx: &StagedContext) -> Option<Value> {
    use crate::capability::process::{CmdSpec, Pipeline};
    let out = ctx
        .caps
        .runner
        .run_capture(&Pipeline::single(
            CmdSpec::new("proxmox-backup-manager")
                .arg("datastore")
                .arg("list")
                .arg("--output-format=json"),
        ))
        .ok()?;
    let datastores: Value = serde_json::from_str(&out).ok()?;
    Some(serde_json::json!({ "datastores": datastores }))
}

/// Attempt to recover a `path` for a block with no `path` line (duplicate
/// keys in a corrupted staged file commonly drop one) from the export
/// inventory JSON, keyed by datastore name.
fn recover_path_from_inventory(inventory: Option<&Value>, name: &str) -> Option<String> {
    inventory?
        .get("datastores")?
        .as_array()?
        .iter()
        .find(|d| d.get("name").and_then(Value::as_str) == Some(name))
        .and_then(|d| d.get("path"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn pbs_create(ctx: &StagedContext, b: &DatastoreBlock) -> Result<()> {
    use crate::capability::process::{CmdSpec, Pipeline};
    ctx.caps
        .runner
        .run(&Pipeline::single(
            CmdSpec::new("proxmox-backup-manager")
                .arg("datastore")
                .arg("create")
                .arg(&b.name)
                .arg(&b.path),
        ))
        .with_context(|| format!("proxmox-backup-manager datastore create {}", b.name))
}

fn pbs_remove(ctx: &StagedContext, name: &str) -> Result<()> {
    use crate::capability::process::{CmdSpec, Pipeline};
    ctx.caps
        .runner
        .run(&Pipeline::single(
            CmdSpec::new("proxmox-backup-manager").arg("datastore").arg("remove").arg(name),
        ))
        .with_context(|| format!("proxmox-backup-manager datastore remove {name}"))
}

/// File-mode apply: write back only the accepted blocks; deferred blocks
/// (path rejected) go to a timestamped sidecar for the operator to review
/// rather than being silently dropped.
pub fn apply(
    ctx: &StagedContext,
    behavior: PbsRestoreBehavior,
    inventory: Option<&Value>,
    protected_paths: &[String],
) -> Result<StagedOutcome> {
    let mut outcome = StagedOutcome::default();
    if !super::gate(ctx) {
        outcome.warnings.push("datastore.cfg: staged-apply gate not satisfied, skipping".into());
        return Ok(outcome);
    }

    let staged = match engine::read_staged(ctx, "etc/proxmox-backup/datastore.cfg")? {
        engine::StagedFile::Missing => return Ok(outcome),
        engine::StagedFile::Remove => {
            engine::install_or_remove(ctx, DEST_REL, None, 0o644)?;
            outcome.applied.push("datastore.cfg (removed, staged body was empty)".into());
            return Ok(outcome);
        }
        engine::StagedFile::Present(body) => normalize_indentation(&body),
    };

    if !engine::has_section_header(&staged.replacen("datastore:", "[datastore]", 1)) {
        outcome.warnings.push("datastore.cfg: invalid structure, skipping".into());
        return Ok(outcome);
    }

    let mut blocks = parse_blocks(&staged);
    for b in blocks.iter_mut() {
        if b.path.is_empty()
            && let Some(recovered) = recover_path_from_inventory(inventory, &b.name)
        {
            b.path = recovered;
        }
    }

    let mut accepted = Vec::new();
    let mut deferred = Vec::new();
    for b in blocks {
        if looks_like_unprotected_mount(&b, protected_paths) {
            deferred.push(b);
        } else {
            accepted.push(b);
        }
    }

    if !deferred.is_empty() {
        let ts = ctx.caps.clock.now_unix();
        let sidecar = format!("/tmp/proxsave/datastore.cfg.deferred.{ts}");
        ctx.caps
            .fs
            .write_atomic(std::path::Path::new(&sidecar), render_blocks(&deferred).as_bytes(), 0o600)?;
        outcome
            .warnings
            .push(format!("{} datastore block(s) deferred to {sidecar}", deferred.len()));
    }

    match behavior {
        PbsRestoreBehavior::Merge => {
            engine::install_or_remove(ctx, DEST_REL, Some(&render_blocks(&accepted)), 0o644)?;
            outcome.applied.push("datastore.cfg".into());
        }
        PbsRestoreBehavior::Clean => {
            use crate::capability::process::CmdSpec;
            let current = engine::list_current_ids(
                ctx,
                &CmdSpec::new("proxmox-backup-manager")
                    .arg("datastore")
                    .arg("list")
                    .arg("--output-format=json"),
            )
            .unwrap_or_default();
            let desired: Vec<&str> = accepted.iter().map(|b| b.name.as_str()).collect();
            for name in &current {
                if !desired.contains(&name.as_str()) {
                    let _ = pbs_remove(ctx, name);
                }
            }
            for b in &accepted {
                if pbs_create(ctx, b).is_err() {
                    outcome.warnings.push(format!("datastore '{}' already exists, left as-is", b.name));
                } else {
                    outcome.applied.push(format!("datastore {}", b.name));
                }
            }
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::test_support::{FakeRunner, fake_caps};

    #[test]
    fn normalize_indentation_forces_four_spaces() {
        let body = "datastore: store1\n\tpath /mnt/store1\n  comment hi\n";
        let normalized = normalize_indentation(body);
        assert!(normalized.contains("    path /mnt/store1"));
        assert!(normalized.contains("    comment hi"));
    }

    #[test]
    fn parse_blocks_extracts_name_and_path() {
        let body = "datastore: store1\n    path /mnt/store1\n    comment backups\n\ndatastore: store2\n    path /srv/store2\n";
        let blocks = parse_blocks(&body);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].name, "store1");
        assert_eq!(blocks[0].path, "/mnt/store1");
        assert_eq!(blocks[1].path, "/srv/store2");
    }

    #[test]
    fn recover_path_from_inventory_by_name() {
        let inv: Value = serde_json::from_str(r#"{"datastores":[{"name":"store1","path":"/mnt/store1"}]}"#).unwrap();
        assert_eq!(recover_path_from_inventory(Some(&inv), "store1").as_deref(), Some("/mnt/store1"));
        assert_eq!(recover_path_from_inventory(Some(&inv), "missing"), None);
    }

    #[test]
    fn srv_path_is_not_treated_as_unmounted_datastore() {
        let blocks = parse_blocks("datastore: store1\n    path /srv/store1\n");
        assert!(!looks_like_unprotected_mount(&blocks[0], &[]));
    }

    #[test]
    fn mnt_path_without_guard_is_deferred() {
        let blocks = parse_blocks("datastore: store1\n    path /mnt/store1\n");
        assert!(looks_like_unprotected_mount(&blocks[0], &[]));
    }

    #[test]
    fn mnt_path_protected_by_guard_is_applied_verbatim() {
        let blocks = parse_blocks("datastore: store1\n    path /mnt/store1\n");
        let protected = vec!["/mnt/store1".to_string()];
        assert!(!looks_like_unprotected_mount(&blocks[0], &protected));
    }

    #[test]
    fn live_inventory_wraps_manager_output_under_datastores_key() {
        let runner = FakeRunner::new().with_capture(
            "proxmox-backup-manager datastore list --output-format=json",
            r#"[{"name":"store1","path":"/mnt/store1"}]"#,
        );
        let tmp = tempfile::tempdir().unwrap();
        let caps = fake_caps(runner);
        let ctx = StagedContext::new(&caps, tmp.path(), tmp.path(), false);
        let inv = live_datastore_inventory(&ctx).unwrap();
        assert_eq!(
            recover_path_from_inventory(Some(&inv), "store1").as_deref(),
            Some("/mnt/store1")
        );
    }
}
