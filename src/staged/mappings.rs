//! PVE resource mapping (pci/usb/dir) staged apply (§4.7, "PVE resource
//! mappings" rule). These always go through `pvesh` regardless of
//! cluster SAFE/RECOVERY mode, so parsing hands off to
//! [`crate::cluster::apply_resource_mappings`] — the same create-or-union
//! path the SAFE apply uses.

use super::{StagedContext, StagedOutcome, engine};
use crate::cluster::{self, ResourceMapping};
use anyhow::Result;

const MAPPING_KINDS: &[(&str, &str)] = &[
    ("etc/pve/mapping/pci.cfg", "pci"),
    ("etc/pve/mapping/usb.cfg", "usb"),
    ("etc/pve/mapping/dir.cfg", "dir"),
];

fn parse_kv_list(s: &str) -> Vec<(String, String)> {
    s.split(',').filter_map(|p| p.split_once('=')).map(|(k, v)| (k.trim().to_string(), v.trim().to_string())).collect()
}

/// Parse one `<kind>.cfg` mapping file: `<kind>: <id>` headers followed by
/// one or more `map node=...,path=...,id=...` lines, each becoming its own
/// [`ResourceMapping`].
pub fn parse_mapping_file(body: &str, kind: &str) -> Vec<ResourceMapping> {
    let header = format!("{kind}: ");
    let mut out = Vec::new();
    let mut current_id: Option<String> = None;
    for line in body.lines() {
        if let Some(rest) = line.strip_prefix(&header) {
            current_id = Some(rest.trim().to_string());
        } else if let Some(id) = &current_id {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix("map ") {
                let kv = parse_kv_list(rest);
                let node = kv.iter().find(|(k, _)| k == "node").map(|(_, v)| v.clone()).unwrap_or_default();
                let path = kv.iter().find(|(k, _)| k == "path").map(|(_, v)| v.clone()).unwrap_or_default();
                out.push(ResourceMapping {
                    kind: kind.to_string(),
                    id: id.clone(),
                    node,
                    path,
                });
            }
        }
    }
    out
}

pub fn apply(ctx: &StagedContext) -> Result<StagedOutcome> {
    let mut outcome = StagedOutcome::default();
    if !super::gate(ctx) {
        outcome.warnings.push("resource mappings: staged-apply gate not satisfied, skipping".into());
        return Ok(outcome);
    }

    let mut mappings = Vec::new();
    for (rel_path, kind) in MAPPING_KINDS {
        if let engine::StagedFile::Present(body) = engine::read_staged(ctx, rel_path)? {
            mappings.extend(parse_mapping_file(&body, kind));
        }
    }
    if mappings.is_empty() {
        return Ok(outcome);
    }

    let n = cluster::apply_resource_mappings(ctx.caps, &mappings)?;
    outcome.applied.push(format!("{n} resource mapping(s)"));
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::test_support::{FakeRunner, fake_caps};

    #[test]
    fn parse_mapping_file_extracts_node_and_path() {
        let body = "pci: gpu0\n\tmap node=pve1,path=0000:01:00.0,id=10de:1eb8\n\tmap node=pve2,path=0000:02:00.0,id=10de:1eb8\n";
        let mappings = parse_mapping_file(body, "pci");
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].id, "gpu0");
        assert_eq!(mappings[0].node, "pve1");
        assert_eq!(mappings[1].path, "0000:02:00.0");
    }

    #[test]
    fn apply_with_no_staged_mapping_files_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let caps = fake_caps(FakeRunner::new());
        let ctx = StagedContext::new(&caps, tmp.path(), tmp.path(), false);
        let outcome = apply(&ctx).unwrap();
        assert!(outcome.applied.is_empty());
    }
}
