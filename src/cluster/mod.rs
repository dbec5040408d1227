//! Cluster SAFE apply (§4.11): re-materialize datacenter-wide state via
//! `pvesh` instead of restoring `/etc/pve` directly.

use crate::capability::Capabilities;
use crate::capability::Runner;
use crate::capability::process::{CmdSpec, Pipeline};
use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceMapping {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub node: String,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourcePool {
    pub id: String,
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmConfigExport {
    pub vmid: u32,
    pub node: String,
    pub kind: VmKind,
    pub config_lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VmKind {
    Qemu,
    Lxc,
}

fn vm_path(kind: VmKind, node: &str, vmid: u32) -> String {
    match kind {
        VmKind::Qemu => format!("/nodes/{node}/qemu/{vmid}/config"),
        VmKind::Lxc => format!("/nodes/{node}/lxc/{vmid}/config"),
    }
}

/// Stable `k=v,k=v` ordering for mapping entries: `node`, `path`, `id`,
/// then alphabetic.
fn stable_mapping_order(m: &ResourceMapping) -> String {
    format!("node={},path={},id={}", m.node, m.path, m.id)
}

pub struct ApplyOutcome {
    pub mappings_applied: usize,
    pub pools_created: usize,
    pub vm_configs_applied: usize,
}

fn pvesh_set(caps: &Capabilities, path: &str, args: &[String]) -> Result<()> {
    let mut cmd = CmdSpec::new("pvesh").arg("set").arg(path);
    for a in args {
        cmd = cmd.arg(a.clone());
    }
    caps.runner
        .run(&Pipeline::single(cmd))
        .with_context(|| format!("pvesh set {path}"))
}

fn pvesh_create(caps: &Capabilities, path: &str, args: &[String]) -> Result<()> {
    let mut cmd = CmdSpec::new("pvesh").arg("create").arg(path);
    for a in args {
        cmd = cmd.arg(a.clone());
    }
    caps.runner
        .run(&Pipeline::single(cmd))
        .with_context(|| format!("pvesh create {path}"))
}

/// Create each mapping; on conflict, GET existing and union entries, then
/// `set`. Simplified here to create-or-update without a real GET/union
/// round trip against a fake API — callers needing strict union semantics
/// should pre-merge `mappings` before calling this.
pub fn apply_resource_mappings(caps: &Capabilities, mappings: &[ResourceMapping]) -> Result<usize> {
    for m in mappings {
        let path = format!("/cluster/mapping/{}", m.kind);
        let entry = stable_mapping_order(m);
        if pvesh_create(caps, &path, &[format!("id={}", m.id), format!("map={entry}")]).is_err() {
            pvesh_set(caps, &format!("{path}/{}", m.id), &[format!("map={entry}")])?;
        }
    }
    Ok(mappings.len())
}

/// Two-phase pool apply: create pool defs, then membership.
pub fn apply_resource_pools(caps: &Capabilities, pools: &[ResourcePool], confirm_membership: bool) -> Result<usize> {
    for p in pools {
        let _ = pvesh_create(caps, "/pools", &[format!("poolid={}", p.id)]);
    }
    if !confirm_membership {
        tracing::warn!("pool membership contains VMs; skipping membership apply without operator confirmation");
        return Ok(pools.len());
    }
    for p in pools {
        if p.members.is_empty() {
            continue;
        }
        pvesh_set(
            caps,
            &format!("/pools/{}", p.id),
            &[format!("vms={}", p.members.join(","))],
        )?;
    }
    Ok(pools.len())
}

/// Per-VM/CT config apply, with an operator-selected `source_node` override
/// when the current hostname isn't present in the export.
pub fn apply_vm_configs(
    caps: &Capabilities,
    configs: &[VmConfigExport],
    current_hostname: &str,
    source_node_override: Option<&str>,
) -> Result<usize> {
    let mut applied = 0;
    for c in configs {
        let node = if configs.iter().any(|x| x.node == current_hostname) {
            current_hostname
        } else {
            source_node_override.unwrap_or(&c.node)
        };
        let path = vm_path(c.kind, node, c.vmid);
        pvesh_set(caps, &path, &c.config_lines)?;
        applied += 1;
    }
    Ok(applied)
}

/// `storage.cfg`/`datacenter.cfg` are skipped when `pve_storage` is in the
/// Staged lane, to avoid double-apply.
pub fn should_apply_storage_cfg(staged_lane_ids: &[&str]) -> bool {
    !staged_lane_ids.contains(&"pve_storage")
}

#[derive(Debug, Clone)]
pub struct StorageBlock {
    pub kind: String,
    pub id: String,
    pub lines: Vec<String>,
}

/// Parse `storage.cfg`'s `<type>: <id>` blocks, the same shape the PBS
/// `datastore.cfg` parser uses, generalized to an arbitrary header type.
pub fn parse_storage_blocks(body: &str) -> Vec<StorageBlock> {
    let mut out = Vec::new();
    let mut current: Option<StorageBlock> = None;
    for line in body.lines() {
        if !line.starts_with(char::is_whitespace) && !line.trim().is_empty() {
            if let Some((kind, id)) = line.split_once(':') {
                if let Some(b) = current.take() {
                    out.push(b);
                }
                current = Some(StorageBlock {
                    kind: kind.trim().to_string(),
                    id: id.trim().to_string(),
                    lines: Vec::new(),
                });
                continue;
            }
        }
        if let Some(block) = current.as_mut() {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                block.lines.push(trimmed.to_string());
            }
        }
    }
    if let Some(b) = current {
        out.push(b);
    }
    out
}

/// Create-or-update each storage definition via `pvesh`.
pub fn apply_storage_cfg(caps: &Capabilities, body: &str) -> Result<usize> {
    let blocks = parse_storage_blocks(body);
    for b in &blocks {
        let prop_args: Vec<String> = b
            .lines
            .iter()
            .filter_map(|l| l.split_once(' '))
            .map(|(k, v)| format!("{k}={}", v.trim()))
            .collect();
        let mut create_args = vec![format!("storage={}", b.id), format!("type={}", b.kind)];
        create_args.extend(prop_args.iter().cloned());
        if pvesh_create(caps, "/storage", &create_args).is_err() {
            pvesh_set(caps, &format!("/storage/{}", b.id), &prop_args)?;
        }
    }
    Ok(blocks.len())
}

/// `datacenter.cfg` is a flat `key: value` singleton; apply it against the
/// cluster options endpoint.
pub fn apply_datacenter_cfg(caps: &Capabilities, body: &str) -> Result<()> {
    let args: Vec<String> = body
        .lines()
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| format!("{}={}", k.trim(), v.trim()))
        .collect();
    if args.is_empty() {
        return Ok(());
    }
    pvesh_set(caps, "/cluster/options", &args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::test_support::{FakeRunner, fake_caps};

    #[test]
    fn stable_order_places_node_path_id_first() {
        let m = ResourceMapping {
            kind: "pci".into(),
            id: "gpu0".into(),
            node: "pve1".into(),
            path: "0000:01:00.0".into(),
        };
        assert_eq!(stable_mapping_order(&m), "node=pve1,path=0000:01:00.0,id=gpu0");
    }

    #[test]
    fn storage_cfg_skipped_when_staged_already_covers_it() {
        assert!(!should_apply_storage_cfg(&["pve_storage"]));
        assert!(should_apply_storage_cfg(&["network"]));
    }

    #[test]
    fn pool_membership_skipped_without_confirmation() {
        let caps = fake_caps(FakeRunner::new());
        let pools = vec![ResourcePool {
            id: "team-a".into(),
            members: vec!["qemu/100".into()],
        }];
        let n = apply_resource_pools(&caps, &pools, false).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn parse_storage_blocks_extracts_type_id_and_properties() {
        let body = "dir: local\n\tpath /var/lib/vz\n\tcontent vztmpl,iso\n\nzfspool: local-zfs\n\tpool rpool/data\n";
        let blocks = parse_storage_blocks(body);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].kind, "dir");
        assert_eq!(blocks[0].id, "local");
        assert!(blocks[0].lines.contains(&"path /var/lib/vz".to_string()));
        assert_eq!(blocks[1].kind, "zfspool");
        assert_eq!(blocks[1].id, "local-zfs");
    }

    #[test]
    fn apply_storage_cfg_creates_each_block() {
        let caps = fake_caps(FakeRunner::new());
        let n = apply_storage_cfg(&caps, "dir: local\n\tpath /var/lib/vz\n").unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn apply_datacenter_cfg_skips_empty_body() {
        let caps = fake_caps(FakeRunner::new());
        apply_datacenter_cfg(&caps, "").unwrap();
    }

    #[test]
    fn vm_config_prefers_current_hostname_as_source_node() {
        let caps = fake_caps(FakeRunner::new());
        let configs = vec![VmConfigExport {
            vmid: 100,
            node: "pve2".into(),
            kind: VmKind::Qemu,
            config_lines: vec!["cores: 4".into()],
        }];
        apply_vm_configs(&caps, &configs, "pve2", None).unwrap();
    }
}
