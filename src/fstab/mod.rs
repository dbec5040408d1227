//! Smart fstab merger (§4.8).

use crate::capability::Capabilities;
use crate::capability::prompt::Prompter;
use crate::capability::process::{CmdSpec, Pipeline};
use crate::capability::{Clock, Fs, Runner};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::time::Duration;

pub const FSTAB_PROMPT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
    pub options: String,
    pub dump: String,
    pub pass: String,
    pub raw_line: String,
}

pub fn parse(fstab: &str) -> Vec<FstabEntry> {
    fstab
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return None;
            }
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            Some(FstabEntry {
                device: fields[0].to_string(),
                mount_point: fields[1].to_string(),
                fs_type: fields[2].to_string(),
                options: fields[3].to_string(),
                dump: fields.get(4).unwrap_or(&"0").to_string(),
                pass: fields.get(5).unwrap_or(&"0").to_string(),
                raw_line: line.to_string(),
            })
        })
        .collect()
}

fn is_stable_device(device: &str) -> bool {
    device.starts_with("UUID=") || device.starts_with("LABEL=") || device.starts_with("PARTUUID=")
}

fn is_network_fs(fs_type: &str) -> bool {
    fs_type.starts_with("nfs") || fs_type.starts_with("cifs") || fs_type == "smbfs"
}

fn root_entry(entries: &[FstabEntry]) -> Option<&FstabEntry> {
    entries.iter().find(|e| e.mount_point == "/")
}

fn swap_entry(entries: &[FstabEntry]) -> Option<&FstabEntry> {
    entries.iter().find(|e| e.fs_type == "swap")
}

/// Rewrite an unstable `/dev/X` backup-side device to a stable id using a
/// backup-side `blkid`/`lsblk` inventory (`device -> stable id`).
pub fn remap_device(device: &str, inventory: &std::collections::HashMap<String, String>) -> String {
    if is_stable_device(device) {
        return device.to_string();
    }
    inventory.get(device).cloned().unwrap_or_else(|| device.to_string())
}

/// Parse `blkid -o export` output: blank-line-delimited `KEY=value`
/// stanzas, one per device, keyed by its `DEVNAME=`. Picks the most
/// stable id available per device, preferring `UUID` over `PARTUUID`
/// over `LABEL`.
pub fn parse_blkid_export(output: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut devname: Option<String> = None;
    let mut uuid: Option<String> = None;
    let mut partuuid: Option<String> = None;
    let mut label: Option<String> = None;

    let mut flush = |devname: &mut Option<String>, uuid: &mut Option<String>, partuuid: &mut Option<String>, label: &mut Option<String>, out: &mut HashMap<String, String>| {
        if let Some(dev) = devname.take() {
            if let Some(id) = uuid.take().map(|u| format!("UUID={u}")).or_else(|| partuuid.take().map(|p| format!("PARTUUID={p}"))).or_else(|| label.take().map(|l| format!("LABEL={l}"))) {
                out.insert(dev, id);
            }
        }
        *uuid = None;
        *partuuid = None;
        *label = None;
    };

    for line in output.lines() {
        if line.trim().is_empty() {
            flush(&mut devname, &mut uuid, &mut partuuid, &mut label, &mut out);
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "DEVNAME" => devname = Some(value.to_string()),
            "UUID" => uuid = Some(value.to_string()),
            "PARTUUID" => partuuid = Some(value.to_string()),
            "LABEL" => label = Some(value.to_string()),
            _ => {}
        }
    }
    flush(&mut devname, &mut uuid, &mut partuuid, &mut label, &mut out);
    out
}

/// Build a device -> stable-id inventory by shelling out to `blkid`. An
/// empty map on failure leaves `remap_device` a no-op, same as an absent
/// inventory.
pub fn gather_device_inventory(caps: &Capabilities) -> HashMap<String, String> {
    caps.runner
        .run_capture(&Pipeline::single(CmdSpec::new("blkid").arg("-o").arg("export")))
        .map(|out| parse_blkid_export(&out))
        .unwrap_or_default()
}

pub struct MergePlan {
    pub root_comparable: bool,
    pub root_match: bool,
    pub swap_comparable: bool,
    pub swap_match: bool,
    pub proposed: Vec<FstabEntry>,
    pub skipped: Vec<FstabEntry>,
}

/// Build the merge plan. `backup_inventory` remaps unstable backup-side
/// `/dev/X` devices before the comparison.
pub fn build_merge_plan(
    current: &[FstabEntry],
    backup_raw: &[FstabEntry],
    backup_inventory: &std::collections::HashMap<String, String>,
) -> MergePlan {
    let backup: Vec<FstabEntry> = backup_raw
        .iter()
        .map(|e| {
            let mut e = e.clone();
            e.device = remap_device(&e.device, backup_inventory);
            e
        })
        .collect();

    let cur_root = root_entry(current);
    let bak_root = root_entry(&backup);
    let root_comparable = cur_root.is_some_and(|r| is_stable_device(&r.device))
        && bak_root.is_some_and(|r| is_stable_device(&r.device));
    let root_match = root_comparable && cur_root.unwrap().device == bak_root.unwrap().device;

    let cur_swap = swap_entry(current);
    let bak_swap = swap_entry(&backup);
    let swap_comparable = cur_swap.is_some_and(|s| is_stable_device(&s.device))
        && bak_swap.is_some_and(|s| is_stable_device(&s.device));
    let swap_match = swap_comparable && cur_swap.unwrap().device == bak_swap.unwrap().device;

    let mut proposed = Vec::new();
    let mut skipped = Vec::new();
    for entry in &backup {
        let already_present = current.iter().any(|c| c.mount_point == entry.mount_point);
        if already_present {
            continue;
        }
        let stable = is_stable_device(&entry.device);
        let network_ok = is_network_fs(&entry.fs_type)
            && (entry.options.contains("nofail") || entry.options.contains("_netdev"));
        if stable || network_ok {
            proposed.push(entry.clone());
        } else {
            skipped.push(entry.clone());
        }
    }

    MergePlan {
        root_comparable,
        root_match,
        swap_comparable,
        swap_match,
        proposed,
        skipped,
    }
}

/// Default answer per §4.8: Yes iff `RootComparable ∧ RootMatch ∧
/// (¬SwapComparable ∨ SwapMatch)`.
pub fn default_answer(plan: &MergePlan) -> bool {
    plan.root_comparable && plan.root_match && (!plan.swap_comparable || plan.swap_match)
}

fn render_entry(e: &FstabEntry) -> String {
    format!(
        "{} {} {} {} {} {}",
        e.device, e.mount_point, e.fs_type, e.options, e.dump, e.pass
    )
}

/// Prompt the operator with a countdown, then on acceptance append the
/// proposed entries and write `/etc/fstab` atomically, preserving mode.
pub fn prompt_and_merge(
    caps: &Capabilities,
    current_fstab_path: &std::path::Path,
    current_raw: &str,
    plan: &MergePlan,
) -> Result<bool> {
    if plan.proposed.is_empty() {
        return Ok(false);
    }

    let deadline = caps.clock.now_instant() + FSTAB_PROMPT_TIMEOUT;
    let default_yes = default_answer(plan);
    let label = format!(
        "Merge {} proposed fstab entries? [Y/n] (default {})",
        plan.proposed.len(),
        if default_yes { "yes" } else { "no" }
    );

    let answer = match caps.prompt.prompt_with_deadline(&label, deadline) {
        Ok(line) => {
            let trimmed = line.trim().to_lowercase();
            if trimmed.is_empty() {
                default_yes
            } else {
                trimmed == "y" || trimmed == "yes"
            }
        }
        Err(_) => default_yes,
    };

    if !answer {
        return Ok(false);
    }

    let mut merged = current_raw.to_string();
    if !merged.ends_with('\n') {
        merged.push('\n');
    }
    for entry in &plan.proposed {
        merged.push_str(&render_entry(entry));
        merged.push('\n');
    }

    let mode = caps
        .fs
        .stat(current_fstab_path)
        .map(|s| if s.mode == 0 { 0o644 } else { s.mode })
        .unwrap_or(0o644);
    caps.fs
        .write_atomic(current_fstab_path, merged.as_bytes(), mode)
        .with_context(|| format!("write {}", current_fstab_path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::test_support::{FakeRunner, fake_caps};
    use std::collections::HashMap;

    fn e(device: &str, mp: &str, fstype: &str, opts: &str) -> FstabEntry {
        FstabEntry {
            device: device.into(),
            mount_point: mp.into(),
            fs_type: fstype.into(),
            options: opts.into(),
            dump: "0".into(),
            pass: "0".into(),
            raw_line: format!("{device} {mp} {fstype} {opts} 0 0"),
        }
    }

    #[test]
    fn parse_skips_comments_and_blank_lines() {
        let fstab = "# header\n\nUUID=abc / ext4 defaults 0 1\n";
        let entries = parse(fstab);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].mount_point, "/");
    }

    #[test]
    fn default_answer_true_when_root_matches_and_no_swap_mismatch() {
        let current = vec![e("UUID=root-1", "/", "ext4", "defaults")];
        let backup = vec![e("UUID=root-1", "/", "ext4", "defaults")];
        let plan = build_merge_plan(&current, &backup, &HashMap::new());
        assert!(default_answer(&plan));
    }

    #[test]
    fn default_answer_false_on_swap_mismatch() {
        let current = vec![
            e("UUID=root-1", "/", "ext4", "defaults"),
            e("UUID=swap-cur", "none", "swap", "sw"),
        ];
        let backup = vec![
            e("UUID=root-1", "/", "ext4", "defaults"),
            e("UUID=swap-bak", "none", "swap", "sw"),
        ];
        let plan = build_merge_plan(&current, &backup, &HashMap::new());
        assert!(plan.swap_comparable);
        assert!(!plan.swap_match);
        assert!(!default_answer(&plan));
    }

    #[test]
    fn unstable_raw_device_without_netdev_is_skipped_not_proposed() {
        let current = vec![e("UUID=root-1", "/", "ext4", "defaults")];
        let backup = vec![
            e("UUID=root-1", "/", "ext4", "defaults"),
            e("/dev/sdb1", "/data", "ext4", "defaults"),
        ];
        let plan = build_merge_plan(&current, &backup, &HashMap::new());
        assert!(plan.proposed.is_empty());
        assert_eq!(plan.skipped.len(), 1);
    }

    #[test]
    fn network_fs_with_nofail_is_proposed_even_when_unstable() {
        let current = vec![e("UUID=root-1", "/", "ext4", "defaults")];
        let backup = vec![
            e("UUID=root-1", "/", "ext4", "defaults"),
            e("10.0.0.5:/export", "/mnt/nfs", "nfs4", "nofail,_netdev"),
        ];
        let plan = build_merge_plan(&current, &backup, &HashMap::new());
        assert_eq!(plan.proposed.len(), 1);
    }

    #[test]
    fn parse_blkid_export_prefers_uuid_over_partuuid_and_label() {
        let output = "DEVNAME=/dev/sda1\nUUID=DATA-42\nPARTUUID=part-1\nLABEL=data\n\n\
                       DEVNAME=/dev/sdb1\nPARTUUID=part-2\n\n\
                       DEVNAME=/dev/sdc1\nLABEL=extra\n";
        let inv = parse_blkid_export(output);
        assert_eq!(inv.get("/dev/sda1"), Some(&"UUID=DATA-42".to_string()));
        assert_eq!(inv.get("/dev/sdb1"), Some(&"PARTUUID=part-2".to_string()));
        assert_eq!(inv.get("/dev/sdc1"), Some(&"LABEL=extra".to_string()));
    }

    #[test]
    fn gather_device_inventory_empty_when_blkid_output_unconfigured() {
        let caps = fake_caps(FakeRunner::new());
        assert!(gather_device_inventory(&caps).is_empty());
    }

    #[test]
    fn remap_uses_inventory_for_unstable_devices() {
        let mut inv = HashMap::new();
        inv.insert("/dev/sdb1".to_string(), "UUID=remapped".to_string());
        assert_eq!(remap_device("/dev/sdb1", &inv), "UUID=remapped");
        assert_eq!(remap_device("UUID=already-stable", &inv), "UUID=already-stable");
    }

    #[test]
    fn merge_writes_proposed_entries_when_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("fstab");
        std::fs::write(&path, "UUID=root-1 / ext4 defaults 0 1\n").unwrap();

        let mut caps = fake_caps(FakeRunner::new());
        caps.prompt = std::sync::Arc::new(crate::capability::prompt::CannedPrompter {
            canned: Some("yes".to_string()),
        });

        let current = vec![e("UUID=root-1", "/", "ext4", "defaults")];
        let backup = vec![
            e("UUID=root-1", "/", "ext4", "defaults"),
            e("UUID=data-1", "/data", "ext4", "defaults"),
        ];
        let plan = build_merge_plan(&current, &backup, &HashMap::new());
        let raw = std::fs::read_to_string(&path).unwrap();
        let applied = prompt_and_merge(&caps, &path, &raw, &plan).unwrap();
        assert!(applied);
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("/data"));
    }
}
