//! Extractor (§4.4): `ExtractSelective` builds the predicate the archive
//! reader streams against from a set of categories, with the two carve-outs
//! spec.md calls out layered on top of the plain category match — the
//! cluster-RECOVERY shadow-guard and the fstab interception.

use crate::archive::{self, ExtractOutcome};
use crate::capability::fs::Fs;
use crate::category::{self, Category, path_matches_category};
use anyhow::Result;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractSelectiveOptions {
    /// §9: during cluster RECOVERY, `/etc/pve` is unmounted. Writing
    /// through it would create shadow files on the root filesystem that
    /// reappear once `pmxcfs` remounts. Strip every `./etc/pve/` entry
    /// regardless of the selected categories.
    pub cluster_shadow_guard: bool,
    /// §4.4: `filesystem`'s `etc/fstab` entry is routed to the Smart
    /// Fstab Merge instead of a raw overwrite. Only the exact `etc/fstab`
    /// entry is excluded; `etc/crypttab` (same category) extracts normally.
    pub exclude_fstab: bool,
}

fn is_under_etc_pve(entry_name: &str) -> bool {
    let n = category::normalize_entry(entry_name);
    n == "./etc/pve" || n.starts_with("./etc/pve/")
}

fn is_fstab(entry_name: &str) -> bool {
    category::normalize_entry(entry_name) == "./etc/fstab"
}

/// §4.4: writes a file iff its archive path matches at least one pattern
/// in `categories` and the owning category is not `exportOnly` — Export
/// lane categories must never reach this call (the driver routes them to
/// the export extraction instead; we still defend against it here).
pub fn extract_selective(
    fs: &dyn Fs,
    tar_bytes: &[u8],
    dest_root: &Path,
    categories: &[Category],
    opts: &ExtractSelectiveOptions,
) -> Result<ExtractOutcome> {
    let cats: Vec<&Category> = categories.iter().filter(|c| !c.export_only).collect();

    archive::extract(fs, tar_bytes, dest_root, |entry_name| {
        if opts.cluster_shadow_guard && is_under_etc_pve(entry_name) {
            return false;
        }
        if opts.exclude_fstab && is_fstab(entry_name) {
            return false;
        }
        cats.iter().any(|c| path_matches_category(entry_name, c))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::fs::RealFs;
    use crate::category::{Category, SystemKind};

    fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    const NETWORK: Category = Category {
        id: "network",
        name: "Network",
        description: "",
        kind: SystemKind::Common,
        paths: &["etc/network/", "etc/hosts"],
        export_only: false,
    };

    const EXPORT_ONLY: Category = Category {
        id: "pve_config_export",
        name: "Export",
        description: "",
        kind: SystemKind::Pve,
        paths: &["etc/pve/jobs.cfg"],
        export_only: true,
    };

    const PVE_CLUSTER: Category = Category {
        id: "pve_cluster",
        name: "Cluster",
        description: "",
        kind: SystemKind::Pve,
        paths: &["etc/pve/"],
        export_only: false,
    };

    const FILESYSTEM: Category = Category {
        id: "filesystem",
        name: "fstab",
        description: "",
        kind: SystemKind::Common,
        paths: &["etc/fstab", "etc/crypttab"],
        export_only: false,
    };

    #[test]
    fn writes_only_matching_non_export_categories() {
        let tar = build_tar(&[
            ("etc/hosts", b"abc"),
            ("etc/pve/jobs.cfg", b"xyz"),
            ("etc/unrelated", b"zzz"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let outcome = extract_selective(
            &RealFs,
            &tar,
            dir.path(),
            &[NETWORK, EXPORT_ONLY],
            &ExtractSelectiveOptions::default(),
        )
        .unwrap();
        assert_eq!(outcome.applied_paths, vec!["etc/hosts"]);
        assert!(dir.path().join("etc/hosts").exists());
        assert!(!dir.path().join("etc/pve/jobs.cfg").exists());
    }

    #[test]
    fn cluster_shadow_guard_strips_etc_pve_regardless_of_selection() {
        let tar = build_tar(&[("etc/pve/storage.cfg", b"x"), ("etc/hosts", b"y")]);
        let dir = tempfile::tempdir().unwrap();
        let opts = ExtractSelectiveOptions {
            cluster_shadow_guard: true,
            exclude_fstab: false,
        };
        let outcome =
            extract_selective(&RealFs, &tar, dir.path(), &[PVE_CLUSTER, NETWORK], &opts).unwrap();
        assert_eq!(outcome.applied_paths, vec!["etc/hosts"]);
        assert!(!dir.path().join("etc/pve/storage.cfg").exists());
    }

    #[test]
    fn fstab_excluded_but_crypttab_still_extracted() {
        let tar = build_tar(&[("etc/fstab", b"x"), ("etc/crypttab", b"y")]);
        let dir = tempfile::tempdir().unwrap();
        let opts = ExtractSelectiveOptions {
            cluster_shadow_guard: false,
            exclude_fstab: true,
        };
        let outcome = extract_selective(&RealFs, &tar, dir.path(), &[FILESYSTEM], &opts).unwrap();
        assert_eq!(outcome.applied_paths, vec!["etc/crypttab"]);
        assert!(!dir.path().join("etc/fstab").exists());
        assert!(dir.path().join("etc/crypttab").exists());
    }
}
