//! Backup bundle producer. The restore side of this crate is the deep
//! implementation; this is the narrow producer that feeds it, grounded in
//! the same tar/gzip/manifest shape `safety::create_safety_backup` and
//! `manifest::Manifest` already define.

use crate::capability::fs::EntryKind;
use crate::capability::{Capabilities, Clock, Fs};
use crate::category::{self, Category};
use crate::collab::BackupProducer;
use crate::manifest::{ClusterMode, CompressionType, EncryptionMode, Manifest, ProxmoxType};
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub struct TarBackupProducer<'a> {
    pub caps: &'a Capabilities,
    pub proxmox_type: ProxmoxType,
    pub categories: Vec<Category>,
    pub hostname: String,
    pub cluster_mode: ClusterMode,
}

impl<'a> TarBackupProducer<'a> {
    pub fn new(
        caps: &'a Capabilities,
        proxmox_type: ProxmoxType,
        categories: Vec<Category>,
        hostname: String,
        cluster_mode: ClusterMode,
    ) -> Self {
        Self {
            caps,
            proxmox_type,
            categories,
            hostname,
            cluster_mode,
        }
    }

    fn collect_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        for p in category::selected_paths(&self.categories) {
            self.walk(Path::new(p.trim_end_matches('/')), &mut out);
        }
        out
    }

    /// Recurse under `/`, following the same rooted-at-`/` convention the
    /// restore side's extractor uses. Paths that don't exist on this host
    /// (a category whose files were never created) are skipped, not fatal.
    fn walk(&self, rel: &Path, out: &mut Vec<String>) {
        let full = Path::new("/").join(rel);
        let stat = match self.caps.fs.stat(&full) {
            Ok(s) => s,
            Err(_) => return,
        };
        match stat.kind {
            EntryKind::Missing => {}
            EntryKind::Dir => {
                let Ok(children) = self.caps.fs.read_dir(&full) else {
                    return;
                };
                for child in children {
                    if let Ok(suffix) = child.strip_prefix("/") {
                        self.walk(suffix, out);
                    }
                }
            }
            EntryKind::File | EntryKind::Symlink => out.push(rel.to_string_lossy().into_owned()),
        }
    }
}

impl BackupProducer for TarBackupProducer<'_> {
    fn produce(&self, dest_dir: &Path) -> Result<PathBuf> {
        self.caps.fs.mkdir_all(dest_dir, 0o700)?;
        let ts = self.caps.clock.now_unix();
        let archive_path = dest_dir.join(format!("proxmox-config-{ts}.tar.gz"));
        let manifest_path = dest_dir.join(format!("proxmox-config-{ts}.manifest.json"));

        let gz = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(gz);
        let mut targets = Vec::new();
        for rel in self.collect_paths() {
            let full = Path::new("/").join(&rel);
            let bytes = match self.caps.fs.read(&full) {
                Ok(b) => b,
                Err(_) => continue,
            };
            let mode = self.caps.fs.stat(&full).map(|s| s.mode).unwrap_or(0o644);
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(mode);
            header.set_cksum();
            builder
                .append_data(&mut header, &rel, bytes.as_slice())
                .with_context(|| format!("append {rel} to backup archive"))?;
            targets.push(rel);
        }
        let gz = builder.into_inner().context("finish tar")?;
        let archive_bytes = gz.finish().context("finish gzip")?;
        self.caps.fs.write_atomic(&archive_path, &archive_bytes, 0o600)?;

        let mut hasher = Sha256::new();
        hasher.update(&archive_bytes);
        let sha256 = hex_encode(&hasher.finalize());

        let manifest = Manifest {
            archive_path: archive_path.to_string_lossy().into_owned(),
            sha256,
            archive_size: archive_bytes.len() as u64,
            created_at: crate::utils::time::fmt_utc(ts)?,
            script_version: env!("CARGO_PKG_VERSION").to_string(),
            compression_type: CompressionType::Gz,
            compression_level: None,
            compression_mode: None,
            proxmox_type: self.proxmox_type,
            proxmox_targets: targets,
            proxmox_version: None,
            hostname: self.hostname.clone(),
            encryption_mode: EncryptionMode::None,
            cluster_mode: self.cluster_mode,
        };
        let manifest_json = serde_json::to_vec_pretty(&manifest).context("serialize manifest")?;
        self.caps.fs.write_atomic(&manifest_path, &manifest_json, 0o600)?;

        Ok(archive_path)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::test_support::{FakeRunner, fake_caps};
    use crate::category::registry;

    #[test]
    fn missing_category_paths_are_skipped_not_fatal() {
        let caps = fake_caps(FakeRunner::new());
        let producer = TarBackupProducer::new(
            &caps,
            ProxmoxType::Pve,
            vec![registry::SSH.clone()],
            "pve1".into(),
            ClusterMode::Standalone,
        );
        let dir = tempfile::tempdir().unwrap();
        let archive = producer.produce(dir.path()).unwrap();
        assert!(archive.exists());
    }

    #[test]
    fn manifest_checksum_matches_archive_bytes() {
        let caps = fake_caps(FakeRunner::new());
        let producer = TarBackupProducer::new(
            &caps,
            ProxmoxType::Pbs,
            vec![registry::PBS_REMOTES.clone()],
            "pbs1".into(),
            ClusterMode::Standalone,
        );
        let dir = tempfile::tempdir().unwrap();
        let archive = producer.produce(dir.path()).unwrap();
        let bytes = std::fs::read(&archive).unwrap();

        let manifest_path = dir
            .path()
            .read_dir()
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.to_string_lossy().ends_with("manifest.json"))
            .unwrap();
        let manifest = Manifest::load(&manifest_path).unwrap();
        manifest.verify_checksum(&bytes).unwrap();
    }
}
