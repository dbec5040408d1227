//! Safety backups (§3 `SafetyBackupResult`, §4.12 phase 7): created just
//! before any live mutation, never auto-deleted.

use crate::capability::Capabilities;
use crate::capability::{Clock, Fs};
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SafetyBackupResult {
    pub backup_path: PathBuf,
    pub created_at: u64,
    pub covered_paths: Vec<String>,
}

/// Snapshot `covered_paths` (rooted at `/`) into a gzip tar under
/// `/tmp/proxsave` with an informative name. Missing paths are skipped,
/// not an error — a fresh host may not have every file a category names.
pub fn create_safety_backup(
    caps: &Capabilities,
    label: &str,
    covered_paths: &[&str],
) -> Result<SafetyBackupResult> {
    let ts = caps.clock.now_unix();
    let dir = PathBuf::from("/tmp/proxsave");
    caps.fs.mkdir_all(&dir, 0o700)?;
    let backup_path = dir.join(format!("safety-{label}-{ts}.tar.gz"));

    let mut present = Vec::new();
    let gz = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(gz);
    for p in covered_paths {
        let full = Path::new("/").join(p.trim_start_matches('/'));
        let bytes = match caps.fs.read(&full) {
            Ok(b) => b,
            Err(_) => continue,
        };
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(caps.fs.stat(&full).map(|s| s.mode).unwrap_or(0o644));
        header.set_cksum();
        builder
            .append_data(&mut header, p, bytes.as_slice())
            .with_context(|| format!("append {p} to safety backup"))?;
        present.push((*p).to_string());
    }
    let gz = builder.into_inner().context("finish tar")?;
    let bytes = gz.finish().context("finish gzip")?;
    caps.fs.write_atomic(&backup_path, &bytes, 0o600)?;

    Ok(SafetyBackupResult {
        backup_path,
        created_at: ts,
        covered_paths: present,
    })
}

/// Full-host safety backup plus the per-domain ones required by the plan
/// (network, firewall, HA, access-control) — §4.12 phase 7.
pub fn create_domain_backups(
    caps: &Capabilities,
    domains: &[(&str, &[&str])],
) -> Result<Vec<SafetyBackupResult>> {
    domains
        .iter()
        .map(|(label, paths)| create_safety_backup(caps, label, paths))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::fs::RealFs;
    use crate::capability::test_support::{FakeRunner, fake_caps};

    #[test]
    fn missing_covered_paths_are_skipped_not_fatal() {
        let caps = fake_caps(FakeRunner::new());
        let result = create_safety_backup(&caps, "network", &["etc/this-does-not-exist"]).unwrap();
        assert!(result.covered_paths.is_empty());
        assert!(RealFs.exists(&result.backup_path));
    }

    #[test]
    fn backup_path_is_informatively_named() {
        let caps = fake_caps(FakeRunner::new());
        let result = create_safety_backup(&caps, "firewall", &[]).unwrap();
        assert!(result.backup_path.to_string_lossy().contains("safety-firewall-"));
    }
}
