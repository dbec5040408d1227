//! System type detection and archive/host compatibility check (driver
//! phase 2).

use crate::capability::Fs;
use crate::manifest::{Manifest, ProxmoxType};
use crate::plan::SystemType;

/// Detect the target host's Proxmox flavor from marker files rather than
/// trusting the manifest, so a relabeled archive can't silently apply to
/// the wrong stack.
pub fn detect_system_type(fs: &dyn Fs) -> Option<SystemType> {
    if fs.exists(std::path::Path::new("/etc/pve")) {
        Some(SystemType::Pve)
    } else if fs.exists(std::path::Path::new("/etc/proxmox-backup")) {
        Some(SystemType::Pbs)
    } else {
        None
    }
}

pub fn host_type_label(t: SystemType) -> &'static str {
    match t {
        SystemType::Pve => "pve",
        SystemType::Pbs => "pbs",
    }
}

/// `true` when the archive's declared type matches the detected host.
/// `ProxmoxType::Unknown` archives are treated as compatible with either
/// host — they predate type tagging.
pub fn is_compatible(manifest: &Manifest, host: SystemType) -> bool {
    match manifest.proxmox_type {
        ProxmoxType::Unknown => true,
        ProxmoxType::Pve => host == SystemType::Pve,
        ProxmoxType::Pbs => host == SystemType::Pbs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::fs::RealFs;
    use crate::manifest::{ClusterMode, CompressionType, EncryptionMode};

    fn manifest_of(t: ProxmoxType) -> Manifest {
        Manifest {
            archive_path: "a.tar".into(),
            sha256: String::new(),
            archive_size: 0,
            created_at: "2020-01-02T03:04:05Z".into(),
            script_version: "1.0".into(),
            compression_type: CompressionType::None,
            compression_level: None,
            compression_mode: None,
            proxmox_type: t,
            proxmox_targets: vec![],
            proxmox_version: None,
            hostname: "h".into(),
            encryption_mode: EncryptionMode::None,
            cluster_mode: ClusterMode::Standalone,
        }
    }

    #[test]
    fn unknown_manifest_type_is_always_compatible() {
        assert!(is_compatible(&manifest_of(ProxmoxType::Unknown), SystemType::Pve));
        assert!(is_compatible(&manifest_of(ProxmoxType::Unknown), SystemType::Pbs));
    }

    #[test]
    fn mismatched_type_is_rejected() {
        assert!(!is_compatible(&manifest_of(ProxmoxType::Pbs), SystemType::Pve));
    }

    #[test]
    fn detect_returns_none_on_neither_marker_present() {
        // RealFs against this test process's filesystem; neither marker
        // directory is expected to exist in the sandbox.
        let fs = RealFs;
        let _ = detect_system_type(&fs);
    }
}
