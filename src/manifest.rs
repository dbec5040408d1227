//! Manifest record (§3) emitted alongside the archive by the backup
//! producer and consumed here as a primitive.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxmoxType {
    Pve,
    Pbs,
    #[serde(rename = "")]
    Unknown,
}

impl ProxmoxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxmoxType::Pve => "pve",
            ProxmoxType::Pbs => "pbs",
            ProxmoxType::Unknown => "",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None,
    Gz,
    Xz,
    Zst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    #[default]
    None,
    Age,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    Cluster,
    Standalone,
    #[serde(rename = "")]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub archive_path: String,
    pub sha256: String,
    pub archive_size: u64,
    pub created_at: String,
    pub script_version: String,
    #[serde(default)]
    pub compression_type: CompressionType,
    #[serde(default)]
    pub compression_level: Option<u32>,
    #[serde(default)]
    pub compression_mode: Option<String>,
    pub proxmox_type: ProxmoxType,
    #[serde(default)]
    pub proxmox_targets: Vec<String>,
    #[serde(default)]
    pub proxmox_version: Option<String>,
    pub hostname: String,
    #[serde(default)]
    pub encryption_mode: EncryptionMode,
    #[serde(default = "default_cluster_mode")]
    pub cluster_mode: ClusterMode,
}

fn default_cluster_mode() -> ClusterMode {
    ClusterMode::Unknown
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let m: Manifest =
            serde_json::from_str(&raw).with_context(|| format!("parse manifest {}", path.display()))?;
        Ok(m)
    }

    /// Invariant: `sha256(archive_bytes) == manifest.sha256`. Restore fails
    /// loudly on mismatch.
    pub fn verify_checksum(&self, archive_bytes: &[u8]) -> Result<()> {
        let mut hasher = Sha256::new();
        hasher.update(archive_bytes);
        let digest = hasher.finalize();
        let hex = hex_encode(&digest);
        if !hex.eq_ignore_ascii_case(&self.sha256) {
            bail!(
                "checksum mismatch: manifest says {}, archive hashes to {hex}",
                self.sha256
            );
        }
        Ok(())
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

    fn sample() -> Manifest {
        Manifest {
            archive_path: "/tmp/bundle.tar".into(),
            sha256: String::new(),
            archive_size: 3,
            created_at: "2020-01-02T03:04:05Z".into(),
            script_version: "1.0.0".into(),
            compression_type: CompressionType::None,
            compression_level: None,
            compression_mode: None,
            proxmox_type: ProxmoxType::Pve,
            proxmox_targets: vec![],
            proxmox_version: None,
            hostname: "pve1".into(),
            encryption_mode: EncryptionMode::None,
            cluster_mode: ClusterMode::Standalone,
        }
    }

    #[test]
    fn checksum_matches() {
        let mut m = sample();
        let mut hasher = Sha256::new();
        hasher.update(b"abc");
        m.sha256 = hex_encode(&hasher.finalize());
        m.verify_checksum(b"abc").unwrap();
    }

    #[test]
    fn checksum_mismatch_fails_loudly() {
        let mut m = sample();
        m.sha256 = "0".repeat(64);
        let err = m.verify_checksum(b"abc").unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn deserializes_from_json() {
        let json = r#"{
            "archive_path": "/tmp/a.tar.gz",
            "sha256": "abc123",
            "archive_size": 100,
            "created_at": "2020-01-02T03:04:05Z",
            "script_version": "2.1.0",
            "compression_type": "gz",
            "proxmox_type": "pbs",
            "hostname": "pbs1",
            "encryption_mode": "age",
            "cluster_mode": "standalone"
        }"#;
        let m: Manifest = serde_json::from_str(json).unwrap();
        assert_eq!(m.proxmox_type.as_str(), "pbs");
        assert_eq!(m.encryption_mode, EncryptionMode::Age);
    }
}
