//! Archive reader (§4.1): open (decrypt + decompress + checksum),
//! enumerate, and selectively extract a POSIX tar stream.

pub mod compression;
pub mod encryption;

use crate::capability::fs::Fs;
use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    WriteAsFile,
    WriteAsDir,
    WriteAsSymlink,
    Skip,
}

#[derive(Default)]
pub struct OpenOptions {
    pub identities: Vec<encryption::Identity>,
    pub passphrase: Option<String>,
    pub expect_sha256: Option<String>,
}

/// Verify (if requested), decrypt (if needed), decompress (if needed).
/// Returns a plain tar byte stream ready for `tar::Archive`.
pub fn open(raw: Vec<u8>, opts: &OpenOptions) -> Result<Vec<u8>> {
    if let Some(expected) = &opts.expect_sha256 {
        let mut hasher = Sha256::new();
        hasher.update(&raw);
        let got = hex_encode(&hasher.finalize());
        if !got.eq_ignore_ascii_case(expected) {
            bail!("checksum mismatch: manifest says {expected}, archive hashes to {got}");
        }
    }

    let head = &raw[..raw.len().min(32)];
    let decrypted: Vec<u8> = if encryption::looks_encrypted(head) {
        let mut out = Vec::new();
        let mut r = encryption::wrap_decrypt(
            Cursor::new(&raw),
            &opts.identities,
            opts.passphrase.as_deref(),
        )?;
        r.read_to_end(&mut out).context("read decrypted stream")?;
        out
    } else {
        raw
    };

    let chead = &decrypted[..decrypted.len().min(8)];
    let kind = compression::detect("", chead);
    let mut plain = Vec::new();
    let mut reader = compression::wrap_reader(kind, Box::new(Cursor::new(decrypted)))
        .context("set up decompressor")?;
    reader
        .read_to_end(&mut plain)
        .context("decompress archive")?;
    Ok(plain)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Single pass over tar headers only; file data is skipped, never read.
pub fn enumerate_paths(tar_bytes: &[u8]) -> Result<Vec<String>> {
    let mut archive = tar::Archive::new(Cursor::new(tar_bytes));
    let mut out = Vec::new();
    for entry in archive.entries().context("read tar entries")? {
        let entry = entry.context("read tar entry header")?;
        let path = entry.path().context("entry path")?;
        out.push(path.to_string_lossy().into_owned());
    }
    Ok(out)
}

/// Reject absolute paths and any `..` component. `allow_root_escape`
/// permits symlink targets to cross `/` when destRoot is the real system
/// root (§4.4).
fn is_safe_relative(p: &Path) -> bool {
    if p.is_absolute() {
        return false;
    }
    !p.components().any(|c| matches!(c, Component::ParentDir))
}

/// Lexically collapse `.`/`..` components without touching the filesystem
/// (the symlink's destination need not exist yet).
fn normalize_lexically(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// True when a symlink's target would resolve outside `dest_root` (§4.4
/// allows crossing root only when `dest_root` *is* the system root). An
/// absolute target is always rejected under a non-root destRoot; a
/// relative target is resolved against the symlink's own parent directory
/// first.
fn escapes_root(dest: &Path, target: &Path, dest_root: &Path) -> bool {
    if dest_root == Path::new("/") {
        return false;
    }
    if target.is_absolute() {
        return true;
    }
    let base = dest.parent().unwrap_or(dest_root);
    let resolved = normalize_lexically(&base.join(target));
    !resolved.starts_with(dest_root)
}

pub struct ExtractOutcome {
    pub applied_paths: Vec<String>,
}

/// Stream the archive once. `selected(entryName)` decides inclusion;
/// whether an included entry is written as a file, directory, or symlink
/// comes from the tar header's own entry type, not from the filter.
pub fn extract(
    fs: &dyn Fs,
    tar_bytes: &[u8],
    dest_root: &Path,
    selected: impl Fn(&str) -> bool,
) -> Result<ExtractOutcome> {
    let mut archive = tar::Archive::new(Cursor::new(tar_bytes));
    let mut applied = Vec::new();

    for entry in archive.entries().context("read tar entries")? {
        let mut entry = entry.context("read tar entry header")?;
        let raw_name = entry.path().context("entry path")?.to_string_lossy().into_owned();

        let rel = PathBuf::from(raw_name.trim_start_matches("./"));
        if !is_safe_relative(&rel) {
            bail!("refusing unsafe archive entry path: {raw_name}");
        }

        if !selected(&raw_name) {
            continue;
        }

        let action = match entry.header().entry_type() {
            tar::EntryType::Directory => FilterAction::WriteAsDir,
            tar::EntryType::Symlink => FilterAction::WriteAsSymlink,
            _ => FilterAction::WriteAsFile,
        };

        let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;
        let dest = dest_root.join(&rel);

        match action {
            FilterAction::WriteAsDir => {
                fs.mkdir_all(&dest, mode).with_context(|| format!("mkdir {}", dest.display()))?;
            }
            FilterAction::WriteAsFile => {
                if let Some(parent) = dest.parent() {
                    fs.mkdir_all(parent, 0o755)
                        .with_context(|| format!("mkdir parent of {}", dest.display()))?;
                }
                let mut contents = Vec::new();
                entry
                    .read_to_end(&mut contents)
                    .with_context(|| format!("read entry data for {raw_name}"))?;
                fs.write_atomic(&dest, &contents, mode)
                    .with_context(|| format!("write {}", dest.display()))?;
            }
            FilterAction::WriteAsSymlink => {
                let target = entry
                    .link_name()
                    .context("read symlink target")?
                    .ok_or_else(|| anyhow::anyhow!("symlink entry {raw_name} has no target"))?;
                let target = target.into_owned();
                if escapes_root(&dest, &target, dest_root) {
                    bail!("symlink {raw_name} target {} escapes destRoot", target.display());
                }
                if let Some(parent) = dest.parent() {
                    fs.mkdir_all(parent, 0o755)
                        .with_context(|| format!("mkdir parent of {}", dest.display()))?;
                }
                fs.symlink(&target, &dest)
                    .with_context(|| format!("symlink {}", dest.display()))?;
            }
            FilterAction::Skip => unreachable!(),
        }
        applied.push(raw_name);
    }

    Ok(ExtractOutcome {
        applied_paths: applied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::fs::RealFs;
    use std::io::Write;

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

    #[test]
    fn enumerate_lists_entry_paths_in_order() {
        let tar = build_tar(&[("etc/hosts", b"a"), ("etc/hostname", b"b")]);
        let paths = enumerate_paths(&tar).unwrap();
        assert_eq!(paths, vec!["etc/hosts", "etc/hostname"]);
    }

    #[test]
    fn open_rejects_checksum_mismatch() {
        let raw = b"not-a-real-archive".to_vec();
        let opts = OpenOptions {
            expect_sha256: Some("0".repeat(64)),
            ..Default::default()
        };
        let err = open(raw, &opts).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn plain_uncompressed_archive_opens_unchanged() {
        let tar = build_tar(&[("etc/hosts", b"127.0.0.1 localhost")]);
        let opened = open(tar.clone(), &OpenOptions::default()).unwrap();
        assert_eq!(opened, tar);
    }

    #[test]
    fn extract_rejects_parent_traversal() {
        let tar = build_tar(&[("../etc/passwd", b"x")]);
        let fs = RealFs;
        let dir = tempfile::tempdir().unwrap();
        let err = extract(&fs, &tar, dir.path(), |_| true).unwrap_err();
        assert!(err.to_string().contains("unsafe"));
    }

    #[test]
    fn escapes_root_rejects_relative_traversal_under_non_root_dest() {
        let dest_root = Path::new("/restore/dest");
        let dest = dest_root.join("foo/link");
        assert!(escapes_root(&dest, Path::new("../../../etc/passwd"), dest_root));
        assert!(!escapes_root(&dest, Path::new("../sibling"), dest_root));
        assert!(escapes_root(&dest, Path::new("/etc/passwd"), dest_root));
    }

    #[test]
    fn escapes_root_allows_anything_when_dest_root_is_system_root() {
        let dest_root = Path::new("/");
        let dest = dest_root.join("foo/link");
        assert!(!escapes_root(&dest, Path::new("../../../etc/passwd"), dest_root));
    }

    #[test]
    fn extract_writes_selected_files_only() {
        let tar = build_tar(&[("etc/hosts", b"abc"), ("etc/skip-me", b"zzz")]);
        let fs = RealFs;
        let dir = tempfile::tempdir().unwrap();
        let outcome = extract(&fs, &tar, dir.path(), |name| name == "etc/hosts").unwrap();
        assert_eq!(outcome.applied_paths, vec!["etc/hosts"]);
        assert!(dir.path().join("etc/hosts").exists());
        assert!(!dir.path().join("etc/skip-me").exists());
        let mut f = std::fs::File::open(dir.path().join("etc/hosts")).unwrap();
        let mut s = String::new();
        f.read_to_string(&mut s).unwrap();
        assert_eq!(s, "abc");
    }
}
