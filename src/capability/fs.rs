//! Filesystem capability.
//!
//! Every read/write/stat/remove the restore engine performs against the
//! live system (or a staging tree) flows through this trait. There is no
//! direct `std::fs` call in the core restore logic outside of here — this
//! is what makes the plan builder, fstab merger, and staged-apply engines
//! unit-testable without touching a real filesystem.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Missing,
}

#[derive(Debug, Clone)]
pub struct Stat {
    pub kind: EntryKind,
    pub len: u64,
    pub mode: u32,
    /// Device id the path resides on (`st_dev`); used to tell a real
    /// mount apart from a plain directory on the root filesystem.
    pub dev: u64,
}

pub trait Fs: Send + Sync {
    fn stat(&self, path: &Path) -> Result<Stat>;
    fn read(&self, path: &Path) -> Result<Vec<u8>>;
    fn read_to_string(&self, path: &Path) -> Result<String> {
        Ok(String::from_utf8(self.read(path)?)?)
    }
    /// Atomic write: temp file in the same directory, then rename into
    /// place. `mode` is masked by 0o7777, matching the archive extractor's
    /// convention.
    fn write_atomic(&self, path: &Path, contents: &[u8], mode: u32) -> Result<()>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    fn remove_dir_all(&self, path: &Path) -> Result<()>;
    fn mkdir_all(&self, path: &Path, mode: u32) -> Result<()>;
    fn mkdir_temp(&self, parent: &Path, prefix: &str) -> Result<PathBuf>;
    fn symlink(&self, target: &Path, link: &Path) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;
    fn exists(&self, path: &Path) -> bool {
        matches!(self.stat(path), Ok(s) if s.kind != EntryKind::Missing)
    }
}

#[derive(Default, Clone, Copy)]
pub struct RealFs;

impl Fs for RealFs {
    fn stat(&self, path: &Path) -> Result<Stat> {
        match fs::symlink_metadata(path) {
            Ok(meta) => {
                let kind = if meta.file_type().is_symlink() {
                    EntryKind::Symlink
                } else if meta.is_dir() {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                };
                #[cfg(unix)]
                let (mode, dev) = {
                    use std::os::unix::fs::MetadataExt;
                    (meta.mode() & 0o7777, meta.dev())
                };
                #[cfg(not(unix))]
                let (mode, dev) = (0o644, 0);
                Ok(Stat {
                    kind,
                    len: meta.len(),
                    mode,
                    dev,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Stat {
                kind: EntryKind::Missing,
                len: 0,
                mode: 0,
                dev: 0,
            }),
            Err(e) => Err(e).with_context(|| format!("stat {}", path.display())),
        }
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        Ok(buf)
    }

    fn write_atomic(&self, path: &Path, contents: &[u8], mode: u32) -> Result<()> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        self.mkdir_all(parent, 0o755)?;

        let tmp_name = format!(
            ".{}.proxsave-tmp-{}",
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "file".to_string()),
            crate::utils::time::current_epoch()
        );
        let tmp_path = parent.join(tmp_name);

        {
            let mut f = File::create(&tmp_path)
                .with_context(|| format!("create temp {}", tmp_path.display()))?;
            f.write_all(contents)
                .with_context(|| format!("write temp {}", tmp_path.display()))?;
            f.sync_all().ok();
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode & 0o7777))
                .with_context(|| format!("chmod {}", tmp_path.display()))?;
        }

        fs::rename(&tmp_path, path)
            .with_context(|| format!("rename {} -> {}", tmp_path.display(), path.display()))?;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove_dir_all {}", path.display())),
        }
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            let mut b = fs::DirBuilder::new();
            b.recursive(true).mode(mode & 0o7777);
            match b.create(path) {
                Ok(()) => Ok(()),
                Err(e) if path.is_dir() => {
                    let _ = e;
                    Ok(())
                }
                Err(e) => Err(e).with_context(|| format!("mkdir -p {}", path.display())),
            }
        }
        #[cfg(not(unix))]
        {
            fs::create_dir_all(path).with_context(|| format!("mkdir -p {}", path.display()))
        }
    }

    fn mkdir_temp(&self, parent: &Path, prefix: &str) -> Result<PathBuf> {
        self.mkdir_all(parent, 0o755)?;
        let name = format!(
            "{prefix}-{}-{}",
            std::process::id(),
            crate::utils::time::current_epoch()
        );
        let dir = parent.join(name);
        self.mkdir_all(&dir, 0o700)?;
        Ok(dir)
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(target, link)
                .with_context(|| format!("symlink {} -> {}", link.display(), target.display()))
        }
        #[cfg(not(unix))]
        {
            let _ = (target, link);
            anyhow::bail!("symlinks are only supported on unix")
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).with_context(|| format!("rename {} -> {}", from.display(), to.display()))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(path).with_context(|| format!("read_dir {}", path.display()))? {
            out.push(entry?.path());
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_atomic_then_stat() {
        let tmp = TempDir::new().unwrap();
        let fs = RealFs;
        let p = tmp.path().join("a/b/c.cfg");
        fs.write_atomic(&p, b"hello", 0o640).unwrap();
        let st = fs.stat(&p).unwrap();
        assert_eq!(st.kind, EntryKind::File);
        assert_eq!(st.len, 5);
        assert_eq!(fs.read_to_string(&p).unwrap(), "hello");
    }

    #[test]
    fn missing_stat_is_not_error() {
        let tmp = TempDir::new().unwrap();
        let fs = RealFs;
        let st = fs.stat(&tmp.path().join("nope")).unwrap();
        assert_eq!(st.kind, EntryKind::Missing);
    }

    #[test]
    fn mkdir_temp_is_unique_and_0700() {
        let tmp = TempDir::new().unwrap();
        let fs = RealFs;
        let a = fs.mkdir_temp(tmp.path(), "run").unwrap();
        let b = fs.mkdir_temp(tmp.path(), "run").unwrap();
        assert_ne!(a, b);
    }
}
