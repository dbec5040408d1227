//! Host-identity capability: `geteuid`, `hostname`, `unmount`.

use anyhow::{Context, Result};
use std::path::Path;

use super::process::{CmdSpec, Runner};

pub trait SystemInfo: Send + Sync {
    fn geteuid(&self) -> u32;
    fn hostname(&self) -> String;
    /// `umount <path>`. Exit code 32 ("not mounted") is treated as success
    /// per spec §4.5.
    fn unmount(&self, path: &Path) -> Result<()>;
}

pub struct RealSystemInfo<'a> {
    runner: &'a dyn Runner,
}

impl<'a> RealSystemInfo<'a> {
    pub fn new(runner: &'a dyn Runner) -> Self {
        Self { runner }
    }
}

impl SystemInfo for RealSystemInfo<'_> {
    fn geteuid(&self) -> u32 {
        // SAFETY: geteuid() has no preconditions and never fails.
        unsafe { libc::geteuid() }
    }

    fn hostname(&self) -> String {
        let mut buf = [0u8; 256];
        // SAFETY: buf is a valid, correctly-sized stack buffer.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if rc != 0 {
            return "localhost".to_string();
        }
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).to_string()
    }

    fn unmount(&self, path: &Path) -> Result<()> {
        let cmd = CmdSpec::new("umount").arg(path.display().to_string());
        let code = self
            .runner
            .run_status(&cmd)
            .with_context(|| format!("umount {}", path.display()))?;
        if code == 0 || code == 32 {
            Ok(())
        } else {
            anyhow::bail!("umount {} failed with exit code {code}", path.display())
        }
    }
}

#[cfg(test)]
pub struct FakeSystemInfo {
    pub euid: u32,
    pub hostname: String,
}

#[cfg(test)]
impl SystemInfo for FakeSystemInfo {
    fn geteuid(&self) -> u32 {
        self.euid
    }
    fn hostname(&self) -> String {
        self.hostname.clone()
    }
    fn unmount(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}
