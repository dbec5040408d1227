//! Service controller (§4.5): stop/start systemd units with bounded
//! polling, plus the cluster-RECOVERY `/etc/pve` unmount.

use crate::capability::Capabilities;
use crate::capability::process::{CmdSpec, Pipeline};
use crate::capability::system::SystemInfo;
use crate::capability::{Clock, Runner};
use anyhow::{Context, Result, bail};
use std::time::Duration;

pub const SERVICE_VERIFY_TIMEOUT: Duration = Duration::from_secs(15);
pub const SERVICE_START_TIMEOUT: Duration = Duration::from_secs(30);

fn systemctl_available(caps: &Capabilities) -> bool {
    caps.runner
        .run_capture(&Pipeline::single(CmdSpec::new("which").arg("systemctl")))
        .map(|out| !out.trim().is_empty())
        .unwrap_or(false)
}

fn is_active(caps: &Capabilities, svc: &str) -> bool {
    caps.runner
        .run_status(&CmdSpec::new("systemctl").arg("is-active").arg(svc))
        .map(|code| code == 0)
        .unwrap_or(false)
}

/// `systemctl stop --no-block <s>`, poll `is-active` up to
/// `SERVICE_VERIFY_TIMEOUT`, then `reset-failed` (best-effort).
pub fn stop(caps: &Capabilities, services: &[&str]) -> Result<()> {
    if !systemctl_available(caps) {
        bail!("systemctl is not available on this host");
    }
    for svc in services {
        caps.runner
            .run(&Pipeline::single(
                CmdSpec::new("systemctl").arg("stop").arg("--no-block").arg(*svc),
            ))
            .with_context(|| format!("systemctl stop {svc}"))?;

        let deadline = caps.clock.now_instant() + SERVICE_VERIFY_TIMEOUT;
        while is_active(caps, svc) && caps.clock.now_instant() < deadline {
            caps.clock.sleep(Duration::from_millis(300));
        }

        let _ = caps.runner.run_status(&CmdSpec::new("systemctl").arg("reset-failed").arg(*svc));
    }
    Ok(())
}

/// `systemctl start <s>`, bounded by `SERVICE_START_TIMEOUT`.
pub fn start(caps: &Capabilities, services: &[&str]) -> Result<()> {
    if !systemctl_available(caps) {
        bail!("systemctl is not available on this host");
    }
    for svc in services {
        let started_at = caps.clock.now_instant();
        caps.runner
            .run(&Pipeline::single(CmdSpec::new("systemctl").arg("start").arg(*svc)))
            .with_context(|| format!("systemctl start {svc}"))?;

        while !is_active(caps, svc) {
            if caps.clock.now_instant().duration_since(started_at) >= SERVICE_START_TIMEOUT {
                bail!("service {svc} did not become active within {SERVICE_START_TIMEOUT:?}");
            }
            caps.clock.sleep(Duration::from_millis(300));
        }
    }
    Ok(())
}

/// Cluster RECOVERY's extra stop step. Exit code 32 ("not mounted") is
/// success, per §4.5.
pub fn unmount_etc_pve(caps: &Capabilities) -> Result<()> {
    caps.system()
        .unmount(std::path::Path::new("/etc/pve"))
        .context("umount /etc/pve")
}

pub const PVE_STACK: &[&str] = &["pve-cluster", "pvedaemon", "pveproxy", "pvestatd"];
pub const PBS_STACK: &[&str] = &["proxmox-backup", "proxmox-backup-proxy"];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::test_support::{FakeRunner, fake_caps, fake_caps_with_runner};
    use std::sync::Arc;

    #[test]
    fn stop_sequence_matches_spec_shape() {
        let runner = Arc::new(
            FakeRunner::new()
                .with_capture("which systemctl", "/usr/bin/systemctl")
                .with_status("systemctl is-active pve-cluster", 3),
        );
        let caps = fake_caps_with_runner(runner.clone());
        stop(&caps, &["pve-cluster"]).unwrap();
        let calls = runner.calls.borrow();
        assert!(calls.iter().any(|c| c.contains("stop --no-block pve-cluster")));
        assert!(calls.iter().any(|c| c.contains("reset-failed pve-cluster")));
    }

    #[test]
    fn missing_systemctl_is_a_hard_failure() {
        let caps = fake_caps(FakeRunner::new());
        let err = stop(&caps, &["pvedaemon"]).unwrap_err();
        assert!(err.to_string().contains("systemctl"));
    }

    #[test]
    fn unmount_exit_32_is_treated_as_success() {
        let runner = FakeRunner::new().with_status("umount /etc/pve", 32);
        let caps = fake_caps(runner);
        unmount_etc_pve(&caps).unwrap();
    }
}
