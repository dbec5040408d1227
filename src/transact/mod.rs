//! Transactional apply engine (§4.9): arm a timer-backed rollback before
//! a risky apply, then disarm on explicit operator commit. Rollback is
//! data, not process — a crash after arming still leaves the timer armed.

use crate::capability::Capabilities;
use crate::capability::process::{CmdSpec, Pipeline};
use crate::capability::{Clock, Fs, Runner};
use crate::errors::ApplyDomain;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ROLLBACK_TIMEOUT: Duration = Duration::from_secs(180);
pub const ACCESS_CONTROL_COMMIT_TIMEOUT: Duration = Duration::from_secs(180);

pub struct RollbackHandle {
    pub kind: ApplyDomain,
    pub marker_path: PathBuf,
    pub script_path: PathBuf,
    pub log_path: PathBuf,
    pub unit_name: Option<String>,
    pub armed_at: u64,
    pub timeout: Duration,
}

fn kind_slug(kind: ApplyDomain) -> &'static str {
    match kind {
        ApplyDomain::Network => "network",
        ApplyDomain::Firewall => "firewall",
        ApplyDomain::Ha => "ha",
        ApplyDomain::AccessControl => "access_control",
    }
}

/// Render the rollback shell script body (§4.9 step 3). After restoring the
/// safety tar over each scoped path, prunes any file that the apply created
/// but the safety tar never had, by diffing the archive's own manifest
/// against what's on disk.
fn rollback_script_body(marker: &Path, safety_tar: &Path, scoped_paths: &[&str], is_network: bool) -> String {
    let scope_list = scoped_paths.join(" ");
    let mut script = format!(
        "#!/bin/sh\n\
         set -e\n\
         [ -f '{marker}' ] || exit 0\n\
         tar -xpf '{tar}' -C / \n\
         for p in {scope}; do\n\
         \tarchived=\"$(mktemp)\"\n\
         \tondisk=\"$(mktemp)\"\n\
         \ttar -tf '{tar}' | sed 's#^\\./##' | grep -F \"$p/\" | sort > \"$archived\"\n\
         \tfind \"/$p\" -type f 2>/dev/null | sed 's#^/##' | sort > \"$ondisk\"\n\
         \tcomm -23 \"$ondisk\" \"$archived\" | while IFS= read -r extra; do\n\
         \t\trm -f \"/$extra\"\n\
         \tdone\n\
         \trm -f \"$archived\" \"$ondisk\"\n\
         done\n",
        marker = marker.display(),
        tar = safety_tar.display(),
        scope = scope_list,
    );
    if is_network {
        script.push_str("systemctl restart networking || ifreload -a || true\n");
    }
    script.push_str(&format!("rm -f '{}'\n", marker.display()));
    script
}

pub struct ArmInputs<'a> {
    pub kind: ApplyDomain,
    pub work_dir: &'a Path,
    pub safety_tar: &'a Path,
    pub scoped_paths: &'a [&'a str],
    pub timeout: Duration,
}

/// Arm: write marker + script, schedule via `systemd-run`, falling back to
/// `nohup sh -c 'sleep N; ...' &` when `systemd-run` is unavailable or
/// fails.
pub fn arm(caps: &Capabilities, inputs: &ArmInputs<'_>) -> Result<RollbackHandle> {
    let ts = caps.clock.now_unix();
    caps.fs.mkdir_all(inputs.work_dir, 0o700)?;

    let slug = kind_slug(inputs.kind);
    let marker_path = inputs.work_dir.join(format!("{slug}_rollback_pending_{ts}"));
    caps.fs.write_atomic(&marker_path, b"pending\n", 0o640)?;

    let script_path = inputs.work_dir.join(format!("{slug}_rollback_{ts}.sh"));
    let body = rollback_script_body(
        &marker_path,
        inputs.safety_tar,
        inputs.scoped_paths,
        matches!(inputs.kind, ApplyDomain::Network),
    );
    caps.fs.write_atomic(&script_path, body.as_bytes(), 0o750)?;

    let log_path = inputs.work_dir.join(format!("{slug}_rollback_{ts}.log"));
    let unit_name = format!("proxsave-rollback-{slug}-{ts}");
    let secs = inputs.timeout.as_secs();

    let systemd_run = caps.runner.run(&Pipeline::single(
        CmdSpec::new("systemd-run")
            .arg(format!("--unit={unit_name}"))
            .arg(format!("--on-active={secs}"))
            .arg("/bin/sh")
            .arg(script_path.to_string_lossy().into_owned()),
    ));

    let unit_name = if systemd_run.is_ok() {
        Some(unit_name)
    } else {
        tracing::warn!("systemd-run unavailable, falling back to nohup for rollback timer");
        let fallback = format!(
            "sleep {secs}; /bin/sh {}",
            script_path.to_string_lossy()
        );
        caps.runner
            .run(&Pipeline::single(
                CmdSpec::new("nohup")
                    .arg("sh")
                    .arg("-c")
                    .arg(fallback)
                    .stdout(crate::capability::process::StdioSpec::Null)
                    .stderr(crate::capability::process::StdioSpec::Null),
            ))
            .context("schedule nohup rollback fallback")?;
        None
    };

    tracing::info!("rollback log path: {}", log_path.display());

    Ok(RollbackHandle {
        kind: inputs.kind,
        marker_path,
        script_path,
        log_path,
        unit_name,
        armed_at: ts,
        timeout: inputs.timeout,
    })
}

/// Disarm: remove marker, best-effort stop the timer unit.
pub fn disarm(caps: &Capabilities, handle: &RollbackHandle) -> Result<()> {
    caps.fs.remove_file(&handle.marker_path)?;
    if let Some(unit) = &handle.unit_name {
        let _ = caps
            .runner
            .run(&Pipeline::single(CmdSpec::new("systemctl").arg("stop").arg(format!("{unit}.timer"))));
        let _ = caps.runner.run(&Pipeline::single(
            CmdSpec::new("systemctl")
                .arg("reset-failed")
                .arg(format!("{unit}.service"))
                .arg(format!("{unit}.timer")),
        ));
    }
    Ok(())
}

/// Run the rollback script synchronously right now (deadline-elapsed
/// path), so the final summary reflects true state.
pub fn fire_now(caps: &Capabilities, handle: &RollbackHandle) -> Result<()> {
    caps.runner
        .run(&Pipeline::single(
            CmdSpec::new("/bin/sh").arg(handle.script_path.to_string_lossy().into_owned()),
        ))
        .with_context(|| format!("run rollback script {}", handle.script_path.display()))
}

pub fn remaining(caps: &Capabilities, handle: &RollbackHandle) -> Duration {
    let elapsed = Duration::from_secs(caps.clock.now_unix().saturating_sub(handle.armed_at));
    handle.timeout.saturating_sub(elapsed)
}

/// Commit protocol (§4.9): prompt "Type COMMIT within Ns", disarm on
/// exact match, leave armed on any other input, fire synchronously on
/// deadline.
pub fn commit_prompt(caps: &Capabilities, handle: &RollbackHandle) -> Result<bool> {
    use crate::capability::prompt::Prompter;
    let deadline = caps.clock.now_instant() + handle.timeout;
    let label = format!("Type COMMIT within {}s", handle.timeout.as_secs());
    match caps.prompt.prompt_with_deadline(&label, deadline) {
        Ok(answer) if answer.trim() == "COMMIT" => {
            disarm(caps, handle)?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(_) => {
            fire_now(caps, handle)?;
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::test_support::{FakeRunner, fake_caps, fake_caps_with_runner};
    use std::sync::Arc;

    fn inputs(work_dir: &Path, tar: &Path) -> ArmInputs<'_> {
        ArmInputs {
            kind: ApplyDomain::Network,
            work_dir,
            safety_tar: tar,
            scoped_paths: &["etc/network"],
            timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn arm_writes_marker_and_script_and_schedules_systemd_run() {
        let tmp = tempfile::tempdir().unwrap();
        let tar = tmp.path().join("safety.tar");
        std::fs::write(&tar, b"x").unwrap();

        let runner = Arc::new(FakeRunner::new());
        let caps = fake_caps_with_runner(runner.clone());
        let handle = arm(&caps, &inputs(tmp.path(), &tar)).unwrap();

        assert!(caps.fs.exists(&handle.marker_path));
        assert!(caps.fs.exists(&handle.script_path));
        assert!(handle.unit_name.is_some());
        let calls = runner.calls.borrow();
        assert!(calls.iter().any(|c| c.contains("systemd-run")));
    }

    #[test]
    fn disarm_removes_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let tar = tmp.path().join("safety.tar");
        std::fs::write(&tar, b"x").unwrap();
        let caps = fake_caps(FakeRunner::new());
        let handle = arm(&caps, &inputs(tmp.path(), &tar)).unwrap();
        disarm(&caps, &handle).unwrap();
        assert!(!caps.fs.exists(&handle.marker_path));
    }

    #[test]
    fn rollback_script_contains_marker_guard_and_restart_for_network() {
        let body = rollback_script_body(Path::new("/tmp/m"), Path::new("/tmp/s.tar"), &["etc/network"], true);
        assert!(body.contains("[ -f '/tmp/m' ] || exit 0"));
        assert!(body.contains("systemctl restart networking"));
        assert!(body.ends_with("rm -f '/tmp/m'\n"));
    }

    #[test]
    fn rollback_script_prunes_files_absent_from_the_archive() {
        let body = rollback_script_body(Path::new("/tmp/m"), Path::new("/tmp/s.tar"), &["etc/network"], false);
        assert!(body.contains("tar -tf '/tmp/s.tar'"));
        assert!(body.contains("find \"/$p\" -type f"));
        assert!(body.contains("comm -23 \"$ondisk\" \"$archived\""));
        assert!(body.contains("rm -f \"/$extra\""));
    }

    #[test]
    fn commit_prompt_disarms_on_exact_commit_word() {
        let tmp = tempfile::tempdir().unwrap();
        let tar = tmp.path().join("safety.tar");
        std::fs::write(&tar, b"x").unwrap();
        let mut caps = fake_caps(FakeRunner::new());
        let handle = arm(&caps, &inputs(tmp.path(), &tar)).unwrap();
        caps.prompt = Arc::new(crate::capability::prompt::CannedPrompter {
            canned: Some("COMMIT".to_string()),
        });
        let committed = commit_prompt(&caps, &handle).unwrap();
        assert!(committed);
        assert!(!caps.fs.exists(&handle.marker_path));
    }

    #[test]
    fn commit_prompt_fires_rollback_on_deadline() {
        let tmp = tempfile::tempdir().unwrap();
        let tar = tmp.path().join("safety.tar");
        std::fs::write(&tar, b"x").unwrap();
        let runner = Arc::new(FakeRunner::new());
        let mut caps = fake_caps_with_runner(runner.clone());
        let handle = arm(&caps, &inputs(tmp.path(), &tar)).unwrap();
        caps.prompt = Arc::new(crate::capability::prompt::CannedPrompter { canned: None });
        let committed = commit_prompt(&caps, &handle).unwrap();
        assert!(!committed);
        let calls = runner.calls.borrow();
        assert!(calls.iter().any(|c| c.contains(&handle.script_path.to_string_lossy().to_string())));
    }
}
