//! PBS remote/sync/verify/prune/s3/traffic-control staged apply (§4.7,
//! "PBS remote/sync/verify/prune/s3/traffic-control" rule). All six share
//! the same section-config shape (`<header>: <id>` plus indented `key
//! value` properties) and the same create-then-update-on-conflict apply,
//! so one generic path drives all of them via an [`ObjectSpec`].

use super::{StagedContext, StagedOutcome, engine};
use crate::capability::Runner;
use crate::capability::process::CmdSpec;
use anyhow::Result;

pub struct ObjectSpec {
    pub rel_path: &'static str,
    pub header: &'static str,
    pub cli_noun: &'static str,
    pub redact_flags: &'static [&'static str],
}

pub const REMOTE: ObjectSpec = ObjectSpec {
    rel_path: "etc/proxmox-backup/remote.cfg",
    header: "remote",
    cli_noun: "remote",
    redact_flags: &["--password"],
};

pub const SYNC_JOB: ObjectSpec = ObjectSpec {
    rel_path: "etc/proxmox-backup/sync.cfg",
    header: "sync",
    cli_noun: "sync-job",
    redact_flags: &[],
};

pub const VERIFY_JOB: ObjectSpec = ObjectSpec {
    rel_path: "etc/proxmox-backup/verification.cfg",
    header: "verification",
    cli_noun: "verify-job",
    redact_flags: &[],
};

pub const PRUNE_JOB: ObjectSpec = ObjectSpec {
    rel_path: "etc/proxmox-backup/prune.cfg",
    header: "prune",
    cli_noun: "prune-job",
    redact_flags: &[],
};

pub const S3_ENDPOINT: ObjectSpec = ObjectSpec {
    rel_path: "etc/proxmox-backup/s3.cfg",
    header: "s3-endpoint",
    cli_noun: "s3-endpoint",
    redact_flags: &["--access-key", "--secret-key"],
};

pub const TRAFFIC_CONTROL: ObjectSpec = ObjectSpec {
    rel_path: "etc/proxmox-backup/traffic-control.cfg",
    header: "rule",
    cli_noun: "traffic-control",
    redact_flags: &[],
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub id: String,
    pub kv: Vec<(String, String)>,
}

pub fn parse_sections(body: &str, header: &str) -> Vec<Section> {
    let prefix = format!("{header}: ");
    let mut out = Vec::new();
    let mut current: Option<Section> = None;
    for line in body.lines() {
        if let Some(rest) = line.strip_prefix(&prefix) {
            if let Some(s) = current.take() {
                out.push(s);
            }
            current = Some(Section {
                id: rest.trim().to_string(),
                kv: Vec::new(),
            });
        } else if let Some(section) = current.as_mut() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some((k, v)) = trimmed.split_once(' ') {
                section.kv.push((k.to_string(), v.trim().to_string()));
            }
        }
    }
    if let Some(s) = current {
        out.push(s);
    }
    out
}

fn args_for(section: &Section) -> Vec<String> {
    let mut args = Vec::new();
    for (k, v) in &section.kv {
        args.push(format!("--{k}"));
        args.push(v.clone());
    }
    args
}

/// Render `args` for logging with sensitive flag values replaced, so a
/// failed apply's error message never leaks a password or access key.
fn redacted_render(cli_noun: &str, action: &str, id: &str, args: &[String], redact_flags: &[&str]) -> String {
    let mut out = format!("proxmox-backup-manager {cli_noun} {action} {id}");
    let mut i = 0;
    while i < args.len() {
        let flag = &args[i];
        out.push(' ');
        out.push_str(flag);
        if i + 1 < args.len() {
            out.push(' ');
            if redact_flags.contains(&flag.as_str()) {
                out.push_str("<redacted>");
            } else {
                out.push_str(&args[i + 1]);
            }
            i += 2;
        } else {
            i += 1;
        }
    }
    out
}

fn run_noun(ctx: &StagedContext, spec: &ObjectSpec, action: &str, id: &str, args: &[String]) -> Result<()> {
    use crate::capability::process::Pipeline;
    let mut cmd = CmdSpec::new("proxmox-backup-manager")
        .arg(spec.cli_noun)
        .arg(action)
        .arg(id);
    for a in args {
        cmd = cmd.arg(a.clone());
    }
    ctx.caps
        .runner
        .run(&Pipeline::single(cmd))
        .map_err(|_| anyhow::anyhow!(redacted_render(spec.cli_noun, action, id, args, spec.redact_flags)))
}

/// Apply one object kind. `clean_strict`: when true, list current IDs and
/// remove any not present in the staged section set before creating.
pub fn apply(ctx: &StagedContext, spec: &ObjectSpec, clean_strict: bool) -> Result<StagedOutcome> {
    let mut outcome = StagedOutcome::default();
    if !super::gate(ctx) {
        outcome.warnings.push(format!("{}: staged-apply gate not satisfied, skipping", spec.rel_path));
        return Ok(outcome);
    }

    let staged = match engine::read_staged(ctx, spec.rel_path)? {
        engine::StagedFile::Missing => return Ok(outcome),
        engine::StagedFile::Remove => {
            engine::install_or_remove(ctx, spec.rel_path, None, 0o644)?;
            outcome.applied.push(format!("{} (removed)", spec.rel_path));
            return Ok(outcome);
        }
        engine::StagedFile::Present(body) => body,
    };

    let sections = parse_sections(&staged, spec.header);
    if sections.is_empty() {
        outcome.warnings.push(format!("{}: no {} sections found, skipping", spec.rel_path, spec.header));
        return Ok(outcome);
    }

    if clean_strict {
        let list_cmd = CmdSpec::new("proxmox-backup-manager")
            .arg(spec.cli_noun)
            .arg("list")
            .arg("--output-format=json");
        let current = engine::list_current_ids(ctx, &list_cmd).unwrap_or_default();
        let desired: Vec<&str> = sections.iter().map(|s| s.id.as_str()).collect();
        for id in &current {
            if !desired.contains(&id.as_str()) {
                let _ = run_noun(ctx, spec, "remove", id, &[]);
            }
        }
    }

    for s in &sections {
        let args = args_for(s);
        if run_noun(ctx, spec, "create", &s.id, &args).is_err() {
            match run_noun(ctx, spec, "update", &s.id, &args) {
                Ok(()) => outcome.applied.push(format!("{} {}", spec.cli_noun, s.id)),
                Err(e) => outcome.warnings.push(format!("{} {} failed: {e:#}", spec.cli_noun, s.id)),
            }
        } else {
            outcome.applied.push(format!("{} {}", spec.cli_noun, s.id));
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::test_support::{FakeRunner, fake_caps};

    #[test]
    fn parse_sections_splits_on_header_and_collects_kv() {
        let body = "remote: backup-a\n\thost 10.0.0.5\n\tauth-id root@pam\n\nremote: backup-b\n\thost 10.0.0.6\n";
        let sections = parse_sections(body, "remote");
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].id, "backup-a");
        assert!(sections[0].kv.contains(&("host".to_string(), "10.0.0.5".to_string())));
        assert_eq!(sections[1].id, "backup-b");
    }

    #[test]
    fn redacted_render_hides_sensitive_flag_values() {
        let args = vec!["--password".to_string(), "s3cr3t".to_string(), "--host".to_string(), "10.0.0.5".to_string()];
        let rendered = redacted_render("remote", "create", "backup-a", &args, &["--password"]);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("s3cr3t"));
        assert!(rendered.contains("10.0.0.5"));
    }

    #[test]
    fn empty_sections_is_reported_as_warning_not_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc/proxmox-backup")).unwrap();
        std::fs::write(tmp.path().join("etc/proxmox-backup/remote.cfg"), "not-a-section-line\n").unwrap();
        let caps = fake_caps(FakeRunner::new());
        let ctx = StagedContext::new(&caps, tmp.path(), tmp.path(), false);
        let outcome = apply(&ctx, &REMOTE, false).unwrap();
        assert!(outcome.applied.is_empty());
    }
}
