//! PBS notification endpoints/matchers staged apply (§4.7, "PBS
//! notifications" rule): merge `notifications.cfg` + the secret-bearing
//! `notifications-priv.cfg` by `(kind, name)`, reconcile via
//! `proxmox-backup-manager notification ...`, then verify the result and
//! attempt one repair pass if something expected didn't take.

use super::{StagedContext, StagedOutcome, engine};
use crate::capability::Runner;
use crate::capability::process::{CmdSpec, Pipeline};
use anyhow::Result;

const MATCHER_KIND: &str = "matcher";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationTarget {
    pub kind: String,
    pub name: String,
    pub kv: Vec<(String, String)>,
}

/// Parse a PBS notification config into `(kind, name)`-keyed targets. A
/// section header is any line of the form `<kind>: <name>`.
pub fn parse_targets(body: &str) -> Vec<NotificationTarget> {
    let mut out = Vec::new();
    let mut current: Option<NotificationTarget> = None;
    for line in body.lines() {
        if !line.starts_with(char::is_whitespace)
            && let Some((kind, rest)) = line.split_once(':')
            && !kind.trim().is_empty()
        {
            if let Some(t) = current.take() {
                out.push(t);
            }
            current = Some(NotificationTarget {
                kind: kind.trim().to_string(),
                name: rest.trim().to_string(),
                kv: Vec::new(),
            });
        } else if let Some(target) = current.as_mut() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some((k, v)) = trimmed.split_once(' ') {
                target.kv.push((k.to_string(), v.trim().to_string()));
            }
        }
    }
    if let Some(t) = current {
        out.push(t);
    }
    out
}

/// Merge secret fields from `notifications-priv.cfg` into the public
/// targets parsed from `notifications.cfg`, matched by `(kind, name)`.
pub fn merge_priv(mut targets: Vec<NotificationTarget>, priv_body: &str) -> Vec<NotificationTarget> {
    let priv_targets = parse_targets(priv_body);
    for pt in priv_targets {
        if let Some(t) = targets.iter_mut().find(|t| t.kind == pt.kind && t.name == pt.name) {
            for (k, v) in pt.kv {
                if !t.kv.iter().any(|(ek, _)| *ek == k) {
                    t.kv.push((k, v));
                }
            }
        } else {
            targets.push(pt);
        }
    }
    targets
}

fn args_for(target: &NotificationTarget) -> Vec<String> {
    let mut args = Vec::new();
    for (k, v) in &target.kv {
        args.push(format!("--{k}"));
        args.push(v.clone());
    }
    args
}

fn noun_for(kind: &str) -> &'static str {
    if kind == MATCHER_KIND { "matcher" } else { "endpoint" }
}

fn reconcile_one(ctx: &StagedContext, target: &NotificationTarget) -> Result<()> {
    let noun = noun_for(&target.kind);
    let args = args_for(target);
    let mut create = CmdSpec::new("proxmox-backup-manager")
        .arg("notification")
        .arg(noun)
        .arg(target.kind.clone())
        .arg("create")
        .arg(&target.name);
    for a in &args {
        create = create.arg(a.clone());
    }
    if ctx.caps.runner.run(&Pipeline::single(create)).is_ok() {
        return Ok(());
    }
    let mut update = CmdSpec::new("proxmox-backup-manager")
        .arg("notification")
        .arg(noun)
        .arg(target.kind.clone())
        .arg("update")
        .arg(&target.name);
    for a in &args {
        update = update.arg(a.clone());
    }
    ctx.caps.runner.run(&Pipeline::single(update))
}

/// Compare the expected `(kind, name)` set against what `endpoint list`
/// and `matcher list` report; anything missing gets one repair attempt.
fn verify_and_repair(ctx: &StagedContext, targets: &[NotificationTarget]) -> Vec<String> {
    let mut still_missing = Vec::new();
    let current_endpoints = engine::list_current_ids(
        ctx,
        &CmdSpec::new("proxmox-backup-manager")
            .arg("notification")
            .arg("endpoint")
            .arg("list")
            .arg("--output-format=json"),
    )
    .unwrap_or_default();
    let current_matchers = engine::list_current_ids(
        ctx,
        &CmdSpec::new("proxmox-backup-manager")
            .arg("notification")
            .arg("matcher")
            .arg("list")
            .arg("--output-format=json"),
    )
    .unwrap_or_default();

    for t in targets {
        let present = if t.kind == MATCHER_KIND {
            current_matchers.contains(&t.name)
        } else {
            current_endpoints.contains(&t.name)
        };
        if !present && reconcile_one(ctx, t).is_err() {
            still_missing.push(format!("{}:{}", t.kind, t.name));
        }
    }
    still_missing
}

pub fn apply(ctx: &StagedContext) -> Result<StagedOutcome> {
    let mut outcome = StagedOutcome::default();
    if !super::gate(ctx) {
        outcome.warnings.push("notifications: staged-apply gate not satisfied, skipping".into());
        return Ok(outcome);
    }

    let pub_body = match engine::read_staged(ctx, "etc/proxmox-backup/notifications.cfg")? {
        engine::StagedFile::Missing | engine::StagedFile::Remove => return Ok(outcome),
        engine::StagedFile::Present(body) => body,
    };
    let priv_body = match engine::read_staged(ctx, "etc/proxmox-backup/notifications-priv.cfg")? {
        engine::StagedFile::Present(body) => body,
        _ => String::new(),
    };

    let targets = merge_priv(parse_targets(&pub_body), &priv_body);
    for t in &targets {
        match reconcile_one(ctx, t) {
            Ok(()) => outcome.applied.push(format!("{}:{}", t.kind, t.name)),
            Err(e) => outcome.warnings.push(format!("{}:{} failed: {e:#}", t.kind, t.name)),
        }
    }

    let still_missing = verify_and_repair(ctx, &targets);
    for m in still_missing {
        outcome.warnings.push(format!("notification {m} missing after repair attempt"));
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::test_support::{FakeRunner, fake_caps};

    #[test]
    fn parse_targets_splits_by_kind_and_name() {
        let body = "smtp: ops-mail\n\tserver mail.example.com\n\tfrom alerts@example.com\n\nmatcher: critical\n\tmatch-severity error\n";
        let targets = parse_targets(body);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].kind, "smtp");
        assert_eq!(targets[0].name, "ops-mail");
        assert_eq!(targets[1].kind, "matcher");
    }

    #[test]
    fn merge_priv_adds_secret_fields_by_kind_and_name() {
        let pub_targets = parse_targets("smtp: ops-mail\n\tserver mail.example.com\n");
        let merged = merge_priv(pub_targets, "smtp: ops-mail\n\tpassword hunter2\n");
        assert_eq!(merged.len(), 1);
        assert!(merged[0].kv.contains(&("password".to_string(), "hunter2".to_string())));
        assert!(merged[0].kv.contains(&("server".to_string(), "mail.example.com".to_string())));
    }

    #[test]
    fn noun_for_matcher_vs_endpoint() {
        assert_eq!(noun_for("matcher"), "matcher");
        assert_eq!(noun_for("smtp"), "endpoint");
    }

    #[test]
    fn apply_without_staged_file_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let caps = fake_caps(FakeRunner::new());
        let ctx = StagedContext::new(&caps, tmp.path(), tmp.path(), false);
        let outcome = apply(&ctx).unwrap();
        assert!(outcome.applied.is_empty());
    }
}
