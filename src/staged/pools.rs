//! PVE resource pools staged apply (§4.7, "PVE pools" rule): parse pool
//! definitions out of the exported `user.cfg`, create the pool objects,
//! then apply membership — gated by an operator prompt when any pool
//! would add VMs, since pool membership can move a VM's ACL scope.

use super::{StagedContext, StagedOutcome, engine};
use crate::capability::{Clock, Prompter};
use crate::cluster::{self, ResourcePool};
use anyhow::Result;
use std::time::Duration;

const POOL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);

/// Parse `pool:<id>:<comment>:<vmid,vmid,...>:` lines out of `user.cfg`.
pub fn parse_pools(user_cfg: &str) -> Vec<ResourcePool> {
    let mut out = Vec::new();
    for line in user_cfg.lines() {
        let Some(rest) = line.strip_prefix("pool:") else {
            continue;
        };
        let fields: Vec<&str> = rest.split(':').collect();
        let Some(id) = fields.first().filter(|s| !s.is_empty()) else {
            continue;
        };
        let members = fields
            .get(2)
            .map(|s| s.split(',').filter(|m| !m.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();
        out.push(ResourcePool {
            id: id.to_string(),
            members,
        });
    }
    out
}

pub fn apply(ctx: &StagedContext) -> Result<StagedOutcome> {
    let mut outcome = StagedOutcome::default();
    if !super::gate(ctx) {
        outcome.warnings.push("resource pools: staged-apply gate not satisfied, skipping".into());
        return Ok(outcome);
    }

    let body = match engine::read_staged(ctx, "etc/pve/user.cfg")? {
        engine::StagedFile::Present(body) => body,
        _ => return Ok(outcome),
    };
    let pools = parse_pools(&body);
    if pools.is_empty() {
        return Ok(outcome);
    }

    let has_members = pools.iter().any(|p| !p.members.is_empty());
    let confirm_membership = if has_members {
        let deadline = ctx.caps.clock.now_instant() + POOL_CONFIRM_TIMEOUT;
        match ctx.caps.prompt.prompt_with_deadline(
            "Some restored pools contain VMs. Apply pool membership too? [y/N]",
            deadline,
        ) {
            Ok(answer) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    } else {
        true
    };

    let n = cluster::apply_resource_pools(ctx.caps, &pools, confirm_membership)?;
    outcome.applied.push(format!("{n} resource pool(s)"));
    if has_members && !confirm_membership {
        outcome.warnings.push("pool membership left unapplied (operator declined or deadline elapsed)".into());
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::test_support::{FakeRunner, fake_caps};

    #[test]
    fn parse_pools_extracts_id_and_members() {
        let cfg = "pool:team-a:desc here:qemu/100,qemu/101:\npool:team-b::\n";
        let pools = parse_pools(cfg);
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].id, "team-a");
        assert_eq!(pools[0].members, vec!["qemu/100", "qemu/101"]);
        assert!(pools[1].members.is_empty());
    }

    #[test]
    fn apply_without_staged_user_cfg_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let caps = fake_caps(FakeRunner::new());
        let ctx = StagedContext::new(&caps, tmp.path(), tmp.path(), false);
        let outcome = apply(&ctx).unwrap();
        assert!(outcome.applied.is_empty());
    }
}
