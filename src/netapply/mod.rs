//! Network apply specialization (§4.10): diagnostics snapshot, mgmt-iface
//! detection, preflight, apply, and post-apply health probe.

use crate::capability::Capabilities;
use crate::capability::process::{CmdSpec, Pipeline};
use crate::capability::{Clock, Fs, Runner};
use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthSeverity {
    Ok,
    Warning,
    Critical,
}

pub struct DiagSnapshot {
    pub dir: PathBuf,
}

/// Pre-apply diagnostics capture: `ip addr`, `ip route`, `ip link`,
/// `resolvectl status`.
pub fn capture_diagnostics(caps: &Capabilities) -> Result<DiagSnapshot> {
    let ts = caps.clock.now_unix();
    let dir = PathBuf::from(format!("/tmp/proxsave/network_diag_{ts}"));
    caps.fs.mkdir_all(&dir, 0o755)?;

    let probes: &[(&str, CmdSpec)] = &[
        ("ip_addr", CmdSpec::new("ip").arg("addr")),
        ("ip_route", CmdSpec::new("ip").arg("route")),
        ("ip_link", CmdSpec::new("ip").arg("link")),
        ("resolvectl", CmdSpec::new("resolvectl").arg("status")),
    ];
    for (name, cmd) in probes {
        let out = caps
            .runner
            .run_capture(&Pipeline::single(cmd.clone()))
            .unwrap_or_default();
        caps.fs.write_atomic(&dir.join(name), out.as_bytes(), 0o644)?;
    }

    Ok(DiagSnapshot { dir })
}

/// Detect the management interface from `SSH_CONNECTION`/`SSH_CLIENT`
/// (client IP is the first field, mapped via `ip route get`), falling
/// back to the default route.
pub fn detect_mgmt_iface(caps: &Capabilities, ssh_connection_env: Option<&str>) -> Option<String> {
    if let Some(env) = ssh_connection_env {
        let client_ip = env.split_whitespace().next()?;
        let out = caps
            .runner
            .run_capture(&Pipeline::single(CmdSpec::new("ip").arg("route").arg("get").arg(client_ip)))
            .ok()?;
        if let Some(iface) = extract_dev_token(&out) {
            return Some(iface);
        }
    }
    let out = caps
        .runner
        .run_capture(&Pipeline::single(CmdSpec::new("ip").arg("route").arg("show").arg("default")))
        .ok()?;
    extract_dev_token(&out)
}

fn extract_dev_token(out: &str) -> Option<String> {
    let tokens: Vec<&str> = out.split_whitespace().collect();
    tokens
        .iter()
        .position(|t| *t == "dev")
        .and_then(|i| tokens.get(i + 1))
        .map(|s| s.to_string())
}

/// `ifquery` preflight (§4.10): run only when the binary exists. A
/// nonzero exit is treated as a parse error — the caller must roll back
/// immediately (no timer) when the staged install was used.
pub fn ifquery_preflight(caps: &Capabilities) -> Result<bool> {
    let available = caps
        .runner
        .run_capture(&Pipeline::single(CmdSpec::new("which").arg("ifquery")))
        .map(|out| !out.trim().is_empty())
        .unwrap_or(false);
    if !available {
        return Ok(true);
    }
    let code = caps.runner.run_status(&CmdSpec::new("ifquery").arg("-a").arg("-c"))?;
    Ok(code == 0)
}

/// Apply: first available of `ifreload -a`, `systemctl restart
/// networking`, `ifup -a`.
pub fn apply(caps: &Capabilities) -> Result<String> {
    let candidates: &[CmdSpec] = &[
        CmdSpec::new("ifreload").arg("-a"),
        CmdSpec::new("systemctl").arg("restart").arg("networking"),
        CmdSpec::new("ifup").arg("-a"),
    ];
    let mut last_err = None;
    for cmd in candidates {
        match caps.runner.run(&Pipeline::single(cmd.clone())) {
            Ok(()) => return Ok(cmd.program.clone()),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no network apply strategy available")))
}

pub struct HealthReport {
    pub severity: HealthSeverity,
    pub checks: Vec<(String, bool)>,
}

/// Post-apply health: link up, expected addresses present, gateway
/// reachable, DNS resolves, PVE/PBS ports open. A critical result does
/// not auto-revert; the operator's commit decision remains authoritative.
pub fn health_probe(caps: &Capabilities, mgmt_iface: Option<&str>, expect_port: u16) -> HealthReport {
    let mut checks = Vec::new();

    if let Some(iface) = mgmt_iface {
        let link_up = caps
            .runner
            .run_capture(&Pipeline::single(CmdSpec::new("ip").arg("link").arg("show").arg(iface)))
            .map(|out| out.contains("state UP"))
            .unwrap_or(false);
        checks.push(("link_up".to_string(), link_up));
    }

    let gateway_ok = caps
        .runner
        .run_status(&CmdSpec::new("ping").arg("-c").arg("1").arg("-W").arg("2").arg("default"))
        .map(|code| code == 0)
        .unwrap_or(false);
    checks.push(("gateway_reachable".to_string(), gateway_ok));

    let dns_ok = caps
        .runner
        .run_status(&CmdSpec::new("resolvectl").arg("query").arg("localhost"))
        .map(|code| code == 0)
        .unwrap_or(false);
    checks.push(("dns_resolves".to_string(), dns_ok));

    let port_ok = caps
        .runner
        .run_status(&CmdSpec::new("nc").arg("-z").arg("127.0.0.1").arg(expect_port.to_string()))
        .map(|code| code == 0)
        .unwrap_or(false);
    checks.push(("service_port_open".to_string(), port_ok));

    let ok_count = checks.iter().filter(|(_, ok)| *ok).count();
    let severity = if ok_count == checks.len() {
        HealthSeverity::Ok
    } else if ok_count == 0 {
        HealthSeverity::Critical
    } else {
        HealthSeverity::Warning
    };

    HealthReport { severity, checks }
}
