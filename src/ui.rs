use prettytable::{Cell, Row, Table};

use crate::category::Category;
use crate::errors::RestoreError;
use crate::plan::RestorePlan;

pub fn log_plan_summary(plan: &RestorePlan) {
    let mut table = Table::new();
    table.set_titles(Row::new(vec![Cell::new("Lane"), Cell::new("Category")]));

    let rows: [(&str, &[Category]); 3] = [
        ("Normal", &plan.normal),
        ("Staged", &plan.staged),
        ("Export", &plan.export),
    ];
    for (lane, cats) in rows {
        for c in cats {
            table.add_row(Row::new(vec![Cell::new(lane), Cell::new(c.id)]));
        }
    }
    table.printstd();

    tracing::info!(
        "cluster_backup={} needs_cluster_restore={} cluster_safe_mode={} needs_pbs_services={}",
        plan.cluster_backup,
        plan.needs_cluster_restore,
        plan.cluster_safe_mode,
        plan.needs_pbs_services
    );
}

pub fn log_safety_backups(paths: &[String]) {
    if paths.is_empty() {
        tracing::info!("<no safety backups created>");
        return;
    }
    let mut table = Table::new();
    table.set_titles(Row::new(vec![Cell::new("Safety backup path")]));
    for p in paths {
        table.add_row(Row::new(vec![Cell::new(p)]));
    }
    table.printstd();
}

pub fn log_restore_warnings(warnings: &[String]) {
    if warnings.is_empty() {
        return;
    }
    let mut table = Table::new();
    table.set_titles(Row::new(vec![Cell::new("#"), Cell::new("Warning")]));
    for (i, w) in warnings.iter().enumerate() {
        table.add_row(Row::new(vec![Cell::new(&(i + 1).to_string()), Cell::new(w)]));
    }
    table.printstd();
}

/// Final summary (§4.12 phase 17): log paths, diagnostics dir, safety
/// backup paths, rollback deadlines, post-rollback IP, reboot advice.
pub fn log_final_summary(
    warnings: &[String],
    fatal: Option<&RestoreError>,
    safety_backups: &[String],
    diag_dir: Option<&str>,
    rollback_pending: &[RestoreError],
) {
    log_restore_warnings(warnings);
    log_safety_backups(safety_backups);

    if let Some(dir) = diag_dir {
        tracing::info!("network diagnostics captured under {dir}");
    }

    for e in rollback_pending {
        if let RestoreError::ApplyNotCommitted {
            domain,
            rollback_log,
            rollback_marker,
            restored_ip,
            rollback_armed,
            rollback_deadline_unix,
        } = e
        {
            tracing::warn!(
                "{domain} apply not committed: armed={rollback_armed} marker={} log={} deadline={rollback_deadline_unix}",
                rollback_marker.display(),
                rollback_log.display(),
            );
            if let Some(ip) = restored_ip {
                tracing::warn!("host reachable (pre-rollback) at {ip}");
            }
        }
    }

    match fatal {
        Some(e) => tracing::error!("restore ended with a fatal error: {e}"),
        None => tracing::info!("restore finished; a reboot is recommended before relying on this host"),
    }
}
