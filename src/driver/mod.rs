//! Restore driver (§4.12): the 17-phase sequence that turns a bundle plus
//! operator choices into a live restore. Every module above this one is a
//! primitive the driver composes; nothing here talks to the filesystem or a
//! process directly except through `Capabilities`.

use crate::archive::{self, OpenOptions};
use crate::capability::Capabilities;
use crate::capability::Runner;
use crate::capability::fs::Fs;
use crate::capability::prompt::Prompter;
use crate::capability::Clock;
use crate::category::{self, registry};
use crate::cluster;
use crate::collab::{LocalStorageFetcher, RcloneStorageFetcher, StorageFetcher};
use crate::compat;
use crate::config::Config;
use crate::errors::{ApplyDomain, RestoreError};
use crate::extract::{self, ExtractSelectiveOptions};
use crate::fstab;
use crate::manifest::Manifest;
use crate::mountguard;
use crate::netapply;
use crate::plan::{self, ClusterChoice, PbsRestoreBehavior, PlanInputs, RestoreMode, RestorePlan};
use crate::safety;
use crate::service;
use crate::staged::{self, StagedContext, StagedOutcome, datastore, mappings, network_install, notifications, pbs_objects, pools};
use crate::tempreg;
use crate::transact::{self, ArmInputs};
use crate::ui;
use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::time::Duration;

const PLAN_CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);
const CLUSTER_CHOICE_TIMEOUT: Duration = Duration::from_secs(60);
const NETWORK_HEALTH_PORT: u16 = 8006;

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// Local path, or a remote ref when `storage_remote` is set.
    pub bundle_ref: String,
    pub manifest_path: Option<PathBuf>,
    pub mode: RestoreMode,
    pub custom_selection: Vec<&'static str>,
    pub dest_root: PathBuf,
    pub dry_run: bool,
    /// `--cli`: never block on a prompt, use the documented default answer.
    pub non_interactive: bool,
    pub pbs_restore_behavior_override: Option<PbsRestoreBehavior>,
    pub cluster_choice_override: Option<ClusterChoice>,
    pub storage_remote: Option<String>,
}

#[derive(Debug, Default)]
pub struct RestoreOutcome {
    pub warnings: Vec<String>,
    pub safety_backup_paths: Vec<String>,
    pub rollback_pending: Vec<RestoreError>,
    pub diag_dir: Option<String>,
}

/// Run phases 1-17 against `req`. Fatal errors from phases 1-7 propagate;
/// everything from phase 8 onward is recorded as a warning and the driver
/// keeps going, per the propagation policy.
pub fn run(caps: &Capabilities, cfg: &Config, req: &RestoreRequest) -> Result<RestoreOutcome> {
    let mut outcome = RestoreOutcome::default();

    let work_dir = tempreg::create(caps, "restore")?;

    // Phase 1: prepare bundle.
    let (tar_bytes, manifest) = phase1_prepare_bundle(caps, cfg, req, &work_dir)?;

    // Phase 2: detect system type, check compatibility.
    let host_type = phase2_detect_and_check(caps, &manifest, req)?;

    // Phase 3: analyze archive contents against the category catalog.
    let analyzed = phase3_analyze(&tar_bytes);

    // Phase 4: mode/category selection, with access-control's network+ssl
    // recommendation folded into a Custom selection.
    let custom_selection = phase4_selection(req, &analyzed);

    // Phase 5: build the plan, including the cluster SAFE/RECOVERY/ABORT
    // choice when the archive carries a cluster backup.
    let plan = phase5_build_plan(caps, req, &manifest, host_type, &analyzed, &custom_selection)?;

    // Phase 6: render the plan and get operator confirmation.
    phase6_confirm(caps, &plan, req)?;

    // Phase 7: safety backups, before any live mutation.
    outcome.safety_backup_paths = phase7_safety_backups(caps, &plan)?;

    // Phase 8: stop the services whose config we are about to overwrite.
    phase8_stop_services(caps, &plan, &mut outcome.warnings);

    // Phase 9: extract the Normal lane, plus the network staged-install.
    phase9_extract_normal(caps, &tar_bytes, &plan, req, &mut outcome.warnings);

    // Phase 10: Smart Fstab Merge.
    if category_selected(&plan, "filesystem") {
        phase10_fstab_merge(caps, &tar_bytes, req, &mut outcome.warnings);
    }

    // Phase 11: Staged lane extraction, mount guards, staged-apply engines.
    let stage_root = work_dir.join("staged");
    if !plan.staged.is_empty() {
        phase11_staged(caps, &tar_bytes, &plan, req, &stage_root, &mut outcome.warnings);
    }

    // Phase 12: Export lane, human-inspection only.
    if !plan.export.is_empty() {
        phase12_export(caps, &tar_bytes, &plan, &mut outcome.warnings);
    }

    // Phase 13: cluster SAFE apply.
    if plan.cluster_safe_mode {
        phase13_cluster_safe_apply(caps, &stage_root, &plan, req, &mut outcome.warnings);
    }

    // Phase 14/15: storage dir recreation, resolv.conf repair.
    phase14_recreate_storage_dirs(caps, &plan, req, &mut outcome.warnings);
    if category_selected(&plan, "network") {
        phase15_repair_resolv_conf(caps, req, &mut outcome.warnings);
    }

    // Phase 16: transactional network/firewall/HA/access-control apply.
    if category_selected(&plan, "network") {
        phase16_network_apply(caps, cfg, req, &mut outcome);
    }

    // Phase 17: restart services, print the final summary.
    phase17_start_services_and_summarize(caps, &plan, &outcome);

    mountguard::cleanup_guards(caps, req.dry_run).ok();

    Ok(outcome)
}

fn category_selected(plan: &RestorePlan, id: &str) -> bool {
    plan.normal.iter().chain(plan.staged.iter()).any(|c| c.id == id)
}

fn phase1_prepare_bundle(
    caps: &Capabilities,
    cfg: &Config,
    req: &RestoreRequest,
    work_dir: &Path,
) -> Result<(Vec<u8>, Manifest)> {
    let archive_path = if let Some(remote) = &req.storage_remote {
        RcloneStorageFetcher {
            caps,
            remote_name: remote.clone(),
        }
        .fetch(&req.bundle_ref, work_dir)?
    } else {
        LocalStorageFetcher.fetch(&req.bundle_ref, work_dir)?
    };

    let manifest_path = req.manifest_path.clone().unwrap_or_else(|| {
        let mut p = archive_path.clone();
        p.set_extension("manifest.json");
        p
    });
    let manifest = Manifest::load(&manifest_path)
        .map_err(|e| RestoreError::Archive(format!("load manifest {}: {e}", manifest_path.display())))?;

    let raw = caps
        .fs
        .read(&archive_path)
        .with_context(|| format!("read archive {}", archive_path.display()))?;

    let identities = match &cfg.restore.age_identity_file {
        Some(p) => {
            let contents = caps
                .fs
                .read_to_string(p)
                .with_context(|| format!("read age identity file {}", p.display()))?;
            crate::archive::encryption::Identity::parse_keyfile(&contents)?
        }
        None => Vec::new(),
    };

    let tar_bytes = archive::open(
        raw,
        &OpenOptions {
            identities,
            passphrase: cfg.restore.age_passphrase.clone(),
            expect_sha256: Some(manifest.sha256.clone()),
        },
    )
    .map_err(|e| RestoreError::Archive(e.to_string()))?;

    Ok((tar_bytes, manifest))
}

fn phase2_detect_and_check(
    caps: &Capabilities,
    manifest: &Manifest,
    req: &RestoreRequest,
) -> Result<plan::SystemType> {
    let host_type = compat::detect_system_type(caps.fs.as_ref())
        .ok_or_else(|| RestoreError::Preflight("could not detect a PVE or PBS install on this host".into()))?;

    if !compat::is_compatible(manifest, host_type) {
        let archive_type = manifest.proxmox_type.as_str().to_string();
        let host_label = compat::host_type_label(host_type).to_string();
        if req.non_interactive {
            return Err(RestoreError::CompatibilityMismatch {
                archive_type,
                host_type: host_label,
            }
            .into());
        }
        let label = format!(
            "archive type '{archive_type}' does not match host type '{host_label}'. Type CONTINUE to proceed anyway"
        );
        let deadline = caps.clock_now_plus(PLAN_CONFIRM_TIMEOUT);
        let answer = caps.prompt.prompt_with_deadline(&label, deadline).unwrap_or_default();
        if answer.trim() != "CONTINUE" {
            return Err(RestoreError::CompatibilityMismatch {
                archive_type,
                host_type: host_label,
            }
            .into());
        }
    }
    Ok(host_type)
}

fn phase3_analyze(tar_bytes: &[u8]) -> Vec<category::AnalyzedCategory> {
    match archive::enumerate_paths(tar_bytes) {
        Ok(paths) => registry::analyze_archive_paths(paths.iter().map(String::as_str)),
        Err(e) => {
            tracing::warn!("[plan] failed to enumerate archive entries ({e}), falling back to Full mode catalog");
            registry::ALL
                .iter()
                .map(|c| category::AnalyzedCategory {
                    category: c.clone(),
                    is_available: true,
                })
                .collect()
        }
    }
}

fn phase4_selection(req: &RestoreRequest, analyzed: &[category::AnalyzedCategory]) -> Vec<&'static str> {
    let mut selection: Vec<&'static str> = req.custom_selection.clone();
    if req.mode == RestoreMode::Custom
        && selection.contains(&"pve_access_control")
        && analyzed.iter().any(|a| a.category.id == "network" && a.is_available)
    {
        for extra in ["network", "ssl"] {
            if !selection.contains(&extra) {
                tracing::info!("[plan] recommending '{extra}' alongside access-control restore");
                selection.push(extra);
            }
        }
    }
    selection
}

fn phase5_build_plan(
    caps: &Capabilities,
    req: &RestoreRequest,
    manifest: &Manifest,
    host_type: plan::SystemType,
    analyzed: &[category::AnalyzedCategory],
    custom_selection: &[&'static str],
) -> Result<RestorePlan> {
    let pve_cluster_available = analyzed.iter().any(|a| a.category.id == "pve_cluster" && a.is_available);
    let cluster_backup = matches!(manifest.cluster_mode, crate::manifest::ClusterMode::Cluster);

    let cluster_choice = if cluster_backup && pve_cluster_available {
        Some(req.cluster_choice_override.unwrap_or_else(|| {
            if req.non_interactive {
                return ClusterChoice::Safe;
            }
            let deadline = caps.clock_now_plus(CLUSTER_CHOICE_TIMEOUT);
            match caps
                .prompt
                .prompt_with_deadline("Cluster backup detected. [S]afe / [R]ecovery / [A]bort?", deadline)
            {
                Ok(a) if a.trim().eq_ignore_ascii_case("r") => ClusterChoice::Recovery,
                Ok(a) if a.trim().eq_ignore_ascii_case("a") => ClusterChoice::Abort,
                _ => ClusterChoice::Safe,
            }
        }))
    } else {
        None
    };

    if cluster_choice == Some(ClusterChoice::Abort) {
        bail!(RestoreError::RestoreAborted {
            reason: "operator chose ABORT at the cluster SAFE/RECOVERY prompt".into()
        });
    }

    let inputs = PlanInputs {
        cluster_mode: manifest.cluster_mode,
        system_type: host_type,
        mode: req.mode,
        custom_selection,
        cluster_choice,
        pbs_restore_behavior: req.pbs_restore_behavior_override.unwrap_or(PbsRestoreBehavior::Merge),
        staging_available: req.dest_root == Path::new("/") && !req.dry_run,
    };
    Ok(plan::build_plan(analyzed, &inputs))
}

fn phase6_confirm(caps: &Capabilities, plan: &RestorePlan, req: &RestoreRequest) -> Result<()> {
    ui::log_plan_summary(plan);
    if req.non_interactive || req.dry_run {
        return Ok(());
    }
    let deadline = caps.clock_now_plus(PLAN_CONFIRM_TIMEOUT);
    let label = format!(
        "About to overwrite config under {}. Type RESTORE to continue",
        req.dest_root.display()
    );
    let answer = caps.prompt.prompt_with_deadline(&label, deadline).unwrap_or_default();
    if answer.trim() != "RESTORE" {
        return Err(RestoreError::RestoreAborted {
            reason: "operator did not confirm the overwrite prompt".into(),
        }
        .into());
    }
    Ok(())
}

fn phase7_safety_backups(caps: &Capabilities, plan: &RestorePlan) -> Result<Vec<String>> {
    let mut domains: Vec<(&str, &[&str])> = Vec::new();
    let all_selected: Vec<category::Category> =
        plan.normal.iter().chain(plan.staged.iter()).cloned().collect();
    let all_paths = category::selected_paths(&all_selected);
    domains.push(("full", &all_paths));

    for (label, id) in [("network", "network"), ("firewall", "pve_firewall"), ("ha", "pve_ha"), ("access-control", "pve_access_control")] {
        if category_selected(plan, id) {
            if let Some(cat) = registry::by_id(id) {
                domains.push((label, cat.paths));
            }
        }
    }

    let results = safety::create_domain_backups(caps, &domains)?;
    Ok(results.into_iter().map(|r| r.backup_path.to_string_lossy().into_owned()).collect())
}

fn phase8_stop_services(caps: &Capabilities, plan: &RestorePlan, warnings: &mut Vec<String>) {
    if plan.needs_cluster_restore {
        if let Err(e) = service::stop(caps, service::PVE_STACK) {
            warnings.push(format!("stopping PVE stack: {e}"));
        }
        if let Err(e) = service::unmount_etc_pve(caps) {
            warnings.push(format!("unmounting /etc/pve: {e}"));
        }
    }
    if plan.needs_pbs_services {
        if let Err(e) = service::stop(caps, service::PBS_STACK) {
            warnings.push(format!("stopping PBS stack: {e}"));
        }
    }
}

fn phase9_extract_normal(
    caps: &Capabilities,
    tar_bytes: &[u8],
    plan: &RestorePlan,
    req: &RestoreRequest,
    warnings: &mut Vec<String>,
) {
    let opts = ExtractSelectiveOptions {
        cluster_shadow_guard: plan.needs_cluster_restore,
        exclude_fstab: true,
    };
    let normal_no_network: Vec<category::Category> =
        plan.normal.iter().filter(|c| c.id != "network").cloned().collect();
    match extract::extract_selective(caps.fs.as_ref(), tar_bytes, &req.dest_root, &normal_no_network, &opts) {
        Ok(o) => tracing::info!("[extract] normal lane wrote {} entries", o.applied_paths.len()),
        Err(e) => warnings.push(format!("normal lane extraction: {e}")),
    }

    if category_selected(plan, "network") {
        phase9b_network_staged_install(caps, tar_bytes, req, warnings);
    }
}

/// Network files route through the staged-install engine rather than a
/// direct write, so the curated-extras list and the resolv.conf skip
/// (§4.12 step 15) apply uniformly regardless of where `network` landed.
fn phase9b_network_staged_install(caps: &Capabilities, tar_bytes: &[u8], req: &RestoreRequest, warnings: &mut Vec<String>) {
    let stage = req.dest_root.join("tmp").join("proxsave").join("network-stage");
    let opts = ExtractSelectiveOptions::default();
    match extract::extract_selective(caps.fs.as_ref(), tar_bytes, &stage, &[registry::NETWORK], &opts) {
        Ok(_) => {
            let ctx = StagedContext::new(caps, &stage, &req.dest_root, req.dry_run);
            match network_install::install(&ctx) {
                Ok(o) => {
                    tracing::info!("[network] staged install applied {} files", o.applied.len());
                    warnings.extend(o.warnings);
                }
                Err(e) => warnings.push(format!("network staged install: {e}")),
            }
        }
        Err(e) => warnings.push(format!("network staging extraction: {e}")),
    }
    caps.fs.remove_dir_all(&stage).ok();
}

fn phase10_fstab_merge(caps: &Capabilities, tar_bytes: &[u8], req: &RestoreRequest, warnings: &mut Vec<String>) {
    let stage = req.dest_root.join("tmp").join("proxsave").join("fstab-stage");
    let opts = ExtractSelectiveOptions::default();
    let result = (|| -> Result<()> {
        extract::extract_selective(caps.fs.as_ref(), tar_bytes, &stage, &[registry::FILESYSTEM], &opts)?;
        let backup_raw = caps.fs.read_to_string(&stage.join("etc/fstab")).unwrap_or_default();
        if backup_raw.trim().is_empty() {
            return Ok(());
        }
        let current_path = req.dest_root.join("etc/fstab");
        let current_raw = caps.fs.read_to_string(&current_path).unwrap_or_default();
        let current = fstab::parse(&current_raw);
        let backup = fstab::parse(&backup_raw);
        let inventory = fstab::gather_device_inventory(caps);
        let merge_plan = fstab::build_merge_plan(&current, &backup, &inventory);
        fstab::prompt_and_merge(caps, &current_path, &current_raw, &merge_plan)?;
        Ok(())
    })();
    if let Err(e) = result {
        warnings.push(format!("fstab merge: {e}"));
    }
    caps.fs.remove_dir_all(&stage).ok();
}

fn phase11_staged(
    caps: &Capabilities,
    tar_bytes: &[u8],
    plan: &RestorePlan,
    req: &RestoreRequest,
    stage_root: &Path,
    warnings: &mut Vec<String>,
) {
    let opts = ExtractSelectiveOptions::default();
    if let Err(e) = extract::extract_selective(caps.fs.as_ref(), tar_bytes, stage_root, &plan.staged, &opts) {
        warnings.push(format!("staged lane extraction: {e}"));
        return;
    }

    let mut protected_paths: Vec<String> = Vec::new();
    if category_selected(plan, "datastore_pbs") {
        let staged_cfg = caps
            .fs
            .read_to_string(&stage_root.join("etc/proxmox-backup/datastore.cfg"))
            .unwrap_or_default();
        let current_fstab = caps
            .fs
            .read_to_string(&req.dest_root.join("etc/fstab"))
            .unwrap_or_default();
        match mountguard::maybe_apply_guards(caps, &staged_cfg, &current_fstab, req.dry_run) {
            Ok(report) => {
                tracing::info!(
                    "[mountguard] {} guard(s) placed, {} already mounted",
                    report.guards.len(),
                    report.already_mounted.len()
                );
                protected_paths.extend(report.guards.iter().map(|g| g.target.to_string_lossy().into_owned()));
                protected_paths.extend(report.already_mounted.iter().map(|p| p.to_string_lossy().into_owned()));
            }
            Err(e) => warnings.push(format!("mount guard: {e}")),
        }
    }

    let ctx = StagedContext::new(caps, stage_root, &req.dest_root, req.dry_run);
    if !staged::gate(&ctx) {
        warnings.push("staged-apply gate not satisfied (destRoot != / or not root or dry-run); skipping staged-apply engines".into());
        return;
    }

    let clean = matches!(plan.pbs_restore_behavior, PbsRestoreBehavior::Clean);
    let mut merged = StagedOutcome::default();

    if category_selected(plan, "datastore_pbs") {
        let inventory = datastore::live_datastore_inventory(&ctx);
        run_engine(&ctx, "datastore.cfg", warnings, &mut merged, || {
            datastore::apply(&ctx, plan.pbs_restore_behavior, inventory.as_ref(), &protected_paths)
        });
    }
    for (id, spec) in [
        ("pbs_remotes", &pbs_objects::REMOTE),
        ("pbs_jobs", &pbs_objects::SYNC_JOB),
        ("pbs_jobs", &pbs_objects::VERIFY_JOB),
        ("pbs_jobs", &pbs_objects::PRUNE_JOB),
        ("pbs_host", &pbs_objects::S3_ENDPOINT),
        ("pbs_host", &pbs_objects::TRAFFIC_CONTROL),
    ] {
        if category_selected(plan, id) {
            run_engine(&ctx, spec.rel_path, warnings, &mut merged, || pbs_objects::apply(&ctx, spec, clean));
        }
    }
    if category_selected(plan, "pve_resource_mappings") {
        run_engine(&ctx, "resource mappings", warnings, &mut merged, || mappings::apply(&ctx));
    }
    if category_selected(plan, "pve_resource_pools") {
        run_engine(&ctx, "resource pools", warnings, &mut merged, || pools::apply(&ctx));
    }
    if category_selected(plan, "pbs_notifications") {
        run_engine(&ctx, "notifications", warnings, &mut merged, || notifications::apply(&ctx));
    }

    tracing::info!("[staged] {} entries applied, {} skipped", merged.applied.len(), merged.skipped.len());
    warnings.extend(merged.warnings);
}

fn run_engine(
    _ctx: &StagedContext,
    label: &str,
    warnings: &mut Vec<String>,
    merged: &mut StagedOutcome,
    f: impl FnOnce() -> Result<StagedOutcome>,
) {
    match f() {
        Ok(o) => merged.merge(o),
        Err(e) => warnings.push(format!("staged apply '{label}': {e}")),
    }
}

fn phase12_export(caps: &Capabilities, tar_bytes: &[u8], plan: &RestorePlan, warnings: &mut Vec<String>) {
    let ts = caps.clock.now_unix();
    let export_dir = PathBuf::from(format!("/tmp/proxsave-config-export-{ts}"));
    let opts = ExtractSelectiveOptions::default();
    match extract::extract_selective(caps.fs.as_ref(), tar_bytes, &export_dir, &plan.export, &opts) {
        Ok(o) => tracing::info!("[export] wrote {} entries to {}", o.applied_paths.len(), export_dir.display()),
        Err(e) => warnings.push(format!("export lane extraction: {e}")),
    }
}

fn phase13_cluster_safe_apply(caps: &Capabilities, stage_root: &Path, plan: &RestorePlan, req: &RestoreRequest, warnings: &mut Vec<String>) {
    let mappings_json = caps
        .fs
        .read_to_string(&stage_root.join("etc/pve/mapping/pci.cfg"))
        .unwrap_or_default();
    let mappings: Vec<cluster::ResourceMapping> = mappings::parse_mapping_file(&mappings_json, "pci");
    if let Err(e) = cluster::apply_resource_mappings(caps, &mappings) {
        warnings.push(format!("cluster SAFE apply (mappings): {e}"));
    }

    let user_cfg = caps
        .fs
        .read_to_string(&stage_root.join("etc/pve/user.cfg"))
        .unwrap_or_default();
    let pools = pools::parse_pools(&user_cfg);
    let confirm_membership = !pools.iter().any(|p| !p.members.is_empty());
    if let Err(e) = cluster::apply_resource_pools(caps, &pools, confirm_membership) {
        warnings.push(format!("cluster SAFE apply (pools): {e}"));
    }

    let configs = collect_vm_configs(caps, stage_root);
    if !configs.is_empty() {
        let hostname = caps.system().hostname();
        let source_node_override = if req.non_interactive || configs.iter().any(|c| c.node == hostname) {
            None
        } else {
            let deadline = caps.clock_now_plus(CLUSTER_CHOICE_TIMEOUT);
            let label = format!("VM/CT config export has no entries for this host ('{hostname}'). Source node to apply from?");
            caps.prompt
                .prompt_with_deadline(&label, deadline)
                .ok()
                .filter(|s| !s.trim().is_empty())
        };
        match cluster::apply_vm_configs(caps, &configs, &hostname, source_node_override.as_deref()) {
            Ok(n) => tracing::info!("[cluster] applied {n} VM/CT config(s)"),
            Err(e) => warnings.push(format!("cluster SAFE apply (vm configs): {e}")),
        }
    }

    if cluster::should_apply_storage_cfg(&plan.staged.iter().map(|c| c.id).collect::<Vec<_>>()) {
        let storage_body = caps.fs.read_to_string(&stage_root.join("etc/pve/storage.cfg")).unwrap_or_default();
        if !storage_body.trim().is_empty() {
            if let Err(e) = cluster::apply_storage_cfg(caps, &storage_body) {
                warnings.push(format!("cluster SAFE apply (storage.cfg): {e}"));
            }
        }
        let datacenter_body = caps.fs.read_to_string(&stage_root.join("etc/pve/datacenter.cfg")).unwrap_or_default();
        if !datacenter_body.trim().is_empty() {
            if let Err(e) = cluster::apply_datacenter_cfg(caps, &datacenter_body) {
                warnings.push(format!("cluster SAFE apply (datacenter.cfg): {e}"));
            }
        }
    } else {
        tracing::info!("[cluster] storage.cfg already handled by the staged lane, skipping SAFE apply for it");
    }
}

/// Walk the exported per-node `qemu-server/<vmid>.conf` and `lxc/<vmid>.conf`
/// files under the staged `etc/pve/nodes/<node>/` tree.
fn collect_vm_configs(caps: &Capabilities, stage_root: &Path) -> Vec<cluster::VmConfigExport> {
    let mut out = Vec::new();
    let Ok(node_dirs) = caps.fs.read_dir(&stage_root.join("etc/pve/nodes")) else {
        return out;
    };
    for node_dir in node_dirs {
        let Some(node) = node_dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        for (subdir, kind) in [("qemu-server", cluster::VmKind::Qemu), ("lxc", cluster::VmKind::Lxc)] {
            let Ok(files) = caps.fs.read_dir(&node_dir.join(subdir)) else {
                continue;
            };
            for file in files {
                let Some(vmid) = file.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse::<u32>().ok()) else {
                    continue;
                };
                let Ok(body) = caps.fs.read_to_string(&file) else {
                    continue;
                };
                out.push(cluster::VmConfigExport {
                    vmid,
                    node: node.clone(),
                    kind,
                    config_lines: body.lines().map(str::to_string).collect(),
                });
            }
        }
    }
    out
}

fn phase14_recreate_storage_dirs(caps: &Capabilities, plan: &RestorePlan, req: &RestoreRequest, warnings: &mut Vec<String>) {
    if !category_selected(plan, "datastore_pbs") && !category_selected(plan, "pve_storage") {
        return;
    }
    let path = req.dest_root.join("etc/proxmox-backup/datastore.cfg");
    let body = caps.fs.read_to_string(&path).unwrap_or_default();
    for block in mountguard::parse_datastore_blocks(&body) {
        let dir = req.dest_root.join(block.path.trim_start_matches('/'));
        if let Err(e) = caps.fs.mkdir_all(&dir, 0o750) {
            warnings.push(format!("recreate datastore dir {}: {e}", dir.display()));
        }
    }
}

fn phase15_repair_resolv_conf(caps: &Capabilities, req: &RestoreRequest, warnings: &mut Vec<String>) {
    if req.dry_run {
        return;
    }
    let out = caps
        .runner
        .run_capture(&crate::capability::process::Pipeline::single(
            crate::capability::process::CmdSpec::new("resolvectl").arg("dns"),
        ))
        .unwrap_or_default();
    if out.trim().is_empty() {
        warnings.push("resolv.conf repair: resolvectl returned no DNS servers, left untouched".into());
        return;
    }
    tracing::info!("[network] resolv.conf left to systemd-resolved; not overwritten by this tool");
}

fn phase16_network_apply(caps: &Capabilities, cfg: &Config, req: &RestoreRequest, outcome: &mut RestoreOutcome) {
    if req.dry_run {
        return;
    }
    let diag = netapply::capture_diagnostics(caps).ok();
    outcome.diag_dir = diag.as_ref().map(|d| d.dir.to_string_lossy().into_owned());

    let safety_tar = outcome
        .safety_backup_paths
        .iter()
        .find(|p| p.contains("safety-network-"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp/proxsave/safety-network.tar.gz"));
    let arm_inputs = ArmInputs {
        kind: ApplyDomain::Network,
        work_dir: &cfg.paths.work_dir,
        safety_tar: &safety_tar,
        scoped_paths: &["etc/network", "etc/hosts", "etc/resolv.conf"],
        timeout: cfg.timeouts.default_rollback,
    };

    if let Ok(false) = netapply::ifquery_preflight(caps) {
        outcome.warnings.push(
            "ifquery preflight failed to parse the staged network config; rolling back the staged install immediately".into(),
        );
        match transact::arm(caps, &arm_inputs) {
            Ok(handle) => {
                let _ = transact::fire_now(caps, &handle);
            }
            Err(e) => outcome.warnings.push(format!("arming immediate network rollback: {e}")),
        }
        return;
    }

    let handle = match transact::arm(caps, &arm_inputs) {
        Ok(h) => h,
        Err(e) => {
            outcome.warnings.push(format!("arming network rollback: {e}"));
            return;
        }
    };

    match netapply::apply(caps) {
        Ok(strategy) => tracing::info!("[network] applied via {strategy}"),
        Err(e) => {
            outcome.warnings.push(format!("network apply: {e}"));
            let _ = transact::fire_now(caps, &handle);
            return;
        }
    }

    let mgmt_iface = netapply::detect_mgmt_iface(caps, std::env::var("SSH_CONNECTION").ok().as_deref());
    let health = netapply::health_probe(caps, mgmt_iface.as_deref(), NETWORK_HEALTH_PORT);
    if health.severity == netapply::HealthSeverity::Critical {
        tracing::error!("[network] health probe critical, firing rollback immediately");
        let _ = transact::fire_now(caps, &handle);
        return;
    }

    match transact::commit_prompt(caps, &handle) {
        Ok(true) => tracing::info!("[network] apply committed"),
        Ok(false) => outcome.rollback_pending.push(RestoreError::ApplyNotCommitted {
            domain: ApplyDomain::Network,
            rollback_log: handle.log_path.clone(),
            rollback_marker: handle.marker_path.clone(),
            restored_ip: mgmt_iface,
            rollback_armed: true,
            rollback_deadline_unix: caps.clock.now_unix() + handle.timeout.as_secs(),
        }),
        Err(e) => outcome.warnings.push(format!("network commit prompt: {e}")),
    }
}

fn phase17_start_services_and_summarize(caps: &Capabilities, plan: &RestorePlan, outcome: &RestoreOutcome) {
    let mut warnings = outcome.warnings.clone();
    if plan.needs_cluster_restore {
        if let Err(e) = service::start(caps, service::PVE_STACK) {
            warnings.push(format!("restarting PVE stack: {e}"));
        }
    }
    if plan.needs_pbs_services {
        if let Err(e) = service::start(caps, service::PBS_STACK) {
            warnings.push(format!("restarting PBS stack: {e}"));
        }
    }

    ui::log_final_summary(
        &warnings,
        None,
        &outcome.safety_backup_paths,
        outcome.diag_dir.as_deref(),
        &outcome.rollback_pending,
    );
}

trait ClockNowPlus {
    fn clock_now_plus(&self, d: Duration) -> std::time::Instant;
}

impl ClockNowPlus for Capabilities {
    fn clock_now_plus(&self, d: Duration) -> std::time::Instant {
        self.clock.now_instant() + d
    }
}
