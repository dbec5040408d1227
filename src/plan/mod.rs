//! Restore plan builder (§4.3). Classification tables as data: the lane
//! table lives in `category::registry`, not scattered across this module.

use crate::category::{AnalyzedCategory, Category, Lane};
use crate::manifest::ClusterMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    Full,
    Storage,
    Base,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterChoice {
    Safe,
    Recovery,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PbsRestoreBehavior {
    Merge,
    Clean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemType {
    Pve,
    Pbs,
}

#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub system_type: SystemType,
    pub mode: RestoreMode,
    pub normal: Vec<Category>,
    pub staged: Vec<Category>,
    pub export: Vec<Category>,
    pub cluster_backup: bool,
    pub needs_cluster_restore: bool,
    pub cluster_safe_mode: bool,
    pub needs_pbs_services: bool,
    pub pbs_restore_behavior: PbsRestoreBehavior,
}

pub struct PlanInputs<'a> {
    pub cluster_mode: ClusterMode,
    pub system_type: SystemType,
    pub mode: RestoreMode,
    /// Categories the operator picked, only consulted when `mode == Custom`.
    pub custom_selection: &'a [&'static str],
    pub cluster_choice: Option<ClusterChoice>,
    pub pbs_restore_behavior: PbsRestoreBehavior,
    /// Staging availability: `false` when destRoot != "/" or a non-real FS,
    /// per §4.3 — staged categories are folded into Normal in that case.
    pub staging_available: bool,
}

/// §4.3: select categories for the given mode, then classify into lanes
/// and derive the plan's flags. A category ID appears in exactly one lane.
pub fn build_plan(analyzed: &[AnalyzedCategory], inputs: &PlanInputs<'_>) -> RestorePlan {
    let selected: Vec<Category> = match inputs.mode {
        RestoreMode::Full => analyzed
            .iter()
            .filter(|a| a.is_available)
            .map(|a| a.category.clone())
            .collect(),
        RestoreMode::Storage | RestoreMode::Base => {
            let catalog = crate::category::registry::mode_catalog_ids(inputs.mode)
                .expect("Storage/Base modes have a mode-scoped catalog");
            analyzed
                .iter()
                .filter(|a| a.is_available && catalog.contains(&a.category.id))
                .map(|a| a.category.clone())
                .collect()
        }
        RestoreMode::Custom => analyzed
            .iter()
            .filter(|a| a.is_available && inputs.custom_selection.contains(&a.category.id))
            .map(|a| a.category.clone())
            .collect(),
    };

    let mut normal = Vec::new();
    let mut staged = Vec::new();
    let mut export = Vec::new();

    for cat in selected {
        if cat.export_only {
            export.push(cat);
            continue;
        }
        let lane = crate::category::registry::static_lane(cat.id);
        match lane {
            Lane::Export => export.push(cat),
            Lane::Staged if inputs.staging_available => staged.push(cat),
            Lane::Staged | Lane::Normal => normal.push(cat),
        }
    }

    let cluster_backup = matches!(inputs.cluster_mode, ClusterMode::Cluster);
    let pve_cluster_selected = normal.iter().chain(staged.iter()).any(|c| c.id == "pve_cluster");
    let cluster_safe_mode =
        cluster_backup && pve_cluster_selected && inputs.cluster_choice == Some(ClusterChoice::Safe);
    let needs_cluster_restore = cluster_backup && pve_cluster_selected && !cluster_safe_mode;
    let needs_pbs_services = staged.iter().chain(normal.iter()).any(|c| {
        matches!(
            c.id,
            "datastore_pbs"
                | "pbs_jobs"
                | "pbs_remotes"
                | "pbs_host"
                | "pbs_tape"
                | "pbs_notifications"
        )
    });

    RestorePlan {
        system_type: inputs.system_type,
        mode: inputs.mode,
        normal,
        staged,
        export,
        cluster_backup,
        needs_cluster_restore,
        cluster_safe_mode,
        needs_pbs_services,
        pbs_restore_behavior: inputs.pbs_restore_behavior,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::registry;

    fn analyzed_all_available() -> Vec<AnalyzedCategory> {
        registry::ALL
            .iter()
            .map(|c| AnalyzedCategory {
                category: c.clone(),
                is_available: true,
            })
            .collect()
    }

    fn base_inputs() -> PlanInputs<'static> {
        PlanInputs {
            cluster_mode: ClusterMode::Standalone,
            system_type: SystemType::Pve,
            mode: RestoreMode::Full,
            custom_selection: &[],
            cluster_choice: None,
            pbs_restore_behavior: PbsRestoreBehavior::Merge,
            staging_available: true,
        }
    }

    #[test]
    fn export_only_category_never_lands_in_normal_or_staged() {
        let plan = build_plan(&analyzed_all_available(), &base_inputs());
        assert!(plan.export.iter().any(|c| c.id == "pve_config_export"));
        assert!(!plan.normal.iter().any(|c| c.id == "pve_config_export"));
        assert!(!plan.staged.iter().any(|c| c.id == "pve_config_export"));
    }

    #[test]
    fn staged_categories_fold_into_normal_when_staging_unavailable() {
        let mut inputs = base_inputs();
        inputs.staging_available = false;
        let plan = build_plan(&analyzed_all_available(), &inputs);
        assert!(plan.staged.is_empty());
        assert!(plan.normal.iter().any(|c| c.id == "datastore_pbs"));
    }

    #[test]
    fn cluster_recovery_flag_set_when_cluster_backup_and_not_safe() {
        let mut inputs = base_inputs();
        inputs.cluster_mode = ClusterMode::Cluster;
        inputs.cluster_choice = Some(ClusterChoice::Recovery);
        let plan = build_plan(&analyzed_all_available(), &inputs);
        assert!(plan.needs_cluster_restore);
        assert!(!plan.cluster_safe_mode);
    }

    #[test]
    fn cluster_safe_choice_sets_safe_mode_not_recovery() {
        let mut inputs = base_inputs();
        inputs.cluster_mode = ClusterMode::Cluster;
        inputs.cluster_choice = Some(ClusterChoice::Safe);
        let plan = build_plan(&analyzed_all_available(), &inputs);
        assert!(plan.cluster_safe_mode);
        assert!(!plan.needs_cluster_restore);
    }

    #[test]
    fn storage_mode_limits_selection_to_its_catalog() {
        let mut inputs = base_inputs();
        inputs.mode = RestoreMode::Storage;
        let plan = build_plan(&analyzed_all_available(), &inputs);
        let all_ids: Vec<&str> = plan
            .normal
            .iter()
            .chain(plan.staged.iter())
            .map(|c| c.id)
            .collect();
        assert!(!all_ids.contains(&"network"));
        assert!(all_ids.contains(&"datastore_pbs") || plan.staged.iter().any(|c| c.id == "datastore_pbs"));
    }
}
