//! Compile-time category catalog (§3, §4.2). A single declarative table
//! consulted by the plan builder — per §9's design note, lane assignment
//! must live here, not be scattered as `if id == "x"` across phases.

use super::{AnalyzedCategory, Category, Lane, SystemKind, path_matches_category};

pub const NETWORK: Category = Category {
    id: "network",
    name: "Network configuration",
    description: "/etc/network/interfaces and related files",
    kind: SystemKind::Common,
    paths: &["etc/network/", "etc/hosts", "etc/hostname"],
    export_only: false,
};

pub const SSH: Category = Category {
    id: "ssh",
    name: "SSH host keys and config",
    description: "",
    kind: SystemKind::Common,
    paths: &["etc/ssh/"],
    export_only: false,
};

pub const SSL: Category = Category {
    id: "ssl",
    name: "TLS certificates and keys",
    description: "",
    kind: SystemKind::Common,
    paths: &["etc/pve/local/pve-ssl.pem", "etc/pve/local/pve-ssl.key"],
    export_only: false,
};

pub const SERVICES: Category = Category {
    id: "services",
    name: "systemd service overrides",
    description: "",
    kind: SystemKind::Common,
    paths: &["etc/systemd/system/"],
    export_only: false,
};

pub const ZFS: Category = Category {
    id: "zfs",
    name: "ZFS pool configuration",
    description: "",
    kind: SystemKind::Common,
    paths: &["etc/zfs/"],
    export_only: false,
};

pub const FILESYSTEM: Category = Category {
    id: "filesystem",
    name: "fstab and mount configuration",
    description: "",
    kind: SystemKind::Common,
    paths: &["etc/fstab", "etc/crypttab"],
    export_only: false,
};

pub const PVE_CLUSTER: Category = Category {
    id: "pve_cluster",
    name: "PVE cluster filesystem",
    description: "",
    kind: SystemKind::Pve,
    paths: &["etc/pve/", "var/lib/pve-cluster/config.db"],
    export_only: false,
};

pub const PVE_STORAGE: Category = Category {
    id: "pve_storage",
    name: "PVE storage definitions",
    description: "",
    kind: SystemKind::Pve,
    paths: &["etc/pve/storage.cfg"],
    export_only: false,
};

pub const PVE_ACCESS_CONTROL: Category = Category {
    id: "pve_access_control",
    name: "PVE users, groups, roles, TFA",
    description: "",
    kind: SystemKind::Pve,
    paths: &["etc/pve/user.cfg", "etc/pve/domains.cfg", "etc/pve/priv/"],
    export_only: false,
};

pub const PVE_SDN: Category = Category {
    id: "pve_sdn",
    name: "PVE software-defined networking",
    description: "",
    kind: SystemKind::Pve,
    paths: &["etc/pve/sdn/"],
    export_only: false,
};

pub const PVE_FIREWALL: Category = Category {
    id: "pve_firewall",
    name: "PVE firewall rules",
    description: "",
    kind: SystemKind::Pve,
    paths: &["etc/pve/firewall/", "etc/pve/nodes/*/host.fw"],
    export_only: false,
};

pub const PVE_HA: Category = Category {
    id: "pve_ha",
    name: "PVE high availability",
    description: "",
    kind: SystemKind::Pve,
    paths: &["etc/pve/ha/"],
    export_only: false,
};

pub const PVE_CONFIG_EXPORT: Category = Category {
    id: "pve_config_export",
    name: "PVE config export (VM/CT configs, jobs)",
    description: "human-inspection only, never written to live root",
    kind: SystemKind::Pve,
    paths: &["etc/pve/jobs.cfg", "etc/pve/qemu-server/", "etc/pve/lxc/"],
    export_only: true,
};

pub const DATASTORE_PBS: Category = Category {
    id: "datastore_pbs",
    name: "PBS datastore definitions",
    description: "",
    kind: SystemKind::Pbs,
    paths: &["etc/proxmox-backup/datastore.cfg"],
    export_only: false,
};

pub const PBS_JOBS: Category = Category {
    id: "pbs_jobs",
    name: "PBS sync/verify/prune jobs",
    description: "",
    kind: SystemKind::Pbs,
    paths: &[
        "etc/proxmox-backup/sync.cfg",
        "etc/proxmox-backup/verification.cfg",
        "etc/proxmox-backup/prune.cfg",
    ],
    export_only: false,
};

pub const PBS_REMOTES: Category = Category {
    id: "pbs_remotes",
    name: "PBS remotes",
    description: "",
    kind: SystemKind::Pbs,
    paths: &["etc/proxmox-backup/remote.cfg"],
    export_only: false,
};

pub const PBS_HOST: Category = Category {
    id: "pbs_host",
    name: "PBS host-level config (traffic-control, s3, acme)",
    description: "",
    kind: SystemKind::Pbs,
    paths: &[
        "etc/proxmox-backup/traffic-control.cfg",
        "etc/proxmox-backup/s3.cfg",
        "etc/proxmox-backup/acme.cfg",
        "etc/proxmox-backup/node.cfg",
    ],
    export_only: false,
};

pub const PBS_TAPE: Category = Category {
    id: "pbs_tape",
    name: "PBS tape changer/media-pool config",
    description: "",
    kind: SystemKind::Pbs,
    paths: &["etc/proxmox-backup/tape.cfg", "etc/proxmox-backup/media-pool.cfg"],
    export_only: false,
};

pub const PBS_NOTIFICATIONS: Category = Category {
    id: "pbs_notifications",
    name: "PBS notification endpoints/matchers",
    description: "",
    kind: SystemKind::Pbs,
    paths: &[
        "etc/proxmox-backup/notifications.cfg",
        "etc/proxmox-backup/notifications-priv.cfg",
    ],
    export_only: false,
};

pub const PVE_RESOURCE_POOLS: Category = Category {
    id: "pve_resource_pools",
    name: "PVE resource pools (exported from user.cfg)",
    description: "",
    kind: SystemKind::Pve,
    paths: &["etc/pve/user.cfg"],
    export_only: false,
};

pub const PVE_RESOURCE_MAPPINGS: Category = Category {
    id: "pve_resource_mappings",
    name: "PVE PCI/USB/dir resource mappings",
    description: "",
    kind: SystemKind::Pve,
    paths: &["etc/pve/mapping/"],
    export_only: false,
};

/// All categories, in a fixed, deterministic order.
pub const ALL: &[Category] = &[
    NETWORK,
    SSH,
    SSL,
    SERVICES,
    ZFS,
    FILESYSTEM,
    PVE_CLUSTER,
    PVE_STORAGE,
    PVE_ACCESS_CONTROL,
    PVE_SDN,
    PVE_FIREWALL,
    PVE_HA,
    PVE_CONFIG_EXPORT,
    DATASTORE_PBS,
    PBS_JOBS,
    PBS_REMOTES,
    PBS_HOST,
    PBS_TAPE,
    PBS_NOTIFICATIONS,
    PVE_RESOURCE_POOLS,
    PVE_RESOURCE_MAPPINGS,
];

/// Static lane assignment table (§4.3). `export_only` categories are
/// always routed to Export regardless of this table.
pub fn static_lane(id: &str) -> Lane {
    match id {
        "datastore_pbs" | "pbs_jobs" | "pbs_remotes" | "pbs_host" | "pbs_tape"
        | "pbs_notifications" | "pve_storage" | "pve_access_control" | "pve_sdn"
        | "pve_firewall" | "pve_ha" | "pve_resource_pools" | "pve_resource_mappings" => {
            Lane::Staged
        }
        "network" | "ssh" | "ssl" | "services" | "zfs" | "filesystem" | "pve_cluster" => {
            Lane::Normal
        }
        "pve_config_export" => Lane::Export,
        _ => Lane::Normal,
    }
}

/// Mode-scoped catalogs for the `Storage` and `Base` restore modes.
pub fn mode_catalog_ids(mode: super::super::plan::RestoreMode) -> Option<&'static [&'static str]> {
    use super::super::plan::RestoreMode;
    match mode {
        RestoreMode::Storage => Some(&["datastore_pbs", "pve_storage", "zfs", "filesystem"]),
        RestoreMode::Base => Some(&["network", "ssh", "ssl", "services", "filesystem"]),
        RestoreMode::Full | RestoreMode::Custom => None,
    }
}

pub fn by_id(id: &str) -> Option<&'static Category> {
    ALL.iter().find(|c| c.id == id)
}

/// §4.2: scan tar entries and mark categories as available. Deterministic
/// order: input order of `ALL` is preserved.
pub fn analyze_archive_paths<'a>(
    entries: impl IntoIterator<Item = &'a str>,
) -> Vec<AnalyzedCategory> {
    let entries: Vec<&str> = entries.into_iter().collect();
    ALL.iter()
        .map(|cat| {
            let is_available = entries.iter().any(|e| path_matches_category(e, cat));
            AnalyzedCategory {
                category: cat.clone(),
                is_available,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_only_categories_always_export_lane() {
        assert!(PVE_CONFIG_EXPORT.export_only);
    }

    #[test]
    fn static_lane_table_matches_spec_groups() {
        assert_eq!(static_lane("datastore_pbs"), Lane::Staged);
        assert_eq!(static_lane("network"), Lane::Normal);
        assert_eq!(static_lane("pve_config_export"), Lane::Export);
    }

    #[test]
    fn analyze_marks_only_matching_categories_available() {
        let entries = vec!["etc/hosts", "etc/proxmox-backup/datastore.cfg"];
        let analyzed = analyze_archive_paths(entries);
        let network = analyzed.iter().find(|a| a.category.id == "network").unwrap();
        let datastore = analyzed
            .iter()
            .find(|a| a.category.id == "datastore_pbs")
            .unwrap();
        let ssh = analyzed.iter().find(|a| a.category.id == "ssh").unwrap();
        assert!(network.is_available);
        assert!(datastore.is_available);
        assert!(!ssh.is_available);
    }

    #[test]
    fn by_id_finds_known_category() {
        assert!(by_id("network").is_some());
        assert!(by_id("nonexistent").is_none());
    }
}
