//! Configuration (§5 "Timeouts", §6 CLI flags, SPEC_FULL §2 ambient stack):
//! `[restore]`/`[paths]`/`[timeouts]` sections, Raw → validated split,
//! secret redaction for `--print-config`.

use anyhow::{Context, Result, bail};
use config as cfg;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::plan::PbsRestoreBehavior;

#[derive(Debug, Clone)]
pub struct Config {
    pub restore: Restore,
    pub paths: Paths,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone)]
pub struct Restore {
    pub default_pbs_restore_behavior: PbsRestoreBehavior,
    pub age_identity_file: Option<PathBuf>,
    pub age_passphrase: Option<String>,
    pub storage_remote: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Paths {
    pub work_dir: PathBuf,
    pub guards_dir: PathBuf,
    pub export_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub service_verify: Duration,
    pub service_start: Duration,
    pub mount_attempt: Duration,
    pub default_rollback: Duration,
    pub fstab_prompt: Duration,
    pub access_control_commit: Duration,
    pub health_probe: Duration,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    restore: RawRestore,
    #[serde(default)]
    paths: RawPaths,
    #[serde(default)]
    timeouts: RawTimeouts,
}

#[derive(Debug, Deserialize, Default)]
struct RawRestore {
    default_pbs_restore_behavior: Option<String>,
    age_identity_file: Option<String>,
    age_passphrase_file: Option<String>,
    storage_remote: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawPaths {
    work_dir: Option<String>,
    guards_dir: Option<String>,
    export_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawTimeouts {
    service_verify_secs: Option<u64>,
    service_start_secs: Option<u64>,
    mount_attempt_secs: Option<u64>,
    default_rollback_secs: Option<u64>,
    fstab_prompt_secs: Option<u64>,
    access_control_commit_secs: Option<u64>,
    health_probe_secs: Option<u64>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let raw: RawConfig = cfg::Config::builder()
            .add_source(cfg::File::from(path))
            .build()
            .with_context(|| format!("load {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("deserialize {}", path.display()))?;

        let n = config_helpers::Normalizer { base_dir };

        let default_pbs_restore_behavior = match n.trim_opt(raw.restore.default_pbs_restore_behavior).as_deref() {
            None | Some("merge") => PbsRestoreBehavior::Merge,
            Some("clean") => PbsRestoreBehavior::Clean,
            Some(other) => bail!("bad restore.default_pbs_restore_behavior '{other}': expected merge|clean"),
        };
        let age_identity_file = n.trim_opt(raw.restore.age_identity_file).map(|s| n.resolve(&s));
        let age_passphrase = match n.trim_opt(raw.restore.age_passphrase_file).map(|s| n.resolve(&s)) {
            Some(p) => Some(
                n.read_secret(&p)
                    .with_context(|| format!("read age passphrase from {}", p.display()))?,
            ),
            None => None,
        };
        let storage_remote = n.trim_opt(raw.restore.storage_remote);

        let work_dir = n
            .trim_opt(raw.paths.work_dir)
            .map(|s| n.resolve(&s))
            .unwrap_or_else(|| PathBuf::from(crate::tempreg::ROOT));
        let guards_dir = n
            .trim_opt(raw.paths.guards_dir)
            .map(|s| n.resolve(&s))
            .unwrap_or_else(|| PathBuf::from(crate::mountguard::GUARDS_ROOT));
        let export_dir = n
            .trim_opt(raw.paths.export_dir)
            .map(|s| n.resolve(&s))
            .unwrap_or_else(|| PathBuf::from("/tmp/proxsave"));

        let timeouts = Timeouts {
            service_verify: secs_or(raw.timeouts.service_verify_secs, crate::service::SERVICE_VERIFY_TIMEOUT),
            service_start: secs_or(raw.timeouts.service_start_secs, crate::service::SERVICE_START_TIMEOUT),
            mount_attempt: secs_or(raw.timeouts.mount_attempt_secs, crate::mountguard::MOUNT_ATTEMPT_TIMEOUT),
            default_rollback: secs_or(raw.timeouts.default_rollback_secs, crate::transact::DEFAULT_ROLLBACK_TIMEOUT),
            fstab_prompt: secs_or(raw.timeouts.fstab_prompt_secs, crate::fstab::FSTAB_PROMPT_TIMEOUT),
            access_control_commit: secs_or(
                raw.timeouts.access_control_commit_secs,
                crate::transact::ACCESS_CONTROL_COMMIT_TIMEOUT,
            ),
            health_probe: secs_or(raw.timeouts.health_probe_secs, crate::netapply::HEALTH_PROBE_TIMEOUT),
        };

        Ok(Self {
            restore: Restore {
                default_pbs_restore_behavior,
                age_identity_file,
                age_passphrase,
                storage_remote,
            },
            paths: Paths {
                work_dir,
                guards_dir,
                export_dir,
            },
            timeouts,
        })
    }

    pub fn to_redacted_toml(&self) -> Result<String> {
        #[derive(Serialize)]
        struct RestoreOut<'a> {
            default_pbs_restore_behavior: &'a str,
            age_identity_file: Option<String>,
            age_passphrase: &'static str,
            storage_remote: Option<&'a str>,
        }
        #[derive(Serialize)]
        struct PathsOut<'a> {
            work_dir: &'a str,
            guards_dir: &'a str,
            export_dir: &'a str,
        }
        #[derive(Serialize)]
        struct TimeoutsOut {
            service_verify_secs: u64,
            service_start_secs: u64,
            mount_attempt_secs: u64,
            default_rollback_secs: u64,
            fstab_prompt_secs: u64,
            access_control_commit_secs: u64,
            health_probe_secs: u64,
        }
        #[derive(Serialize)]
        struct Out<'a> {
            restore: RestoreOut<'a>,
            paths: PathsOut<'a>,
            timeouts: TimeoutsOut,
        }

        let out = Out {
            restore: RestoreOut {
                default_pbs_restore_behavior: match self.restore.default_pbs_restore_behavior {
                    PbsRestoreBehavior::Merge => "merge",
                    PbsRestoreBehavior::Clean => "clean",
                },
                age_identity_file: self.restore.age_identity_file.as_ref().map(|p| p.display().to_string()),
                age_passphrase: if self.restore.age_passphrase.is_some() {
                    "<redacted>"
                } else {
                    "<none>"
                },
                storage_remote: self.restore.storage_remote.as_deref(),
            },
            paths: PathsOut {
                work_dir: &self.paths.work_dir.to_string_lossy(),
                guards_dir: &self.paths.guards_dir.to_string_lossy(),
                export_dir: &self.paths.export_dir.to_string_lossy(),
            },
            timeouts: TimeoutsOut {
                service_verify_secs: self.timeouts.service_verify.as_secs(),
                service_start_secs: self.timeouts.service_start.as_secs(),
                mount_attempt_secs: self.timeouts.mount_attempt.as_secs(),
                default_rollback_secs: self.timeouts.default_rollback.as_secs(),
                fstab_prompt_secs: self.timeouts.fstab_prompt.as_secs(),
                access_control_commit_secs: self.timeouts.access_control_commit.as_secs(),
                health_probe_secs: self.timeouts.health_probe.as_secs(),
            },
        };
        Ok(toml::to_string_pretty(&out)?)
    }
}

fn secs_or(raw: Option<u64>, default: Duration) -> Duration {
    raw.map(Duration::from_secs).unwrap_or(default)
}

mod config_helpers {
    use anyhow::Result;
    use std::{fs, path::{Path, PathBuf}};

    pub(super) struct Normalizer<'a> {
        pub base_dir: &'a Path,
    }

    impl Normalizer<'_> {
        #[inline]
        pub fn trim_opt(&self, s: Option<String>) -> Option<String> {
            s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        }

        #[inline]
        pub fn resolve(&self, p: &str) -> PathBuf {
            let pb = PathBuf::from(p.trim());
            if pb.is_absolute() { pb } else { self.base_dir.join(pb) }
        }

        pub fn read_secret(&self, p: &Path) -> Result<String> {
            let mut s = String::from_utf8(fs::read(p)?)?;
            while s.ends_with('\n') || s.ends_with('\r') {
                s.pop();
            }
            Ok(s)
        }
    }
}
