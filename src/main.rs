use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt};

mod archive;
mod backup;
mod capability;
mod category;
mod cluster;
mod collab;
mod compat;
mod config;
mod driver;
mod errors;
mod extract;
mod fstab;
mod manifest;
mod mountguard;
mod netapply;
mod plan;
mod safety;
mod service;
mod staged;
mod tempreg;
mod transact;
mod ui;
mod utils;

use capability::Capabilities;
use capability::fs::Fs;
use capability::system::SystemInfo;
use config::Config;
use errors::RestoreError;
use plan::{ClusterChoice, PbsRestoreBehavior, RestoreMode};

#[derive(Parser, Debug)]
#[command(
    name = "proxsave",
    about = "Selective, transactional config restore orchestrator for Proxmox VE / PBS",
    arg_required_else_help = false,
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[arg(long, default_value = "./config.toml", global = true)]
    config: PathBuf,

    #[arg(long, global = true)]
    debug: bool,

    #[arg(long, global = true)]
    check_config: bool,

    #[arg(long, global = true)]
    print_config: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Produce a new config bundle plus manifest.
    Backup(BackupArgs),
    /// Restore a config bundle onto this host.
    Restore(RestoreArgs),
    /// Open a bundle (decrypt + decompress + checksum) without restoring it.
    Decrypt(DecryptArgs),
    /// Release any mount guards left armed by an interrupted restore.
    CleanupGuards(CleanupGuardsArgs),
    /// Print the build version.
    Version,
}

#[derive(clap::Args, Debug)]
struct BackupArgs {
    /// Destination directory for the archive and its manifest.
    #[arg(long, default_value = "/tmp/proxsave")]
    dest_dir: PathBuf,

    /// Comma-separated category ids; defaults to every category available
    /// for the detected system type.
    #[arg(long, value_delimiter = ',')]
    categories: Vec<String>,

    #[arg(long)]
    dry_run: bool,
}

#[derive(clap::Args, Debug)]
struct RestoreArgs {
    /// Local path to the archive, or a remote ref when --storage-remote is set.
    bundle_ref: String,

    #[arg(long)]
    manifest: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "full")]
    mode: ModeArg,

    /// Category ids to restore; only consulted when --mode=custom.
    #[arg(long, value_delimiter = ',')]
    select: Vec<String>,

    #[arg(long, default_value = "/")]
    base_dir: PathBuf,

    #[arg(long)]
    dry_run: bool,

    /// Never block on an operator prompt; use the documented default answer.
    #[arg(long)]
    cli: bool,

    #[arg(long, value_enum)]
    pbs_restore_behavior: Option<PbsBehaviorArg>,

    #[arg(long, value_enum)]
    cluster_choice: Option<ClusterChoiceArg>,

    #[arg(long)]
    storage_remote: Option<String>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Full,
    Storage,
    Base,
    Custom,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum PbsBehaviorArg {
    Merge,
    Clean,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ClusterChoiceArg {
    Safe,
    Recovery,
    Abort,
}

#[derive(clap::Args, Debug)]
struct DecryptArgs {
    bundle_path: PathBuf,

    #[arg(long)]
    manifest: Option<PathBuf>,

    #[arg(long)]
    out: PathBuf,
}

#[derive(clap::Args, Debug)]
struct CleanupGuardsArgs {
    #[arg(long)]
    dry_run: bool,
}

fn init_tracing(debug: bool) {
    let default = if debug { "trace" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(debug)
        .with_line_number(debug)
        .without_time()
        .try_init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(cli) {
        Ok(()) => {}
        Err(e) => {
            let code = e
                .downcast_ref::<RestoreError>()
                .map(|re| re.exit_code())
                .unwrap_or(1);
            tracing::error!("{e:#}");
            std::process::exit(code);
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if cli.command.is_none() && !cli.check_config && !cli.print_config {
        let mut cmd = Cli::command();
        cmd.print_help()?;
        println!();
        return Ok(());
    }

    if matches!(cli.command, Some(Cmd::Version)) {
        println!("proxsave {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let cfg = Config::load(&cli.config)?;

    if cli.check_config {
        tracing::info!("config OK");
        return Ok(());
    }
    if cli.print_config {
        println!("{}", cfg.to_redacted_toml()?);
        return Ok(());
    }

    let Some(cmd) = cli.command else {
        let mut cmd = Cli::command();
        cmd.print_help()?;
        println!();
        return Ok(());
    };

    let caps = Capabilities::real();

    match cmd {
        Cmd::Backup(args) => run_backup(&caps, &cfg, args),
        Cmd::Restore(args) => run_restore(&caps, &cfg, args),
        Cmd::Decrypt(args) => run_decrypt(&caps, &cfg, args),
        Cmd::CleanupGuards(args) => run_cleanup_guards(&caps, args),
        Cmd::Version => unreachable!("handled above"),
    }
}

fn run_backup(caps: &Capabilities, _cfg: &Config, args: BackupArgs) -> Result<()> {
    let _lock = utils::lock::LockGuard::try_acquire("proxsave-backup")?;

    let host_type = compat::detect_system_type(caps.fs.as_ref())
        .ok_or_else(|| RestoreError::Preflight("could not detect a PVE or PBS install on this host".into()))?;
    let proxmox_type = match host_type {
        plan::SystemType::Pve => manifest::ProxmoxType::Pve,
        plan::SystemType::Pbs => manifest::ProxmoxType::Pbs,
    };

    let categories: Vec<category::Category> = if args.categories.is_empty() {
        category::registry::ALL
            .iter()
            .filter(|c| !c.export_only)
            .cloned()
            .collect()
    } else {
        args.categories
            .iter()
            .filter_map(|id| category::registry::by_id(id))
            .cloned()
            .collect()
    };

    let hostname = caps.system().hostname();
    let cluster_mode = if caps.fs.exists(std::path::Path::new("/etc/pve/corosync.conf")) {
        manifest::ClusterMode::Cluster
    } else {
        manifest::ClusterMode::Standalone
    };

    if args.dry_run {
        tracing::info!(
            "[backup] dry-run: would archive {} categories to {}",
            categories.len(),
            args.dest_dir.display()
        );
        return Ok(());
    }

    let producer = backup::TarBackupProducer::new(caps, proxmox_type, categories, hostname, cluster_mode);
    let archive = collab::BackupProducer::produce(&producer, &args.dest_dir)?;
    tracing::info!("[backup] wrote {}", archive.display());
    Ok(())
}

fn run_restore(caps: &Capabilities, cfg: &Config, args: RestoreArgs) -> Result<()> {
    let _lock = utils::lock::LockGuard::try_acquire("proxsave-restore")?;

    let mode = match args.mode {
        ModeArg::Full => RestoreMode::Full,
        ModeArg::Storage => RestoreMode::Storage,
        ModeArg::Base => RestoreMode::Base,
        ModeArg::Custom => RestoreMode::Custom,
    };
    let custom_selection: Vec<&'static str> = args
        .select
        .iter()
        .filter_map(|id| category::registry::by_id(id))
        .map(|c| c.id)
        .collect();

    let req = driver::RestoreRequest {
        bundle_ref: args.bundle_ref,
        manifest_path: args.manifest,
        mode,
        custom_selection,
        dest_root: args.base_dir,
        dry_run: args.dry_run,
        non_interactive: args.cli,
        pbs_restore_behavior_override: args.pbs_restore_behavior.map(|b| match b {
            PbsBehaviorArg::Merge => PbsRestoreBehavior::Merge,
            PbsBehaviorArg::Clean => PbsRestoreBehavior::Clean,
        }),
        cluster_choice_override: args.cluster_choice.map(|c| match c {
            ClusterChoiceArg::Safe => ClusterChoice::Safe,
            ClusterChoiceArg::Recovery => ClusterChoice::Recovery,
            ClusterChoiceArg::Abort => ClusterChoice::Abort,
        }),
        storage_remote: args.storage_remote.or_else(|| cfg.restore.storage_remote.clone()),
    };

    driver::run(caps, cfg, &req)?;
    Ok(())
}

fn run_decrypt(caps: &Capabilities, cfg: &Config, args: DecryptArgs) -> Result<()> {
    let manifest_path = args.manifest.clone().unwrap_or_else(|| {
        let mut p = args.bundle_path.clone();
        p.set_extension("manifest.json");
        p
    });
    let manifest = manifest::Manifest::load(&manifest_path)
        .with_context(|| format!("load manifest {}", manifest_path.display()))?;

    let raw = caps
        .fs
        .read(&args.bundle_path)
        .with_context(|| format!("read {}", args.bundle_path.display()))?;

    let identities = match &cfg.restore.age_identity_file {
        Some(p) => {
            let contents = caps
                .fs
                .read_to_string(p)
                .with_context(|| format!("read age identity file {}", p.display()))?;
            archive::encryption::Identity::parse_keyfile(&contents)?
        }
        None => Vec::new(),
    };

    let tar_bytes = archive::open(
        raw,
        &archive::OpenOptions {
            identities,
            passphrase: cfg.restore.age_passphrase.clone(),
            expect_sha256: Some(manifest.sha256.clone()),
        },
    )?;

    caps.fs.write_atomic(&args.out, &tar_bytes, 0o600)?;
    tracing::info!("[decrypt] wrote {} bytes to {}", tar_bytes.len(), args.out.display());
    Ok(())
}

fn run_cleanup_guards(caps: &Capabilities, args: CleanupGuardsArgs) -> Result<()> {
    let n = mountguard::cleanup_guards(caps, args.dry_run)?;
    tracing::info!("[cleanup-guards] released {n} guard(s)");
    Ok(())
}
