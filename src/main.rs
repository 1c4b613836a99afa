use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use vmshift::{
    artifacts::{ArtifactCriteria, purge_dir},
    change_id::{ChangeIdStore, ChangeToken, PersistedToken},
    command::tool_available,
    config::{DEFAULT_CONFIG_PATH, WorkerConfig},
    controller::HttpController,
    conversion::VirtV2vInPlace,
    export::{BlockExporter, LiveSessions, NbdkitExporter, spawn_interrupt_watcher},
    full_copy::Nbdcopy,
    hypervisor::GovcConnector,
    logger::{self, LogFormat},
    post_import::ScriptTasks,
    target::BlockDeviceTargets,
    worker::{Worker, WorkerDeps, WorkerSettings},
};

#[derive(Parser)]
#[command(name = "vmshift")]
#[command(about = "Snapshot and changed-block-tracking disk replication worker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the worker configuration
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Text)]
    log_format: LogFormatArg,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker loop for one VM
    Run {
        /// Overrides controller.vm_id
        #[arg(long)]
        vm_id: Option<String>,
    },
    /// Inspect persisted change ids
    ChangeId {
        #[command(subcommand)]
        change_id_command: ChangeIdCommands,
    },
    /// Manage the artifact cache
    Artifacts {
        #[command(subcommand)]
        artifacts_command: ArtifactsCommands,
    },
}

#[derive(Subcommand)]
enum ChangeIdCommands {
    /// Print the change id persisted for a disk
    Show {
        state_dir: PathBuf,
        disk_label: String,
    },
    /// Check that a raw change id parses
    Parse { raw: String },
}

#[derive(Subcommand)]
enum ArtifactsCommands {
    /// Remove every cached artifact
    Purge,
}

fn load_config(path: &Path) -> anyhow::Result<WorkerConfig> {
    if path.exists() {
        WorkerConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))
    } else {
        logger::warn!(
            "Configuration not found at {}, using defaults",
            path.display()
        );
        Ok(WorkerConfig::default())
    }
}

async fn run_worker(mut config: WorkerConfig, vm_id: Option<String>) -> anyhow::Result<()> {
    if let Some(vm_id) = vm_id {
        config.controller.vm_id = vm_id;
    }
    config.validate().context("invalid configuration")?;

    for tool in [
        &config.hypervisor.govc_binary,
        &config.hypervisor.changed_areas_helper,
        &config.export.nbdkit_binary,
        &config.copy.nbdcopy_binary,
        &config.conversion.binary,
    ] {
        if !tool_available(tool) {
            logger::warn!("'{}' not found, commands that need it will fail", tool);
        }
    }

    let controller = Arc::new(
        HttpController::new(
            &config.controller.url,
            &config.controller.vm_id,
            config.controller.token.clone(),
            config.request_timeout(),
        )
        .context("failed to set up controller client")?,
    );
    let exporter: Arc<dyn BlockExporter> = Arc::new(NbdkitExporter {
        nbdkit: config.export.nbdkit_binary.clone(),
        socket_dir: config.export.socket_dir.clone(),
        compression: config.export.compression.clone(),
        ready_timeout: config.ready_timeout(),
    });

    let deps = WorkerDeps {
        controller,
        connector: Arc::new(GovcConnector::new(
            &config.hypervisor.govc_binary,
            &config.hypervisor.changed_areas_helper,
        )),
        exporter: exporter.clone(),
        copier: Arc::new(Nbdcopy::new(&config.copy.nbdcopy_binary)),
        targets: Arc::new(BlockDeviceTargets {
            device_dir: config.target.device_dir.clone(),
            state_dir: config.target.state_dir.clone(),
        }),
        converter: Arc::new(VirtV2vInPlace {
            binary: config.conversion.binary.clone(),
            verbose: config.conversion.verbose,
        }),
        post_import: Arc::new(ScriptTasks::new(config.post_import.scripts.clone())),
    };
    let settings = WorkerSettings {
        idle_interval: config.idle_interval(),
        status_interval: config.status_interval(),
        artifact_cache_dir: config.artifacts.cache_dir.clone(),
        sdk: ArtifactCriteria {
            os: config.artifacts.sdk_os.clone(),
            arch: config.artifacts.sdk_arch.clone(),
            version: config.artifacts.sdk_version.clone(),
        },
    };

    let live = LiveSessions::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher = spawn_interrupt_watcher(live.clone(), exporter, shutdown_tx);

    logger::info!("Worker for VM '{}' starting", config.controller.vm_id);
    let mut worker = Worker::new(deps, settings, live);
    let result = worker.run(shutdown_rx).await;
    worker.shutdown().await;
    watcher.abort();

    result.context("worker loop failed")
}

fn show_change_id(state_dir: &Path, disk_label: &str) -> anyhow::Result<()> {
    let store = ChangeIdStore::new(state_dir);
    match store
        .read(disk_label)
        .with_context(|| format!("failed to read {}", store.path_for(disk_label).display()))?
    {
        PersistedToken::Absent => println!("{}: no change id persisted", disk_label),
        PersistedToken::Invalid(raw) => {
            println!("{}: invalid change id '{}' (next cycle copies in full)", disk_label, raw)
        }
        PersistedToken::Valid(token) => println!(
            "{}: {} (lineage {}, sequence {})",
            disk_label, token.raw, token.lineage_id, token.sequence
        ),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = match cli.log_format {
        LogFormatArg::Text => LogFormat::Text,
        LogFormatArg::Json => LogFormat::Json,
    };
    logger::init_logger_with(format, cli.verbose);

    match cli.command {
        Commands::Run { vm_id } => {
            let config = load_config(&cli.config)?;
            run_worker(config, vm_id).await?;
        }
        Commands::ChangeId { change_id_command } => match change_id_command {
            ChangeIdCommands::Show {
                state_dir,
                disk_label,
            } => show_change_id(&state_dir, &disk_label)?,
            ChangeIdCommands::Parse { raw } => match ChangeToken::parse(&raw) {
                Ok(token) => println!(
                    "lineage: {}\nsequence: {}",
                    token.lineage_id, token.sequence
                ),
                Err(e) => bail!("{}", e),
            },
        },
        Commands::Artifacts { artifacts_command } => match artifacts_command {
            ArtifactsCommands::Purge => {
                let config = load_config(&cli.config)?;
                purge_dir(&config.artifacts.cache_dir);
                println!(
                    "Artifact cache {} purged",
                    config.artifacts.cache_dir.display()
                );
            }
        },
    }

    Ok(())
}
