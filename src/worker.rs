//! The worker control loop: poll the controller, execute one command at a
//! time, report the outcome, repeat until told to finish.

use crate::artifacts::{ArtifactCache, ArtifactCriteria};
use crate::controller::{
    ArtifactKind, CommandKind, Controller, MigrationCommand, OsHints, WorkerStatus,
};
use crate::conversion::GuestConverter;
use crate::export::{BlockExporter, LiveSessions};
use crate::full_copy::BulkCopier;
use crate::hypervisor::{Hypervisor, SourceConnector, SourceDescriptor};
use crate::pipeline::{CycleReport, CycleRequest, Pipeline};
use crate::post_import::PostImport;
use crate::status::StatusReporter;
use crate::target::TargetProvider;
use crate::{MigrateError, Result, log_debug, log_error, log_info, log_warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, sleep};

/// The collaborators a worker drives.
#[derive(Clone)]
pub struct WorkerDeps {
    pub controller: Arc<dyn Controller>,
    pub connector: Arc<dyn SourceConnector>,
    pub exporter: Arc<dyn BlockExporter>,
    pub copier: Arc<dyn BulkCopier>,
    pub targets: Arc<dyn TargetProvider>,
    pub converter: Arc<dyn GuestConverter>,
    pub post_import: Arc<dyn PostImport>,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub idle_interval: Duration,
    pub status_interval: Duration,
    pub artifact_cache_dir: PathBuf,
    pub sdk: ArtifactCriteria,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Executing(CommandKind),
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Terminate,
}

pub struct Worker {
    deps: WorkerDeps,
    settings: WorkerSettings,
    live: Arc<LiveSessions>,
    reporter: StatusReporter,
    artifacts: ArtifactCache,
    state: WorkerState,
    source: Option<(SourceDescriptor, Arc<dyn Hypervisor>)>,
    libdir: Option<PathBuf>,
    drivers: Option<PathBuf>,
    root_target: Option<PathBuf>,
}

impl Worker {
    /// Build the worker. Leftover artifacts from a previous run are purged.
    pub fn new(deps: WorkerDeps, settings: WorkerSettings, live: Arc<LiveSessions>) -> Self {
        let reporter = StatusReporter::spawn(deps.controller.clone(), settings.status_interval);
        let mut artifacts = ArtifactCache::new(deps.controller.clone(), &settings.artifact_cache_dir);
        artifacts.purge();
        Self {
            deps,
            settings,
            live,
            reporter,
            artifacts,
            state: WorkerState::Idle,
            source: None,
            libdir: None,
            drivers: None,
            root_target: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state != state {
            log_debug!("Worker state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Poll and execute commands until POST_IMPORT completes or `shutdown`
    /// flips to true during an idle wait.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        log_info!("Worker loop started");
        loop {
            if *shutdown.borrow() {
                log_info!("Shutdown requested");
                break;
            }

            let command = match self.deps.controller.next_command().await {
                Ok(command) => command,
                Err(e) => {
                    log_warn!("Command poll failed: {}", e);
                    if self.idle_wait(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match command.kind {
                CommandKind::Idle => {}
                CommandKind::Unknown => log_warn!("Ignoring unknown command kind"),
                kind => {
                    self.set_state(WorkerState::Executing(kind));
                    if self.execute(&command).await == Flow::Terminate {
                        self.set_state(WorkerState::Terminating);
                        break;
                    }
                }
            }

            self.set_state(WorkerState::Idle);
            if self.idle_wait(&mut shutdown).await {
                log_info!("Shutdown requested");
                break;
            }
        }
        log_info!("Worker loop finished");
        Ok(())
    }

    /// Sleep for the idle interval; true when shutdown was requested.
    async fn idle_wait(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = sleep(self.settings.idle_interval) => *shutdown.borrow(),
            changed = shutdown.changed() => match changed {
                Ok(()) => *shutdown.borrow(),
                Err(_) => {
                    sleep(self.settings.idle_interval).await;
                    false
                }
            },
        }
    }

    /// The single place where command errors turn into a FAILED status.
    async fn execute(&mut self, command: &MigrationCommand) -> Flow {
        log_info!("Executing {:?}", command.kind);
        let result = match command.kind {
            CommandKind::ImportDisks => self.import_disks(command).await.map(|m| (m, Flow::Continue)),
            CommandKind::FinalizeImport => {
                self.finalize_import(command).await.map(|m| (m, Flow::Continue))
            }
            CommandKind::PostImport => self.post_import(command).await.map(|m| (m, Flow::Terminate)),
            CommandKind::Idle | CommandKind::Unknown => return Flow::Continue,
        };

        match result {
            Ok((message, flow)) => {
                self.reporter.push(WorkerStatus::success(message));
                flow
            }
            Err(e) => {
                log_error!("{:?} failed: {}", command.kind, e);
                self.reporter.push(WorkerStatus::failed(e.to_string()));
                Flow::Continue
            }
        }
    }

    async fn ensure_source(&mut self, command: &MigrationCommand) -> Result<Arc<dyn Hypervisor>> {
        if let Some((current, hypervisor)) = &self.source {
            if command.source.as_ref().is_none_or(|wanted| wanted == current) {
                return Ok(hypervisor.clone());
            }
        }

        let wanted = command.source.as_ref().ok_or_else(|| {
            MigrateError::Controller("command carries no source and no connection is open".to_string())
        })?;
        log_info!("Connecting to {} for VM '{}'", wanted.endpoint, wanted.vm_name);
        let hypervisor = self.deps.connector.connect(wanted).await?;
        self.source = Some((wanted.clone(), hypervisor.clone()));
        Ok(hypervisor)
    }

    async fn ensure_artifacts(&mut self, hints: &OsHints) -> Result<()> {
        let sdk = self
            .artifacts
            .fetch(ArtifactKind::SdkBundle, &self.settings.sdk)
            .await?;
        if sdk.refreshed {
            self.reporter
                .push(WorkerStatus::running("Transfer SDK downloaded", true));
        }
        self.libdir = Some(sdk.dir);

        if hints.guest_conversion {
            let criteria = ArtifactCriteria {
                os: hints.os.clone(),
                arch: hints.arch.clone(),
                version: hints.version.clone(),
            };
            match self
                .artifacts
                .fetch(ArtifactKind::DriverPackage, &criteria)
                .await
            {
                Ok(drivers) => self.drivers = Some(drivers.path),
                Err(e) => log_warn!("No driver package for guest conversion: {}", e),
            }
        }
        Ok(())
    }

    async fn run_cycle(
        &mut self,
        hypervisor: Arc<dyn Hypervisor>,
        command: &MigrationCommand,
        convert_guest: bool,
    ) -> Result<CycleReport> {
        let source = self
            .source
            .as_ref()
            .map(|(source, _)| source.clone())
            .unwrap_or_default();
        let pipeline = Pipeline {
            hypervisor,
            source,
            exporter: self.deps.exporter.clone(),
            copier: self.deps.copier.clone(),
            targets: self.deps.targets.clone(),
            converter: self.deps.converter.clone(),
            live: self.live.clone(),
        };
        let request = CycleRequest {
            location_ref: command.location_ref.clone(),
            convert_guest,
            root_disk: command.os_hints.root_disk.clone(),
            libdir: self.libdir.clone(),
            drivers: self.drivers.clone(),
        };

        let report = pipeline.run_cycle(&request, &mut self.reporter).await?;
        if report.root_target.is_some() {
            self.root_target = report.root_target.clone();
        }
        Ok(report)
    }

    async fn import_disks(&mut self, command: &MigrationCommand) -> Result<String> {
        let hypervisor = self.ensure_source(command).await?;
        self.ensure_artifacts(&command.os_hints).await?;
        let report = self.run_cycle(hypervisor, command, false).await?;

        match &self.root_target {
            Some(root) => self.deps.post_import.run(root, true).await?,
            None => log_warn!("Root disk unknown, skipping post-import dry run"),
        }
        Ok(format!("Imported {} disk(s)", report.disks.len()))
    }

    async fn finalize_import(&mut self, command: &MigrationCommand) -> Result<String> {
        let hypervisor = self.ensure_source(command).await?;
        self.ensure_artifacts(&command.os_hints).await?;

        hypervisor.power_off().await?;
        self.reporter.push(WorkerStatus::running(
            format!("Source VM {} powered off", hypervisor.vm_name()),
            true,
        ));

        let report = self
            .run_cycle(hypervisor, command, command.os_hints.guest_conversion)
            .await?;
        let converted = report.disks.iter().any(|d| d.converted);
        Ok(format!(
            "Final sync of {} disk(s) complete{}",
            report.disks.len(),
            if converted { ", guest converted" } else { "" }
        ))
    }

    /// Boot disk target for POST_IMPORT: the one this process last synced,
    /// else the hinted label, else the label recorded in the state dir.
    fn resolve_root(&self, command: &MigrationCommand) -> Result<PathBuf> {
        if let Some(root) = &self.root_target {
            return Ok(root.clone());
        }
        let label = match &command.os_hints.root_disk {
            Some(label) => Some(label.clone()),
            None => self.deps.targets.recorded_root()?,
        };
        let label = label.ok_or_else(|| {
            MigrateError::PostImport(
                "root disk unknown: no rootDisk hint and none recorded by an import".to_string(),
            )
        })?;
        let root = self.deps.targets.locate(&command.location_ref, &label);
        log_info!("Post-import root disk '{}' at {}", label, root.display());
        Ok(root)
    }

    async fn post_import(&mut self, command: &MigrationCommand) -> Result<String> {
        let root = self.resolve_root(command)?;
        self.deps.post_import.run(&root, false).await?;
        nix::unistd::sync();
        Ok("Post-import configuration applied".to_string())
    }

    /// Deliver queued statuses and clear the artifact cache.
    pub async fn shutdown(mut self) {
        self.artifacts.purge();
        self.reporter.drain().await;
    }
}
