//! Block-export sessions: one read-only nbdkit VDDK export per eligible disk
//! of the cycle's snapshot, each on its own private Unix socket.

use crate::change_id::disk_slug;
use crate::disk::DiskDescriptor;
use crate::hypervisor::{Hypervisor, SourceDescriptor};
use crate::nbd::NbdClient;
use crate::{MigrateError, Result, log_debug, log_error, log_info, log_warn};
use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::{Duration, Instant, sleep, timeout};

const READY_POLL: Duration = Duration::from_millis(100);
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Random-access reads of a snapshotted disk image.
#[async_trait]
pub trait ExportReader: Send {
    fn size(&self) -> u64;

    /// Fill `buf` from `offset`; short reads are errors.
    async fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Everything an export needs to find the disk inside the snapshot.
#[derive(Debug, Clone)]
pub struct ExportContext {
    pub source: SourceDescriptor,
    pub vm_ref: String,
    pub snapshot_ref: String,
    /// Unpacked SDK bundle, when the controller supplied one.
    pub libdir: Option<PathBuf>,
}

struct SessionProcess {
    child: tokio::sync::Mutex<Option<Child>>,
    files: Vec<PathBuf>,
}

/// A live export for one disk. Clones share the same process, so stopping
/// any clone stops the session for all of them.
#[derive(Clone)]
pub struct ExportSession {
    pub disk: DiskDescriptor,
    pub socket_path: PathBuf,
    process: Option<Arc<SessionProcess>>,
}

impl std::fmt::Debug for ExportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportSession")
            .field("disk", &self.disk.label)
            .field("socket_path", &self.socket_path)
            .field("has_process", &self.process.is_some())
            .finish()
    }
}

impl ExportSession {
    /// A session without a backing process (in-process or test exports).
    pub fn detached(disk: DiskDescriptor, socket_path: PathBuf) -> Self {
        Self {
            disk,
            socket_path,
            process: None,
        }
    }

    pub fn uri(&self) -> String {
        format!("nbd+unix:///?socket={}", self.socket_path.display())
    }

    /// Terminate the process and remove its files. Safe to call repeatedly.
    pub async fn stop_process(&self) -> Result<()> {
        let Some(process) = &self.process else {
            return Ok(());
        };

        let child = process.child.lock().await.take();
        let mut result = Ok(());
        if let Some(mut child) = child {
            if let Some(pid) = child.id() {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    log_warn!("SIGTERM to export for '{}' failed: {}", self.disk.label, e);
                }
            }
            match timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    log_debug!("Export for '{}' exited with {}", self.disk.label, status)
                }
                Ok(Err(e)) => result = Err(MigrateError::Io(e)),
                Err(_) => {
                    log_warn!("Export for '{}' ignored SIGTERM, killing", self.disk.label);
                    if let Err(e) = child.kill().await {
                        result = Err(MigrateError::Export(format!(
                            "kill export for '{}': {}",
                            self.disk.label, e
                        )));
                    }
                }
            }
        }

        for file in process.files.iter().chain(std::iter::once(&self.socket_path)) {
            match fs::remove_file(file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log_warn!("Could not remove {}: {}", file.display(), e),
            }
        }
        result
    }
}

#[async_trait]
pub trait BlockExporter: Send + Sync {
    /// Start one export per disk. Either every session comes up or none do.
    async fn start(&self, ctx: &ExportContext, disks: &[DiskDescriptor]) -> Result<Vec<ExportSession>>;

    async fn open(&self, session: &ExportSession) -> Result<Box<dyn ExportReader>>;

    /// Stop every session, attempting all of them even when some fail.
    async fn stop(&self, sessions: Vec<ExportSession>) -> Result<()> {
        let mut failures = Vec::new();
        for session in sessions {
            if let Err(e) = session.stop_process().await {
                log_error!("Stopping export for '{}' failed: {}", session.disk.label, e);
                failures.push(format!("{}: {}", session.disk.label, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MigrateError::Export(format!(
                "failed to stop {} export(s): {}",
                failures.len(),
                failures.join("; ")
            )))
        }
    }
}

#[derive(Debug, Clone)]
pub struct NbdkitExporter {
    pub nbdkit: String,
    pub socket_dir: PathBuf,
    pub compression: String,
    pub ready_timeout: Duration,
}

/// Host part of an endpoint that may be given as a URL.
pub fn endpoint_host(endpoint: &str) -> &str {
    let without_scheme = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
}

fn moref_value(reference: &str) -> &str {
    reference
        .split_once(':')
        .map(|(_, value)| value)
        .unwrap_or(reference)
}

impl NbdkitExporter {
    fn paths_for(&self, ctx: &ExportContext, disk: &DiskDescriptor) -> (PathBuf, PathBuf, PathBuf) {
        let stem = format!(
            "{}-{}-{}",
            disk_slug(&ctx.source.vm_name),
            disk.key,
            disk_slug(&disk.label)
        );
        (
            self.socket_dir.join(format!("{}.sock", stem)),
            self.socket_dir.join(format!("{}.pid", stem)),
            self.socket_dir.join(format!("{}.pw", stem)),
        )
    }

    pub fn build_command(
        &self,
        ctx: &ExportContext,
        disk: &DiskDescriptor,
        socket: &Path,
        pid_file: &Path,
        password_file: &Path,
    ) -> Command {
        let mut cmd = Command::new(&self.nbdkit);
        cmd.arg("--readonly")
            .arg("--exit-with-parent")
            .arg("--foreground")
            .arg("--unix")
            .arg(socket)
            .arg("--pidfile")
            .arg(pid_file)
            .arg("vddk")
            .arg(format!("server={}", endpoint_host(&ctx.source.endpoint)))
            .arg(format!("user={}", ctx.source.username))
            .arg(format!("password=+{}", password_file.display()))
            .arg(format!("vm=moref={}", moref_value(&ctx.vm_ref)))
            .arg(format!("snapshot={}", moref_value(&ctx.snapshot_ref)))
            .arg(format!("compression={}", self.compression));
        if let Some(thumbprint) = &ctx.source.thumbprint {
            cmd.arg(format!("thumbprint={}", thumbprint));
        }
        if let Some(libdir) = &ctx.libdir {
            cmd.arg(format!("libdir={}", libdir.display()));
        }
        cmd.arg(format!("file={}", disk.backing_file));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }

    async fn start_one(&self, ctx: &ExportContext, disk: &DiskDescriptor) -> Result<ExportSession> {
        let (socket, pid_file, password_file) = self.paths_for(ctx, disk);
        for stale in [&socket, &pid_file] {
            let _ = fs::remove_file(stale);
        }

        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&password_file)?;
            file.write_all(ctx.source.password.as_bytes())?;
        }

        let mut cmd = self.build_command(ctx, disk, &socket, &pid_file, &password_file);
        log_debug!("Export command: {}", crate::command::describe(&cmd));
        let child = cmd.spawn().map_err(|e| {
            let _ = fs::remove_file(&password_file);
            MigrateError::Export(format!("spawn {} for '{}': {}", self.nbdkit, disk.label, e))
        })?;

        let session = ExportSession {
            disk: disk.clone(),
            socket_path: socket,
            process: Some(Arc::new(SessionProcess {
                child: tokio::sync::Mutex::new(Some(child)),
                files: vec![pid_file.clone(), password_file],
            })),
        };

        if let Err(e) = self.wait_ready(&session, &pid_file).await {
            let _ = session.stop_process().await;
            return Err(e);
        }
        log_info!(
            "Export for '{}' ready on {}",
            disk.label,
            session.socket_path.display()
        );
        Ok(session)
    }

    async fn wait_ready(&self, session: &ExportSession, pid_file: &Path) -> Result<()> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            if pid_file.exists() {
                return Ok(());
            }
            if let Some(process) = &session.process {
                if let Some(child) = process.child.lock().await.as_mut() {
                    if let Some(status) = child.try_wait()? {
                        return Err(MigrateError::Export(format!(
                            "export for '{}' exited early with {}",
                            session.disk.label, status
                        )));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(MigrateError::ExportTimeout {
                    disk: session.disk.label.clone(),
                    timeout: self.ready_timeout,
                });
            }
            sleep(READY_POLL).await;
        }
    }
}

#[async_trait]
impl BlockExporter for NbdkitExporter {
    async fn start(&self, ctx: &ExportContext, disks: &[DiskDescriptor]) -> Result<Vec<ExportSession>> {
        fs::create_dir_all(&self.socket_dir)?;

        let mut sessions = Vec::with_capacity(disks.len());
        for disk in disks {
            match self.start_one(ctx, disk).await {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    if let Err(stop_err) = self.stop(sessions).await {
                        log_error!("Cleanup after failed export start: {}", stop_err);
                    }
                    return Err(e.for_disk(&disk.label));
                }
            }
        }
        Ok(sessions)
    }

    async fn open(&self, session: &ExportSession) -> Result<Box<dyn ExportReader>> {
        let client = NbdClient::connect_unix(&session.socket_path, "")
            .await
            .map_err(|e| e.for_disk(&session.disk.label))?;
        Ok(Box::new(client))
    }
}

/// Snapshot a cycle is reading from, as seen by the interrupt watcher.
pub struct LiveSnapshot {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub reference: String,
}

/// Sessions and the snapshot that are currently live, shared with the
/// interrupt watcher. Whoever takes an entry owns its teardown.
#[derive(Default)]
pub struct LiveSessions {
    sessions: Mutex<Vec<ExportSession>>,
    snapshot: Mutex<Option<LiveSnapshot>>,
}

impl LiveSessions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn install(&self, sessions: &[ExportSession]) {
        if let Ok(mut live) = self.sessions.lock() {
            live.extend_from_slice(sessions);
        }
    }

    /// Hand the sessions to whoever tears them down; later calls get nothing.
    pub fn take(&self) -> Vec<ExportSession> {
        self.sessions
            .lock()
            .map(|mut live| std::mem::take(&mut *live))
            .unwrap_or_default()
    }

    pub fn register_snapshot(&self, hypervisor: Arc<dyn Hypervisor>, reference: &str) {
        if let Ok(mut snapshot) = self.snapshot.lock() {
            *snapshot = Some(LiveSnapshot {
                hypervisor,
                reference: reference.to_string(),
            });
        }
    }

    pub fn take_snapshot(&self) -> Option<LiveSnapshot> {
        self.snapshot.lock().ok().and_then(|mut snapshot| snapshot.take())
    }

    /// Claim the snapshot `reference` for removal. False when it is not
    /// registered, e.g. because the interrupt watcher already took it.
    pub fn release_snapshot(&self, reference: &str) -> bool {
        match self.snapshot.lock() {
            Ok(mut snapshot) => match snapshot.as_ref() {
                Some(live) if live.reference == reference => {
                    *snapshot = None;
                    true
                }
                _ => false,
            },
            Err(_) => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        let no_sessions = self.sessions.lock().map(|live| live.is_empty()).unwrap_or(true);
        let no_snapshot = self.snapshot.lock().map(|s| s.is_none()).unwrap_or(true);
        no_sessions && no_snapshot
    }
}

/// Stop whatever is live: exports first, then the snapshot with
/// consolidation. Returns false when nothing was live.
pub async fn teardown_live(live: &LiveSessions, exporter: &dyn BlockExporter) -> bool {
    let sessions = live.take();
    let snapshot = live.take_snapshot();
    if sessions.is_empty() && snapshot.is_none() {
        return false;
    }

    if !sessions.is_empty() {
        log_warn!("Stopping {} export session(s)", sessions.len());
        if let Err(e) = exporter.stop(sessions).await {
            log_error!("{}", e);
        }
    }
    if let Some(snapshot) = snapshot {
        log_warn!("Removing snapshot {}", snapshot.reference);
        if let Err(e) = snapshot
            .hypervisor
            .remove_snapshot(&snapshot.reference, true)
            .await
        {
            log_error!("Failed to remove snapshot {}: {}", snapshot.reference, e);
        }
    }
    true
}

/// Exit status used when an interrupt lands mid-cycle.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Watch for SIGINT/SIGTERM. A cycle in flight is torn down and the process
/// exits; otherwise the worker loop is asked to stop at its next idle wait.
pub fn spawn_interrupt_watcher(
    live: Arc<LiveSessions>,
    exporter: Arc<dyn BlockExporter>,
    shutdown: watch::Sender<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut term =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    log_error!("Cannot install SIGTERM handler: {}", e);
                    return;
                }
            };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }

            if !teardown_live(&live, exporter.as_ref()).await {
                log_info!("Interrupt received, stopping after the current command");
                let _ = shutdown.send(true);
                continue;
            }
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskMode, SharingMode};
    use tempfile::TempDir;

    fn disk() -> DiskDescriptor {
        DiskDescriptor {
            key: 2000,
            label: "Hard disk 1".to_string(),
            capacity_bytes: 1 << 20,
            backing_file: "[ds1] web/web-000001.vmdk".to_string(),
            snapshot_chain: vec![],
            sharing: SharingMode::NoSharing,
            disk_mode: DiskMode::Persistent,
            change_id: None,
        }
    }

    fn ctx() -> ExportContext {
        ExportContext {
            source: SourceDescriptor {
                endpoint: "https://vc.example.com/sdk".to_string(),
                username: "admin".to_string(),
                password: "secret".to_string(),
                thumbprint: Some("AA:BB".to_string()),
                vm_name: "web".to_string(),
                ..Default::default()
            },
            vm_ref: "VirtualMachine:vm-42".to_string(),
            snapshot_ref: "VirtualMachineSnapshot:snapshot-7".to_string(),
            libdir: Some(PathBuf::from("/opt/vddk")),
        }
    }

    #[test]
    fn endpoint_host_strips_url() {
        assert_eq!(endpoint_host("https://vc.example.com/sdk"), "vc.example.com");
        assert_eq!(endpoint_host("vc.example.com"), "vc.example.com");
    }

    #[test]
    fn command_never_carries_password() {
        let exporter = NbdkitExporter {
            nbdkit: "nbdkit".to_string(),
            socket_dir: PathBuf::from("/run/vmshift"),
            compression: "skipz".to_string(),
            ready_timeout: Duration::from_secs(10),
        };
        let cmd = exporter.build_command(
            &ctx(),
            &disk(),
            Path::new("/run/vmshift/a.sock"),
            Path::new("/run/vmshift/a.pid"),
            Path::new("/run/vmshift/a.pw"),
        );
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert!(args.contains(&"server=vc.example.com".to_string()));
        assert!(args.contains(&"vm=moref=vm-42".to_string()));
        assert!(args.contains(&"snapshot=snapshot-7".to_string()));
        assert!(args.contains(&"password=+/run/vmshift/a.pw".to_string()));
        assert!(args.contains(&"libdir=/opt/vddk".to_string()));
        assert_eq!(args.last().unwrap(), "file=[ds1] web/web-000001.vmdk");
        assert!(!args.iter().any(|a| a.contains("secret")));
    }

    #[tokio::test]
    async fn start_times_out_when_never_ready() {
        let dir = TempDir::new().unwrap();
        // `sleep` ignores the nbdkit arguments and never writes a pidfile.
        let script = dir.path().join("fake-nbdkit");
        fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        let mut perms = fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        fs::set_permissions(&script, perms).unwrap();

        let exporter = NbdkitExporter {
            nbdkit: script.to_string_lossy().into_owned(),
            socket_dir: dir.path().join("run"),
            compression: "none".to_string(),
            ready_timeout: Duration::from_millis(300),
        };

        let err = exporter.start(&ctx(), &[disk()]).await.unwrap_err();
        assert!(err.is_fatal_to_cycle());
        assert!(matches!(
            err,
            MigrateError::Disk { ref source, .. } if matches!(**source, MigrateError::ExportTimeout { .. })
        ));
        // Password file is cleaned up with the failed session.
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("run")).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn live_sessions_hand_out_once() {
        let live = LiveSessions::new();
        live.install(&[ExportSession::detached(disk(), PathBuf::from("/tmp/x.sock"))]);
        assert!(!live.is_empty());
        assert_eq!(live.take().len(), 1);
        assert!(live.take().is_empty());
    }

    #[tokio::test]
    async fn detached_stop_is_idempotent() {
        let session = ExportSession::detached(disk(), PathBuf::from("/nonexistent/x.sock"));
        session.stop_process().await.unwrap();
        session.stop_process().await.unwrap();
    }
}
