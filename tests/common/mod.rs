// Shared in-memory fakes for the pipeline and worker integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use vmshift::controller::{Artifact, ArtifactKind, Controller, MigrationCommand, WorkerStatus};
use vmshift::conversion::GuestConverter;
use vmshift::disk::{DiskBacking, DiskDescriptor, FileBacking, HardwareDevice};
use vmshift::export::{BlockExporter, ExportContext, ExportReader, ExportSession};
use vmshift::full_copy::BulkCopier;
use vmshift::hypervisor::{ChangedAreas, DiskArea, Hypervisor, SourceConnector, SourceDescriptor};
use vmshift::post_import::PostImport;
use vmshift::status::ProgressSink;
use vmshift::target::{BlockWriter, Target, TargetProvider};
use vmshift::{MigrateError, Result};

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

pub fn source() -> SourceDescriptor {
    SourceDescriptor {
        endpoint: "https://vc.example.com/sdk".to_string(),
        username: "admin".to_string(),
        password: "secret".to_string(),
        vm_name: "web".to_string(),
        ..Default::default()
    }
}

pub fn virtual_disk(key: i32, label: &str, capacity: u64, change_id: &str) -> HardwareDevice {
    let mut file = FileBacking::new(&format!("[ds1] web/web-{}.vmdk", key));
    file.change_id = Some(change_id.to_string());
    HardwareDevice::VirtualDisk {
        key,
        label: label.to_string(),
        capacity_bytes: capacity,
        backing: DiskBacking::Flat(file),
    }
}

#[derive(Default)]
pub struct HypervisorLog {
    pub snapshots_created: usize,
    pub snapshots_removed: Vec<(String, bool)>,
    pub power_offs: usize,
    pub queries: Vec<(i32, u64, String)>,
}

pub struct FakeHypervisor {
    pub devices: Mutex<Vec<HardwareDevice>>,
    /// Changed areas per disk key, reported as a single page.
    pub changed: Mutex<HashMap<i32, Vec<(u64, u64)>>>,
    pub fail_snapshot: bool,
    pub log: Mutex<HypervisorLog>,
}

impl FakeHypervisor {
    pub fn new(devices: Vec<HardwareDevice>) -> Self {
        Self {
            devices: Mutex::new(devices),
            changed: Mutex::new(HashMap::new()),
            fail_snapshot: false,
            log: Mutex::new(HypervisorLog::default()),
        }
    }

    fn capacity_of(&self, key: i32) -> u64 {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find_map(|d| match d {
                HardwareDevice::VirtualDisk {
                    key: k,
                    capacity_bytes,
                    ..
                } if *k == key => Some(*capacity_bytes),
                _ => None,
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    fn vm_name(&self) -> &str {
        "web"
    }

    async fn vm_ref(&self) -> Result<String> {
        Ok("VirtualMachine:vm-42".to_string())
    }

    async fn create_snapshot(&self, _name: &str) -> Result<String> {
        if self.fail_snapshot {
            return Err(MigrateError::Hypervisor("task failed: quiesce timeout".to_string()));
        }
        let mut log = self.log.lock().unwrap();
        log.snapshots_created += 1;
        Ok(format!("VirtualMachineSnapshot:snapshot-{}", log.snapshots_created))
    }

    async fn remove_snapshot(&self, snapshot_ref: &str, consolidate: bool) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .snapshots_removed
            .push((snapshot_ref.to_string(), consolidate));
        Ok(())
    }

    async fn snapshot_devices(&self, _snapshot_ref: &str) -> Result<Vec<HardwareDevice>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn query_changed_areas(
        &self,
        _snapshot_ref: &str,
        disk_key: i32,
        start_offset: u64,
        change_id: &str,
    ) -> Result<ChangedAreas> {
        self.log
            .lock()
            .unwrap()
            .queries
            .push((disk_key, start_offset, change_id.to_string()));
        let capacity = self.capacity_of(disk_key);
        let areas = self
            .changed
            .lock()
            .unwrap()
            .get(&disk_key)
            .cloned()
            .unwrap_or_default();
        Ok(ChangedAreas {
            start_offset,
            length: capacity - start_offset,
            areas: areas
                .into_iter()
                .map(|(start, length)| DiskArea { start, length })
                .collect(),
        })
    }

    async fn power_off(&self) -> Result<()> {
        self.log.lock().unwrap().power_offs += 1;
        Ok(())
    }
}

pub struct FakeConnector {
    pub hypervisor: Arc<FakeHypervisor>,
    pub connects: Mutex<usize>,
}

#[async_trait]
impl SourceConnector for FakeConnector {
    async fn connect(&self, _source: &SourceDescriptor) -> Result<Arc<dyn Hypervisor>> {
        *self.connects.lock().unwrap() += 1;
        Ok(self.hypervisor.clone())
    }
}

#[derive(Default)]
pub struct ExportLog {
    pub started: usize,
    pub stopped: usize,
    /// (disk label, offset, length) of every export read.
    pub reads: Vec<(String, u64, usize)>,
}

#[derive(Default)]
pub struct FakeExporter {
    pub fail_start: bool,
    pub log: Arc<Mutex<ExportLog>>,
}

struct ZeroReader {
    label: String,
    size: u64,
    log: Arc<Mutex<ExportLog>>,
}

#[async_trait]
impl ExportReader for ZeroReader {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .reads
            .push((self.label.clone(), offset, buf.len()));
        buf.fill(0x5a);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl BlockExporter for FakeExporter {
    async fn start(&self, _ctx: &ExportContext, disks: &[DiskDescriptor]) -> Result<Vec<ExportSession>> {
        if self.fail_start {
            return Err(MigrateError::ExportTimeout {
                disk: disks[0].label.clone(),
                timeout: std::time::Duration::from_secs(10),
            }
            .for_disk(&disks[0].label));
        }
        self.log.lock().unwrap().started += disks.len();
        Ok(disks
            .iter()
            .map(|d| ExportSession::detached(d.clone(), PathBuf::from(format!("/fake/{}.sock", d.key))))
            .collect())
    }

    async fn open(&self, session: &ExportSession) -> Result<Box<dyn ExportReader>> {
        Ok(Box::new(ZeroReader {
            label: session.disk.label.clone(),
            size: session.disk.capacity_bytes,
            log: self.log.clone(),
        }))
    }

    async fn stop(&self, sessions: Vec<ExportSession>) -> Result<()> {
        self.log.lock().unwrap().stopped += sessions.len();
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCopier {
    /// (disk label, target path, destination zeroed)
    pub copies: Mutex<Vec<(String, PathBuf, bool)>>,
    pub fail_on: Option<String>,
    pub panic_on: Option<String>,
}

#[async_trait]
impl BulkCopier for FakeCopier {
    async fn copy(
        &self,
        session: &ExportSession,
        target_path: &Path,
        target_is_zeroed: bool,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        let label = session.disk.label.clone();
        if self.panic_on.as_deref() == Some(label.as_str()) {
            panic!("copier exploded on {}", label);
        }
        if self.fail_on.as_deref() == Some(label.as_str()) {
            return Err(MigrateError::Copy("nbdcopy exited with 1".to_string()));
        }
        progress.report(format!("Copying disk {}: 100%", label), false);
        self.copies
            .lock()
            .unwrap()
            .push((label, target_path.to_path_buf(), target_is_zeroed));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct TargetState {
    pub exists: bool,
    pub connected: bool,
    pub token: Option<String>,
    pub token_writes: Vec<String>,
    pub writes: Vec<(u64, usize)>,
    /// Fail the write with this index (0-based, counted per target).
    pub fail_write: Option<usize>,
}

pub struct FakeTarget {
    path: PathBuf,
    state: Arc<Mutex<TargetState>>,
}

struct RecordingWriter {
    state: Arc<Mutex<TargetState>>,
}

impl BlockWriter for RecordingWriter {
    fn alignment(&self) -> u64 {
        512
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_write == Some(state.writes.len()) {
            return Err(MigrateError::Target("injected write failure".to_string()));
        }
        state.writes.push((offset, data.len()));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Target for FakeTarget {
    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.exists = true;
        state.connected = true;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state.lock().unwrap().exists)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.state.lock().unwrap().connected = false;
        Ok(())
    }

    async fn read_change_token(&self) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().token.clone())
    }

    async fn write_change_token(&self, raw: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.token = Some(raw.to_string());
        state.token_writes.push(raw.to_string());
        Ok(())
    }

    fn open_writer(&self) -> Result<Box<dyn BlockWriter>> {
        Ok(Box::new(RecordingWriter {
            state: self.state.clone(),
        }))
    }
}

#[derive(Default)]
pub struct FakeTargets {
    pub states: Mutex<HashMap<String, Arc<Mutex<TargetState>>>>,
    pub root: Mutex<Option<String>>,
}

impl FakeTargets {
    pub fn state(&self, label: &str) -> Arc<Mutex<TargetState>> {
        self.states
            .lock()
            .unwrap()
            .entry(label.to_string())
            .or_default()
            .clone()
    }
}

impl TargetProvider for FakeTargets {
    fn target_for(&self, location_ref: &str, disk: &DiskDescriptor) -> Box<dyn Target> {
        Box::new(FakeTarget {
            path: self.locate(location_ref, &disk.label),
            state: self.state(&disk.label),
        })
    }

    fn locate(&self, location_ref: &str, label: &str) -> PathBuf {
        PathBuf::from(location_ref).join(label)
    }

    fn record_root(&self, label: &str) -> Result<()> {
        *self.root.lock().unwrap() = Some(label.to_string());
        Ok(())
    }

    fn recorded_root(&self) -> Result<Option<String>> {
        Ok(self.root.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeConverter {
    pub converted: Mutex<Vec<(PathBuf, Option<PathBuf>)>>,
}

#[async_trait]
impl GuestConverter for FakeConverter {
    async fn convert(&self, target_path: &Path, drivers: Option<&Path>) -> Result<()> {
        self.converted
            .lock()
            .unwrap()
            .push((target_path.to_path_buf(), drivers.map(Path::to_path_buf)));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePostImport {
    pub runs: Mutex<Vec<(PathBuf, bool)>>,
}

#[async_trait]
impl PostImport for FakePostImport {
    async fn run(&self, root_target: &Path, dry_run: bool) -> Result<()> {
        self.runs
            .lock()
            .unwrap()
            .push((root_target.to_path_buf(), dry_run));
        Ok(())
    }
}

pub struct FakeController {
    pub commands: Mutex<VecDeque<MigrationCommand>>,
    pub statuses: Mutex<Vec<WorkerStatus>>,
    pub artifacts: Vec<Artifact>,
}

impl FakeController {
    pub fn new(commands: Vec<MigrationCommand>) -> Arc<Self> {
        Arc::new(Self {
            commands: Mutex::new(commands.into()),
            statuses: Mutex::new(vec![]),
            artifacts: vec![Artifact {
                id: "vddk-8.0.2".to_string(),
                kind: ArtifactKind::SdkBundle,
                os: "linux".to_string(),
                architectures: vec!["x86_64".to_string()],
                versions: vec!["8.0.2".to_string()],
                last_updated: Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap(),
                files: vec!["libvixDiskLib.so.8".to_string()],
                required_file_name: Some("libvixDiskLib.so.8".to_string()),
            }],
        })
    }
}

#[async_trait]
impl Controller for FakeController {
    async fn next_command(&self) -> Result<MigrationCommand> {
        Ok(self
            .commands
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(MigrationCommand::idle))
    }

    async fn push_status(&self, status: &WorkerStatus) -> Result<()> {
        self.statuses.lock().unwrap().push(status.clone());
        Ok(())
    }

    async fn list_artifacts(&self) -> Result<Vec<Artifact>> {
        Ok(self.artifacts.clone())
    }

    async fn download_file(&self, artifact_id: &str, file_name: &str, dest: &Path) -> Result<()> {
        std::fs::write(dest, format!("{}/{}", artifact_id, file_name))?;
        Ok(())
    }
}

/// Collects every progress message.
#[derive(Default)]
pub struct Messages(pub Vec<(String, bool)>);

impl ProgressSink for Messages {
    fn report(&mut self, message: String, important: bool) {
        self.0.push((message, important));
    }
}
