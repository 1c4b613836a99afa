//! Where copied bytes land: a raw block device (or image file) per disk plus
//! the sidecar that remembers its last synced change id.

use crate::change_id::{ChangeIdStore, disk_slug};
use crate::disk::DiskDescriptor;
use crate::{MigrateError, Result, log_debug, log_info, log_warn};
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

pub const SECTOR_SIZE: u64 = 512;
pub const BUFFER_ALIGN: usize = 4096;

/// Synchronous positioned writes into the target.
pub trait BlockWriter: Send {
    /// Required offset/length granularity (1 when unconstrained).
    fn alignment(&self) -> u64;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Make everything written so far durable.
    fn flush(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Target: Send + Sync {
    async fn connect(&mut self) -> Result<()>;

    fn path(&self) -> &Path;

    async fn exists(&self) -> Result<bool>;

    async fn disconnect(&mut self) -> Result<()>;

    /// Raw persisted token; `None` when nothing was ever persisted.
    async fn read_change_token(&self) -> Result<Option<String>>;

    async fn write_change_token(&self, raw: &str) -> Result<()>;

    fn open_writer(&self) -> Result<Box<dyn BlockWriter>>;
}

/// Builds the target for each disk of a command.
pub trait TargetProvider: Send + Sync {
    fn target_for(&self, location_ref: &str, disk: &DiskDescriptor) -> Box<dyn Target>;

    /// Path the target for `label` lives at, without touching it.
    fn locate(&self, location_ref: &str, label: &str) -> PathBuf;

    /// Remember which disk is the boot disk, across worker restarts.
    fn record_root(&self, label: &str) -> Result<()>;

    fn recorded_root(&self) -> Result<Option<String>>;
}

/// A heap buffer whose usable region starts on a [`BUFFER_ALIGN`] boundary.
pub struct AlignedBuf {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuf {
    pub fn new(len: usize) -> Self {
        let storage = vec![0u8; len + BUFFER_ALIGN];
        let start = storage.as_ptr().align_offset(BUFFER_ALIGN);
        Self {
            storage,
            start,
            len,
        }
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    pub fn slice(&self, len: usize) -> &[u8] {
        &self.storage[self.start..self.start + len.min(self.len)]
    }

    pub fn slice_mut(&mut self, len: usize) -> &mut [u8] {
        let end = self.start + len.min(self.len);
        &mut self.storage[self.start..end]
    }
}

pub struct DirectWriter {
    file: File,
    direct: bool,
    scratch: Option<AlignedBuf>,
}

impl DirectWriter {
    /// Open for `O_DIRECT` writes, falling back to buffered writes plus
    /// `fdatasync` where the filesystem refuses direct I/O.
    pub fn open(path: &Path) -> Result<Self> {
        match OpenOptions::new()
            .write(true)
            .custom_flags(nix::libc::O_DIRECT)
            .open(path)
        {
            Ok(file) => Ok(Self {
                file,
                direct: true,
                scratch: None,
            }),
            Err(e) if e.raw_os_error() == Some(nix::libc::EINVAL) => {
                log_warn!(
                    "{} does not support O_DIRECT, using buffered writes",
                    path.display()
                );
                let file = OpenOptions::new().write(true).open(path)?;
                Ok(Self {
                    file,
                    direct: false,
                    scratch: None,
                })
            }
            Err(e) => Err(MigrateError::Target(format!(
                "open {} for writing: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn is_direct(&self) -> bool {
        self.direct
    }
}

impl BlockWriter for DirectWriter {
    fn alignment(&self) -> u64 {
        if self.direct { SECTOR_SIZE } else { 1 }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.direct {
            self.file.write_all_at(data, offset)?;
            return Ok(());
        }

        if offset % SECTOR_SIZE != 0 || data.len() as u64 % SECTOR_SIZE != 0 {
            return Err(MigrateError::Target(format!(
                "unaligned direct write of {} bytes at {}",
                data.len(),
                offset
            )));
        }
        if (data.as_ptr() as usize) % BUFFER_ALIGN == 0 {
            self.file.write_all_at(data, offset)?;
            return Ok(());
        }

        if self
            .scratch
            .as_ref()
            .is_none_or(|buf| buf.capacity() < data.len())
        {
            self.scratch = Some(AlignedBuf::new(data.len()));
        }
        let scratch = self
            .scratch
            .get_or_insert_with(|| AlignedBuf::new(data.len()));
        scratch.slice_mut(data.len()).copy_from_slice(data);
        self.file.write_all_at(scratch.slice(data.len()), offset)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

pub struct BlockDeviceTarget {
    label: String,
    device_path: PathBuf,
    capacity_bytes: u64,
    store: ChangeIdStore,
    connected: bool,
}

impl BlockDeviceTarget {
    pub fn new(disk: &DiskDescriptor, device_path: PathBuf, store: ChangeIdStore) -> Self {
        Self {
            label: disk.label.clone(),
            device_path,
            capacity_bytes: disk.capacity_bytes,
            store,
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

#[async_trait]
impl Target for BlockDeviceTarget {
    async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }

        match std::fs::metadata(&self.device_path) {
            Ok(meta) if meta.file_type().is_block_device() => {
                log_debug!("Using block device {}", self.device_path.display());
            }
            Ok(meta) if meta.is_file() => {
                if meta.len() < self.capacity_bytes {
                    let file = OpenOptions::new().write(true).open(&self.device_path)?;
                    file.set_len(self.capacity_bytes)?;
                }
            }
            Ok(_) => {
                return Err(MigrateError::TargetConnect(format!(
                    "{} is neither a block device nor a file",
                    self.device_path.display()
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.device_path.starts_with("/dev") {
                    return Err(MigrateError::TargetConnect(format!(
                        "device {} for '{}' is not attached",
                        self.device_path.display(),
                        self.label
                    )));
                }
                if let Some(parent) = self.device_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = File::create(&self.device_path)?;
                file.set_len(self.capacity_bytes)?;
                log_info!(
                    "Created sparse image {} ({} bytes) for '{}'",
                    self.device_path.display(),
                    self.capacity_bytes,
                    self.label
                );
            }
            Err(e) => {
                return Err(MigrateError::TargetConnect(format!(
                    "{}: {}",
                    self.device_path.display(),
                    e
                )));
            }
        }

        self.connected = true;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.device_path
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.device_path.exists())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    async fn read_change_token(&self) -> Result<Option<String>> {
        self.store.read_raw(&self.label)
    }

    async fn write_change_token(&self, raw: &str) -> Result<()> {
        self.store.write(&self.label, raw)
    }

    fn open_writer(&self) -> Result<Box<dyn BlockWriter>> {
        if !self.connected {
            return Err(MigrateError::Target(format!(
                "target for '{}' is not connected",
                self.label
            )));
        }
        Ok(Box::new(DirectWriter::open(&self.device_path)?))
    }
}

/// Per-disk devices under `<location_ref or device_dir>/<disk-slug>`.
#[derive(Debug, Clone)]
pub struct BlockDeviceTargets {
    pub device_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl TargetProvider for BlockDeviceTargets {
    fn target_for(&self, location_ref: &str, disk: &DiskDescriptor) -> Box<dyn Target> {
        Box::new(BlockDeviceTarget::new(
            disk,
            self.locate(location_ref, &disk.label),
            ChangeIdStore::new(&self.state_dir),
        ))
    }

    fn locate(&self, location_ref: &str, label: &str) -> PathBuf {
        let base = if location_ref.trim().is_empty() {
            self.device_dir.clone()
        } else {
            PathBuf::from(location_ref)
        };
        base.join(disk_slug(label))
    }

    fn record_root(&self, label: &str) -> Result<()> {
        ChangeIdStore::new(&self.state_dir).write_root_label(label)
    }

    fn recorded_root(&self) -> Result<Option<String>> {
        ChangeIdStore::new(&self.state_dir).read_root_label()
    }
}
