use crate::{MigrateError, Result, log_debug, log_warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskMode {
    Persistent,
    NonPersistent,
    Undoable,
    IndependentPersistent,
    IndependentNonpersistent,
    Append,
}

impl DiskMode {
    pub fn is_independent(&self) -> bool {
        matches!(
            self,
            DiskMode::IndependentPersistent | DiskMode::IndependentNonpersistent
        )
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "independent_persistent" => DiskMode::IndependentPersistent,
            "independent_nonpersistent" => DiskMode::IndependentNonpersistent,
            "nonpersistent" => DiskMode::NonPersistent,
            "undoable" => DiskMode::Undoable,
            "append" => DiskMode::Append,
            _ => DiskMode::Persistent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingMode {
    NoSharing,
    MultiWriter,
}

impl SharingMode {
    pub fn parse(value: &str) -> Self {
        match value {
            "sharingMultiWriter" | "multi_writer" => SharingMode::MultiWriter,
            _ => SharingMode::NoSharing,
        }
    }
}

/// Backing of a virtual disk as reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskBacking {
    Flat(FileBacking),
    SeSparse(FileBacking),
    Sparse(FileBacking),
    RawDeviceMapping { device_name: String },
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBacking {
    pub file_name: String,
    pub disk_mode: DiskMode,
    pub sharing: SharingMode,
    pub change_id: Option<String>,
    pub parent: Option<Box<DiskBacking>>,
}

impl FileBacking {
    pub fn new(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            disk_mode: DiskMode::Persistent,
            sharing: SharingMode::NoSharing,
            change_id: None,
            parent: None,
        }
    }
}

/// One entry of a snapshot's hardware list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareDevice {
    VirtualDisk {
        key: i32,
        label: String,
        capacity_bytes: u64,
        backing: DiskBacking,
    },
    Other {
        key: i32,
        label: String,
    },
}

/// An eligible disk inside the cycle's snapshot. Immutable for the cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDescriptor {
    pub key: i32,
    pub label: String,
    pub capacity_bytes: u64,
    pub backing_file: String,
    pub snapshot_chain: Vec<String>,
    pub sharing: SharingMode,
    pub disk_mode: DiskMode,
    /// Change id the snapshot reports for this disk, if CBT is enabled.
    pub change_id: Option<String>,
}

/// Check one backing and return `(backing file, snapshot chain)`.
///
/// The chain starts at the snapshot's own delta and walks parent links, so
/// the base disk comes last. It is only used for diagnostics.
pub fn inspect_backing(backing: &DiskBacking) -> Result<(String, Vec<String>)> {
    let file = match backing {
        DiskBacking::RawDeviceMapping { device_name } => {
            return Err(MigrateError::UnsupportedDisk(format!(
                "raw device mapping '{}' cannot be snapshotted",
                device_name
            )));
        }
        DiskBacking::Unknown(kind) => {
            return Err(MigrateError::UnsupportedDisk(format!(
                "unknown backing type '{}'",
                kind
            )));
        }
        DiskBacking::Flat(file) | DiskBacking::SeSparse(file) | DiskBacking::Sparse(file) => file,
    };

    if file.disk_mode.is_independent() {
        return Err(MigrateError::UnsupportedDisk(format!(
            "'{}' is in independent mode and has no snapshot support",
            file.file_name
        )));
    }
    if file.sharing == SharingMode::MultiWriter {
        return Err(MigrateError::UnsupportedDisk(format!(
            "'{}' has multi-writer sharing enabled",
            file.file_name
        )));
    }

    let mut chain = vec![file.file_name.clone()];
    let mut parent = file.parent.as_deref();
    while let Some(p) = parent {
        match p {
            DiskBacking::Flat(f) | DiskBacking::SeSparse(f) | DiskBacking::Sparse(f) => {
                chain.push(f.file_name.clone());
                parent = f.parent.as_deref();
            }
            DiskBacking::RawDeviceMapping { .. } | DiskBacking::Unknown(_) => {
                return Err(MigrateError::UnsupportedDisk(format!(
                    "'{}' has an unsupported parent backing",
                    file.file_name
                )));
            }
        }
    }

    Ok((file.file_name.clone(), chain))
}

/// Classify one hardware device. `Ok(None)` means "not a disk".
pub fn classify(device: &HardwareDevice) -> Result<Option<DiskDescriptor>> {
    let HardwareDevice::VirtualDisk {
        key,
        label,
        capacity_bytes,
        backing,
    } = device
    else {
        return Ok(None);
    };

    let (backing_file, snapshot_chain) = inspect_backing(backing)?;
    let (sharing, disk_mode, change_id) = match backing {
        DiskBacking::Flat(f) | DiskBacking::SeSparse(f) | DiskBacking::Sparse(f) => {
            (f.sharing, f.disk_mode, f.change_id.clone())
        }
        _ => (SharingMode::NoSharing, DiskMode::Persistent, None),
    };

    Ok(Some(DiskDescriptor {
        key: *key,
        label: label.clone(),
        capacity_bytes: *capacity_bytes,
        backing_file,
        snapshot_chain,
        sharing,
        disk_mode,
        change_id,
    }))
}

/// Filter a snapshot's hardware list down to the disks that can be copied.
/// Rejected disks are logged and skipped; they never fail the cycle.
pub fn eligible_disks(devices: &[HardwareDevice]) -> Vec<DiskDescriptor> {
    let mut disks = Vec::new();
    for device in devices {
        match classify(device) {
            Ok(Some(disk)) => {
                log_debug!(
                    "Disk '{}' ({} bytes) chain: {}",
                    disk.label,
                    disk.capacity_bytes,
                    disk.snapshot_chain.join(" <- ")
                );
                disks.push(disk);
            }
            Ok(None) => {}
            Err(e) => log_warn!("Skipping device: {}", e),
        }
    }
    disks
}
