//! Source hypervisor seam and its vSphere implementation.
//!
//! The engine only ever talks to [`Hypervisor`]; [`GovcHypervisor`] drives
//! vCenter through the `govc` CLI the same way the rest of the tooling drives
//! local hypervisors through their CLIs.

use crate::command::{run_checked, stdout_of};
use crate::disk::{DiskBacking, DiskMode, FileBacking, HardwareDevice, SharingMode};
use crate::{MigrateError, Result, log_info, log_warn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::OnceCell;

/// Connection details for the source VM, delivered with each command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescriptor {
    pub endpoint: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub thumbprint: Option<String>,
    #[serde(default)]
    pub datacenter: Option<String>,
    pub vm_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskArea {
    pub start: u64,
    pub length: u64,
}

/// One page of a changed-areas query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedAreas {
    pub start_offset: u64,
    pub length: u64,
    #[serde(default, rename = "changedArea")]
    pub areas: Vec<DiskArea>,
}

impl ChangedAreas {
    pub fn next_start(&self) -> u64 {
        self.start_offset.saturating_add(self.length)
    }
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    fn vm_name(&self) -> &str;

    /// Managed object reference of the VM.
    async fn vm_ref(&self) -> Result<String>;

    /// Create a quiesced, memory-excluded snapshot; returns its reference.
    async fn create_snapshot(&self, name: &str) -> Result<String>;

    async fn remove_snapshot(&self, snapshot_ref: &str, consolidate: bool) -> Result<()>;

    async fn snapshot_devices(&self, snapshot_ref: &str) -> Result<Vec<HardwareDevice>>;

    async fn query_changed_areas(
        &self,
        snapshot_ref: &str,
        disk_key: i32,
        start_offset: u64,
        change_id: &str,
    ) -> Result<ChangedAreas>;

    async fn power_off(&self) -> Result<()>;
}

/// Opens a [`Hypervisor`] for a source descriptor.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(&self, source: &SourceDescriptor) -> Result<Arc<dyn Hypervisor>>;
}

pub struct GovcHypervisor {
    govc: String,
    changed_areas_helper: String,
    source: SourceDescriptor,
    vm_ref: OnceCell<String>,
}

impl GovcHypervisor {
    pub fn new(govc: &str, changed_areas_helper: &str, source: SourceDescriptor) -> Self {
        Self {
            govc: govc.to_string(),
            changed_areas_helper: changed_areas_helper.to_string(),
            source,
            vm_ref: OnceCell::new(),
        }
    }

    fn with_env(&self, cmd: &mut Command) {
        cmd.env("GOVC_URL", &self.source.endpoint)
            .env("GOVC_USERNAME", &self.source.username)
            .env("GOVC_PASSWORD", &self.source.password)
            .env("GOVC_INSECURE", if self.source.insecure { "1" } else { "0" });
        if let Some(dc) = &self.source.datacenter {
            cmd.env("GOVC_DATACENTER", dc);
        }
        cmd.kill_on_drop(true);
    }

    fn govc(&self) -> Command {
        let mut cmd = Command::new(&self.govc);
        self.with_env(&mut cmd);
        cmd
    }

    async fn collect_simple(&self, object: &str, property: &str) -> Result<String> {
        let mut cmd = self.govc();
        cmd.args(["object.collect", "-s", object, property]);
        stdout_of(&mut cmd)
            .await
            .map_err(|e| MigrateError::Hypervisor(format!("collect {}: {}", property, e)))
    }

    pub async fn ping(&self) -> Result<()> {
        let mut cmd = self.govc();
        cmd.arg("about");
        run_checked(&mut cmd).await.map_err(|e| {
            MigrateError::Hypervisor(format!("cannot reach {}: {}", self.source.endpoint, e))
        })?;
        Ok(())
    }
}

#[async_trait]
impl Hypervisor for GovcHypervisor {
    fn vm_name(&self) -> &str {
        &self.source.vm_name
    }

    async fn vm_ref(&self) -> Result<String> {
        let vm_ref = self
            .vm_ref
            .get_or_try_init(|| async {
                let mut cmd = self.govc();
                cmd.args(["find", "-i", "/", "-type", "m", "-name", &self.source.vm_name]);
                let out = stdout_of(&mut cmd).await?;
                out.lines()
                    .next()
                    .map(|line| line.trim().to_string())
                    .filter(|line| !line.is_empty())
                    .ok_or_else(|| {
                        MigrateError::Hypervisor(format!("VM '{}' not found", self.source.vm_name))
                    })
            })
            .await?;
        Ok(vm_ref.clone())
    }

    async fn create_snapshot(&self, name: &str) -> Result<String> {
        let vm_ref = self.vm_ref().await?;
        let mut cmd = self.govc();
        cmd.args([
            "snapshot.create",
            "-vm",
            &self.source.vm_name,
            "-m=false",
            "-q=true",
            name,
        ]);
        run_checked(&mut cmd)
            .await
            .map_err(|e| MigrateError::Snapshot(format!("create '{}': {}", name, e)))?;

        let snapshot_ref = self
            .collect_simple(&vm_ref, "snapshot.currentSnapshot")
            .await
            .map_err(|e| MigrateError::Snapshot(e.to_string()))?;
        if snapshot_ref.is_empty() {
            return Err(MigrateError::Snapshot(format!(
                "snapshot '{}' created but not reported as current",
                name
            )));
        }
        Ok(snapshot_ref)
    }

    async fn remove_snapshot(&self, snapshot_ref: &str, consolidate: bool) -> Result<()> {
        // snapshot.remove matches on the bare moref value.
        let id = snapshot_ref
            .split_once(':')
            .map(|(_, id)| id)
            .unwrap_or(snapshot_ref);
        let mut cmd = self.govc();
        cmd.args([
            "snapshot.remove",
            "-vm",
            &self.source.vm_name,
            &format!("-c={}", consolidate),
            id,
        ]);
        run_checked(&mut cmd)
            .await
            .map_err(|e| MigrateError::Snapshot(format!("remove {}: {}", snapshot_ref, e)))?;
        Ok(())
    }

    async fn snapshot_devices(&self, snapshot_ref: &str) -> Result<Vec<HardwareDevice>> {
        let mut cmd = self.govc();
        cmd.args([
            "object.collect",
            "-json",
            snapshot_ref,
            "config.hardware.device",
        ]);
        let out = stdout_of(&mut cmd).await?;
        let value: Value = serde_json::from_str(&out)?;
        parse_devices(&value)
    }

    async fn query_changed_areas(
        &self,
        snapshot_ref: &str,
        disk_key: i32,
        start_offset: u64,
        change_id: &str,
    ) -> Result<ChangedAreas> {
        let vm_ref = self.vm_ref().await?;
        let mut cmd = Command::new(&self.changed_areas_helper);
        self.with_env(&mut cmd);
        cmd.args(["--vm", &vm_ref, "--snapshot", snapshot_ref])
            .args(["--device-key", &disk_key.to_string()])
            .args(["--start", &start_offset.to_string()])
            .args(["--change-id", change_id]);
        let out = stdout_of(&mut cmd).await.map_err(|e| {
            MigrateError::Hypervisor(format!("changed areas for disk {}: {}", disk_key, e))
        })?;
        Ok(serde_json::from_str(&out)?)
    }

    async fn power_off(&self) -> Result<()> {
        let vm_ref = self.vm_ref().await?;
        let state = self.collect_simple(&vm_ref, "runtime.powerState").await?;
        if state == "poweredOff" {
            log_info!("VM '{}' already powered off", self.source.vm_name);
            return Ok(());
        }

        let mut cmd = self.govc();
        cmd.args(["vm.power", "-off", "-force", &self.source.vm_name]);
        if let Err(e) = run_checked(&mut cmd).await {
            // A guest shutting itself down races the request.
            let state = self.collect_simple(&vm_ref, "runtime.powerState").await?;
            if state != "poweredOff" {
                return Err(MigrateError::Hypervisor(format!("power off: {}", e)));
            }
            log_warn!("Power off reported {}, but VM is off", e);
        }
        Ok(())
    }
}

pub struct GovcConnector {
    govc: String,
    changed_areas_helper: String,
}

impl GovcConnector {
    pub fn new(govc: &str, changed_areas_helper: &str) -> Self {
        Self {
            govc: govc.to_string(),
            changed_areas_helper: changed_areas_helper.to_string(),
        }
    }
}

#[async_trait]
impl SourceConnector for GovcConnector {
    async fn connect(&self, source: &SourceDescriptor) -> Result<Arc<dyn Hypervisor>> {
        let hypervisor = GovcHypervisor::new(&self.govc, &self.changed_areas_helper, source.clone());
        hypervisor.ping().await?;
        log_info!("Connected to {} for VM '{}'", source.endpoint, source.vm_name);
        Ok(Arc::new(hypervisor))
    }
}

fn field<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    let obj = value.as_object()?;
    if let Some(v) = obj.get(name) {
        return Some(v);
    }
    let mut chars = name.chars();
    let capitalised: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => return None,
    };
    obj.get(&capitalised)
}

fn str_field(value: &Value, name: &str) -> Option<String> {
    field(value, name).and_then(Value::as_str).map(str::to_string)
}

fn type_name(value: &Value) -> String {
    str_field(value, "_typeName").unwrap_or_default()
}

/// Find the device array in `object.collect -json` output, whatever envelope
/// the govc version wraps it in.
fn find_device_array(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Array(items)
            if !items.is_empty() && items.iter().all(|i| field(i, "key").is_some()) =>
        {
            Some(items)
        }
        Value::Array(items) => items.iter().find_map(find_device_array),
        Value::Object(map) => map.values().find_map(find_device_array),
        _ => None,
    }
}

fn parse_backing(value: &Value) -> DiskBacking {
    let kind = type_name(value);
    if kind.contains("RawDiskMapping") || field(value, "lunUuid").is_some() {
        return DiskBacking::RawDeviceMapping {
            device_name: str_field(value, "deviceName").unwrap_or_default(),
        };
    }
    let Some(file_name) = str_field(value, "fileName") else {
        return DiskBacking::Unknown(if kind.is_empty() { "unknown".into() } else { kind });
    };

    let file = FileBacking {
        file_name,
        disk_mode: DiskMode::parse(&str_field(value, "diskMode").unwrap_or_default()),
        sharing: SharingMode::parse(&str_field(value, "sharing").unwrap_or_default()),
        change_id: str_field(value, "changeId").filter(|id| !id.is_empty()),
        parent: field(value, "parent")
            .filter(|p| !p.is_null())
            .map(|p| Box::new(parse_backing(p))),
    };

    if kind.contains("SeSparse") {
        DiskBacking::SeSparse(file)
    } else if kind.contains("Sparse") {
        DiskBacking::Sparse(file)
    } else if kind.is_empty() || kind.contains("Flat") {
        DiskBacking::Flat(file)
    } else {
        DiskBacking::Unknown(kind)
    }
}

pub fn parse_devices(value: &Value) -> Result<Vec<HardwareDevice>> {
    let items = find_device_array(value).ok_or_else(|| {
        MigrateError::Hypervisor("no hardware device list in snapshot config".to_string())
    })?;

    let devices = items
        .iter()
        .map(|item| {
            let key = field(item, "key").and_then(Value::as_i64).unwrap_or_default() as i32;
            let label = field(item, "deviceInfo")
                .and_then(|info| str_field(info, "label"))
                .unwrap_or_else(|| format!("device {}", key));
            let is_disk = type_name(item) == "VirtualDisk"
                || (type_name(item).is_empty() && field(item, "capacityInBytes").is_some());

            match (is_disk, field(item, "backing")) {
                (true, Some(backing)) => HardwareDevice::VirtualDisk {
                    key,
                    label,
                    capacity_bytes: field(item, "capacityInBytes")
                        .and_then(Value::as_u64)
                        .unwrap_or_default(),
                    backing: parse_backing(backing),
                },
                _ => HardwareDevice::Other { key, label },
            }
        })
        .collect();
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_collect_output() {
        let doc = json!([{
            "name": "config.hardware.device",
            "val": {
                "_typeName": "ArrayOfVirtualDevice",
                "_value": [
                    {
                        "_typeName": "VirtualDisk",
                        "key": 2000,
                        "deviceInfo": {"label": "Hard disk 1"},
                        "capacityInBytes": 10737418240u64,
                        "backing": {
                            "_typeName": "VirtualDiskFlatVer2BackingInfo",
                            "fileName": "[ds1] web/web-000001.vmdk",
                            "diskMode": "persistent",
                            "sharing": "sharingNone",
                            "changeId": "52 aa/7",
                            "parent": {
                                "_typeName": "VirtualDiskFlatVer2BackingInfo",
                                "fileName": "[ds1] web/web.vmdk",
                                "diskMode": "persistent"
                            }
                        }
                    },
                    {
                        "_typeName": "VirtualDisk",
                        "key": 2001,
                        "deviceInfo": {"label": "Hard disk 2"},
                        "capacityInBytes": 1024,
                        "backing": {
                            "_typeName": "VirtualDiskRawDiskMappingVer1BackingInfo",
                            "deviceName": "vml.02000",
                            "lunUuid": "0200"
                        }
                    },
                    {
                        "_typeName": "VirtualE1000",
                        "key": 4000,
                        "deviceInfo": {"label": "Network adapter 1"}
                    }
                ]
            }
        }]);

        let devices = parse_devices(&doc).unwrap();
        assert_eq!(devices.len(), 3);
        match &devices[0] {
            HardwareDevice::VirtualDisk {
                key,
                capacity_bytes,
                backing: DiskBacking::Flat(file),
                ..
            } => {
                assert_eq!(*key, 2000);
                assert_eq!(*capacity_bytes, 10 << 30);
                assert_eq!(file.change_id.as_deref(), Some("52 aa/7"));
                assert!(file.parent.is_some());
            }
            other => panic!("unexpected device {:?}", other),
        }
        assert!(matches!(
            devices[1],
            HardwareDevice::VirtualDisk {
                backing: DiskBacking::RawDeviceMapping { .. },
                ..
            }
        ));
        assert!(matches!(devices[2], HardwareDevice::Other { key: 4000, .. }));
    }

    #[test]
    fn changed_areas_json_shape() {
        let areas: ChangedAreas = serde_json::from_str(
            r#"{"startOffset": 0, "length": 4096, "changedArea": [{"start": 512, "length": 1024}]}"#,
        )
        .unwrap();
        assert_eq!(areas.next_start(), 4096);
        assert_eq!(areas.areas, vec![DiskArea { start: 512, length: 1024 }]);
    }
}
