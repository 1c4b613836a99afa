use crate::post_import::PostImportScript;
use crate::{MigrateError, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vmshift/worker.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub worker: LoopConfig,
    #[serde(default)]
    pub hypervisor: HypervisorConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub copy: CopyConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub post_import: PostImportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub url: String,
    /// Bearer token sent with every request
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub vm_id: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: None,
            vm_id: String::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Sleep between polls when there is nothing to do
    #[serde(default = "default_idle_interval")]
    pub idle_interval_secs: u64,
    /// Minimum gap between non-important status pushes
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            idle_interval_secs: default_idle_interval(),
            status_interval_secs: default_status_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorConfig {
    #[serde(default = "default_govc")]
    pub govc_binary: String,
    #[serde(default = "default_changed_areas_helper")]
    pub changed_areas_helper: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            govc_binary: default_govc(),
            changed_areas_helper: default_changed_areas_helper(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_nbdkit")]
    pub nbdkit_binary: String,
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            nbdkit_binary: default_nbdkit(),
            socket_dir: default_socket_dir(),
            compression: default_compression(),
            ready_timeout_secs: default_ready_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyConfig {
    #[serde(default = "default_nbdcopy")]
    pub nbdcopy_binary: String,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            nbdcopy_binary: default_nbdcopy(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_device_dir")]
    pub device_dir: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            device_dir: default_device_dir(),
            state_dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    #[serde(default = "default_conversion_binary")]
    pub binary: String,
    #[serde(default)]
    pub verbose: bool,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            binary: default_conversion_binary(),
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_sdk_os")]
    pub sdk_os: String,
    #[serde(default = "default_sdk_arch")]
    pub sdk_arch: String,
    #[serde(default = "default_sdk_version")]
    pub sdk_version: String,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            sdk_os: default_sdk_os(),
            sdk_arch: default_sdk_arch(),
            sdk_version: default_sdk_version(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostImportConfig {
    #[serde(default)]
    pub scripts: Vec<PostImportScript>,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_idle_interval() -> u64 {
    10
}

fn default_status_interval() -> u64 {
    5
}

fn default_govc() -> String {
    "govc".to_string()
}

fn default_changed_areas_helper() -> String {
    "vmshift-cbt".to_string()
}

fn default_nbdkit() -> String {
    "nbdkit".to_string()
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/run/vmshift")
}

fn default_compression() -> String {
    "skipz".to_string()
}

fn default_ready_timeout() -> u64 {
    10
}

fn default_nbdcopy() -> String {
    "nbdcopy".to_string()
}

fn default_device_dir() -> PathBuf {
    PathBuf::from("/dev/disk/by-vmshift")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/vmshift/state")
}

fn default_conversion_binary() -> String {
    "virt-v2v-in-place".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/cache/vmshift/artifacts")
}

fn default_sdk_os() -> String {
    "linux".to_string()
}

fn default_sdk_arch() -> String {
    "x86_64".to_string()
}

fn default_sdk_version() -> String {
    "8.0".to_string()
}

impl WorkerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self> {
        let config: WorkerConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Checks that need to hold before the worker loop can start.
    pub fn validate(&self) -> Result<()> {
        if self.controller.url.trim().is_empty() {
            return Err(MigrateError::Config("controller.url is required".to_string()));
        }
        self.controller.url.parse::<Url>().map_err(|e| {
            MigrateError::Config(format!("controller.url '{}': {}", self.controller.url, e))
        })?;
        if self.controller.vm_id.trim().is_empty() {
            return Err(MigrateError::Config("controller.vm_id is required".to_string()));
        }
        for (name, value) in [
            ("controller.request_timeout_secs", self.controller.request_timeout_secs),
            ("worker.idle_interval_secs", self.worker.idle_interval_secs),
            ("worker.status_interval_secs", self.worker.status_interval_secs),
            ("export.ready_timeout_secs", self.export.ready_timeout_secs),
        ] {
            if value == 0 {
                return Err(MigrateError::Config(format!("{} must be greater than 0", name)));
            }
        }
        Ok(())
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.worker.idle_interval_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.worker.status_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.controller.request_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.export.ready_timeout_secs)
    }
}
