//! Guest conversion of the copied root disk.

use crate::command::run_checked;
use crate::{MigrateError, Result, log_info};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Token written after conversion. It never parses, so the next cycle
/// copies the whole disk again.
pub const POST_CONVERSION_TOKEN: &str = "";

#[async_trait]
pub trait GuestConverter: Send + Sync {
    /// Convert the guest on `target_path` in place. `drivers` points at an
    /// unpacked driver package when one is cached.
    async fn convert(&self, target_path: &Path, drivers: Option<&Path>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct VirtV2vInPlace {
    pub binary: String,
    pub verbose: bool,
}

impl VirtV2vInPlace {
    pub fn build_command(&self, target_path: &Path, drivers: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-i").arg("disk");
        if self.verbose {
            cmd.arg("-v").arg("-x");
        }
        cmd.arg(target_path);
        if let Some(drivers) = drivers {
            cmd.env("VIRTIO_WIN", drivers);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl GuestConverter for VirtV2vInPlace {
    async fn convert(&self, target_path: &Path, drivers: Option<&Path>) -> Result<()> {
        log_info!("Converting guest on {}", target_path.display());
        let mut cmd = self.build_command(target_path, drivers);
        run_checked(&mut cmd).await.map_err(|e| match e {
            MigrateError::CommandFailed { status, stderr, .. } => {
                MigrateError::Conversion(format!("{} exited with {}: {}", self.binary, status, stderr))
            }
            other => MigrateError::Conversion(other.to_string()),
        })?;
        log_info!("Guest conversion of {} finished", target_path.display());
        Ok(())
    }
}
