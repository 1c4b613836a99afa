//! Guest-side steps that run against the imported root disk.

use crate::command::run_checked;
use crate::{MigrateError, Result, log_info};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

#[async_trait]
pub trait PostImport: Send + Sync {
    /// Run every task against `root_target`. A dry run validates without
    /// committing changes to the guest.
    async fn run(&self, root_target: &Path, dry_run: bool) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostImportScript {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl PostImportScript {
    pub fn build_command(&self, root_target: &Path, dry_run: bool) -> Command {
        let mut cmd = Command::new(&self.command);
        if dry_run {
            cmd.arg("--dry-run");
        }
        cmd.args(&self.args)
            .arg(root_target)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

/// Configured scripts, run in order; the first failure stops the rest.
#[derive(Debug, Clone, Default)]
pub struct ScriptTasks {
    pub scripts: Vec<PostImportScript>,
}

impl ScriptTasks {
    pub fn new(scripts: Vec<PostImportScript>) -> Self {
        Self { scripts }
    }
}

#[async_trait]
impl PostImport for ScriptTasks {
    async fn run(&self, root_target: &Path, dry_run: bool) -> Result<()> {
        let mode = if dry_run { "dry run" } else { "apply" };
        for script in &self.scripts {
            log_info!(
                "Post-import task '{}' ({}) on {}",
                script.name,
                mode,
                root_target.display()
            );
            let mut cmd = script.build_command(root_target, dry_run);
            run_checked(&mut cmd)
                .await
                .map_err(|e| MigrateError::PostImport(format!("'{}': {}", script.name, e)))?;
        }
        Ok(())
    }
}
