use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Serde(String),
    #[error("Hypervisor error: {0}")]
    Hypervisor(String),
    #[error("Snapshot error: {0}")]
    Snapshot(String),
    #[error("Export session error: {0}")]
    Export(String),
    #[error("Export for disk '{disk}' not ready after {timeout:?}")]
    ExportTimeout { disk: String, timeout: Duration },
    #[error("NBD protocol error: {0}")]
    Nbd(String),
    #[error("Target error: {0}")]
    Target(String),
    #[error("Target connect failed: {0}")]
    TargetConnect(String),
    #[error("Copy failed: {0}")]
    Copy(String),
    #[error("Guest conversion failed: {0}")]
    Conversion(String),
    #[error("Post-import task failed: {0}")]
    PostImport(String),
    #[error("Controller error: {0}")]
    Controller(String),
    #[error("Artifact error: {0}")]
    Artifact(String),
    #[error("Unsupported disk: {0}")]
    UnsupportedDisk(String),
    #[error("'{program}' exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("Disk '{disk}': {source}")]
    Disk {
        disk: String,
        #[source]
        source: Box<MigrateError>,
    },
    #[error("Interrupted")]
    Interrupted,
}

impl MigrateError {
    /// Attach the disk label an error happened on.
    pub fn for_disk(self, disk: &str) -> Self {
        match self {
            MigrateError::Disk { .. } => self,
            other => MigrateError::Disk {
                disk: disk.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Errors that abort the whole disk-import instruction regardless of
    /// which disk was being processed.
    pub fn is_fatal_to_cycle(&self) -> bool {
        match self {
            MigrateError::Snapshot(_)
            | MigrateError::ExportTimeout { .. }
            | MigrateError::Export(_)
            | MigrateError::TargetConnect(_) => true,
            MigrateError::Disk { source, .. } => source.is_fatal_to_cycle(),
            _ => false,
        }
    }
}

impl From<toml::de::Error> for MigrateError {
    fn from(err: toml::de::Error) -> Self {
        MigrateError::Serde(err.to_string())
    }
}

impl From<serde_json::Error> for MigrateError {
    fn from(err: serde_json::Error) -> Self {
        MigrateError::Serde(err.to_string())
    }
}

impl From<reqwest::Error> for MigrateError {
    fn from(err: reqwest::Error) -> Self {
        MigrateError::Controller(err.to_string())
    }
}

impl From<semver::Error> for MigrateError {
    fn from(err: semver::Error) -> Self {
        MigrateError::Artifact(format!("invalid version: {}", err))
    }
}

impl From<nix::Error> for MigrateError {
    fn from(err: nix::Error) -> Self {
        MigrateError::Io(std::io::Error::from(err))
    }
}
