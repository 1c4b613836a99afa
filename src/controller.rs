//! The worker's channel to its controller: command polling, status pushes
//! and the artifact index.

use crate::hypervisor::SourceDescriptor;
use crate::{MigrateError, Result, log_debug};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    Idle,
    ImportDisks,
    FinalizeImport,
    PostImport,
    #[serde(other)]
    Unknown,
}

/// Guest details the controller knows about the VM being migrated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OsHints {
    pub os: String,
    pub arch: String,
    pub version: String,
    pub guest_conversion: bool,
    /// Label of the boot disk, when the controller knows it.
    pub root_disk: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationCommand {
    pub kind: CommandKind,
    #[serde(default)]
    pub source: Option<SourceDescriptor>,
    #[serde(default)]
    pub os_hints: OsHints,
    #[serde(default)]
    pub location_ref: String,
}

impl MigrationCommand {
    pub fn idle() -> Self {
        Self {
            kind: CommandKind::Idle,
            source: None,
            os_hints: OsHints::default(),
            location_ref: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub phase: Phase,
    pub message: String,
    #[serde(default)]
    pub important: bool,
}

impl WorkerStatus {
    pub fn running(message: impl Into<String>, important: bool) -> Self {
        Self {
            phase: Phase::Running,
            message: message.into(),
            important,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            phase: Phase::Success,
            message: message.into(),
            important: true,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            phase: Phase::Failed,
            message: message.into(),
            important: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    SdkBundle,
    DriverPackage,
    OsImage,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ArtifactKind::SdkBundle => "sdk-bundle",
            ArtifactKind::DriverPackage => "driver-package",
            ArtifactKind::OsImage => "os-image",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub versions: Vec<String>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub files: Vec<String>,
    /// File (or path inside an unpacked archive) that must exist locally
    /// for a cached copy to count as present.
    #[serde(default)]
    pub required_file_name: Option<String>,
}

#[async_trait]
pub trait Controller: Send + Sync {
    /// Next command for this worker's VM; `Idle` when there is nothing to do.
    async fn next_command(&self) -> Result<MigrationCommand>;

    async fn push_status(&self, status: &WorkerStatus) -> Result<()>;

    async fn list_artifacts(&self) -> Result<Vec<Artifact>>;

    async fn download_file(&self, artifact_id: &str, file_name: &str, dest: &Path) -> Result<()>;
}

pub struct HttpController {
    client: Client,
    base_url: Url,
    vm_id: String,
    token: Option<String>,
}

impl HttpController {
    pub fn new(url: &str, vm_id: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let base_url: Url = url
            .parse()
            .map_err(|e| MigrateError::Config(format!("invalid controller URL '{}': {}", url, e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MigrateError::Controller(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url,
            vm_id: vm_id.to_string(),
            token,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        format!("{}/api/v1/{}", base, path)
            .parse()
            .map_err(|e| MigrateError::Controller(format!("bad endpoint '{}': {}", path, e)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn expect_success(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(MigrateError::Controller(format!(
            "{} returned {}: {}",
            what,
            status,
            body.trim()
        )))
    }
}

#[async_trait]
impl Controller for HttpController {
    async fn next_command(&self) -> Result<MigrationCommand> {
        let url = self.endpoint(&format!("workers/{}/command", self.vm_id))?;
        let response = self.authorize(self.client.get(url)).send().await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(MigrationCommand::idle());
        }
        let response = Self::expect_success(response, "command poll").await?;
        let command: MigrationCommand = response.json().await?;
        log_debug!("Polled command {:?}", command.kind);
        Ok(command)
    }

    async fn push_status(&self, status: &WorkerStatus) -> Result<()> {
        let url = self.endpoint(&format!("workers/{}/status", self.vm_id))?;
        let response = self
            .authorize(self.client.post(url))
            .json(status)
            .send()
            .await?;
        Self::expect_success(response, "status push").await?;
        Ok(())
    }

    async fn list_artifacts(&self) -> Result<Vec<Artifact>> {
        let url = self.endpoint("artifacts")?;
        let response = self.authorize(self.client.get(url)).send().await?;
        let response = Self::expect_success(response, "artifact index").await?;
        Ok(response.json().await?)
    }

    async fn download_file(&self, artifact_id: &str, file_name: &str, dest: &Path) -> Result<()> {
        let url = self.endpoint(&format!("artifacts/{}/files/{}", artifact_id, file_name))?;
        let response = self.authorize(self.client.get(url)).send().await?;
        let response =
            Self::expect_success(response, &format!("download of {}/{}", artifact_id, file_name))
                .await?;
        let bytes = response.bytes().await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }
}
