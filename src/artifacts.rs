//! Local cache of controller-hosted artifacts (SDK bundles, driver
//! packages, OS images).

use crate::controller::{Artifact, ArtifactKind, Controller};
use crate::{MigrateError, Result, log_debug, log_info, log_warn};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use semver::Version;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// What the caller needs from an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactCriteria {
    pub os: String,
    pub arch: String,
    /// Requested version; only major.minor has to match.
    pub version: String,
}

/// A fetched artifact on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifact {
    /// Directory holding the artifact's files, archives already unpacked.
    pub dir: PathBuf,
    /// `dir/<requiredFileName>` when the artifact names one, else `dir`.
    pub path: PathBuf,
    /// Downloaded by this fetch rather than reused.
    pub refreshed: bool,
}

/// Parse versions such as `8`, `8.0` or `8.0.3-beta`.
pub fn parse_version(raw: &str) -> Result<Version> {
    let raw = raw.trim().trim_start_matches('v');
    let core_len = raw.find(['-', '+']).unwrap_or(raw.len());
    let dots = raw[..core_len].matches('.').count();
    let padded = match dots {
        0 => format!("{}.0.0{}", &raw[..core_len], &raw[core_len..]),
        1 => format!("{}.0{}", &raw[..core_len], &raw[core_len..]),
        _ => raw.to_string(),
    };
    Ok(Version::parse(&padded)?)
}

pub fn version_matches(requested: &str, offered: &str) -> bool {
    match (parse_version(requested), parse_version(offered)) {
        (Ok(want), Ok(have)) => want.major == have.major && want.minor == have.minor,
        _ => false,
    }
}

fn matches(artifact: &Artifact, kind: ArtifactKind, criteria: &ArtifactCriteria) -> bool {
    artifact.kind == kind
        && (criteria.os.is_empty() || artifact.os.eq_ignore_ascii_case(&criteria.os))
        && (criteria.arch.is_empty()
            || artifact
                .architectures
                .iter()
                .any(|a| a.eq_ignore_ascii_case(&criteria.arch)))
        && (criteria.version.is_empty()
            || artifact
                .versions
                .iter()
                .any(|v| version_matches(&criteria.version, v)))
}

/// Pick the matching artifact; the most recently updated one wins.
pub fn select<'a>(
    artifacts: &'a [Artifact],
    kind: ArtifactKind,
    criteria: &ArtifactCriteria,
) -> Result<&'a Artifact> {
    artifacts
        .iter()
        .filter(|a| matches(a, kind, criteria))
        .max_by_key(|a| a.last_updated)
        .ok_or_else(|| {
            MigrateError::Artifact(format!(
                "no {} for os={} arch={} version={}",
                kind, criteria.os, criteria.arch, criteria.version
            ))
        })
}

/// A controller-supplied file name must be a single plain path component.
pub fn checked_file_name(name: &str) -> Result<&Path> {
    let path = Path::new(name);
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(path),
        _ => Err(MigrateError::Artifact(format!(
            "refusing artifact file name '{}'",
            name
        ))),
    }
}

/// A relative path below the artifact directory, e.g. `lib64/libvixDiskLib.so`.
fn checked_relative(name: &str) -> Result<&Path> {
    let path = Path::new(name);
    let plain = path.components().all(|c| matches!(c, Component::Normal(_)));
    if name.is_empty() || !plain {
        return Err(MigrateError::Artifact(format!(
            "refusing required file name '{}'",
            name
        )));
    }
    Ok(path)
}

pub fn is_tarball(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    [".tar", ".tar.gz", ".tgz"]
        .iter()
        .any(|ext| name.ends_with(ext))
}

/// Unpack a plain or gzip-compressed tarball into `dest`. Entries that
/// would escape `dest` are skipped by `unpack_in`.
pub fn unpack_tarball(archive: &Path, dest: &Path) -> Result<()> {
    let mut file = File::open(archive)?;
    let mut magic = [0u8; 2];
    let gzipped = file.read(&mut magic)? == magic.len() && magic == [0x1f, 0x8b];
    file.seek(SeekFrom::Start(0))?;

    let reader: Box<dyn Read> = if gzipped {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut tar = tar::Archive::new(reader);
    for entry in tar.entries()? {
        let mut entry = entry?;
        if !entry.unpack_in(dest)? {
            log_warn!(
                "Skipped archive entry outside {}: {}",
                dest.display(),
                entry.path()?.display()
            );
        }
    }
    Ok(())
}

pub struct ArtifactCache {
    controller: Arc<dyn Controller>,
    cache_dir: PathBuf,
    last_updates: HashMap<ArtifactKind, (String, DateTime<Utc>)>,
}

impl ArtifactCache {
    pub fn new(controller: Arc<dyn Controller>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            controller,
            cache_dir: cache_dir.into(),
            last_updates: HashMap::new(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn dir_for(&self, kind: ArtifactKind) -> PathBuf {
        self.cache_dir.join(kind.to_string())
    }

    /// Make the matching artifact available locally, downloading it when
    /// the controller's copy changed or the local one is incomplete.
    pub async fn fetch(
        &mut self,
        kind: ArtifactKind,
        criteria: &ArtifactCriteria,
    ) -> Result<LocalArtifact> {
        let index = self.controller.list_artifacts().await?;
        let artifact = select(&index, kind, criteria)?;
        let required = artifact
            .required_file_name
            .as_deref()
            .map(checked_relative)
            .transpose()?;
        let dir = self.dir_for(kind);
        let path = required.map_or_else(|| dir.clone(), |r| dir.join(r));

        let seen = self
            .last_updates
            .get(&kind)
            .is_some_and(|(id, at)| *id == artifact.id && *at == artifact.last_updated);
        let present = match required {
            Some(_) => path.exists(),
            None => fs::read_dir(&dir).is_ok_and(|mut entries| entries.next().is_some()),
        };
        if seen && present {
            log_debug!("Artifact {} unchanged, using {}", artifact.id, dir.display());
            return Ok(LocalArtifact {
                dir,
                path,
                refreshed: false,
            });
        }

        log_info!(
            "Downloading {} artifact {} ({} file(s), updated {})",
            kind,
            artifact.id,
            artifact.files.len(),
            artifact.last_updated
        );
        let staging = self.cache_dir.join(format!(".{}.partial", kind));
        let downloads = self.cache_dir.join(format!(".{}.download", kind));
        for scratch in [&staging, &downloads] {
            remove_dir_if_present(scratch)?;
            fs::create_dir_all(scratch)?;
        }

        let staged = self.stage(artifact, &downloads, &staging).await;
        if let Err(e) = remove_dir_if_present(&downloads) {
            log_warn!("Cannot remove {}: {}", downloads.display(), e);
        }
        if let Err(e) = staged {
            let _ = remove_dir_if_present(&staging);
            return Err(e);
        }

        remove_dir_if_present(&dir)?;
        fs::rename(&staging, &dir)?;
        self.last_updates
            .insert(kind, (artifact.id.clone(), artifact.last_updated));
        Ok(LocalArtifact {
            dir,
            path,
            refreshed: true,
        })
    }

    /// Download every file of `artifact`, unpacking tarballs into `staging`
    /// and moving anything else there as is.
    async fn stage(&self, artifact: &Artifact, downloads: &Path, staging: &Path) -> Result<()> {
        for file in &artifact.files {
            let name = checked_file_name(file)?;
            let downloaded = downloads.join(name);
            self.controller
                .download_file(&artifact.id, file, &downloaded)
                .await
                .map_err(|e| {
                    MigrateError::Artifact(format!(
                        "download of {}/{} failed: {}",
                        artifact.id, file, e
                    ))
                })?;

            if is_tarball(file) {
                log_debug!("Unpacking {} into {}", file, staging.display());
                let dest = staging.to_path_buf();
                tokio::task::spawn_blocking(move || unpack_tarball(&downloaded, &dest))
                    .await
                    .map_err(|e| MigrateError::Artifact(format!("unpacking {} aborted: {}", file, e)))?
                    .map_err(|e| {
                        MigrateError::Artifact(format!(
                            "unpacking {}/{} failed: {}",
                            artifact.id, file, e
                        ))
                    })?;
            } else {
                fs::rename(&downloaded, staging.join(name))?;
            }
        }

        if let Some(required) = &artifact.required_file_name {
            if !staging.join(required).exists() {
                return Err(MigrateError::Artifact(format!(
                    "{} does not provide {}",
                    artifact.id, required
                )));
            }
        }
        Ok(())
    }

    /// Best-effort removal of every cached artifact.
    pub fn purge(&mut self) {
        self.last_updates.clear();
        purge_dir(&self.cache_dir);
    }
}

fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Remove the contents of `cache_dir`, logging rather than failing.
pub fn purge_dir(cache_dir: &Path) {
    let entries = match fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            log_warn!("Cannot read artifact cache {}: {}", cache_dir.display(), e);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(e) = result {
            log_warn!("Cannot remove cached artifact {}: {}", path.display(), e);
        }
    }
}
