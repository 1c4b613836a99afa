//! Disk change tokens (`<lineage>/<sequence>`) and the sidecar files that
//! remember the last token successfully copied to each target disk.

use crate::{MigrateError, Result, log_debug};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeToken {
    pub lineage_id: String,
    pub sequence: String,
    pub raw: String,
}

impl ChangeToken {
    /// Parse a raw token. The lineage itself may contain spaces (vSphere
    /// prints it as space separated hex pairs), so split on the last `/`.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let (lineage, sequence) = trimmed
            .rsplit_once('/')
            .ok_or_else(|| MigrateError::Serde(format!("malformed change id '{}'", trimmed)))?;

        if lineage.trim().is_empty() || sequence.is_empty() {
            return Err(MigrateError::Serde(format!(
                "malformed change id '{}'",
                trimmed
            )));
        }
        if !sequence.chars().all(|c| c.is_ascii_digit()) {
            return Err(MigrateError::Serde(format!(
                "change id '{}' has a non-numeric sequence",
                trimmed
            )));
        }

        Ok(Self {
            lineage_id: lineage.trim().to_string(),
            sequence: sequence.to_string(),
            raw: trimmed.to_string(),
        })
    }

    /// Two tokens can be compared incrementally only within one lineage.
    pub fn is_continuous_with(&self, other: &ChangeToken) -> bool {
        self.lineage_id == other.lineage_id
    }
}

impl fmt::Display for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.lineage_id, self.sequence)
    }
}

/// Outcome of reading a persisted token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistedToken {
    Absent,
    Invalid(String),
    Valid(ChangeToken),
}

impl PersistedToken {
    pub fn from_raw(raw: Option<String>) -> Self {
        match raw {
            None => PersistedToken::Absent,
            Some(raw) => match ChangeToken::parse(&raw) {
                Ok(token) => PersistedToken::Valid(token),
                Err(_) => PersistedToken::Invalid(raw),
            },
        }
    }

    pub fn valid(&self) -> Option<&ChangeToken> {
        match self {
            PersistedToken::Valid(token) => Some(token),
            _ => None,
        }
    }
}

/// Turn a disk label such as `Hard disk 1` into `hard-disk-1`.
pub fn disk_slug(label: &str) -> String {
    let mut slug = String::with_capacity(label.len());
    let mut last_dash = true;
    for c in label.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("disk");
    }
    slug
}

/// Sidecar files under a state directory, one per target disk.
#[derive(Debug, Clone)]
pub struct ChangeIdStore {
    state_dir: PathBuf,
}

impl ChangeIdStore {
    pub fn new<P: AsRef<Path>>(state_dir: P) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, disk_label: &str) -> PathBuf {
        self.state_dir
            .join(format!("{}.changeid", disk_slug(disk_label)))
    }

    pub fn read_raw(&self, disk_label: &str) -> Result<Option<String>> {
        let path = self.path_for(disk_label);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn read(&self, disk_label: &str) -> Result<PersistedToken> {
        Ok(PersistedToken::from_raw(self.read_raw(disk_label)?))
    }

    /// Replace the sidecar atomically; an empty `raw` deliberately stores an
    /// invalid token so the next cycle takes the full-copy path.
    pub fn write(&self, disk_label: &str, raw: &str) -> Result<()> {
        let path = self.path_for(disk_label);
        self.write_atomic(&path, raw)?;
        log_debug!("Persisted change id '{}' to {}", raw, path.display());
        Ok(())
    }

    pub fn root_path(&self) -> PathBuf {
        self.state_dir.join("root-disk")
    }

    /// Label of the boot disk last synced into this state directory.
    pub fn read_root_label(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.root_path()) {
            Ok(contents) => {
                let label = contents.trim();
                Ok((!label.is_empty()).then(|| label.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_root_label(&self, label: &str) -> Result<()> {
        self.write_atomic(&self.root_path(), label)
    }

    fn write_atomic(&self, path: &Path, contents: &str) -> Result<()> {
        fs::create_dir_all(&self.state_dir)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        if let Ok(dir) = fs::File::open(&self.state_dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}
