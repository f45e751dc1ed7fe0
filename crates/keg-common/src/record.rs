//! Persisted container records.
//!
//! One JSON file per container, keyed by container name, under the
//! runtime directory. The record is the only link between a running
//! container and later `stop`/`rm`/`exec` invocations.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KegError, KegResult};
use crate::id::ContainerId;
use crate::paths::{LOG_FILE, RECORD_FILE};

/// Container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// The init process has been started.
    Running,
    /// Stopped through `keg stop`.
    Stopped,
    /// The process exited on its own.
    Exited,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Identity and runtime facts of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Host PID of the container init, -1 once stopped.
    pub pid: i32,
    /// Content-derived container ID.
    pub id: String,
    /// Human name, defaults to the ID.
    pub name: String,
    /// Creation time.
    pub create_at: DateTime<Utc>,
    /// Original command line, space-joined.
    pub command: String,
    /// Current status.
    pub status: ContainerStatus,
    /// Volume specs (`host:container`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume: Vec<String>,
    /// Image the workspace was built from.
    pub image: String,
    /// Exposed port specs (`host:container`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port: Vec<String>,
    /// Assigned address as `a.b.c.d/prefix`, set after network connect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Network the container is attached to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

impl ContainerRecord {
    /// Create a running record for a freshly spawned container.
    ///
    /// An empty `name` falls back to the ID.
    #[must_use]
    pub fn new(
        id: &ContainerId,
        name: &str,
        pid: i32,
        image: &str,
        command: &[String],
        volume: &[String],
        port: &[String],
    ) -> Self {
        let name = if name.is_empty() {
            id.to_string()
        } else {
            name.to_string()
        };
        Self {
            pid,
            id: id.to_string(),
            name,
            create_at: Utc::now(),
            command: command.join(" "),
            status: ContainerStatus::Running,
            volume: volume.to_vec(),
            image: image.to_string(),
            port: port.to_vec(),
            ip: None,
            network: None,
        }
    }

    /// Transition to stopped: status `stopped`, PID cleared to -1.
    pub fn mark_stopped(&mut self) {
        self.status = ContainerStatus::Stopped;
        self.pid = -1;
    }

    /// Record the network attachment.
    pub fn set_network(&mut self, ip: impl Into<String>, network: impl Into<String>) {
        self.ip = Some(ip.into());
        self.network = Some(network.into());
    }

    /// Forget the network attachment.
    pub fn clear_network(&mut self) {
        self.ip = None;
        self.network = None;
    }
}

/// Check that `name` can be used as a single path component.
///
/// # Errors
///
/// Returns [`KegError::Config`] for an empty name, `.`, `..`, or a name
/// containing `/` or a NUL byte.
pub fn validate_name(name: &str) -> KegResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(KegError::Config {
            message: format!("invalid container name {name:?}"),
        });
    }
    Ok(())
}

/// Manages container record persistence.
#[derive(Debug, Clone)]
pub struct RecordStore {
    /// Directory holding one sub-directory per container.
    dir: PathBuf,
}

impl RecordStore {
    /// Create a record store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of a container's record file.
    #[must_use]
    pub fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(name).join(RECORD_FILE)
    }

    /// Path of a container's log file.
    #[must_use]
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.dir.join(name).join(LOG_FILE)
    }

    /// Save a record, creating its directory when needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self, record: &ContainerRecord) -> KegResult<()> {
        validate_name(&record.name)?;
        let path = self.record_path(&record.name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(&path, json)?;

        tracing::debug!(
            container = %record.name,
            path = %path.display(),
            "Saved container record"
        );
        Ok(())
    }

    /// Load a record by container name.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::ContainerNotFound`] when no record exists, or
    /// [`KegError::Config`] for a name that is not a plain path component.
    pub fn load(&self, name: &str) -> KegResult<ContainerRecord> {
        validate_name(name)?;
        let path = self.record_path(name);
        if !path.exists() {
            return Err(KegError::ContainerNotFound {
                name: name.to_string(),
            });
        }
        Self::read(&path)
    }

    fn read(path: &Path) -> KegResult<ContainerRecord> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Delete a container's runtime directory (record and log).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn delete(&self, name: &str) -> KegResult<()> {
        validate_name(name)?;
        let dir = self.dir.join(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            tracing::debug!(container = %name, path = %dir.display(), "Deleted container record");
        }
        Ok(())
    }

    /// List all readable records.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directory cannot be read.
    pub fn list(&self) -> KegResult<Vec<ContainerRecord>> {
        let mut records = Vec::new();
        if !self.dir.exists() {
            return Ok(records);
        }

        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path().join(RECORD_FILE);
            if !path.is_file() {
                continue;
            }
            match Self::read(&path) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable record");
                }
            }
        }

        records.sort_by(|a, b| a.create_at.cmp(&b.create_at));
        Ok(records)
    }

    /// Check if a record exists.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        validate_name(name).is_ok() && self.record_path(name).exists()
    }
}
