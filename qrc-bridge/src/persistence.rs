//! Snapshot persistence for cached control state
//!
//! Snapshots are JSON or JSONL (a header line followed by one line per
//! control), optionally gzipped. Writes are atomic: the snapshot lands in a
//! `.tmp` sibling and is renamed over the target, with the previous target
//! rotated into timestamped backups. Restore falls back to the most recent
//! valid backup when the target is missing or corrupt.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::ControlState;

/// Snapshot schema version
pub const SNAPSHOT_VERSION: &str = "1.0.0";

/// Default number of rotated backups kept
pub const DEFAULT_BACKUP_COUNT: usize = 3;

/// On-disk snapshot encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    /// One JSON document
    Json,
    /// Newline-framed: header line, then one line per control
    JsonLines,
}

/// Snapshot store configuration
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Target file
    pub path: PathBuf,
    /// Encoding
    pub format: SnapshotFormat,
    /// Gzip the payload
    pub gzip: bool,
    /// Rotated backups to keep
    pub backup_count: usize,
}

impl SnapshotConfig {
    /// JSON snapshot at `path` with default rotation
    pub fn json(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: SnapshotFormat::Json,
            gzip: false,
            backup_count: DEFAULT_BACKUP_COUNT,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonSnapshot {
    version: String,
    timestamp: String,
    control_count: usize,
    controls: HashMap<String, ControlState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum JsonlLine {
    /// First line of a JSONL snapshot
    Header {
        version: String,
        timestamp: String,
        control_count: usize,
    },
    /// One control entry
    Control { name: String, state: ControlState },
}

/// Reads and writes control-state snapshots
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    config: SnapshotConfig,
}

impl SnapshotStore {
    /// Store writing to the configured target
    pub fn new(config: SnapshotConfig) -> Self {
        Self { config }
    }

    /// The snapshot target path
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Write a snapshot atomically, rotating the previous target into a
    /// backup first
    pub async fn persist(&self, controls: &HashMap<String, ControlState>) -> Result<()> {
        let payload = self.encode(controls)?;
        let tmp = self.tmp_path();

        if let Some(parent) = self.config.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    Error::Persistence(format!("cannot create snapshot directory: {}", e))
                })?;
            }
        }

        tokio::fs::write(&tmp, &payload)
            .await
            .map_err(|e| Error::Persistence(format!("snapshot write failed: {}", e)))?;

        if tokio::fs::try_exists(&self.config.path).await.unwrap_or(false) {
            let backup = self.backup_path();
            if let Err(e) = tokio::fs::copy(&self.config.path, &backup).await {
                tracing::warn!("Snapshot backup rotation failed: {}", e);
            }
            self.prune_backups().await;
        }

        tokio::fs::rename(&tmp, &self.config.path)
            .await
            .map_err(|e| Error::Persistence(format!("snapshot rename failed: {}", e)))?;

        tracing::info!(
            path = %self.config.path.display(),
            controls = controls.len(),
            "Snapshot persisted"
        );
        Ok(())
    }

    /// Load the snapshot, falling back through backups most-recent-first.
    /// A missing target with no backups restores to empty.
    pub async fn restore(&self) -> Result<HashMap<String, ControlState>> {
        match self.try_load(&self.config.path).await {
            Ok(Some(controls)) => return Ok(controls),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    path = %self.config.path.display(),
                    "Snapshot load failed, trying backups: {}",
                    e
                );
            }
        }

        for backup in self.list_backups().await {
            match self.try_load(&backup).await {
                Ok(Some(controls)) => {
                    tracing::info!(backup = %backup.display(), "Restored from backup");
                    return Ok(controls);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(backup = %backup.display(), "Backup unusable: {}", e);
                }
            }
        }

        Ok(HashMap::new())
    }

    async fn try_load(&self, path: &Path) -> Result<Option<HashMap<String, ControlState>>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Persistence(format!("snapshot read failed: {}", e))),
        };
        self.decode(&bytes).map(Some)
    }

    fn encode(&self, controls: &HashMap<String, ControlState>) -> Result<Vec<u8>> {
        let timestamp = Utc::now().to_rfc3339();
        let plain = match self.config.format {
            SnapshotFormat::Json => {
                let snapshot = JsonSnapshot {
                    version: SNAPSHOT_VERSION.to_string(),
                    timestamp,
                    control_count: controls.len(),
                    controls: controls.clone(),
                    metadata: None,
                };
                serde_json::to_vec_pretty(&snapshot)?
            }
            SnapshotFormat::JsonLines => {
                let mut out = Vec::new();
                let header = JsonlLine::Header {
                    version: SNAPSHOT_VERSION.to_string(),
                    timestamp,
                    control_count: controls.len(),
                };
                out.extend_from_slice(&serde_json::to_vec(&header)?);
                out.push(b'\n');
                for (name, state) in controls {
                    let line = JsonlLine::Control {
                        name: name.clone(),
                        state: state.clone(),
                    };
                    out.extend_from_slice(&serde_json::to_vec(&line)?);
                    out.push(b'\n');
                }
                out
            }
        };

        if self.config.gzip {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&plain)
                .and_then(|_| encoder.finish())
                .map_err(|e| Error::Persistence(format!("gzip failed: {}", e)))
        } else {
            Ok(plain)
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<HashMap<String, ControlState>> {
        // Sniff gzip by magic so a flag mismatch still restores
        let plain = if bytes.starts_with(&[0x1f, 0x8b]) {
            let mut decoder = GzDecoder::new(bytes);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::Persistence(format!("gunzip failed: {}", e)))?;
            out
        } else {
            bytes.to_vec()
        };

        let controls = match self.config.format {
            SnapshotFormat::Json => {
                let snapshot: JsonSnapshot = serde_json::from_slice(&plain)?;
                validate_version(&snapshot.version)?;
                snapshot.controls
            }
            SnapshotFormat::JsonLines => {
                let text = std::str::from_utf8(&plain)
                    .map_err(|e| Error::Persistence(format!("snapshot is not UTF-8: {}", e)))?;
                let mut lines = text.lines().filter(|line| !line.trim().is_empty());

                let header: JsonlLine = serde_json::from_str(lines.next().ok_or_else(|| {
                    Error::Persistence("snapshot is empty".to_string())
                })?)?;
                let JsonlLine::Header { version, .. } = header else {
                    return Err(Error::Persistence(
                        "first snapshot line is not a header".to_string(),
                    ));
                };
                validate_version(&version)?;

                let mut controls = HashMap::new();
                for line in lines {
                    let entry: JsonlLine = serde_json::from_str(line)?;
                    let JsonlLine::Control { name, state } = entry else {
                        return Err(Error::Persistence(
                            "unexpected header past the first line".to_string(),
                        ));
                    };
                    controls.insert(name, state);
                }
                controls
            }
        };

        for (name, state) in &controls {
            if name != &state.name {
                return Err(Error::Persistence(format!(
                    "snapshot entry key '{}' does not match control name '{}'",
                    name, state.name
                )));
            }
        }
        Ok(controls)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .config
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot".to_string());
        name.push_str(".tmp");
        self.config.path.with_file_name(name)
    }

    fn backup_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        let mut name = self
            .config
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot".to_string());
        name.push_str(&format!(".backup.{}", stamp));
        self.config.path.with_file_name(name)
    }

    /// Backups newest first
    async fn list_backups(&self) -> Vec<PathBuf> {
        let Some(parent) = self.config.path.parent() else {
            return Vec::new();
        };
        let parent = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        let prefix = format!(
            "{}.backup.",
            self.config
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        );

        let mut backups = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(parent).await else {
            return backups;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) {
                backups.push(entry.path());
            }
        }
        // ISO timestamps with dashes sort lexicographically
        backups.sort();
        backups.reverse();
        backups
    }

    async fn prune_backups(&self) {
        let backups = self.list_backups().await;
        for stale in backups.iter().skip(self.config.backup_count.max(1)) {
            if let Err(e) = tokio::fs::remove_file(stale).await {
                tracing::warn!(backup = %stale.display(), "Backup prune failed: {}", e);
            }
        }
    }
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || !version.starts_with("1.") {
        return Err(Error::Persistence(format!(
            "unsupported snapshot version '{}'",
            version
        )));
    }
    Ok(())
}
