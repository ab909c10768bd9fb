//! Disk spillover for event buffers
//!
//! When a group's ring fills, older events migrate to JSON files under the
//! spillover directory, named `{group_id}_{epoch_ms}_{seq}.json`. Queries
//! load files whose time span intersects the requested range and merge them
//! with in-memory events. A janitor removes stale files and enforces a
//! total-size cap.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::SpilloverConfig;
use crate::error::{Error, Result};
use crate::model::CachedEvent;

/// Janitor cadence
const JANITOR_INTERVAL: Duration = Duration::from_secs(600);

/// On-disk shape of one spill file
#[derive(Debug, Serialize, Deserialize)]
struct SpillFile {
    group_id: String,
    start_ms: i64,
    end_ms: i64,
    events: Vec<CachedEvent>,
}

/// What a janitor pass removed
#[derive(Debug, Default, Clone, Copy)]
pub struct JanitorReport {
    /// Files removed for age
    pub removed_for_age: usize,
    /// Files removed to respect the total-size cap
    pub removed_for_size: usize,
}

/// Spill file writer/reader rooted at one directory
#[derive(Debug, Clone)]
pub struct SpilloverStore {
    config: SpilloverConfig,
}

impl SpilloverStore {
    /// Store rooted at the configured directory, created if missing
    pub fn new(config: SpilloverConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.directory).map_err(|e| {
            Error::Persistence(format!(
                "cannot create spillover directory {}: {}",
                config.directory.display(),
                e
            ))
        })?;
        Ok(Self { config })
    }

    /// The directory spill files live in
    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Write one batch of (time-ordered) events to a spill file
    pub async fn write(&self, group_id: &str, seq: u64, events: &[CachedEvent]) -> Result<PathBuf> {
        let Some(first) = events.first() else {
            return Err(Error::Persistence("nothing to spill".to_string()));
        };
        let last = events.last().unwrap_or(first);

        let file = SpillFile {
            group_id: group_id.to_string(),
            start_ms: first.timestamp_ms,
            end_ms: last.timestamp_ms,
            events: events.to_vec(),
        };
        let path = self.config.directory.join(format!(
            "{}_{}_{}.json",
            sanitize_group_id(group_id),
            first.timestamp_ms,
            seq
        ));

        let encoded = serde_json::to_vec(&file)?;
        tokio::fs::write(&path, encoded)
            .await
            .map_err(|e| Error::Persistence(format!("spill write failed: {}", e)))?;

        tracing::debug!(
            group = group_id,
            file = %path.display(),
            events = events.len(),
            "Spilled events to disk"
        );
        Ok(path)
    }

    /// Load all spilled events of one group whose file span intersects
    /// `[start_ms, end_ms]`
    pub async fn load_range(
        &self,
        group_id: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<Vec<CachedEvent>> {
        let prefix = format!("{}_", sanitize_group_id(group_id));
        let mut events = Vec::new();

        let mut dir = match tokio::fs::read_dir(&self.config.directory).await {
            Ok(dir) => dir,
            Err(_) => return Ok(events),
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }
            let bytes = match tokio::fs::read(entry.path()).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(file = %entry.path().display(), "Unreadable spill file: {}", e);
                    continue;
                }
            };
            let file: SpillFile = match serde_json::from_slice(&bytes) {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!(file = %entry.path().display(), "Corrupt spill file: {}", e);
                    continue;
                }
            };
            if file.group_id != group_id {
                continue;
            }
            let intersects = start_ms.map_or(true, |start| file.end_ms >= start)
                && end_ms.map_or(true, |end| file.start_ms <= end);
            if !intersects {
                continue;
            }
            events.extend(file.events.into_iter().filter(|event| {
                start_ms.map_or(true, |start| event.timestamp_ms >= start)
                    && end_ms.map_or(true, |end| event.timestamp_ms <= end)
            }));
        }

        Ok(events)
    }

    /// One cleanup pass: drop files past `max_age_days`, then oldest-first
    /// until total size fits the cap
    pub async fn janitor_pass(&self) -> Result<JanitorReport> {
        let mut report = JanitorReport::default();
        let max_age = Duration::from_secs(self.config.max_age_days * 24 * 3600);
        let cap_bytes = self.config.total_size_cap_mb * 1024 * 1024;

        let mut files: Vec<(PathBuf, std::time::SystemTime, u64)> = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.config.directory).await {
            Ok(dir) => dir,
            Err(_) => return Ok(report),
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let modified = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            files.push((path, modified, meta.len()));
        }

        let now = std::time::SystemTime::now();
        files.retain(|(path, modified, _)| {
            let stale = now
                .duration_since(*modified)
                .map(|age| age > max_age)
                .unwrap_or(false);
            if stale {
                if std::fs::remove_file(path).is_ok() {
                    report.removed_for_age += 1;
                }
            }
            !stale
        });

        let mut total: u64 = files.iter().map(|(_, _, size)| size).sum();
        files.sort_by_key(|(_, modified, _)| *modified);
        for (path, _, size) in files {
            if total <= cap_bytes {
                break;
            }
            if std::fs::remove_file(&path).is_ok() {
                report.removed_for_size += 1;
                total = total.saturating_sub(size);
            }
        }

        if report.removed_for_age + report.removed_for_size > 0 {
            tracing::info!(
                removed_for_age = report.removed_for_age,
                removed_for_size = report.removed_for_size,
                "Spillover janitor pass complete"
            );
        }
        Ok(report)
    }

    /// Run the janitor periodically; returns a token that stops it
    pub fn start_janitor(&self) -> CancellationToken {
        let store = self.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(JANITOR_INTERVAL) => {
                        if let Err(e) = store.janitor_pass().await {
                            tracing::warn!("Spillover janitor failed: {}", e);
                        }
                    }
                }
            }
        });

        cancel
    }
}

/// Keep group ids filesystem-safe in file names
fn sanitize_group_id(group_id: &str) -> String {
    group_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
