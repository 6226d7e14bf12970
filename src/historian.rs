//! Per-container access history
//!
//! Every proxied request appends a line to its container's log. Eviction reads
//! the modification time of those logs to find the least recently used
//! containers.

use crate::config::HistorianConfig;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// One recorded access
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistorianRecord {
    pub timestamp: DateTime<FixedOffset>,
    pub path: String,
}

pub trait Historian: Send + Sync {
    /// Append an access of `path` to the container's log
    fn record(&self, container_id: &str, path: &str) -> io::Result<()>;

    /// Create the container's log if it does not exist yet, without recording
    /// an access
    fn touch(&self, container_id: &str) -> io::Result<()>;

    /// All records for a container, in append order
    fn list(&self, container_id: &str) -> io::Result<Vec<HistorianRecord>>;

    /// When the container's log was last appended to
    fn last_access(&self, container_id: &str) -> Option<SystemTime>;

    /// `container_ids` ordered least recently used first
    fn lru(&self, container_ids: &[String]) -> Vec<String>;
}

pub type SharedHistorian = Arc<dyn Historian>;

/// Run a historian call on the blocking pool, keeping file I/O off the
/// async workers
pub async fn offload<T, F>(historian: &SharedHistorian, f: F) -> io::Result<T>
where
    F: FnOnce(&dyn Historian) -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let historian = Arc::clone(historian);
    tokio::task::spawn_blocking(move || f(historian.as_ref()))
        .await
        .map_err(io::Error::other)?
}

/// Build the configured historian
pub fn from_config(config: &HistorianConfig) -> SharedHistorian {
    match config.root() {
        Some(root) => Arc::new(FileHistorian::new(root)),
        None => Arc::new(NullHistorian),
    }
}

/// Satisfies [`Historian`] but records nothing; every container looks
/// equally recent
#[derive(Debug, Default, Clone)]
pub struct NullHistorian;

impl Historian for NullHistorian {
    fn record(&self, _container_id: &str, _path: &str) -> io::Result<()> {
        Ok(())
    }

    fn touch(&self, _container_id: &str) -> io::Result<()> {
        Ok(())
    }

    fn list(&self, _container_id: &str) -> io::Result<Vec<HistorianRecord>> {
        Ok(Vec::new())
    }

    fn last_access(&self, _container_id: &str) -> Option<SystemTime> {
        Some(SystemTime::now())
    }

    fn lru(&self, container_ids: &[String]) -> Vec<String> {
        let mut ids = container_ids.to_vec();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Stores each container's history as `<root>/<container_id>.log`, one
/// `<ISO-8601 timestamp>\t<path>` line per access
#[derive(Debug)]
pub struct FileHistorian {
    root: PathBuf,
    /// Keeps concurrent appends from interleaving within this process
    write_lock: Mutex<()>,
}

impl FileHistorian {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn log_path(&self, container_id: &str) -> PathBuf {
        let file_name: String = container_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{}.log", file_name))
    }

    fn open_for_append(&self, container_id: &str) -> io::Result<std::fs::File> {
        std::fs::create_dir_all(&self.root)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(container_id))
    }
}

fn normalize_path(path: &str) -> String {
    let single_line: String = path
        .chars()
        .map(|c| if c == '\n' || c == '\r' || c == '\t' { ' ' } else { c })
        .collect();
    if single_line.starts_with('/') {
        single_line
    } else {
        format!("/{}", single_line)
    }
}

impl Historian for FileHistorian {
    fn record(&self, container_id: &str, path: &str) -> io::Result<()> {
        let line = format!(
            "{}\t{}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            normalize_path(path)
        );

        let _guard = self.write_lock.lock();
        let mut file = self.open_for_append(container_id)?;
        file.write_all(line.as_bytes())?;
        debug!(container_id, path, "Recorded access");
        Ok(())
    }

    fn touch(&self, container_id: &str) -> io::Result<()> {
        let _guard = self.write_lock.lock();
        self.open_for_append(container_id).map(|_| ())
    }

    fn list(&self, container_id: &str) -> io::Result<Vec<HistorianRecord>> {
        let content = match std::fs::read_to_string(self.log_path(container_id)) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut records = Vec::new();
        for line in content.lines() {
            let Some((timestamp, path)) = line.split_once('\t') else {
                warn!(container_id, line, "Skipping malformed history line");
                continue;
            };
            match DateTime::parse_from_rfc3339(timestamp) {
                Ok(timestamp) => records.push(HistorianRecord {
                    timestamp,
                    path: path.to_string(),
                }),
                Err(e) => {
                    warn!(container_id, line, error = %e, "Skipping malformed history line");
                }
            }
        }
        Ok(records)
    }

    fn last_access(&self, container_id: &str) -> Option<SystemTime> {
        std::fs::metadata(self.log_path(container_id))
            .and_then(|m| m.modified())
            .ok()
    }

    fn lru(&self, container_ids: &[String]) -> Vec<String> {
        let mut ordered: Vec<(SystemTime, String)> = container_ids
            .iter()
            .map(|id| {
                // No log at all: older than anything that has one
                let modified = self.last_access(id).unwrap_or(SystemTime::UNIX_EPOCH);
                (modified, id.clone())
            })
            .collect();
        ordered.sort();
        ordered.dedup_by(|a, b| a.1 == b.1);
        ordered.into_iter().map(|(_, id)| id).collect()
    }
}
