//! Container manager abstraction
//!
//! The launcher and the proxy only ever talk to an engine through
//! [`ContainerManager`]. The Docker Engine backend lives in [`crate::docker`];
//! tests provide in-memory implementations.

use crate::error::EngineError;
use crate::host_files::HostFiles;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Label keys marking and describing containers owned by this system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootLabel {
    root: String,
}

impl RootLabel {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    /// `<root>`, set to "true" on every owned container
    pub fn key(&self) -> &str {
        &self.root
    }

    /// `<root>.port`, the internal port the container serves on
    pub fn port_key(&self) -> String {
        format!("{}.port", self.root)
    }

    /// `<root>.mem_reservation_mb`, present only when a reservation was given
    pub fn mem_reservation_key(&self) -> String {
        format!("{}.mem_reservation_mb", self.root)
    }

    /// Reservation recorded on a container, if any
    pub fn mem_reservation_mb(&self, labels: &HashMap<String, String>) -> Option<u64> {
        labels
            .get(&self.mem_reservation_key())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Declared internal port, if any
    pub fn port(&self, labels: &HashMap<String, String>) -> Option<u16> {
        labels.get(&self.port_key()).and_then(|v| v.trim().parse().ok())
    }
}

/// Kind of filesystem mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Host directory bind-mounted into the container
    Bind,
    /// Engine-managed named volume
    Volume,
}

/// A mount attached at container creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub kind: MountKind,
    /// Host path for binds, volume name for volumes
    pub source: String,
    /// Absolute path inside the container
    pub target: String,
    pub read_only: bool,
}

/// Arguments for starting a container
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Fully qualified image reference (`name:tag`)
    pub image: String,
    pub cmd: Option<Vec<String>>,
    pub name: String,
    pub labels: HashMap<String, String>,
    /// `KEY=value` pairs
    pub env: Vec<String>,
    /// Container ports published on random host ports
    pub published_ports: Vec<u16>,
    pub mounts: Vec<Mount>,
    /// Fractional cores
    pub cpus: Option<f64>,
    /// Soft memory reservation
    pub mem_reservation_mb: Option<u64>,
}

/// Engine-observed container
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    /// Container port (e.g. "80/tcp") to host ports it is published on
    pub ports: HashMap<String, Vec<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub running: bool,
}

/// Filters for [`ContainerManager::list`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilters {
    /// `key` or `key=value` label selectors; all must match
    pub labels: Vec<String>,
    /// Exact container name
    pub name: Option<String>,
}

impl ContainerFilters {
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            labels: vec![label.into()],
            name: None,
        }
    }

    pub fn name(name: impl Into<String>) -> Self {
        Self {
            labels: Vec::new(),
            name: Some(name.into()),
        }
    }

    /// Whether a container satisfies these filters
    pub fn matches(&self, container: &ManagedContainer) -> bool {
        if let Some(ref name) = self.name {
            if container.name.trim_start_matches('/') != name.trim_start_matches('/') {
                return false;
            }
        }
        self.labels.iter().all(|selector| match selector.split_once('=') {
            Some((k, v)) => container.labels.get(k).map(|actual| actual == v).unwrap_or(false),
            None => container.labels.contains_key(selector.as_str()),
        })
    }
}

/// Operations a container engine backend provides
#[async_trait]
pub trait ContainerManager: Send + Sync {
    /// Start a container and return its ID
    async fn run(&self, options: RunOptions) -> Result<String, EngineError>;

    /// Pull `image:version`
    async fn pull(&self, image: &str, version: &str) -> Result<(), EngineError>;

    /// Callable URL of a running container's label-declared port
    async fn get_url(&self, name: &str) -> Result<String, EngineError>;

    async fn get_container(&self, name_or_id: &str) -> Result<ManagedContainer, EngineError>;

    async fn get_id(&self, name: &str) -> Result<String, EngineError> {
        Ok(self.get_container(name).await?.id)
    }

    /// Running and stopped containers matching `filters`
    async fn list(&self, filters: &ContainerFilters) -> Result<Vec<ManagedContainer>, EngineError>;

    /// Raw stdout and stderr
    async fn logs(&self, name: &str) -> Result<Vec<u8>, EngineError>;

    /// Force-remove a container together with its engine volumes, including
    /// scratch volumes from [`ContainerManager::create_volume`]
    async fn remove(&self, name_or_id: &str) -> Result<(), EngineError>;

    /// Create an engine-managed scratch volume and return its name
    async fn create_volume(&self) -> Result<String, EngineError>;

    /// Delete a scratch volume no container holds
    async fn remove_volume(&self, name: &str) -> Result<(), EngineError>;

    /// Writer for files on the engine's host
    fn host_files(&self) -> Arc<dyn HostFiles>;
}

pub type SharedContainerManager = Arc<dyn ContainerManager>;
