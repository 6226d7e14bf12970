//! Launching containers from declarative specs, and keeping their combined
//! memory reservations within budget

use crate::config::LauncherConfig;
use crate::engine::{
    ContainerFilters, ManagedContainer, Mount, MountKind, RootLabel, RunOptions,
    SharedContainerManager,
};
use crate::error::{EngineError, LaunchError};
use crate::historian::{self, SharedHistorian};
use chrono::Utc;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Environment variable holding the serialized input
pub const INPUT_JSON_ENV: &str = "INPUT_JSON";
/// Environment variable holding a URL the container fetches its input from
pub const INPUT_JSON_URL_ENV: &str = "INPUT_JSON_URL";
/// Largest reservation whose byte count still fits the engine's signed 64 bits
pub const MAX_MEM_RESERVATION_MB: u64 = i64::MAX as u64 / (1024 * 1024);

/// A directory to mount into the container
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VolumeSpec {
    /// Absolute path inside the container
    pub bind: String,
    /// Host directory to expose read-only; absent means a fresh read-write
    /// scratch volume
    #[serde(default)]
    pub host_path: Option<String>,
    /// Always computed by the launcher; supplying it is rejected
    #[serde(default)]
    pub mode: Option<String>,
}

impl VolumeSpec {
    pub fn scratch(bind: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            host_path: None,
            mode: None,
        }
    }

    pub fn host(host_path: impl Into<String>, bind: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            host_path: Some(host_path.into()),
            mode: None,
        }
    }
}

/// Desired state for one launch
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContainerSpec {
    /// Image reference; "latest" is assumed when no tag is given
    pub image_name: String,
    /// Must be unique among live containers
    pub container_name: String,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    /// Delivered through INPUT_JSON and/or INPUT_JSON_URL
    #[serde(default)]
    pub input: serde_json::Value,
    /// Container paths that each get a fresh scratch volume
    #[serde(default)]
    pub extra_directories: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Port the container serves HTTP on
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    /// Fractional cores
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    /// `None` exempts the container from memory accounting and eviction
    #[serde(default)]
    pub mem_reservation_mb: Option<u64>,
}

fn default_container_port() -> u16 {
    80
}

fn default_cpus() -> f64 {
    0.5
}

impl ContainerSpec {
    pub fn new(image_name: impl Into<String>, container_name: impl Into<String>) -> Self {
        Self {
            image_name: image_name.into(),
            container_name: container_name.into(),
            cmd: None,
            input: serde_json::Value::Null,
            extra_directories: Vec::new(),
            volumes: Vec::new(),
            labels: HashMap::new(),
            container_port: default_container_port(),
            cpus: default_cpus(),
            mem_reservation_mb: None,
        }
    }

    /// Set the input payload (builder pattern)
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    /// Add a label (builder pattern)
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set the memory reservation (builder pattern)
    pub fn with_mem_reservation_mb(mut self, mb: u64) -> Self {
        self.mem_reservation_mb = Some(mb);
        self
    }

    /// Set the container port (builder pattern)
    pub fn with_port(mut self, port: u16) -> Self {
        self.container_port = port;
        self
    }

    /// Add a scratch directory (builder pattern)
    pub fn with_extra_directory(mut self, path: impl Into<String>) -> Self {
        self.extra_directories.push(path.into());
        self
    }

    /// Add a volume (builder pattern)
    pub fn with_volume(mut self, volume: VolumeSpec) -> Self {
        self.volumes.push(volume);
        self
    }

    /// Set the command (builder pattern)
    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = Some(cmd);
        self
    }

    /// Check the spec before anything touches the engine
    pub fn validate(&self) -> Result<(), LaunchError> {
        if self.image_name.trim().is_empty() {
            return Err(LaunchError::Validation("'image_name' is required".to_string()));
        }
        if self.container_name.trim().is_empty() {
            return Err(LaunchError::Validation("'container_name' is required".to_string()));
        }
        if !self
            .container_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(LaunchError::Validation(format!(
                "'container_name' may only contain letters, digits, '-', '_' and '.': {}",
                self.container_name
            )));
        }
        if self.container_port == 0 {
            return Err(LaunchError::Validation("'container_port' must be greater than 0".to_string()));
        }
        if !(self.cpus > 0.0 && self.cpus.is_finite()) {
            return Err(LaunchError::Validation(format!("'cpus' must be positive, got {}", self.cpus)));
        }
        if let Some(mb) = self.mem_reservation_mb {
            if mb > MAX_MEM_RESERVATION_MB {
                return Err(LaunchError::Validation(format!(
                    "'mem_reservation_mb' must be at most {}, got {}",
                    MAX_MEM_RESERVATION_MB, mb
                )));
            }
        }
        for dir in &self.extra_directories {
            if !Path::new(dir).is_absolute() {
                return Err(LaunchError::Validation(format!(
                    "Specified path \"{}\" is not absolute",
                    dir
                )));
            }
        }
        for volume in &self.volumes {
            if let Some(ref mode) = volume.mode {
                return Err(LaunchError::Validation(format!(
                    "Volume mode is computed, not supplied; got \"{}\" for {}",
                    mode, volume.bind
                )));
            }
            if !Path::new(&volume.bind).is_absolute() {
                return Err(LaunchError::Validation(format!(
                    "Specified path \"{}\" is not absolute",
                    volume.bind
                )));
            }
            if let Some(ref host_path) = volume.host_path {
                if !Path::new(host_path).is_absolute() {
                    return Err(LaunchError::Validation(format!(
                        "Specified host path \"{}\" is not absolute",
                        host_path
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Append ":latest" when no tag is present, so a pull never fetches every tag
pub fn normalize_image(image: &str) -> String {
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if last_segment.contains(':') || last_segment.contains('@') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

/// How input payloads reach containers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDelivery {
    /// Serialize input into INPUT_JSON
    pub envvar: bool,
    /// Stage input under the data directory and point INPUT_JSON_URL at
    /// `<url_base>/<container_name>/input.json`
    pub url_base: Option<String>,
}

/// Launches containers and evicts least recently used ones to stay within
/// the memory budget
pub struct Launcher {
    engine: SharedContainerManager,
    historian: SharedHistorian,
    root_label: RootLabel,
    data_dir: String,
    /// 0 = unlimited
    mem_limit_mb: u64,
    input: InputDelivery,
    /// Serializes the budget check, eviction and start of each launch
    launch_lock: Mutex<()>,
}

impl Launcher {
    pub fn new(
        engine: SharedContainerManager,
        historian: SharedHistorian,
        config: &LauncherConfig,
    ) -> Result<Self, LaunchError> {
        let input = InputDelivery {
            envvar: config.input_json_envvar,
            url_base: config.input_json_url.clone(),
        };
        if !input.envvar && input.url_base.is_none() {
            return Err(LaunchError::Validation(
                "Enable INPUT_JSON delivery or configure an input URL".to_string(),
            ));
        }
        if !Path::new(&config.data_dir).is_absolute() {
            return Err(LaunchError::Validation(format!(
                "Data directory \"{}\" is not absolute",
                config.data_dir
            )));
        }

        Ok(Self {
            engine,
            historian,
            root_label: RootLabel::new(config.root_label.clone()),
            data_dir: config.data_dir.clone(),
            mem_limit_mb: config.mem_limit_mb,
            input,
            launch_lock: Mutex::new(()),
        })
    }

    pub fn root_label(&self) -> &RootLabel {
        &self.root_label
    }

    pub fn engine(&self) -> &SharedContainerManager {
        &self.engine
    }

    pub fn historian(&self) -> &SharedHistorian {
        &self.historian
    }

    /// Launch a container and return the URL it is reachable at
    pub async fn run(&self, spec: ContainerSpec) -> Result<String, LaunchError> {
        spec.validate()?;

        {
            let _guard = self.launch_lock.lock().await;

            // Staging input for a taken name would clobber the live container's
            match self.engine.get_container(&spec.container_name).await {
                Ok(existing) => {
                    return Err(EngineError::Failed(format!(
                        "Conflict. The container name \"/{}\" is already in use by container {}",
                        spec.container_name, existing.id
                    ))
                    .into());
                }
                Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }

            if self.mem_limit_mb > 0 {
                let reserved = self.reserved_memory_mb().await?;
                let requested = spec.mem_reservation_mb.unwrap_or(0);
                let need_to_free = requested
                    .saturating_add(reserved)
                    .saturating_sub(self.mem_limit_mb);
                debug!(
                    container = %spec.container_name,
                    requested,
                    reserved,
                    limit = self.mem_limit_mb,
                    need_to_free,
                    "Checked memory budget"
                );
                if need_to_free > 0 {
                    self.evict(need_to_free).await?;
                }
            }

            let mut volumes = Vec::new();
            let id = match self.launch(&spec, &mut volumes).await {
                Ok(id) => id,
                Err(e) => {
                    self.release(&spec.container_name, &volumes).await;
                    return Err(e);
                }
            };
            info!(
                container = %spec.container_name,
                container_id = %id,
                mem_reservation_mb = ?spec.mem_reservation_mb,
                "Launched container"
            );

            // Gives never-proxied containers an access time for LRU ordering
            let log_id = id.clone();
            let touched = historian::offload(&self.historian, move |h| h.touch(&log_id)).await;
            if let Err(e) = touched {
                warn!(container_id = %id, error = %e, "Failed to create access log");
            }
        }

        // Start-call metadata often lacks freshly assigned ports
        Ok(self.engine.get_url(&spec.container_name).await?)
    }

    /// Stage everything the container needs and start it. Scratch volumes
    /// created along the way are pushed onto `volumes`.
    async fn launch(&self, spec: &ContainerSpec, volumes: &mut Vec<String>) -> Result<String, LaunchError> {
        let mut labels = spec.labels.clone();
        labels.insert(self.root_label.key().to_string(), "true".to_string());
        labels.insert(self.root_label.port_key(), spec.container_port.to_string());
        if let Some(mb) = spec.mem_reservation_mb {
            labels.insert(self.root_label.mem_reservation_key(), mb.to_string());
        }

        let mounts = self.mounts(spec, volumes).await?;
        let options = RunOptions {
            image: normalize_image(&spec.image_name),
            cmd: spec.cmd.clone(),
            name: spec.container_name.clone(),
            labels,
            env: self.input_env(spec).await?,
            published_ports: vec![spec.container_port],
            mounts,
            cpus: Some(spec.cpus),
            mem_reservation_mb: spec.mem_reservation_mb,
        };
        Ok(self.engine.run(options).await?)
    }

    /// Undo the staging of a launch that never produced a container
    async fn release(&self, container_name: &str, volumes: &[String]) {
        for volume in volumes {
            match self.engine.remove_volume(volume).await {
                Ok(()) | Err(EngineError::NotFound(_)) => {}
                Err(e) => {
                    warn!(container = %container_name, volume = %volume, error = %e, "Failed to remove scratch volume of failed launch");
                }
            }
        }
        self.discard_input(container_name).await;
    }

    /// Caller-supplied host paths are mounted read-only; scratch volumes are
    /// read-write
    async fn mounts(&self, spec: &ContainerSpec, created: &mut Vec<String>) -> Result<Vec<Mount>, LaunchError> {
        let mut mounts = Vec::new();
        let volumes = spec
            .extra_directories
            .iter()
            .map(|dir| VolumeSpec::scratch(dir.clone()))
            .chain(spec.volumes.iter().cloned());

        for volume in volumes {
            let mount = match volume.host_path {
                Some(host_path) => Mount {
                    kind: MountKind::Bind,
                    source: host_path,
                    target: volume.bind,
                    read_only: true,
                },
                None => {
                    let name = self.engine.create_volume().await?;
                    created.push(name.clone());
                    Mount {
                        kind: MountKind::Volume,
                        source: name,
                        target: volume.bind,
                        read_only: false,
                    }
                }
            };
            mounts.push(mount);
        }
        Ok(mounts)
    }

    /// Where a container's input is staged, when input goes by URL
    fn staged_input_dir(&self, container_name: &str) -> Option<String> {
        self.input
            .url_base
            .as_ref()
            .map(|_| format!("{}/{}", self.data_dir.trim_end_matches('/'), container_name))
    }

    /// Delete a container's staged input, if any
    async fn discard_input(&self, container_name: &str) {
        let Some(dir) = self.staged_input_dir(container_name) else {
            return;
        };
        if let Err(e) = self.engine.host_files().remove_dir_all(&dir).await {
            warn!(container = %container_name, dir = %dir, error = %e, "Failed to remove staged input");
        }
    }

    async fn input_env(&self, spec: &ContainerSpec) -> Result<Vec<String>, LaunchError> {
        let mut env = Vec::new();
        let serialized = serde_json::to_string(&spec.input)?;

        if self.input.envvar {
            env.push(format!("{}={}", INPUT_JSON_ENV, serialized));
        }

        if let (Some(url_base), Some(dir)) = (
            self.input.url_base.as_ref(),
            self.staged_input_dir(&spec.container_name),
        ) {
            let host_files = self.engine.host_files();
            host_files.mkdir_p(&dir).await?;
            host_files
                .write(&format!("{}/input.json", dir), &serialized)
                .await?;
            env.push(format!(
                "{}={}/{}/input.json",
                INPUT_JSON_URL_ENV,
                url_base.trim_end_matches('/'),
                spec.container_name
            ));
        }

        Ok(env)
    }

    /// Owned containers, running or not
    pub async fn list_owned(&self) -> Result<Vec<ManagedContainer>, EngineError> {
        self.engine
            .list(&ContainerFilters::label(self.root_label.key()))
            .await
    }

    /// Sum of the reservations recorded on owned containers
    pub async fn reserved_memory_mb(&self) -> Result<u64, EngineError> {
        Ok(self
            .list_owned()
            .await?
            .iter()
            .filter_map(|c| self.root_label.mem_reservation_mb(&c.labels))
            .fold(0, u64::saturating_add))
    }

    /// Remove least recently used containers until `need_to_free_mb` has
    /// been released or no candidates remain. Returns the amount freed.
    ///
    /// Containers without a reservation are never candidates.
    pub async fn evict(&self, need_to_free_mb: u64) -> Result<u64, EngineError> {
        let reservations: HashMap<String, (String, u64)> = self
            .list_owned()
            .await?
            .into_iter()
            .filter_map(|c| {
                self.root_label
                    .mem_reservation_mb(&c.labels)
                    .map(|mb| (c.id, (c.name, mb)))
            })
            .collect();
        let candidates: Vec<String> = reservations.keys().cloned().collect();
        let mut queue: VecDeque<String> = self.historian.lru(&candidates).into();

        let mut freed = 0u64;
        while freed < need_to_free_mb {
            let Some(id) = queue.pop_front() else {
                break;
            };
            let Some((name, mb)) = reservations.get(&id) else {
                continue;
            };
            match self.engine.remove(&id).await {
                Ok(()) => {}
                // Already gone; its reservation is released either way
                Err(EngineError::NotFound(_)) => {
                    debug!(container_id = %id, "Eviction candidate already removed");
                }
                Err(e) => return Err(e),
            }
            self.discard_input(name).await;
            freed = freed.saturating_add(*mb);
            info!(container = %name, container_id = %id, freed_mb = *mb, "Evicted least recently used container");
        }

        if freed < need_to_free_mb {
            warn!(
                need_to_free_mb,
                freed_mb = freed,
                "No more containers to evict; memory budget will be exceeded"
            );
        }
        Ok(freed)
    }

    /// Remove one container, its engine volumes and its staged input
    pub async fn kill(&self, name_or_id: &str) -> Result<(), EngineError> {
        let container = self.engine.get_container(name_or_id).await?;
        self.engine.remove(&container.id).await?;
        self.discard_input(&container.name).await;
        Ok(())
    }

    /// Remove every container carrying `label` (`key` or `key=value`)
    pub async fn purge_by_label(&self, label: &str) -> Result<usize, EngineError> {
        let containers = self.engine.list(&ContainerFilters::label(label)).await?;
        let mut removed = 0;
        for container in containers {
            match self.engine.remove(&container.id).await {
                Ok(()) | Err(EngineError::NotFound(_)) => removed += 1,
                Err(e) => return Err(e),
            }
            self.discard_input(&container.name).await;
        }
        info!(label, removed, "Purged containers by label");
        Ok(removed)
    }

    /// Remove owned containers started more than `seconds` ago that have
    /// not been accessed within `seconds`. Returns the removed names.
    pub async fn purge_inactive(&self, seconds: u64) -> Result<Vec<String>, EngineError> {
        let window = Duration::from_secs(seconds);
        let cutoff = SystemTime::now()
            .checked_sub(window)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let cutoff_utc = Utc::now() - chrono::Duration::seconds(seconds as i64);

        let mut removed = Vec::new();
        for container in self.list_owned().await? {
            let young = container.started_at.map(|t| t > cutoff_utc).unwrap_or(false);
            let recently_used = self
                .historian
                .last_access(&container.id)
                .map(|t| t > cutoff)
                .unwrap_or(false);
            if young || recently_used {
                continue;
            }
            match self.engine.remove(&container.id).await {
                Ok(()) | Err(EngineError::NotFound(_)) => {
                    self.discard_input(&container.name).await;
                    info!(container = %container.name, "Purged inactive container");
                    removed.push(container.name);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_image() {
        assert_eq!(normalize_image("nginx"), "nginx:latest");
        assert_eq!(normalize_image("nginx:1.10.3-alpine"), "nginx:1.10.3-alpine");
        assert_eq!(normalize_image("scottx611x/refinery-higlass-docker"), "scottx611x/refinery-higlass-docker:latest");
        assert_eq!(normalize_image("registry:5000/tool"), "registry:5000/tool:latest");
        assert_eq!(normalize_image("registry:5000/tool:v1"), "registry:5000/tool:v1");
        assert_eq!(normalize_image("tool@sha256:abcd"), "tool@sha256:abcd");
    }

    #[test]
    fn test_spec_defaults_from_json() {
        let spec: ContainerSpec = serde_json::from_str(
            r#"{"image_name": "nginx", "container_name": "viz-1"}"#,
        )
        .unwrap();
        assert_eq!(spec, ContainerSpec::new("nginx", "viz-1"));
        assert_eq!(spec.container_port, 80);
        assert_eq!(spec.mem_reservation_mb, None);
        spec.validate().unwrap();
    }

    #[test]
    fn test_validate_required_fields() {
        let err = ContainerSpec::new("", "c").validate().unwrap_err();
        assert!(err.to_string().contains("image_name"));

        let err = ContainerSpec::new("nginx", " ").validate().unwrap_err();
        assert!(err.to_string().contains("container_name"));

        let err = ContainerSpec::new("nginx", "a/b").validate().unwrap_err();
        assert!(matches!(err, LaunchError::Validation(_)));

        let err = ContainerSpec::new("nginx", "c").with_port(0).validate().unwrap_err();
        assert!(err.to_string().contains("container_port"));
    }

    #[test]
    fn test_validate_reservation_fits_engine() {
        ContainerSpec::new("nginx", "c")
            .with_mem_reservation_mb(MAX_MEM_RESERVATION_MB)
            .validate()
            .unwrap();

        let err = ContainerSpec::new("nginx", "c")
            .with_mem_reservation_mb(MAX_MEM_RESERVATION_MB + 1)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("mem_reservation_mb"), "{}", err);

        let spec: ContainerSpec = serde_json::from_str(
            r#"{"image_name": "nginx", "container_name": "c", "mem_reservation_mb": 18446744073709551615}"#,
        )
        .unwrap();
        assert!(matches!(spec.validate(), Err(LaunchError::Validation(_))));
    }

    #[test]
    fn test_validate_relative_extra_directory() {
        let err = ContainerSpec::new("nginx", "c")
            .with_extra_directory("relative/path")
            .validate()
            .unwrap_err();
        assert!(matches!(err, LaunchError::Validation(_)));
        assert!(err.to_string().contains("not absolute"));

        ContainerSpec::new("nginx", "c")
            .with_extra_directory("/data/scratch")
            .validate()
            .unwrap();
    }

    #[test]
    fn test_validate_volume_mode_rejected() {
        let spec: ContainerSpec = serde_json::from_str(
            r#"{
                "image_name": "nginx",
                "container_name": "c",
                "volumes": [{"bind": "/data/in", "host_path": "/srv/in", "mode": "rw"}]
            }"#,
        )
        .unwrap();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("mode"), "{}", err);
    }

    #[test]
    fn test_validate_relative_volume_paths() {
        let err = ContainerSpec::new("nginx", "c")
            .with_volume(VolumeSpec::host("srv/in", "/data/in"))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("host path"));

        let err = ContainerSpec::new("nginx", "c")
            .with_volume(VolumeSpec::scratch("data"))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("not absolute"));
    }
}
