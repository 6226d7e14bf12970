//! Docker Engine backend for [`ContainerManager`]

use crate::config::EngineConfig;
use crate::engine::{
    ContainerFilters, ContainerManager, ManagedContainer, Mount, MountKind, RootLabel, RunOptions,
};
use crate::error::EngineError;
use crate::host_files::{self, HostFiles};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerSummary, HostConfig, Mount as DockerMount,
    MountPointTypeEnum, MountTypeEnum, PortBinding, PortMap,
};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Manages containers on a local or remote Docker Engine
pub struct DockerEngineManager {
    client: Docker,
    root_label: RootLabel,
    /// Host name placed in container URLs
    public_host: String,
    host_files: Arc<dyn HostFiles>,
    timeout: Duration,
}

impl DockerEngineManager {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. `docker_host` from configuration
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn new(config: &EngineConfig, root_label: RootLabel) -> anyhow::Result<Self> {
        let timeout_secs = config.timeout_secs;
        let client = if let Some(ref host) = config.docker_host {
            Self::connect_to_host(host, timeout_secs).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host, timeout_secs).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}. \
                     Ensure Docker is running and accessible.",
                    host, e
                )
            })?
        } else {
            Self::connect_with_defaults(timeout_secs).await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self::with_client(client, config, root_label))
    }

    /// Wrap an already connected client
    pub fn with_client(client: Docker, config: &EngineConfig, root_label: RootLabel) -> Self {
        Self {
            client,
            root_label,
            public_host: config.public_host(),
            host_files: host_files::from_config(&config.host_files),
            timeout: config.timeout(),
        }
    }

    fn connect_to_host(host: &str, timeout_secs: u64) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, timeout_secs, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, timeout_secs, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults(timeout_secs: u64) -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        let mut tried_paths = Vec::new();

        for (name, path) in &socket_paths {
            if path.is_empty() || path.contains("//") {
                continue; // Skip invalid paths from empty env vars
            }

            if std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                match Docker::connect_with_socket(path, timeout_secs, bollard::API_DEFAULT_VERSION) {
                    Ok(client) => {
                        if client.ping().await.is_ok() {
                            return Ok(client);
                        }
                        tried_paths.push(format!("{} ({}) - socket exists but daemon not responding", path, name));
                    }
                    Err(e) => {
                        tried_paths.push(format!("{} ({}) - connection failed: {}", path, name, e));
                    }
                }
            }
        }

        match Docker::connect_with_socket_defaults() {
            Ok(client) => Ok(client),
            Err(e) => {
                let tried_info = if tried_paths.is_empty() {
                    "No Docker socket found at common locations".to_string()
                } else {
                    format!("Tried:\n  - {}", tried_paths.join("\n  - "))
                };

                anyhow::bail!(
                    "Cannot connect to Docker daemon. {}\n\n\
                     To fix this:\n\
                     - Start Docker Desktop, Colima, or dockerd\n\
                     - Or set DOCKER_HOST environment variable\n\
                     - Or set docker_host in the [engine] configuration\n\n\
                     Underlying error: {}",
                    tried_info, e
                )
            }
        }
    }

    /// Run an engine call under the configured time bound
    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, bollard::errors::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(e, what)),
            Err(_) => Err(EngineError::Timeout(self.timeout.as_secs())),
        }
    }

    /// Pull a fully qualified image reference
    async fn pull_reference(&self, reference: &str) -> Result<(), EngineError> {
        let (image, tag) = split_image_reference(reference);
        info!(image, tag, "Pulling Docker image");

        let options = CreateImageOptions {
            from_image: image.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };

        let pull = async {
            let mut stream = self.client.create_image(Some(options), None, None);
            while let Some(result) = stream.next().await {
                match result {
                    Ok(progress) => {
                        if let Some(status) = progress.status {
                            debug!(image, status, "Pull progress");
                        }
                        if let Some(error) = progress.error {
                            return Err(pull_error(reference, &error)
                                .unwrap_or_else(|| EngineError::Failed(format!("pull {}: {}", reference, error))));
                        }
                    }
                    Err(bollard::errors::Error::DockerResponseServerError {
                        status_code: 404,
                        message,
                    }) => return Err(EngineError::PossiblyOutOfDiskSpace(format!("{}: {}", reference, message))),
                    Err(e) => return Err(pull_error(reference, &e.to_string()).unwrap_or(EngineError::Api(e))),
                }
            }
            Ok(())
        };

        match tokio::time::timeout(self.timeout, pull).await {
            Ok(result) => result?,
            Err(_) => return Err(EngineError::Timeout(self.timeout.as_secs())),
        }

        info!(image, tag, "Image pulled successfully");
        Ok(())
    }

    async fn inspect(&self, name_or_id: &str) -> Result<ContainerInspectResponse, EngineError> {
        self.bounded(
            name_or_id,
            self.client
                .inspect_container(name_or_id, None::<InspectContainerOptions>),
        )
        .await
    }

    /// Remove a named volume if it carries the root label. Anonymous volumes
    /// are already gone with their container.
    async fn remove_owned_volume(&self, name: &str) -> Result<(), EngineError> {
        let volume = match self.bounded(name, self.client.inspect_volume(name)).await {
            Ok(volume) => volume,
            Err(EngineError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if !volume.labels.contains_key(self.root_label.key()) {
            return Ok(());
        }
        match self.remove_volume(name).await {
            Ok(()) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn container_config(&self, options: &RunOptions) -> Config<String> {
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: PortMap = HashMap::new();
        for port in &options.published_ports {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            // Empty host port lets the engine pick a free one
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(String::new()),
                }]),
            );
        }

        let mounts: Vec<DockerMount> = options.mounts.iter().map(docker_mount).collect();

        let host_config = HostConfig {
            port_bindings: if port_bindings.is_empty() { None } else { Some(port_bindings) },
            mounts: if mounts.is_empty() { None } else { Some(mounts) },
            memory_reservation: options.mem_reservation_mb.and_then(mb_to_bytes),
            nano_cpus: options.cpus.map(|cpus| (cpus * 1_000_000_000.0) as i64),
            ..Default::default()
        };

        Config {
            image: Some(options.image.clone()),
            cmd: options.cmd.clone(),
            env: if options.env.is_empty() { None } else { Some(options.env.clone()) },
            labels: Some(options.labels.clone()),
            exposed_ports: if exposed_ports.is_empty() { None } else { Some(exposed_ports) },
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn create(&self, options: &RunOptions) -> Result<String, EngineError> {
        let create_options = CreateContainerOptions {
            name: options.name.clone(),
            platform: None,
        };
        let response = self
            .bounded(
                &options.image,
                self.client
                    .create_container(Some(create_options), self.container_config(options)),
            )
            .await?;
        for warning in &response.warnings {
            warn!(container = %options.name, warning, "Engine warning on create");
        }
        Ok(response.id)
    }
}

#[async_trait]
impl ContainerManager for DockerEngineManager {
    async fn run(&self, options: RunOptions) -> Result<String, EngineError> {
        let id = match self.create(&options).await {
            Ok(id) => id,
            Err(EngineError::NotFound(_)) => {
                // Images are pulled on demand, as `docker run` does
                self.pull_reference(&options.image).await?;
                self.create(&options).await.map_err(|e| match e {
                    EngineError::NotFound(what) => EngineError::PossiblyOutOfDiskSpace(what),
                    other => other,
                })?
            }
            Err(e) => return Err(e),
        };

        info!(container = %options.name, container_id = %id, image = %options.image, "Created Docker container");

        let started = self
            .bounded(
                &options.name,
                self.client
                    .start_container(&id, None::<StartContainerOptions<String>>),
            )
            .await;
        if let Err(e) = started {
            // A created-but-dead container would hold the name and its reservation
            warn!(container = %options.name, container_id = %id, error = %e, "Failed to start container, removing it");
            if let Err(cleanup) = self.remove(&id).await {
                warn!(container_id = %id, error = %cleanup, "Failed to remove container after failed start");
            }
            return Err(e);
        }

        info!(container = %options.name, container_id = %id, "Started Docker container");
        Ok(id)
    }

    async fn pull(&self, image: &str, version: &str) -> Result<(), EngineError> {
        self.pull_reference(&format!("{}:{}", image, version)).await
    }

    async fn get_url(&self, name: &str) -> Result<String, EngineError> {
        let inspected = self.inspect(name).await?;
        let labels = inspected
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        let ports = inspected
            .network_settings
            .as_ref()
            .and_then(|s| s.ports.as_ref());
        resolve_url(name, &self.public_host, &self.root_label, &labels, ports)
    }

    async fn get_container(&self, name_or_id: &str) -> Result<ManagedContainer, EngineError> {
        Ok(from_inspect(self.inspect(name_or_id).await?))
    }

    async fn list(&self, filters: &ContainerFilters) -> Result<Vec<ManagedContainer>, EngineError> {
        let mut engine_filters: HashMap<String, Vec<String>> = HashMap::new();
        if !filters.labels.is_empty() {
            engine_filters.insert("label".to_string(), filters.labels.clone());
        }
        if let Some(ref name) = filters.name {
            engine_filters.insert("name".to_string(), vec![name.trim_start_matches('/').to_string()]);
        }

        let options = ListContainersOptions::<String> {
            all: true,
            filters: engine_filters,
            ..Default::default()
        };
        let summaries = self
            .bounded("containers", self.client.list_containers(Some(options)))
            .await?;

        // The engine's name filter matches substrings
        Ok(summaries
            .into_iter()
            .map(from_summary)
            .filter(|c| filters.matches(c))
            .collect())
    }

    async fn logs(&self, name: &str) -> Result<Vec<u8>, EngineError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            tail: "all".to_string(),
            ..Default::default()
        };

        let collect = async {
            let mut stream = self.client.logs(name, Some(options));
            let mut buffer = Vec::new();
            while let Some(chunk) = stream.next().await {
                match chunk? {
                    LogOutput::StdOut { message }
                    | LogOutput::StdErr { message }
                    | LogOutput::Console { message } => buffer.extend_from_slice(&message),
                    LogOutput::StdIn { .. } => {}
                }
            }
            Ok::<_, bollard::errors::Error>(buffer)
        };
        self.bounded(name, collect).await
    }

    async fn remove(&self, name_or_id: &str) -> Result<(), EngineError> {
        // `v` only covers anonymous volumes; named scratch volumes go separately
        let volumes = volume_names(&self.inspect(name_or_id).await?);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.bounded(
            name_or_id,
            self.client.remove_container(name_or_id, Some(options)),
        )
        .await?;
        info!(container = name_or_id, "Removed Docker container");

        for volume in volumes {
            if let Err(e) = self.remove_owned_volume(&volume).await {
                warn!(container = name_or_id, volume = %volume, error = %e, "Failed to remove scratch volume");
            }
        }
        Ok(())
    }

    async fn create_volume(&self) -> Result<String, EngineError> {
        let mut labels = HashMap::new();
        labels.insert(self.root_label.key().to_string(), "true".to_string());
        let options = CreateVolumeOptions {
            name: format!("toolgate-{}", uuid::Uuid::new_v4()),
            driver: "local".to_string(),
            driver_opts: HashMap::new(),
            labels,
        };
        let volume = self
            .bounded("volume", self.client.create_volume(options))
            .await?;
        debug!(volume = %volume.name, "Created scratch volume");
        Ok(volume.name)
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.bounded(
            name,
            self.client
                .remove_volume(name, Some(RemoveVolumeOptions { force: true })),
        )
        .await?;
        debug!(volume = name, "Removed scratch volume");
        Ok(())
    }

    fn host_files(&self) -> Arc<dyn HostFiles> {
        Arc::clone(&self.host_files)
    }
}

/// Map engine failures onto the typed taxonomy
fn classify(error: bollard::errors::Error, what: &str) -> EngineError {
    match error {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound(what.to_string()),
        other => EngineError::Api(other),
    }
}

/// Pull failures for a pinned image that point at missing local storage
fn pull_error(reference: &str, message: &str) -> Option<EngineError> {
    let lower = message.to_lowercase();
    let missing = lower.contains("not found")
        || lower.contains("manifest unknown")
        || lower.contains("does not exist")
        || lower.contains("pull access denied")
        || lower.contains("no space left");
    missing.then(|| EngineError::PossiblyOutOfDiskSpace(format!("{}: {}", reference, message)))
}

/// Split `name:tag`, ignoring a port in the registry host
pub fn split_image_reference(reference: &str) -> (&str, &str) {
    let last_segment_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[last_segment_start..].rfind(':') {
        Some(i) => {
            let split = last_segment_start + i;
            (&reference[..split], &reference[split + 1..])
        }
        None => (reference, "latest"),
    }
}

/// Names of the volumes mounted into an inspected container
fn volume_names(inspected: &ContainerInspectResponse) -> Vec<String> {
    inspected
        .mounts
        .iter()
        .flatten()
        .filter(|m| m.typ == Some(MountPointTypeEnum::VOLUME))
        .filter_map(|m| m.name.clone())
        .collect()
}

/// Memory reservation in bytes, or `None` when it does not fit the engine's i64
fn mb_to_bytes(mb: u64) -> Option<i64> {
    i64::try_from(mb).ok()?.checked_mul(1024 * 1024)
}

fn docker_mount(mount: &Mount) -> DockerMount {
    DockerMount {
        target: Some(mount.target.clone()),
        source: Some(mount.source.clone()),
        typ: Some(match mount.kind {
            MountKind::Bind => MountTypeEnum::BIND,
            MountKind::Volume => MountTypeEnum::VOLUME,
        }),
        read_only: Some(mount.read_only),
        ..Default::default()
    }
}

/// Resolve the URL for a container's declared port.
///
/// Checked in order: port label present, any ports published, declared port
/// published, declared port bound to a host port.
pub fn resolve_url(
    container: &str,
    host: &str,
    root_label: &RootLabel,
    labels: &HashMap<String, String>,
    ports: Option<&PortMap>,
) -> Result<String, EngineError> {
    let port_key = root_label.port_key();
    let container_port = labels.get(&port_key).ok_or_else(|| EngineError::NoPortLabel {
        container: container.to_string(),
        key: port_key.clone(),
    })?;

    let ports = match ports {
        Some(ports) if !ports.is_empty() => ports,
        _ => {
            return Err(EngineError::NoPortsOpen {
                container: container.to_string(),
            })
        }
    };

    let binding = ports
        .get(&format!("{}/tcp", container_port.trim()))
        .ok_or_else(|| {
            let mut available: Vec<&str> = ports.keys().map(String::as_str).collect();
            available.sort();
            EngineError::ExpectedPortMissing {
                container: container.to_string(),
                port: container_port.clone(),
                available: format!("{:?}", available),
            }
        })?;

    let host_port = binding
        .as_ref()
        .and_then(|bindings| bindings.first())
        .and_then(|b| b.host_port.as_deref())
        .filter(|p| p.parse::<u16>().is_ok())
        .ok_or_else(|| EngineError::MisconfiguredPort {
            container: container.to_string(),
            port: container_port.clone(),
        })?;

    Ok(format!("http://{}:{}", host, host_port))
}

fn from_summary(summary: ContainerSummary) -> ManagedContainer {
    let mut ports: HashMap<String, Vec<String>> = HashMap::new();
    for port in summary.ports.unwrap_or_default() {
        let proto = port
            .typ
            .map(|t| t.to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "tcp".to_string());
        let entry = ports.entry(format!("{}/{}", port.private_port, proto)).or_default();
        if let Some(public) = port.public_port {
            entry.push(public.to_string());
        }
    }

    ManagedContainer {
        id: summary.id.unwrap_or_default(),
        name: summary
            .names
            .and_then(|names| names.into_iter().next())
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        labels: summary.labels.unwrap_or_default(),
        ports,
        started_at: summary.created.and_then(|secs| DateTime::from_timestamp(secs, 0)),
        running: summary.state.as_deref() == Some("running"),
    }
}

fn from_inspect(inspected: ContainerInspectResponse) -> ManagedContainer {
    let ports = inspected
        .network_settings
        .and_then(|s| s.ports)
        .unwrap_or_default()
        .into_iter()
        .map(|(key, bindings)| {
            let host_ports = bindings
                .unwrap_or_default()
                .into_iter()
                .filter_map(|b| b.host_port)
                .collect();
            (key, host_ports)
        })
        .collect();

    let state = inspected.state;
    ManagedContainer {
        id: inspected.id.unwrap_or_default(),
        name: inspected
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        labels: inspected.config.and_then(|c| c.labels).unwrap_or_default(),
        ports,
        started_at: state
            .as_ref()
            .and_then(|s| s.started_at.as_deref())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)),
        running: state.and_then(|s| s.running).unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::MountPoint;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn bound(host_port: Option<&str>) -> Option<Vec<PortBinding>> {
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: host_port.map(String::from),
        }])
    }

    #[test]
    fn test_resolve_url_no_port_label() {
        let root = RootLabel::new("test-root");
        let err = resolve_url("c", "localhost", &root, &labels(&[("test-root", "true")]), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::NoPortLabel { .. }), "{err}");
        assert!(err.to_string().contains("test-root.port"));
    }

    #[test]
    fn test_resolve_url_no_ports_open() {
        let root = RootLabel::new("test-root");
        let labels = labels(&[("test-root.port", "80")]);

        let err = resolve_url("c", "localhost", &root, &labels, None).unwrap_err();
        assert!(matches!(err, EngineError::NoPortsOpen { .. }), "{err}");

        let empty = PortMap::new();
        let err = resolve_url("c", "localhost", &root, &labels, Some(&empty)).unwrap_err();
        assert!(matches!(err, EngineError::NoPortsOpen { .. }), "{err}");
    }

    #[test]
    fn test_resolve_url_expected_port_missing() {
        let root = RootLabel::new("test-root");
        let mut ports = PortMap::new();
        ports.insert("8080/tcp".to_string(), bound(Some("32768")));

        let err = resolve_url("c", "localhost", &root, &labels(&[("test-root.port", "80")]), Some(&ports))
            .unwrap_err();
        assert!(matches!(err, EngineError::ExpectedPortMissing { .. }), "{err}");
        assert!(err.to_string().contains("8080/tcp"));
    }

    #[test]
    fn test_resolve_url_misconfigured_port() {
        let root = RootLabel::new("test-root");
        let labels = labels(&[("test-root.port", "80")]);

        let mut unbound = PortMap::new();
        unbound.insert("80/tcp".to_string(), None);
        let err = resolve_url("c", "localhost", &root, &labels, Some(&unbound)).unwrap_err();
        assert!(matches!(err, EngineError::MisconfiguredPort { .. }), "{err}");

        let mut no_host_port = PortMap::new();
        no_host_port.insert("80/tcp".to_string(), bound(None));
        let err = resolve_url("c", "localhost", &root, &labels, Some(&no_host_port)).unwrap_err();
        assert!(matches!(err, EngineError::MisconfiguredPort { .. }), "{err}");

        let mut garbage = PortMap::new();
        garbage.insert("80/tcp".to_string(), bound(Some("")));
        let err = resolve_url("c", "localhost", &root, &labels, Some(&garbage)).unwrap_err();
        assert!(matches!(err, EngineError::MisconfiguredPort { .. }), "{err}");
    }

    #[test]
    fn test_resolve_url_success() {
        let root = RootLabel::new("test-root");
        let mut ports = PortMap::new();
        ports.insert("80/tcp".to_string(), bound(Some("32768")));
        ports.insert("443/tcp".to_string(), None);

        let url = resolve_url("c", "10.0.0.5", &root, &labels(&[("test-root.port", "80")]), Some(&ports))
            .unwrap();
        assert_eq!(url, "http://10.0.0.5:32768");
    }

    #[test]
    fn test_split_image_reference() {
        assert_eq!(split_image_reference("nginx:1.10.3-alpine"), ("nginx", "1.10.3-alpine"));
        assert_eq!(split_image_reference("nginx"), ("nginx", "latest"));
        assert_eq!(
            split_image_reference("registry:5000/team/tool"),
            ("registry:5000/team/tool", "latest")
        );
        assert_eq!(
            split_image_reference("registry:5000/team/tool:v2"),
            ("registry:5000/team/tool", "v2")
        );
    }

    #[test]
    fn test_pull_error_classification() {
        assert!(matches!(
            pull_error("no_such_image:latest", "pull access denied for no_such_image"),
            Some(EngineError::PossiblyOutOfDiskSpace(_))
        ));
        assert!(matches!(
            pull_error("x:1", "manifest unknown"),
            Some(EngineError::PossiblyOutOfDiskSpace(_))
        ));
        assert!(pull_error("x:1", "connection reset by peer").is_none());
    }

    #[test]
    fn test_docker_mount() {
        let mount = docker_mount(&Mount {
            kind: MountKind::Bind,
            source: "/host/in".to_string(),
            target: "/data/in".to_string(),
            read_only: true,
        });
        assert_eq!(mount.typ, Some(MountTypeEnum::BIND));
        assert_eq!(mount.read_only, Some(true));
        assert_eq!(mount.source.as_deref(), Some("/host/in"));
    }

    #[test]
    fn test_mb_to_bytes() {
        assert_eq!(mb_to_bytes(0), Some(0));
        assert_eq!(mb_to_bytes(512), Some(512 * 1024 * 1024));
        assert_eq!(mb_to_bytes(i64::MAX as u64 / (1024 * 1024)).map(|b| b > 0), Some(true));
        assert_eq!(mb_to_bytes(i64::MAX as u64 / (1024 * 1024) + 1), None);
        assert_eq!(mb_to_bytes(u64::MAX), None);
    }

    #[test]
    fn test_volume_names_skip_binds() {
        let inspected = ContainerInspectResponse {
            mounts: Some(vec![
                MountPoint {
                    typ: Some(MountPointTypeEnum::VOLUME),
                    name: Some("toolgate-1234".to_string()),
                    destination: Some("/data/scratch".to_string()),
                    ..Default::default()
                },
                MountPoint {
                    typ: Some(MountPointTypeEnum::BIND),
                    source: Some("/srv/in".to_string()),
                    destination: Some("/data/in".to_string()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };
        assert_eq!(volume_names(&inspected), vec!["toolgate-1234".to_string()]);
        assert!(volume_names(&ContainerInspectResponse::default()).is_empty());
    }
}
