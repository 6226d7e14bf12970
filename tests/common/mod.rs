//! Shared helpers: an in-memory container engine and tiny HTTP upstreams

#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use toolgate::engine::{ContainerFilters, ContainerManager, ManagedContainer, MountKind, RunOptions};
use toolgate::error::EngineError;
use toolgate::host_files::HostFiles;

/// Host files that only remember what was written and removed
#[derive(Default)]
pub struct RecordingHostFiles {
    pub writes: Mutex<Vec<(String, String)>>,
    pub dirs: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
}

#[async_trait]
impl HostFiles for RecordingHostFiles {
    async fn write(&self, path: &str, content: &str) -> Result<(), EngineError> {
        self.writes.lock().push((path.to_string(), content.to_string()));
        Ok(())
    }

    async fn mkdir_p(&self, path: &str) -> Result<(), EngineError> {
        self.dirs.lock().push(path.to_string());
        Ok(())
    }

    async fn remove_dir_all(&self, path: &str) -> Result<(), EngineError> {
        self.removed.lock().push(path.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct FakeState {
    containers: Vec<ManagedContainer>,
    urls: HashMap<String, String>,
    logs: HashMap<String, Vec<u8>>,
    runs: Vec<RunOptions>,
    /// "run <name>" / "remove <name>" in call order
    events: Vec<String>,
    next_id: u64,
    next_volume: u64,
    /// Scratch volumes that exist
    volumes: Vec<String>,
    /// Scratch volumes mounted by each container ID
    mounted: HashMap<String, Vec<String>>,
}

/// In-memory [`ContainerManager`]. Launched containers get a placeholder URL
/// nobody listens on; point it at a real upstream with [`FakeEngine::set_url`].
/// Inserted containers have no URL, like a container that is still booting.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
    pub host_files: Arc<RecordingHostFiles>,
    /// Delay inside `run`, to widen race windows
    pub run_delay: Mutex<Option<Duration>>,
    /// Makes every `run` fail with this message, creating nothing
    pub run_failure: Mutex<Option<String>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_url(&self, name: &str, url: &str) {
        self.state.lock().urls.insert(name.to_string(), url.to_string());
    }

    pub fn set_logs(&self, name: &str, logs: &[u8]) {
        self.state.lock().logs.insert(name.to_string(), logs.to_vec());
    }

    pub fn set_started_at(&self, name: &str, started_at: DateTime<Utc>) {
        let mut state = self.state.lock();
        if let Some(c) = state.containers.iter_mut().find(|c| c.name == name) {
            c.started_at = Some(started_at);
        }
    }

    /// Add a container without going through `run`
    pub fn insert(&self, name: &str, labels: &[(&str, &str)]) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("fake-{:04}", state.next_id);
        state.containers.push(ManagedContainer {
            id: id.clone(),
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ports: HashMap::new(),
            started_at: Some(Utc::now()),
            running: true,
        });
        id
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().containers.iter().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }

    pub fn runs(&self) -> Vec<RunOptions> {
        self.state.lock().runs.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    pub fn volumes(&self) -> Vec<String> {
        let mut volumes = self.state.lock().volumes.clone();
        volumes.sort();
        volumes
    }

    pub fn id_of(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .containers
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.id.clone())
    }

    fn find(&self, name_or_id: &str) -> Option<ManagedContainer> {
        self.state
            .lock()
            .containers
            .iter()
            .find(|c| c.name == name_or_id || c.id == name_or_id)
            .cloned()
    }
}

#[async_trait]
impl ContainerManager for FakeEngine {
    async fn run(&self, options: RunOptions) -> Result<String, EngineError> {
        let delay = *self.run_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = self.run_failure.lock().clone() {
            return Err(EngineError::Failed(message));
        }

        let mut state = self.state.lock();
        if state.containers.iter().any(|c| c.name == options.name) {
            return Err(EngineError::Failed(format!(
                "Conflict. The container name \"/{}\" is already in use",
                options.name
            )));
        }
        state.next_id += 1;
        let id = format!("fake-{:04}", state.next_id);
        state.containers.push(ManagedContainer {
            id: id.clone(),
            name: options.name.clone(),
            labels: options.labels.clone(),
            ports: HashMap::new(),
            started_at: Some(Utc::now()),
            running: true,
        });
        let scratch = options
            .mounts
            .iter()
            .filter(|m| m.kind == MountKind::Volume)
            .map(|m| m.source.clone())
            .collect();
        state.mounted.insert(id.clone(), scratch);
        // Published ports are assigned at start, like a real engine
        let url = "http://127.0.0.1:1".to_string();
        state.urls.entry(options.name.clone()).or_insert(url);
        state.events.push(format!("run {}", options.name));
        state.runs.push(options);
        Ok(id)
    }

    async fn pull(&self, _image: &str, _version: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn get_url(&self, name: &str) -> Result<String, EngineError> {
        if self.find(name).is_none() {
            return Err(EngineError::NotFound(name.to_string()));
        }
        self.state
            .lock()
            .urls
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NoPortsOpen {
                container: name.to_string(),
            })
    }

    async fn get_container(&self, name_or_id: &str) -> Result<ManagedContainer, EngineError> {
        self.find(name_or_id)
            .ok_or_else(|| EngineError::NotFound(name_or_id.to_string()))
    }

    async fn list(&self, filters: &ContainerFilters) -> Result<Vec<ManagedContainer>, EngineError> {
        Ok(self
            .state
            .lock()
            .containers
            .iter()
            .filter(|c| filters.matches(c))
            .cloned()
            .collect())
    }

    async fn logs(&self, name: &str) -> Result<Vec<u8>, EngineError> {
        if self.find(name).is_none() {
            return Err(EngineError::NotFound(name.to_string()));
        }
        Ok(self.state.lock().logs.get(name).cloned().unwrap_or_default())
    }

    async fn remove(&self, name_or_id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let Some(pos) = state
            .containers
            .iter()
            .position(|c| c.name == name_or_id || c.id == name_or_id)
        else {
            return Err(EngineError::NotFound(name_or_id.to_string()));
        };
        let removed = state.containers.remove(pos);
        state.urls.remove(&removed.name);
        let scratch = state.mounted.remove(&removed.id).unwrap_or_default();
        state.volumes.retain(|v| !scratch.contains(v));
        state.events.push(format!("remove {}", removed.name));
        Ok(())
    }

    async fn create_volume(&self) -> Result<String, EngineError> {
        let mut state = self.state.lock();
        state.next_volume += 1;
        let name = format!("toolgate-vol-{}", state.next_volume);
        state.volumes.push(name.clone());
        Ok(name)
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let Some(pos) = state.volumes.iter().position(|v| v == name) else {
            return Err(EngineError::NotFound(name.to_string()));
        };
        state.volumes.remove(pos);
        Ok(())
    }

    fn host_files(&self) -> Arc<dyn HostFiles> {
        Arc::clone(&self.host_files) as Arc<dyn HostFiles>
    }
}

/// Bind an ephemeral port on localhost
pub async fn bind_local() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Upstream that answers every request with `<body> <path-and-query>` and
/// echoes the remote-user header it received
pub async fn spawn_upstream(body: &'static str) -> SocketAddr {
    let (listener, _) = bind_local().await;
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    let user = req
                        .headers()
                        .get("x-remote-user")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string();
                    let pq = req
                        .uri()
                        .path_and_query()
                        .map(|pq| pq.as_str().to_string())
                        .unwrap_or_default();
                    Ok::<_, Infallible>(
                        Response::builder()
                            .header("x-upstream-user", user)
                            .body(Full::new(Bytes::from(format!("{} {}", body, pq))))
                            .unwrap(),
                    )
                });
                let _ = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// Upstream that accepts connections and answers with garbage
pub async fn spawn_garbage_upstream() -> SocketAddr {
    let (listener, _) = bind_local().await;
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(b"NOT HTTP AT ALL\r\n\r\n").await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

/// A localhost port with nothing listening
pub async fn closed_port() -> u16 {
    let (listener, port) = bind_local().await;
    drop(listener);
    port
}

/// Wait for a port to become available (server listening)
pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send a raw HTTP/1.1 request and return the full response text
pub async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let mut request = format!("{} {} HTTP/1.1\r\n", method, path);
    if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("host")) {
        request.push_str(&format!("Host: 127.0.0.1:{}\r\n", port));
    }
    for (k, v) in headers {
        request.push_str(&format!("{}: {}\r\n", k, v));
    }
    request.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    ));
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Send a simple HTTP request and get response
pub async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    http_request(port, "GET", path, &[], "").await
}

/// Send HTTP request with custom Host header
pub async fn http_get_with_host(
    port: u16,
    path: &str,
    host: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    http_request(port, "GET", path, &[("Host", host)], "").await
}

/// Status line of a raw response
pub fn status_line(response: &str) -> &str {
    response.lines().next().unwrap_or("")
}

/// Body of a raw response (after the blank line)
pub fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

/// Value of a header in a raw response, case-insensitive
pub fn header_of<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let head = response.split_once("\r\n\r\n").map(|(h, _)| h).unwrap_or(response);
    head.lines().skip(1).find_map(|line| {
        let (k, v) = line.split_once(':')?;
        if k.trim().eq_ignore_ascii_case(name) {
            Some(v.trim())
        } else {
            None
        }
    })
}
