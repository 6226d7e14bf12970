use crate::error::{EngineError, LaunchError};
use crate::launcher::{ContainerSpec, Launcher};
use crate::pool::PoolStats;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted launch request body
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid response with StatusCode enum and static header")
}

fn json_error(status: StatusCode, message: impl std::fmt::Display) -> Response<Full<Bytes>> {
    json_response(status, serde_json::json!({ "error": message.to_string() }))
}

/// Launch failures map onto distinct statuses so callers can alert on disk
/// pressure separately
fn launch_error_status(e: &LaunchError) -> StatusCode {
    match e {
        LaunchError::Validation(_) | LaunchError::Input(_) => StatusCode::BAD_REQUEST,
        LaunchError::Engine(EngineError::PossiblyOutOfDiskSpace(_)) => StatusCode::INSUFFICIENT_STORAGE,
        LaunchError::Engine(_) => StatusCode::BAD_GATEWAY,
    }
}

struct AdminState {
    launcher: Arc<Launcher>,
    pool_stats: Option<Arc<PoolStats>>,
    auth_token: String,
}

/// Admin API for launching and managing containers
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        launcher: Arc<Launcher>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            state: Arc::new(AdminState {
                launcher,
                pool_stats: None,
                auth_token,
            }),
            shutdown_rx,
        }
    }

    /// Report proxy pool counters under GET /stats
    pub fn with_pool_stats(mut self, stats: Arc<PoolStats>) -> Self {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            state.pool_stats = Some(stats);
        }
        self
    }

    pub fn auth_token(&self) -> &str {
        &self.state.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    _addr: SocketAddr,
    state: Arc<AdminState>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_admin_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

/// Decoded value of `key` in a query string
fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k == key {
            urlencoding::decode(v).ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

async fn handle_admin_request(
    req: Request<Incoming>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    let response = match (&method, path.as_str()) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        _ if !check_auth(&req, &state.auth_token) => {
            warn!(%method, %path, "Unauthorized admin API request");
            response(StatusCode::UNAUTHORIZED, "unauthorized")
        }

        (&Method::POST, "/containers") => launch(req, &state.launcher).await,

        (&Method::GET, "/containers") => list(&state.launcher).await,

        (&Method::DELETE, p) if p.starts_with("/containers/") => {
            let name = p.trim_start_matches("/containers/");
            if name.is_empty() || name.contains('/') {
                response(StatusCode::BAD_REQUEST, "missing container name")
            } else {
                match state.launcher.kill(name).await {
                    Ok(()) => {
                        info!(container = name, "Container removed via admin API");
                        json_response(StatusCode::OK, serde_json::json!({ "removed": name }))
                    }
                    Err(EngineError::NotFound(_)) => {
                        json_error(StatusCode::NOT_FOUND, format!("No such container: {}", name))
                    }
                    Err(e) => {
                        error!(container = name, error = %e, "Failed to remove container");
                        json_error(StatusCode::BAD_GATEWAY, e)
                    }
                }
            }
        }

        (&Method::POST, "/purge") => match query_param(req.uri().query(), "label") {
            Some(label) if !label.is_empty() => match state.launcher.purge_by_label(&label).await {
                Ok(removed) => json_response(StatusCode::OK, serde_json::json!({ "removed": removed })),
                Err(e) => {
                    error!(label, error = %e, "Purge failed");
                    json_error(StatusCode::BAD_GATEWAY, e)
                }
            },
            _ => response(StatusCode::BAD_REQUEST, "missing label"),
        },

        (&Method::GET, "/stats") => match state.pool_stats {
            Some(ref stats) => json_response(
                StatusCode::OK,
                serde_json::json!({
                    "total_requests": stats.get_total_requests(),
                    "failed_requests": stats.get_failed_requests(),
                }),
            ),
            None => response(StatusCode::NOT_FOUND, "not found"),
        },

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn launch(req: Request<Incoming>, launcher: &Launcher) -> Response<Full<Bytes>> {
    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("Failed to read body: {}", e)),
    };
    let spec: ContainerSpec = match serde_json::from_slice(&body) {
        Ok(spec) => spec,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("Invalid container spec: {}", e)),
    };

    let name = spec.container_name.clone();
    match launcher.run(spec).await {
        Ok(url) => json_response(
            StatusCode::CREATED,
            serde_json::json!({ "name": name, "url": url }),
        ),
        Err(e) => {
            let status = launch_error_status(&e);
            if status == StatusCode::BAD_REQUEST {
                warn!(container = %name, error = %e, "Rejected launch request");
            } else {
                error!(container = %name, error = %e, "Launch failed");
            }
            json_error(status, e)
        }
    }
}

async fn list(launcher: &Launcher) -> Response<Full<Bytes>> {
    let containers = match launcher.list_owned().await {
        Ok(containers) => containers,
        Err(e) => return json_error(StatusCode::BAD_GATEWAY, e),
    };
    let root = launcher.root_label();
    let historian = launcher.historian();

    let entries: Vec<serde_json::Value> = containers
        .iter()
        .map(|c| {
            let last_access = historian
                .last_access(&c.id)
                .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339());
            serde_json::json!({
                "name": c.name,
                "id": c.id,
                "running": c.running,
                "port": root.port(&c.labels),
                "mem_reservation_mb": root.mem_reservation_mb(&c.labels),
                "started_at": c.started_at.map(|t| t.to_rfc3339()),
                "last_access": last_access,
            })
        })
        .collect();

    json_response(StatusCode::OK, serde_json::json!({ "containers": entries }))
}
