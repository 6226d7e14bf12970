use crate::config::ProxyConfig;
use crate::engine::SharedContainerManager;
use crate::error::{
    not_found_response, please_wait_response, text_response, EngineError, PleaseWaitPage,
    ProxyErrorCode,
};
use crate::historian::{self, SharedHistorian};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::routing::{request_host, HostnameRouter};
use anyhow::Context;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Identity of the requesting user. An embedding application inserts this
/// as a request extension; without it the anonymous user is forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUser(pub String);

/// Proxy behavior derived from [`ProxyConfig`]
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Without leading slash, e.g. "docker/"
    pub path_prefix: String,
    pub logs_path: String,
    pub page: PleaseWaitPage,
    pub anonymous_user: String,
    pub remote_user_header: HeaderName,
    pub request_timeout: Duration,
}

impl ProxySettings {
    pub fn from_config(config: &ProxyConfig) -> anyhow::Result<Self> {
        let remote_user_header = HeaderName::from_bytes(config.remote_user_header.as_bytes())
            .with_context(|| format!("Invalid remote_user_header: {}", config.remote_user_header))?;
        Ok(Self {
            path_prefix: config.path_prefix.trim_start_matches('/').to_string(),
            logs_path: config.logs_path.trim_matches('/').to_string(),
            page: PleaseWaitPage {
                title: config.please_wait_title.clone(),
                body_html: config.please_wait_body_html.clone(),
                refresh_secs: config.refresh_secs,
            },
            anonymous_user: config.anonymous_user.clone(),
            remote_user_header,
            request_timeout: config.request_timeout(),
        })
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        // Default config always carries a valid header name
        Self::from_config(&ProxyConfig::default()).unwrap_or_else(|_| Self {
            path_prefix: "docker/".to_string(),
            logs_path: "docker-logs".to_string(),
            page: PleaseWaitPage::default(),
            anonymous_user: "AnonymousUser".to_string(),
            remote_user_header: HeaderName::from_static("x-remote-user"),
            request_timeout: Duration::from_secs(30),
        })
    }
}

/// What a request path addresses
#[derive(Debug, PartialEq, Eq)]
enum Target<'a> {
    /// `/<prefix><name>/<rest>`
    Container { name: &'a str, rest: &'a str },
    /// `/<prefix><name>` without the trailing slash
    MissingSlash,
}

/// Maps requests to containers and forwards them
pub struct Proxy {
    engine: SharedContainerManager,
    historian: SharedHistorian,
    pool: Arc<ConnectionPool>,
    router: Option<HostnameRouter>,
    settings: ProxySettings,
}

impl Proxy {
    pub fn new(
        engine: SharedContainerManager,
        historian: SharedHistorian,
        settings: ProxySettings,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            engine,
            historian,
            pool: Arc::new(ConnectionPool::new(pool_config)),
            router: None,
            settings,
        }
    }

    /// Also accept `<name>.<host_suffix>` addressing
    pub fn with_router(mut self, router: HostnameRouter) -> Self {
        self.router = Some(router);
        self
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    fn target<'a>(&self, path: &'a str) -> Option<Target<'a>> {
        let after = path
            .strip_prefix('/')?
            .strip_prefix(self.settings.path_prefix.as_str())?;
        match after.split_once('/') {
            Some((name, rest)) if !name.is_empty() => Some(Target::Container { name, rest }),
            None if !after.is_empty() => Some(Target::MissingSlash),
            _ => None,
        }
    }

    fn please_wait(
        &self,
        code: ProxyErrorCode,
        detail: &str,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        please_wait_response(&self.settings.page, code, detail)
    }

    /// Handle one request; never fails, every outcome is a response
    pub async fn handle(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        if let Some(ref router) = self.router {
            router.apply(&mut req);
        }

        let path = req.uri().path().to_string();
        let (name, rest) = match self.target(&path) {
            Some(Target::Container { name, rest }) => (name.to_string(), rest.to_string()),
            Some(Target::MissingSlash) => {
                let location = match req.uri().query() {
                    Some(query) => format!("{}/?{}", path, query),
                    None => format!("{}/", path),
                };
                return redirect_response(&location);
            }
            None => return not_found_response(&format!("No container addressed by {}", path)),
        };

        if rest.trim_end_matches('/') == self.settings.logs_path {
            return self.container_logs(&name).await;
        }

        let upstream_path = match req.uri().query() {
            Some(query) => format!("/{}?{}", rest, query),
            None => format!("/{}", rest),
        };

        let remote_user = req
            .extensions()
            .get::<RemoteUser>()
            .map(|u| u.0.clone())
            .unwrap_or_else(|| self.settings.anonymous_user.clone());

        debug!(
            method = %req.method(),
            path = %upstream_path,
            container = %name,
            remote_user = %remote_user,
            "Incoming request"
        );

        let container_id = match self.engine.get_id(&name).await {
            Ok(id) => id,
            Err(e) => {
                debug!(container = %name, error = %e, "Container lookup failed");
                return self.please_wait(engine_error_code(&e), &e.to_string());
            }
        };

        let accessed = upstream_path.clone();
        let recorded =
            historian::offload(&self.historian, move |h| h.record(&container_id, &accessed)).await;
        if let Err(e) = recorded {
            warn!(container = %name, error = %e, "Failed to record access");
        }

        let base_url = match self.engine.get_url(&name).await {
            Ok(url) => url,
            Err(e) => {
                debug!(container = %name, error = %e, "Container URL not available");
                return self.please_wait(engine_error_code(&e), &e.to_string());
            }
        };

        self.set_forwarding_headers(&mut req, client_addr, &remote_user);

        let request_timeout = self.settings.request_timeout;
        let result = tokio::time::timeout(
            request_timeout,
            self.pool.send_request(req, &base_url, &upstream_path),
        )
        .await;

        match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_transient() => {
                debug!(container = %name, url = %base_url, error = %e, "Upstream not accepting requests yet");
                self.please_wait(ProxyErrorCode::UpstreamUnavailable, &e.to_string())
            }
            Ok(Err(e)) => {
                error!(container = %name, url = %base_url, error = %e, "Failed to forward request");
                not_found_response(&e.to_string())
            }
            Err(_) => {
                warn!(
                    container = %name,
                    url = %base_url,
                    timeout_secs = request_timeout.as_secs(),
                    "Request timed out"
                );
                self.please_wait(
                    ProxyErrorCode::UpstreamUnavailable,
                    &format!("Request timed out after {} seconds", request_timeout.as_secs()),
                )
            }
        }
    }

    /// Engine logs as plain text; failures come back as their error chain
    async fn container_logs(&self, name: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        match self.engine.logs(name).await {
            Ok(logs) => text_response(logs, None),
            Err(e) => {
                warn!(container = %name, error = %e, "Failed to fetch container logs");
                let trace = format!("{:?}", anyhow::Error::new(e));
                text_response(trace, Some(ProxyErrorCode::LogsUnavailable))
            }
        }
    }

    /// Overwrites the forwarding headers and the remote-user header; client
    /// supplied values never reach the container.
    fn set_forwarding_headers(
        &self,
        req: &mut Request<Incoming>,
        client_addr: SocketAddr,
        remote_user: &str,
    ) {
        let host = request_host(req);
        let headers = req.headers_mut();

        let request_id = headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }

        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }

        if let Some(value) = host.and_then(|h| HeaderValue::from_str(&h).ok()) {
            headers.insert(X_FORWARDED_HOST, value);
        }

        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

        match HeaderValue::from_str(remote_user) {
            Ok(value) => {
                headers.insert(self.settings.remote_user_header.clone(), value);
            }
            Err(_) => {
                headers.remove(&self.settings.remote_user_header);
            }
        }
    }
}

fn engine_error_code(e: &EngineError) -> ProxyErrorCode {
    match e {
        EngineError::NotFound(_) => ProxyErrorCode::ContainerNotFound,
        e if e.is_not_ready() => ProxyErrorCode::ContainerNotReady,
        _ => ProxyErrorCode::UpstreamUnavailable,
    }
}

fn redirect_response(location: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut builder = Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::CONTENT_TYPE, "text/plain");
    if let Ok(value) = HeaderValue::from_str(location) {
        builder = builder.header(hyper::header::LOCATION, value);
    }
    builder
        .body(
            Full::new(Bytes::from("Redirecting"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

/// The reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    proxy: Arc<Proxy>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, proxy: Arc<Proxy>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            proxy,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let proxy = Arc::clone(&self.proxy);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, proxy).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, proxy: Arc<Proxy>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let proxy = Arc::clone(&proxy);
        async move { Ok::<_, hyper::Error>(proxy.handle(req, addr).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
