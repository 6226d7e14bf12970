//! Pooled HTTP client for forwarding requests to containers

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request
    RequestBuild(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "Client error: {}", e),
            PoolError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Client(e) => Some(e),
            PoolError::RequestBuild(_) => None,
        }
    }
}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

impl PoolError {
    /// True when the upstream looks like it is still starting: refused or
    /// reset connections, garbled or truncated responses. Everything else is
    /// a hard failure.
    pub fn is_transient(&self) -> bool {
        match self {
            PoolError::Client(e) => {
                if e.is_connect() {
                    return true;
                }
                let mut source = std::error::Error::source(e);
                while let Some(err) = source {
                    if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
                        if hyper_err.is_parse()
                            || hyper_err.is_incomplete_message()
                            || hyper_err.is_canceled()
                            || hyper_err.is_closed()
                        {
                            return true;
                        }
                    }
                    if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
                        use std::io::ErrorKind::*;
                        if matches!(
                            io_err.kind(),
                            ConnectionRefused
                                | ConnectionReset
                                | ConnectionAborted
                                | BrokenPipe
                                | UnexpectedEof
                        ) {
                            return true;
                        }
                    }
                    source = err.source();
                }
                false
            }
            PoolError::RequestBuild(_) => false,
        }
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests handed to the client
    pub total_requests: AtomicU64,
    /// Requests that produced no upstream response
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to containers
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward `req` to `base_url` (e.g. `http://host:32768`) at
    /// `path_and_query`, keeping method, headers, and body.
    ///
    /// The Host header is replaced by the upstream authority.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        base_url: &str,
        path_and_query: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri: Uri = format!("{}{}", base_url.trim_end_matches('/'), path_and_query)
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| PoolError::RequestBuild(e.to_string()))?;
        let authority = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or_else(|| PoolError::RequestBuild(format!("No authority in {}", uri)))?;

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(uri);

        for (key, value) in parts.headers.iter() {
            if key == HOST || is_hop_by_hop(key) {
                continue;
            }
            builder = builder.header(key, value);
        }
        let host = HeaderValue::from_str(&authority)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
        builder = builder.header(HOST, host);

        let backend_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = match self.client.request(backend_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Connection-scoped headers are not forwarded
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}
