//! Error types and the HTTP responses the proxy renders from them

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Errors raised by a container engine backend
#[derive(Debug, Error)]
pub enum EngineError {
    /// No container with the given name or ID exists
    #[error("No such container: {0}")]
    NotFound(String),

    /// The container carries no port-declaration label
    #[error("On container {container}, no label with key {key}")]
    NoPortLabel { container: String, key: String },

    /// The container publishes no ports at all
    #[error("Container {container} has no ports open")]
    NoPortsOpen { container: String },

    /// The declared port is not among the published ports
    #[error("On container {container}, port {port} is not available, but these are: {available}")]
    ExpectedPortMissing {
        container: String,
        port: String,
        available: String,
    },

    /// The declared port is published but has no usable host binding
    #[error("On container {container}, port {port} is misconfigured")]
    MisconfiguredPort { container: String, port: String },

    /// An image could not be found; for pinned images this almost always means
    /// local storage is exhausted
    #[error("Possibly out of disk space: {0}")]
    PossiblyOutOfDiskSpace(String),

    /// Staging files on the engine host failed
    #[error("Host file operation failed: {0}")]
    HostFiles(String),

    /// An engine call did not finish within its time bound
    #[error("Engine call timed out after {0} seconds")]
    Timeout(u64),

    /// The engine reported a failure outside the kinds above
    #[error("Engine operation failed: {0}")]
    Failed(String),

    /// Any other engine API failure
    #[error("Engine API error: {0}")]
    Api(#[from] bollard::errors::Error),
}

impl EngineError {
    /// True for the port-resolution failures seen while a container boots
    pub fn is_not_ready(&self) -> bool {
        matches!(
            self,
            EngineError::NoPortLabel { .. }
                | EngineError::NoPortsOpen { .. }
                | EngineError::ExpectedPortMissing { .. }
                | EngineError::MisconfiguredPort { .. }
        )
    }
}

/// Errors raised while launching a container
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The caller violated the launch contract; never retried
    #[error("Invalid container spec: {0}")]
    Validation(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Failed to serialize input: {0}")]
    Input(#[from] serde_json::Error),
}

/// Codes placed in the X-Proxy-Error header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Container exists but is not accepting connections yet
    ContainerNotReady,
    /// No container with the requested name
    ContainerNotFound,
    /// Upstream refused, reset, or garbled the connection
    UpstreamUnavailable,
    /// Hard protocol failure; usually a bad path inside the container
    PageNotFound,
    /// Container logs could not be retrieved
    LogsUnavailable,
}

impl ProxyErrorCode {
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::ContainerNotReady => "CONTAINER_NOT_READY",
            ProxyErrorCode::ContainerNotFound => "CONTAINER_NOT_FOUND",
            ProxyErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ProxyErrorCode::PageNotFound => "PAGE_NOT_FOUND",
            ProxyErrorCode::LogsUnavailable => "LOGS_UNAVAILABLE",
        }
    }
}

/// Reason phrase sent with every please-wait response
pub const PLEASE_WAIT_REASON: &str = "Container not yet available";

/// Title and body of the please-wait page
#[derive(Debug, Clone)]
pub struct PleaseWaitPage {
    /// Escaped before rendering
    pub title: String,
    /// Rendered as-is
    pub body_html: String,
    /// Seconds before the browser reloads the page
    pub refresh_secs: u64,
}

impl Default for PleaseWaitPage {
    fn default() -> Self {
        Self {
            title: "Please wait".to_string(),
            body_html: "<h1>Please wait</h1>\n<p>The container is starting up. \
                        This page will reload automatically.</p>"
                .to_string(),
            refresh_secs: 5,
        }
    }
}

impl PleaseWaitPage {
    pub fn render(&self, reason: &str) -> String {
        format!(
            "<!DOCTYPE html>\n<html>\n<head>\n\
             <meta http-equiv=\"refresh\" content=\"{}\">\n\
             <title>{}</title>\n</head>\n<body>\n{}\n\
             <!-- {} -->\n</body>\n</html>\n",
            self.refresh_secs,
            escape_html(&self.title),
            self.body_html,
            escape_html(reason).replace("--", "- -"),
        )
    }
}

/// Escape the characters that are significant in HTML text and attributes
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Reason phrases must be visible ASCII on a single line
fn sanitize_reason(reason: &str) -> String {
    reason
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { ' ' })
        .collect()
}

fn boxed(body: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// 503 page that tells the browser to retry.
///
/// The reason phrase is `Container not yet available: <detail>`, so callers can
/// tell failure causes apart from the status line alone.
pub fn please_wait_response(
    page: &PleaseWaitPage,
    code: ProxyErrorCode,
    detail: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let reason = sanitize_reason(&format!("{}: {}", PLEASE_WAIT_REASON, detail));
    let mut response = Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header("Content-Type", "text/html; charset=utf-8")
        .header("Retry-After", page.refresh_secs.to_string())
        .header("X-Proxy-Error", code.as_header_value())
        .body(boxed(page.render(&reason)))
        .expect("valid response with StatusCode enum and static headers");
    if let Ok(phrase) = hyper::ext::ReasonPhrase::try_from(reason.into_bytes()) {
        response.extensions_mut().insert(phrase);
    }
    response
}

/// 404 page for hard upstream failures
pub fn not_found_response(detail: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Not Found</title></head>\n\
         <body>\n<h1>Not Found</h1>\n<p>{}</p>\n</body>\n</html>\n",
        escape_html(detail)
    );
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "text/html; charset=utf-8")
        .header("X-Proxy-Error", ProxyErrorCode::PageNotFound.as_header_value())
        .body(boxed(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// 200 plain text response; also used to hand back logs-retrieval failures
pub fn text_response(
    body: impl Into<Bytes>,
    code: Option<ProxyErrorCode>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; charset=utf-8");
    if let Some(code) = code {
        builder = builder.header("X-Proxy-Error", code.as_header_value());
    }
    builder
        .body(boxed(body))
        .expect("valid response with StatusCode enum and static headers")
}
