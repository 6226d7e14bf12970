//! Hostname-based routing
//!
//! `<name>.<host_suffix>/<path>` is rewritten to `/<path_prefix><name>/<path>`
//! so the proxy handles both addressing forms identically.

use hyper::http::uri::{PathAndQuery, Uri};
use hyper::Request;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HostnameRouter {
    /// Always starts with '.'
    host_suffix: String,
    path_prefix: String,
}

impl HostnameRouter {
    pub fn new(host_suffix: &str, path_prefix: &str) -> Self {
        let host_suffix = host_suffix.trim_start_matches('.').to_ascii_lowercase();
        Self {
            host_suffix: format!(".{}", host_suffix),
            path_prefix: path_prefix.trim_start_matches('/').to_string(),
        }
    }

    /// Path-form equivalent of a request for `path` on `host`, or `None` when
    /// the host does not name a container.
    ///
    /// The suffix matches case-insensitively; the name keeps its case, since
    /// container names are case-sensitive.
    pub fn rewrite(&self, host: &str, path: &str) -> Option<String> {
        let hostname = strip_port(host);
        let split = hostname.len().checked_sub(self.host_suffix.len())?;
        let (name, suffix) = (hostname.get(..split)?, hostname.get(split..)?);
        if !suffix.eq_ignore_ascii_case(&self.host_suffix) || name.is_empty() {
            return None;
        }
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Some(format!("/{}{}{}", self.path_prefix, name, path))
    }

    /// Rewrite the request URI in place, keeping the query string.
    /// Returns whether the request was rewritten.
    pub fn apply<B>(&self, req: &mut Request<B>) -> bool {
        let Some(host) = request_host(req) else {
            return false;
        };
        let Some(path) = self.rewrite(&host, req.uri().path()) else {
            return false;
        };

        let path_and_query = match req.uri().query() {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };
        let Ok(path_and_query) = path_and_query.parse::<PathAndQuery>() else {
            return false;
        };

        let mut parts = req.uri().clone().into_parts();
        parts.path_and_query = Some(path_and_query);
        match Uri::from_parts(parts) {
            Ok(uri) => {
                debug!(host = %host, rewritten = %uri, "Routed by hostname");
                *req.uri_mut() = uri;
                true
            }
            Err(_) => false,
        }
    }
}

/// Host header, falling back to the URI authority (HTTP/2 and absolute-form)
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literals never match a suffix anyway
    if host.starts_with('[') {
        return host;
    }
    host.split(':').next().unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> HostnameRouter {
        HostnameRouter::new(".docker.localhost", "docker/")
    }

    #[test]
    fn test_rewrite_matches_path_form() {
        assert_eq!(
            router().rewrite("foobar.docker.localhost", "/"),
            Some("/docker/foobar/".to_string())
        );
        assert_eq!(
            router().rewrite("foobar.docker.localhost:8000", "/css/app.css"),
            Some("/docker/foobar/css/app.css".to_string())
        );
    }

    #[test]
    fn test_rewrite_ignores_other_hosts() {
        assert_eq!(router().rewrite("localhost", "/"), None);
        assert_eq!(router().rewrite("docker.localhost", "/"), None);
        assert_eq!(router().rewrite(".docker.localhost", "/"), None);
        assert_eq!(router().rewrite("foo.example.com", "/"), None);
    }

    #[test]
    fn test_rewrite_suffix_ignores_case_name_keeps_it() {
        assert_eq!(
            router().rewrite("foobar.Docker.LocalHost", "/"),
            Some("/docker/foobar/".to_string())
        );
        assert_eq!(
            router().rewrite("MyTool.docker.localhost", "/"),
            Some("/docker/MyTool/".to_string())
        );
        assert_eq!(
            HostnameRouter::new("Docker.Localhost", "docker/").rewrite("MyTool.DOCKER.LOCALHOST:8000", "/a"),
            Some("/docker/MyTool/a".to_string())
        );
    }

    #[test]
    fn test_rewrite_short_or_non_ascii_hosts() {
        assert_eq!(router().rewrite("x", "/"), None);
        assert_eq!(router().rewrite("é.docker.localhost", "/"), Some("/docker/é/".to_string()));
        assert_eq!(router().rewrite("ébdocker.localhost", "/"), None);
    }

    #[test]
    fn test_suffix_without_leading_dot() {
        let router = HostnameRouter::new("docker.localhost", "/docker/");
        assert_eq!(
            router.rewrite("foobar.docker.localhost", "/x"),
            Some("/docker/foobar/x".to_string())
        );
    }

    #[test]
    fn test_apply_keeps_query() {
        let mut req = Request::builder()
            .uri("/search?q=1")
            .header("Host", "foobar.docker.localhost")
            .body(())
            .unwrap();
        assert!(router().apply(&mut req));
        assert_eq!(req.uri().path(), "/docker/foobar/search");
        assert_eq!(req.uri().query(), Some("q=1"));

        let mut req = Request::builder()
            .uri("/search")
            .header("Host", "localhost:8000")
            .body(())
            .unwrap();
        assert!(!router().apply(&mut req));
        assert_eq!(req.uri().path(), "/search");
    }
}
