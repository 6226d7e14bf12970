use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Container engine connection
    #[serde(default)]
    pub engine: EngineConfig,

    /// Launch and eviction settings
    #[serde(default)]
    pub launcher: LauncherConfig,

    /// Reverse proxy behavior
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Hostname-based addressing
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Access history used for LRU eviction
    #[serde(default)]
    pub historian: HistorianConfig,

    /// Background removal of inactive containers
    #[serde(default)]
    pub purge: PurgeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Proxy port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API, always bound to localhost
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Token for admin API write operations.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum idle upstream connections per container (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            pid_file: None,
        }
    }
}

/// How files reach the engine's host
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HostFilesConfig {
    /// Engine shares this machine's filesystem
    #[default]
    Local,
    /// Engine runs elsewhere; files are written over SSH
    Remote {
        host: String,
        pem: Option<String>,
        ssh_username: Option<String>,
        #[serde(default)]
        strict_host_key_checking: bool,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Docker host URL (default: DOCKER_HOST, then common socket paths)
    pub docker_host: Option<String>,

    /// Upper bound for a single engine call in seconds (default: 120)
    #[serde(default = "default_engine_timeout")]
    pub timeout_secs: u64,

    /// Host name used in container URLs.
    /// Defaults to the remote host when files are remote, else "localhost"
    pub public_host: Option<String>,

    #[serde(default)]
    pub host_files: HostFilesConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            timeout_secs: default_engine_timeout(),
            public_host: None,
            host_files: HostFilesConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn public_host(&self) -> String {
        if let Some(ref host) = self.public_host {
            return host.clone();
        }
        match self.host_files {
            HostFilesConfig::Remote { ref host, .. } => host.clone(),
            HostFilesConfig::Local => "localhost".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LauncherConfig {
    /// Label key marking containers owned by this system
    #[serde(default = "default_root_label")]
    pub root_label: String,

    /// Absolute directory on the engine host for staged input
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Total memory reservations allowed, in MB (0 = unlimited)
    #[serde(default)]
    pub mem_limit_mb: u64,

    /// Deliver input as the INPUT_JSON environment variable (default: true)
    #[serde(default = "default_true")]
    pub input_json_envvar: bool,

    /// Base URL under which `data_dir` is served; when set, input is staged
    /// as a file and INPUT_JSON_URL points at it
    pub input_json_url: Option<String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            root_label: default_root_label(),
            data_dir: default_data_dir(),
            mem_limit_mb: 0,
            input_json_envvar: true,
            input_json_url: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Path prefix in front of container names (default: "docker/")
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// Path under a container that returns its engine logs
    #[serde(default = "default_logs_path")]
    pub logs_path: String,

    #[serde(default = "default_please_wait_title")]
    pub please_wait_title: String,

    /// HTML placed in the please-wait body without escaping
    #[serde(default = "default_please_wait_body")]
    pub please_wait_body_html: String,

    /// Seconds before the please-wait page reloads (default: 5)
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,

    /// Max seconds to wait for a container to respond (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Identity forwarded when the request carries none
    #[serde(default = "default_anonymous_user")]
    pub anonymous_user: String,

    /// Header carrying the identity to the container
    #[serde(default = "default_remote_user_header")]
    pub remote_user_header: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            path_prefix: default_path_prefix(),
            logs_path: default_logs_path(),
            please_wait_title: default_please_wait_title(),
            please_wait_body_html: default_please_wait_body(),
            refresh_secs: default_refresh_secs(),
            request_timeout_secs: default_request_timeout(),
            anonymous_user: default_anonymous_user(),
            remote_user_header: default_remote_user_header(),
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RoutingConfig {
    /// e.g. "docker.localhost": requests for `<name>.docker.localhost` are
    /// routed like `/<path_prefix><name>/...`
    pub host_suffix: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HistorianConfig {
    /// One append-only log per container under `root`
    File { root: Option<String> },
    /// Record nothing
    Null,
}

impl Default for HistorianConfig {
    fn default() -> Self {
        HistorianConfig::File { root: None }
    }
}

impl HistorianConfig {
    /// Storage root for the file historian
    pub fn root(&self) -> Option<PathBuf> {
        match self {
            HistorianConfig::File { root: Some(root) } => Some(PathBuf::from(root)),
            HistorianConfig::File { root: None } => Some(
                dirs_next::data_local_dir()
                    .unwrap_or_else(std::env::temp_dir)
                    .join("toolgate")
                    .join("historian"),
            ),
            HistorianConfig::Null => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PurgeConfig {
    /// Remove containers idle for longer than this many seconds
    pub inactive_secs: Option<u64>,

    /// How often to look for inactive containers (default: 60)
    #[serde(default = "default_purge_interval")]
    pub interval_secs: u64,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            inactive_secs: None,
            interval_secs: default_purge_interval(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_engine_timeout() -> u64 {
    120
}

fn default_root_label() -> String {
    "io.github.toolgate".to_string()
}

fn default_data_dir() -> String {
    "/tmp/toolgate-data".to_string()
}

fn default_true() -> bool {
    true
}

fn default_path_prefix() -> String {
    "docker/".to_string()
}

fn default_logs_path() -> String {
    "docker-logs".to_string()
}

fn default_please_wait_title() -> String {
    "Please wait".to_string()
}

fn default_please_wait_body() -> String {
    "<h1>Please wait</h1>\n<p>The container is starting up. \
     This page will reload automatically.</p>"
        .to_string()
}

fn default_refresh_secs() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_anonymous_user() -> String {
    "AnonymousUser".to_string()
}

fn default_remote_user_header() -> String {
    "x-remote-user".to_string()
}

fn default_purge_interval() -> u64 {
    60
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if !self.launcher.input_json_envvar && self.launcher.input_json_url.is_none() {
            errors.push(
                "launcher: enable 'input_json_envvar' or set 'input_json_url'".to_string(),
            );
        }

        if !Path::new(&self.launcher.data_dir).is_absolute() {
            errors.push(format!(
                "launcher: 'data_dir' must be absolute, got '{}'",
                self.launcher.data_dir
            ));
        }

        if self.launcher.root_label.trim().is_empty() {
            errors.push("launcher: 'root_label' must not be empty".to_string());
        }

        if let HostFilesConfig::Remote { ref host, .. } = self.engine.host_files {
            if host.trim().is_empty() {
                errors.push("engine.host_files: remote 'host' must not be empty".to_string());
            }
        }

        if let Some(ref suffix) = self.routing.host_suffix {
            if suffix.trim_start_matches('.').is_empty() {
                errors.push("routing: 'host_suffix' must not be empty".to_string());
            }
        }

        if self.proxy.remote_user_header.parse::<hyper::header::HeaderName>().is_err() {
            errors.push(format!(
                "proxy: invalid 'remote_user_header' '{}'",
                self.proxy.remote_user_header
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8000
bind = "127.0.0.1"
admin_port = 9000

[engine]
docker_host = "tcp://10.0.0.5:2375"
host_files = { kind = "remote", host = "10.0.0.5", pem = "key.pem", ssh_username = "ec2-user" }

[launcher]
root_label = "test-root"
data_dir = "/srv/toolgate"
mem_limit_mb = 100
input_json_envvar = false
input_json_url = "http://10.0.0.5/inputs"

[proxy]
please_wait_title = "Hold on"
logs_path = "logs"

[routing]
host_suffix = "docker.localhost"

[historian]
kind = "null"

[purge]
inactive_secs = 3600
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.admin_port, 9000);
        assert_eq!(config.engine.docker_host.as_deref(), Some("tcp://10.0.0.5:2375"));
        assert_eq!(
            config.engine.host_files,
            HostFilesConfig::Remote {
                host: "10.0.0.5".to_string(),
                pem: Some("key.pem".to_string()),
                ssh_username: Some("ec2-user".to_string()),
                strict_host_key_checking: false,
            }
        );
        assert_eq!(config.engine.public_host(), "10.0.0.5");
        assert_eq!(config.launcher.root_label, "test-root");
        assert_eq!(config.launcher.mem_limit_mb, 100);
        assert_eq!(config.proxy.please_wait_title, "Hold on");
        assert_eq!(config.proxy.logs_path, "logs");
        assert_eq!(config.proxy.path_prefix, "docker/");
        assert_eq!(config.routing.host_suffix.as_deref(), Some("docker.localhost"));
        assert_eq!(config.historian, HistorianConfig::Null);
        assert_eq!(config.historian.root(), None);
        assert_eq!(config.purge.inactive_secs, Some(3600));
        assert_eq!(config.purge.interval_secs, 60);
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.engine.host_files, HostFilesConfig::Local);
        assert_eq!(config.engine.public_host(), "localhost");
        assert_eq!(config.engine.timeout(), Duration::from_secs(120));
        assert!(config.launcher.input_json_envvar);
        assert_eq!(config.launcher.mem_limit_mb, 0);
        assert_eq!(config.proxy.anonymous_user, "AnonymousUser");
        assert!(config.historian.root().is_some());
        assert!(config.routing.host_suffix.is_none());
    }

    #[test]
    fn test_public_host_override() {
        let toml = r#"
[engine]
public_host = "engine.internal"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.engine.public_host(), "engine.internal");
    }

    #[test]
    fn test_file_historian_root() {
        let toml = r#"
[historian]
kind = "file"
root = "/var/lib/toolgate/history"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(
            config.historian.root(),
            Some(PathBuf::from("/var/lib/toolgate/history"))
        );
    }

    #[test]
    fn test_validate_requires_input_delivery() {
        let toml = r#"
[launcher]
input_json_envvar = false
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("input_json_envvar"), "{}", err);
    }

    #[test]
    fn test_validate_relative_data_dir() {
        let toml = r#"
[launcher]
data_dir = "relative/dir"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must be absolute"), "{}", err);
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[engine]
host_files = { kind = "remote", host = "" }

[launcher]
input_json_envvar = false
data_dir = "rel"

[proxy]
remote_user_header = "bad header"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("input_json_envvar"));
        assert!(err.contains("data_dir"));
        assert!(err.contains("remote 'host'"));
        assert!(err.contains("remote_user_header"));
    }
}
