use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use toolgate::admin::{AdminServer, PKG_NAME, VERSION};
use toolgate::config::Config;
use toolgate::docker::DockerEngineManager;
use toolgate::engine::{RootLabel, SharedContainerManager};
use toolgate::historian;
use toolgate::launcher::Launcher;
use toolgate::pool::PoolConfig;
use toolgate::proxy::{Proxy, ProxyServer, ProxySettings};
use toolgate::routing::HostnameRouter;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("toolgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("toolgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let root_label = RootLabel::new(config.launcher.root_label.clone());
    let engine: SharedContainerManager =
        Arc::new(DockerEngineManager::new(&config.engine, root_label).await?);
    let historian = historian::from_config(&config.historian);
    let launcher = Arc::new(Launcher::new(
        Arc::clone(&engine),
        Arc::clone(&historian),
        &config.launcher,
    )?);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    let settings = ProxySettings::from_config(&config.proxy)?;
    let mut proxy = Proxy::new(Arc::clone(&engine), Arc::clone(&historian), settings, pool_config);
    if let Some(ref suffix) = config.routing.host_suffix {
        info!(host_suffix = %suffix, "Hostname routing enabled");
        proxy = proxy.with_router(HostnameRouter::new(suffix, &config.proxy.path_prefix));
    }
    let proxy = Arc::new(proxy);
    let pool_stats = proxy.pool().stats();

    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid proxy bind address");
            anyhow::anyhow!("Invalid proxy bind address: {}", e)
        })?;
    let proxy_server = ProxyServer::new(proxy_addr, proxy, shutdown_rx.clone());

    // Admin API only listens locally
    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(admin_addr, Arc::clone(&launcher), shutdown_rx.clone(), admin_token)
        .with_pool_stats(pool_stats);

    if let Some(inactive_secs) = config.purge.inactive_secs {
        let interval = Duration::from_secs(config.purge.interval_secs.max(1));
        let purge_launcher = Arc::clone(&launcher);
        let purge_shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            purge_inactive_loop(purge_launcher, inactive_secs, interval, purge_shutdown_rx).await;
        });
    }

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown; launched containers keep running
    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = admin_handle.await;
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn purge_inactive_loop(
    launcher: Arc<Launcher>,
    inactive_secs: u64,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match launcher.purge_inactive(inactive_secs).await {
                    Ok(removed) if !removed.is_empty() => {
                        info!(count = removed.len(), containers = ?removed, "Purged inactive containers");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Failed to purge inactive containers");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting toolgate");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        host_suffix = ?config.routing.host_suffix,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        docker_host = ?config.engine.docker_host,
        public_host = %config.engine.public_host(),
        timeout_secs = config.engine.timeout_secs,
        "Engine settings"
    );
    info!(
        root_label = %config.launcher.root_label,
        mem_limit_mb = config.launcher.mem_limit_mb,
        input_json_envvar = config.launcher.input_json_envvar,
        input_json_url = ?config.launcher.input_json_url,
        "Launcher settings"
    );
    info!(
        path_prefix = %config.proxy.path_prefix,
        logs_path = %config.proxy.logs_path,
        request_timeout_secs = config.proxy.request_timeout_secs,
        purge_inactive_secs = ?config.purge.inactive_secs,
        "Proxy settings"
    );
}
