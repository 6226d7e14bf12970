//! Staging files on the host the container engine runs on
//!
//! When the engine is local this is plain filesystem access. When it is
//! remote, files are written over SSH so that bind mounts and input payloads
//! land where the engine can see them.

use crate::config::HostFilesConfig;
use crate::error::EngineError;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait HostFiles: Send + Sync {
    /// Write `content` followed by a newline to `path`
    async fn write(&self, path: &str, content: &str) -> Result<(), EngineError>;

    /// Create `path` and any missing parents
    async fn mkdir_p(&self, path: &str) -> Result<(), EngineError>;

    /// Delete `path` and everything under it; a missing path is not an error
    async fn remove_dir_all(&self, path: &str) -> Result<(), EngineError>;
}

/// Build the writer described by configuration
pub fn from_config(config: &HostFilesConfig) -> Arc<dyn HostFiles> {
    match config {
        HostFilesConfig::Local => Arc::new(LocalHostFiles),
        HostFilesConfig::Remote {
            host,
            pem,
            ssh_username,
            strict_host_key_checking,
        } => Arc::new(RemoteHostFiles {
            host: host.clone(),
            pem: pem.clone(),
            ssh_username: ssh_username.clone(),
            strict_host_key_checking: *strict_host_key_checking,
        }),
    }
}

/// Files on the local filesystem
#[derive(Debug, Default, Clone)]
pub struct LocalHostFiles;

#[async_trait]
impl HostFiles for LocalHostFiles {
    async fn write(&self, path: &str, content: &str) -> Result<(), EngineError> {
        let mut data = String::with_capacity(content.len() + 1);
        data.push_str(content);
        data.push('\n');
        tokio::fs::write(path, data)
            .await
            .map_err(|e| EngineError::HostFiles(format!("write {}: {}", path, e)))
    }

    async fn mkdir_p(&self, path: &str) -> Result<(), EngineError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| EngineError::HostFiles(format!("mkdir {}: {}", path, e)))
    }

    async fn remove_dir_all(&self, path: &str) -> Result<(), EngineError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::HostFiles(format!("remove {}: {}", path, e))),
        }
    }
}

/// Files on a remote engine host, reached with `ssh`
#[derive(Debug, Clone)]
pub struct RemoteHostFiles {
    pub host: String,
    pub pem: Option<String>,
    pub ssh_username: Option<String>,
    pub strict_host_key_checking: bool,
}

impl RemoteHostFiles {
    fn ssh_args(&self, remote_command: String) -> Vec<String> {
        let mut args = Vec::new();
        if !self.strict_host_key_checking {
            args.push("-oStrictHostKeyChecking=no".to_string());
        }
        if let Some(ref pem) = self.pem {
            args.push("-i".to_string());
            args.push(pem.clone());
        }
        match self.ssh_username {
            Some(ref user) => args.push(format!("{}@{}", user, self.host)),
            None => args.push(self.host.clone()),
        }
        args.push(remote_command);
        args
    }

    async fn exec(&self, remote_command: String, stdin: Option<&[u8]>) -> Result<(), EngineError> {
        let args = self.ssh_args(remote_command);
        debug!(host = %self.host, command = ?args.last(), "Running remote host command");

        let mut child = Command::new("ssh")
            .args(&args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::HostFiles(format!("spawn ssh: {}", e)))?;

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data)
                .await
                .map_err(|e| EngineError::HostFiles(format!("ssh stdin: {}", e)))?;
            // Closing stdin lets the remote `cat` finish
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| EngineError::HostFiles(format!("ssh: {}", e)))?;
        if !output.status.success() {
            return Err(EngineError::HostFiles(format!(
                "ssh {} exited with {}: {}",
                self.host,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl HostFiles for RemoteHostFiles {
    async fn write(&self, path: &str, content: &str) -> Result<(), EngineError> {
        let command = format!("cat > {}", shell_words::quote(path));
        let mut data = content.as_bytes().to_vec();
        data.push(b'\n');
        self.exec(command, Some(&data)).await
    }

    async fn mkdir_p(&self, path: &str) -> Result<(), EngineError> {
        self.exec(format!("mkdir -p {}", shell_words::quote(path)), None)
            .await
    }

    async fn remove_dir_all(&self, path: &str) -> Result<(), EngineError> {
        self.exec(format!("rm -rf -- {}", shell_words::quote(path)), None)
            .await
    }
}
