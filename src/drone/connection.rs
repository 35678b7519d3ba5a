use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::SshConfig;
use crate::drone::utility::DroneUtility;
use crate::error::{DispatchError, Result};

/// Exit status ssh reserves for its own failures (connect, auth, ...).
const SSH_FAILURE_STATUS: i32 = 255;

/// How a drone's call batches reach the helper that executes them.
#[async_trait]
pub trait DroneConnection: Send + Sync + std::fmt::Debug {
    /// Feed `payload` to the helper and return what it wrote to stdout.
    async fn run(&self, payload: String) -> Result<String>;

    /// Release any persistent connection state.
    fn close(&self) {}
}

/// Runs batches in this process.
#[derive(Debug, Clone)]
pub struct LocalConnection {
    utility: Arc<DroneUtility>,
}

impl LocalConnection {
    pub fn new(utility: DroneUtility) -> Self {
        Self {
            utility: Arc::new(utility),
        }
    }
}

impl Default for LocalConnection {
    fn default() -> Self {
        Self::new(DroneUtility::default())
    }
}

#[async_trait]
impl DroneConnection for LocalConnection {
    async fn run(&self, payload: String) -> Result<String> {
        let utility = self.utility.clone();
        tokio::task::spawn_blocking(move || utility.execute_payload(&payload))
            .await
            .map_err(|e| DispatchError::Internal(format!("local helper panicked: {}", e)))?
    }
}

/// Runs batches on a remote host through the ssh client.
#[derive(Debug, Clone)]
pub struct SshConnection {
    hostname: String,
    config: SshConfig,
}

impl SshConnection {
    pub fn new(hostname: impl Into<String>, config: SshConfig) -> Self {
        Self {
            hostname: hostname.into(),
            config,
        }
    }

    fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
        ];
        if let Some(port) = self.config.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(self.config.destination(&self.hostname));
        args.push(self.config.helper_command.clone());
        args
    }

    fn transport_error(&self, message: impl Into<String>) -> DispatchError {
        DispatchError::Transport {
            hostname: self.hostname.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl DroneConnection for SshConnection {
    async fn run(&self, payload: String) -> Result<String> {
        tracing::debug!(hostname = %self.hostname, bytes = payload.len(), "Sending batch over ssh");

        let Some((program, client_args)) = self.config.client.split_first() else {
            return Err(self.transport_error("no ssh client configured"));
        };
        let mut child = Command::new(program)
            .args(client_args)
            .args(self.ssh_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.transport_error(format!("failed to spawn ssh: {}", e)))?;

        // Fed from its own task so a helper that never reads stdin cannot
        // stall us past the call timeout. Dropping stdin ends the batch.
        let stdin = child.stdin.take();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(payload.as_bytes()).await?;
            }
            Ok::<(), std::io::Error>(())
        });

        let output =
            match tokio::time::timeout(self.config.call_timeout(), child.wait_with_output()).await
            {
                Ok(result) => result.map_err(|e| self.transport_error(e.to_string()))?,
                Err(_) => {
                    writer.abort();
                    return Err(self.transport_error(format!(
                        "timed out after {}s",
                        self.config.call_timeout_secs
                    )));
                }
            };

        // The helper is gone; a write still pending can never complete.
        writer.abort();
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if output.status.success() => {
                return Err(self.transport_error(format!("failed to write batch: {}", e)))
            }
            // The exit status below explains it better.
            Ok(Err(_)) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                return Err(DispatchError::Internal(format!(
                    "batch writer panicked: {}",
                    e
                )))
            }
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            tracing::info!(hostname = %self.hostname, "{}", line);
        }

        match output.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            Some(SSH_FAILURE_STATUS) => Err(self.transport_error(format!(
                "host unreachable: {}",
                stderr.trim()
            ))),
            code => Err(self.transport_error(format!(
                "helper exited with {:?}: {}",
                code,
                stderr.trim()
            ))),
        }
    }

    fn close(&self) {
        tracing::debug!(hostname = %self.hostname, "Closing ssh connection");
    }
}
