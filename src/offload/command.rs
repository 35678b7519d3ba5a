use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::config::OffloaderConfig;
use crate::error::{DispatchError, Result};
use crate::offload::job_directory::OffloadRequest;
use crate::offload::sanitize::{limit_file_count, sanitize_dir};

/// Join a bucket path and a name the way a filesystem join would.
fn join_uri(base: &str, name: &str) -> String {
    if base.is_empty() || base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// Build the gsutil command that uploads `dir` under `gs_path`.
///
/// `rsync` targets `<gs_path>/<basename of dir>`; `cp` targets `gs_path` and
/// lets gsutil append the directory name.
pub fn get_cmd_list(multiprocessing: bool, dir: &Path, gs_path: &str, use_rsync: bool) -> Vec<String> {
    let mut cmd = vec!["gsutil".to_string()];
    if multiprocessing {
        cmd.push("-m".to_string());
    }
    let target = if use_rsync {
        cmd.push("rsync".to_string());
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        join_uri(gs_path, &name)
    } else {
        cmd.push("cp".to_string());
        gs_path.to_string()
    };
    cmd.push("-eR".to_string());
    cmd.push(dir.to_string_lossy().into_owned());
    cmd.push(target);
    cmd
}

/// What to do with a directory picked for offload.
#[derive(Debug, Clone, PartialEq)]
pub enum OffloadFn {
    /// Upload with gsutil, deleting the local copy on success.
    Upload {
        gs_uri: String,
        gsutil: Vec<String>,
        multiprocessing: bool,
        use_rsync: bool,
        timeout: Duration,
        max_file_count: usize,
    },
    /// Delete results without uploading them.
    DeleteOnly,
}

impl OffloadFn {
    pub fn from_config(config: &OffloaderConfig) -> Self {
        if config.delete_only {
            return OffloadFn::DeleteOnly;
        }
        OffloadFn::Upload {
            gs_uri: config.gs_uri.clone(),
            gsutil: config.gsutil.clone(),
            multiprocessing: config.multiprocessing,
            use_rsync: config.use_rsync,
            timeout: config.offload_timeout(),
            max_file_count: config.max_file_count,
        }
    }

    /// Offload one directory.
    ///
    /// On failure the directory is left in place so the job stays open and
    /// is picked up again on the next cycle.
    pub async fn offload_dir(&self, request: &OffloadRequest) -> Result<()> {
        match self {
            OffloadFn::DeleteOnly => {
                tokio::fs::remove_dir_all(&request.dir).await?;
                tracing::debug!(dir = %request.dir.display(), "Deleted results");
                Ok(())
            }
            OffloadFn::Upload {
                gs_uri,
                gsutil,
                multiprocessing,
                use_rsync,
                timeout,
                max_file_count,
            } => {
                let dir = request.dir.clone();
                let max_file_count = *max_file_count;
                tokio::task::spawn_blocking(move || {
                    sanitize_dir(&dir)?;
                    limit_file_count(&dir, max_file_count)
                })
                .await
                .map_err(|e| DispatchError::Internal(format!("prepare task panicked: {}", e)))??;

                let gs_path = join_uri(gs_uri, &request.dest);
                // Swap the configured client in for the bare `gsutil`.
                let mut cmd = gsutil.clone();
                cmd.extend(
                    get_cmd_list(*multiprocessing, &request.dir, &gs_path, *use_rsync)
                        .into_iter()
                        .skip(1),
                );
                tracing::debug!(dir = %request.dir.display(), command = ?cmd, "Offloading");
                run_with_timeout(&cmd, *timeout).await?;

                tokio::fs::remove_dir_all(&request.dir).await?;
                tracing::debug!(dir = %request.dir.display(), "Offloaded results");
                Ok(())
            }
        }
    }
}

async fn run_with_timeout(cmd: &[String], timeout: Duration) -> Result<()> {
    let Some((program, args)) = cmd.split_first() else {
        return Err(DispatchError::Offload("empty command".to_string()));
    };
    let child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => {
            return Err(DispatchError::Offload(format!(
                "{} timed out after {}s",
                program,
                timeout.as_secs()
            )))
        }
    };
    if output.status.success() {
        Ok(())
    } else {
        Err(DispatchError::Offload(format!(
            "{} exited with {:?}: {}",
            program,
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}
