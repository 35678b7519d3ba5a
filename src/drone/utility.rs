//! Helper that executes call batches on the drone itself.
//!
//! Runs in-process for `localhost` and as `drone-dispatch utility` on remote
//! drones. Each call is executed in order; a call that fails leaves `null` in
//! its result slot and adds a warning, so one bad call never hides the
//! results of the rest of the batch.

use std::fs;
use std::path::Path;
use std::process::Command;

use serde_json::{Map, Value};

use crate::drone::call::{decode_batch, Call, RemoteResponse};
use crate::error::{DispatchError, Result};

#[derive(Debug, Clone)]
pub struct DroneUtility {
    /// Remote shell handed to rsync for transfers.
    rsync_shell: String,
}

impl Default for DroneUtility {
    fn default() -> Self {
        Self {
            rsync_shell: "ssh -o BatchMode=yes -o ConnectTimeout=30".to_string(),
        }
    }
}

impl DroneUtility {
    pub fn new(rsync_shell: impl Into<String>) -> Self {
        Self {
            rsync_shell: rsync_shell.into(),
        }
    }

    /// Decode a batch, run it, and encode the response.
    pub fn execute_payload(&self, payload: &str) -> Result<String> {
        let calls = decode_batch(payload)?;
        self.execute_calls(&calls).encode()
    }

    pub fn execute_calls(&self, calls: &[Call]) -> RemoteResponse {
        let mut response = RemoteResponse::default();
        for call in calls {
            match self.execute_call(call, &mut response.warnings) {
                Ok(value) => response.results.push(value),
                Err(e) => {
                    response.results.push(Value::Null);
                    response.warnings.push(format!("{} failed: {}", call, e));
                }
            }
        }
        response
    }

    fn execute_call(&self, call: &Call, warnings: &mut Vec<String>) -> Result<Value> {
        match call.method.as_str() {
            "initialize" => {
                fs::create_dir_all(call.str_param(0, "results_dir")?)?;
                Ok(Value::Null)
            }
            "write_to_file" => {
                let path = Path::new(call.str_param(0, "path")?);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, call.str_param(1, "contents")?)?;
                Ok(Value::Null)
            }
            "copy_file_or_directory" => {
                copy_file_or_directory(
                    Path::new(call.str_param(0, "source")?),
                    Path::new(call.str_param(1, "destination")?),
                )?;
                Ok(Value::Null)
            }
            "delete_file_or_directory" => {
                remove_path(Path::new(call.str_param(0, "path")?))?;
                Ok(Value::Null)
            }
            "read_pidfiles" => read_pidfiles(call),
            "get_file_from" => {
                let hostname = call.str_param(0, "hostname")?;
                let source = format!("{}:{}", hostname, call.str_param(1, "source")?);
                let destination = call.str_param(2, "destination")?;
                if let Some(parent) = Path::new(destination).parent() {
                    fs::create_dir_all(parent)?;
                }
                self.rsync(&source, destination)?;
                Ok(Value::Null)
            }
            "send_file_to" => {
                let hostname = call.str_param(0, "hostname")?;
                let mut source = call.str_param(1, "source")?.to_string();
                let mut destination = call.str_param(2, "destination")?.to_string();
                let can_fail = call.bool_param(3, "can_fail", false)?;
                if Path::new(&source).is_dir() {
                    // Copy directory contents rather than nesting the directory.
                    source.push('/');
                    destination.push('/');
                }
                let target = format!("{}:{}", hostname, destination);
                match self.rsync(&source, &target) {
                    Ok(()) => Ok(Value::Null),
                    Err(e) if can_fail => {
                        warnings.push(format!("Error sending {} to {}: {}", source, target, e));
                        Ok(Value::Null)
                    }
                    Err(e) => Err(e),
                }
            }
            other => Err(DispatchError::InvalidCall {
                method: other.to_string(),
                message: "unknown method".to_string(),
            }),
        }
    }

    fn rsync(&self, source: &str, destination: &str) -> Result<()> {
        let output = Command::new("rsync")
            .args(["-a", "-e", &self.rsync_shell, source, destination])
            .output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DispatchError::Internal(format!(
                "rsync exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Replace `destination` with a copy of `source`.
///
/// Copying a path onto itself is a no-op, and a missing source fails before
/// the destination is touched.
fn copy_file_or_directory(source: &Path, destination: &Path) -> Result<()> {
    let source_path = fs::canonicalize(source)?;
    if let Ok(destination_path) = fs::canonicalize(destination) {
        if destination_path == source_path {
            return Ok(());
        }
        remove_path(destination)?;
    }
    copy_tree(source, destination)
}

fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    if source.is_dir() {
        fs::create_dir_all(destination)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_tree(&entry.path(), &destination.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, destination)?;
    }
    Ok(())
}

/// Remove a file or a directory tree. A missing path is not an error.
fn remove_path(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn read_pidfiles(call: &Call) -> Result<Value> {
    let paths = call
        .param(0, "paths")
        .and_then(Value::as_array)
        .ok_or_else(|| DispatchError::InvalidCall {
            method: call.method.clone(),
            message: "missing list argument 'paths'".to_string(),
        })?;

    let mut contents = Map::new();
    for path in paths.iter().filter_map(Value::as_str) {
        let value = match fs::read_to_string(path) {
            Ok(text) => Value::String(text),
            Err(_) => Value::Null,
        };
        contents.insert(path.to_string(), value);
    }
    Ok(Value::Object(contents))
}
