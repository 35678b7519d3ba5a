use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::config::{DroneConfig, SshConfig};
use crate::drone::call::{encode_batch, Call, RemoteResponse};
use crate::drone::connection::{DroneConnection, LocalConnection, SshConnection};
use crate::error::{DispatchError, Result};
use crate::notify::Notifier;

/// Hostname that selects in-process execution.
pub const LOCALHOST: &str = "localhost";

/// The part of a drone a worker needs to run a batch.
///
/// Cheap to clone; holds no queued calls, so workers never touch the
/// orchestrator's queue.
#[derive(Clone)]
pub struct DroneClient {
    hostname: String,
    connection: Arc<dyn DroneConnection>,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for DroneClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DroneClient")
            .field("hostname", &self.hostname)
            .field("connection", &self.connection)
            .finish()
    }
}

impl DroneClient {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Ship `calls` to the drone and return one result per call.
    ///
    /// Warnings reported by the helper go to the notifier. A response that
    /// cannot be decoded is logged with the raw payload and returned as a
    /// protocol error.
    pub async fn execute_calls(&self, calls: Vec<Call>) -> Result<Vec<Value>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        let payload = encode_batch(&calls)?;
        tracing::debug!(hostname = %self.hostname, calls = calls.len(), "Executing calls");

        let raw = self.connection.run(payload).await?;
        let response = match RemoteResponse::decode(&raw) {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(
                    hostname = %self.hostname,
                    error = %e,
                    payload = %raw,
                    "Invalid response from drone"
                );
                return Err(self.protocol_error(e.to_string()));
            }
        };

        let subject = format!("Warning from drone {}", self.hostname);
        for warning in &response.warnings {
            tracing::warn!(hostname = %self.hostname, warning = %warning, "Drone warning");
            self.notifier.notify(&subject, warning);
        }

        if response.results.len() != calls.len() {
            return Err(self.protocol_error(format!(
                "expected {} results, got {}",
                calls.len(),
                response.results.len()
            )));
        }
        Ok(response.results)
    }

    fn protocol_error(&self, message: String) -> DispatchError {
        DispatchError::Protocol {
            hostname: self.hostname.clone(),
            message,
        }
    }
}

/// One execution target and its pending calls.
#[derive(Debug)]
pub struct Drone {
    pub enabled: bool,
    pub max_processes: u32,
    pub active_processes: u32,
    pub allowed_users: Option<HashSet<String>>,
    calls: Vec<Call>,
    client: DroneClient,
}

impl Drone {
    pub fn new(
        config: DroneConfig,
        connection: Arc<dyn DroneConnection>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            enabled: config.enabled,
            max_processes: config.max_processes,
            active_processes: 0,
            allowed_users: config.allowed_users,
            calls: Vec::new(),
            client: DroneClient {
                hostname: config.hostname,
                connection,
                notifier,
            },
        }
    }

    /// Build a drone with the connection its hostname calls for: in-process
    /// for `localhost`, ssh otherwise.
    pub fn from_config(config: DroneConfig, ssh: &SshConfig, notifier: Arc<dyn Notifier>) -> Self {
        let connection: Arc<dyn DroneConnection> = if config.hostname == LOCALHOST {
            Arc::new(LocalConnection::default())
        } else {
            Arc::new(SshConnection::new(config.hostname.clone(), ssh.clone()))
        };
        Self::new(config, connection, notifier)
    }

    pub fn hostname(&self) -> &str {
        &self.client.hostname
    }

    pub fn is_local(&self) -> bool {
        self.hostname() == LOCALHOST
    }

    pub fn client(&self) -> &DroneClient {
        &self.client
    }

    /// Load as a sortable pair. Lower sorts as less loaded; at equal load the
    /// drone with more slots wins.
    pub fn used_capacity(&self) -> (f64, i64) {
        if self.max_processes == 0 {
            return (1.0, 0);
        }
        (
            self.active_processes as f64 / self.max_processes as f64,
            -(self.max_processes as i64),
        )
    }

    pub fn usable_by(&self, user: &str) -> bool {
        match self.allowed_users {
            Some(ref users) if !users.is_empty() => users.contains(user),
            _ => true,
        }
    }

    pub fn queue_call(&mut self, call: Call) {
        self.calls.push(call);
    }

    pub fn queued_calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn has_queued_calls(&self) -> bool {
        !self.calls.is_empty()
    }

    /// Empty the queue, returning what was in it.
    pub fn take_queued_calls(&mut self) -> Vec<Call> {
        std::mem::take(&mut self.calls)
    }

    /// Execute one call now, bypassing the queue.
    pub async fn call(&self, call: Call) -> Result<Value> {
        let mut results = self.client.execute_calls(vec![call]).await?;
        Ok(results.pop().unwrap_or(Value::Null))
    }

    /// Run every queued call. The queue is emptied whether or not the batch
    /// succeeds, so a failure never replays stale calls next cycle.
    pub async fn execute_queued_calls(&mut self) -> Result<Vec<Value>> {
        let calls = self.take_queued_calls();
        self.client.execute_calls(calls).await
    }

    /// Queue a transfer of `source` on this drone to `destination` on
    /// `other`.
    ///
    /// Transfers are routed through whichever side is local so two remote
    /// drones never need to reach each other, except when neither is local.
    pub fn send_file_to(
        &mut self,
        other: &mut Drone,
        source: &str,
        destination: &str,
        can_fail: bool,
    ) {
        if other.hostname() == self.hostname() {
            self.copy_file(source, destination);
        } else if other.is_local() {
            let call = Call::new("get_file_from")
                .arg(self.hostname())
                .arg(source)
                .arg(destination);
            other.queue_call(call);
        } else {
            let call = Call::new("send_file_to")
                .arg(other.hostname())
                .arg(source)
                .arg(destination)
                .arg(can_fail);
            self.queue_call(call);
        }
    }

    pub fn copy_file(&mut self, source: &str, destination: &str) {
        self.queue_call(
            Call::new("copy_file_or_directory")
                .arg(source)
                .arg(destination),
        );
    }

    pub fn shutdown(&mut self) {
        if self.has_queued_calls() {
            tracing::warn!(
                hostname = %self.hostname(),
                calls = self.calls.len(),
                "Shutting down drone with unexecuted calls"
            );
            self.calls.clear();
        }
        self.client.connection.close();
    }
}
