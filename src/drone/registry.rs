use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::DispatcherConfig;
use crate::dispatch::{DroneResults, ThreadedTaskQueue};
use crate::drone::call::Call;
use crate::drone::host::Drone;
use crate::error::{DispatchError, Result};
use crate::notify::Notifier;

/// Owns every drone the scheduler talks to, and which of them have been
/// initialized.
#[derive(Debug)]
pub struct DroneRegistry {
    drones: BTreeMap<String, Drone>,
    started: HashSet<String>,
    results_dir: PathBuf,
}

impl DroneRegistry {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            drones: BTreeMap::new(),
            started: HashSet::new(),
            results_dir: results_dir.into(),
        }
    }

    pub fn from_config(config: &DispatcherConfig, notifier: Arc<dyn Notifier>) -> Self {
        let mut registry = Self::new(config.results_dir.clone());
        for drone_config in &config.drones {
            registry.add(Drone::from_config(
                drone_config.clone(),
                &config.ssh,
                notifier.clone(),
            ));
        }
        registry
    }

    /// Register a drone, replacing any previous one with the same hostname.
    pub fn add(&mut self, drone: Drone) {
        tracing::info!(hostname = %drone.hostname(), "Drone registered");
        self.drones.insert(drone.hostname().to_string(), drone);
    }

    pub fn get(&self, hostname: &str) -> Option<&Drone> {
        self.drones.get(hostname)
    }

    pub fn get_mut(&mut self, hostname: &str) -> Result<&mut Drone> {
        self.drones
            .get_mut(hostname)
            .ok_or_else(|| DispatchError::DroneNotFound(hostname.to_string()))
    }

    pub fn hostnames(&self) -> Vec<&str> {
        self.drones.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.drones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drones.is_empty()
    }

    /// Queue the one-time initialization of `hostname`. Returns true only the
    /// first time it is called for a host.
    pub fn ensure_started(&mut self, hostname: &str) -> Result<bool> {
        if self.started.contains(hostname) {
            return Ok(false);
        }
        let results_dir = self.results_dir.to_string_lossy().into_owned();
        self.get_mut(hostname)?
            .queue_call(Call::new("initialize").arg(results_dir));
        self.started.insert(hostname.to_string());
        tracing::debug!(hostname, "Drone initialization queued");
        Ok(true)
    }

    /// The least loaded enabled drone `user` may run on.
    pub fn pick_drone(&self, user: &str) -> Option<&str> {
        self.drones
            .values()
            .filter(|d| d.enabled && d.usable_by(user))
            .min_by(|a, b| {
                let (a_load, a_max) = a.used_capacity();
                let (b_load, b_max) = b.used_capacity();
                a_load.total_cmp(&b_load).then(a_max.cmp(&b_max))
            })
            .map(Drone::hostname)
    }

    /// Queue a transfer between two registered drones.
    pub fn send_file(
        &mut self,
        from: &str,
        to: &str,
        source: &str,
        destination: &str,
        can_fail: bool,
    ) -> Result<()> {
        if from == to {
            self.get_mut(from)?.copy_file(source, destination);
            return Ok(());
        }
        let mut sender = self
            .drones
            .remove(from)
            .ok_or_else(|| DispatchError::DroneNotFound(from.to_string()))?;
        let result = match self.drones.get_mut(to) {
            Some(receiver) => {
                sender.send_file_to(receiver, source, destination, can_fail);
                Ok(())
            }
            None => Err(DispatchError::DroneNotFound(to.to_string())),
        };
        self.drones.insert(from.to_string(), sender);
        result
    }

    /// Run every drone's queued calls concurrently and wait for the results.
    pub async fn execute_actions(&mut self, queue: &ThreadedTaskQueue) -> Result<DroneResults> {
        let results = queue.execute(self.drones.values_mut(), true).await?;
        Ok(results.unwrap_or_default())
    }

    pub fn shutdown(&mut self) {
        for drone in self.drones.values_mut() {
            drone.shutdown();
        }
        tracing::info!(drones = self.drones.len(), "Drones shut down");
    }
}
