use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::drone::Drone;
use crate::error::{DispatchError, Result};

/// Results of one dispatch cycle, keyed by drone hostname.
pub type DroneResults = HashMap<String, Vec<Value>>;

type Worker = JoinHandle<Result<()>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fans queued calls out to drones, one worker per drone, and gathers what
/// comes back.
///
/// A drone that hangs only holds its own worker; the others finish
/// independently. There is no timeout or cancellation at this layer.
#[derive(Debug, Default)]
pub struct ThreadedTaskQueue {
    results: Arc<Mutex<VecDeque<(String, Vec<Value>)>>>,
    workers: Mutex<HashMap<String, Worker>>,
}

impl ThreadedTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a worker for every drone that has queued calls.
    ///
    /// With `wait`, blocks until all workers finish and returns their
    /// results. Without it, returns `None` immediately; collect later with
    /// [`get_results`](Self::get_results).
    ///
    /// # Errors
    ///
    /// Fails before starting anything if results from an earlier cycle are
    /// still queued, workers are still registered, or a hostname appears
    /// twice in `drones`.
    pub async fn execute<'a, I>(&self, drones: I, wait: bool) -> Result<Option<DroneResults>>
    where
        I: IntoIterator<Item = &'a mut Drone>,
    {
        {
            let pending = lock(&self.results).len();
            if pending > 0 {
                return Err(DispatchError::TaskQueue(format!(
                    "execute called with {} unretrieved results",
                    pending
                )));
            }

            let mut workers = lock(&self.workers);
            if !workers.is_empty() {
                let mut running: Vec<&String> = workers.keys().collect();
                running.sort();
                return Err(DispatchError::TaskQueue(format!(
                    "execute called while workers are still registered for {:?}",
                    running
                )));
            }

            let busy: Vec<&'a mut Drone> = drones
                .into_iter()
                .filter(|d| d.has_queued_calls())
                .collect();
            let mut seen = HashSet::new();
            for drone in &busy {
                if !seen.insert(drone.hostname()) {
                    return Err(DispatchError::TaskQueue(format!(
                        "drone {} passed to execute more than once",
                        drone.hostname()
                    )));
                }
            }

            for drone in busy {
                let hostname = drone.hostname().to_string();
                let calls = drone.take_queued_calls();
                let client = drone.client().clone();
                let results = self.results.clone();
                tracing::debug!(hostname = %hostname, calls = calls.len(), "Starting drone worker");

                let handle = tokio::spawn(async move {
                    let output = client.execute_calls(calls).await?;
                    lock(&results).push_back((client.hostname().to_string(), output));
                    Ok(())
                });
                workers.insert(hostname, handle);
            }
        }

        if wait {
            Ok(Some(self.get_results().await?))
        } else {
            Ok(None)
        }
    }

    /// Join every outstanding worker.
    ///
    /// The worker map is emptied even when a worker failed. The first
    /// failure is returned with its original message; later ones are only
    /// logged.
    pub async fn wait_on_drones(&self) -> Result<()> {
        let workers: Vec<(String, Worker)> = lock(&self.workers).drain().collect();

        let mut first_error = None;
        for (hostname, handle) in workers {
            let message = match handle.await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("worker panicked: {}", e),
            };
            tracing::error!(hostname = %hostname, error = %message, "Drone worker failed");
            if first_error.is_none() {
                first_error = Some(format!("{}: {}", hostname, message));
            }
        }

        match first_error {
            Some(message) => Err(DispatchError::TaskQueue(message)),
            None => Ok(()),
        }
    }

    /// Wait for all workers, then drain the results queue.
    ///
    /// If a worker failed, the error is returned and the results of the
    /// drones that succeeded stay queued for the next call.
    pub async fn get_results(&self) -> Result<DroneResults> {
        self.wait_on_drones().await?;

        let drained: Vec<(String, Vec<Value>)> = lock(&self.results).drain(..).collect();
        let mut results = DroneResults::with_capacity(drained.len());
        for (hostname, output) in drained {
            if results.contains_key(&hostname) {
                return Err(DispatchError::TaskQueue(format!(
                    "task queue recorded results for drone {} more than once",
                    hostname
                )));
            }
            results.insert(hostname, output);
        }
        Ok(results)
    }

    /// True when no workers are registered and no results are waiting.
    pub fn is_idle(&self) -> bool {
        lock(&self.workers).is_empty() && lock(&self.results).is_empty()
    }

    #[cfg(test)]
    fn record_results(&self, hostname: &str, output: Vec<Value>) {
        lock(&self.results).push_back((hostname.to_string(), output));
    }
}
