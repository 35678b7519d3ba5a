//! Concurrent execution of queued drone calls.
//!
//! One tokio task per drone with pending work; each runs its drone's batch in
//! FIFO order and pushes the results onto a shared queue. Nothing is ordered
//! across drones.

pub mod task_queue;

pub use task_queue::{DroneResults, ThreadedTaskQueue};
