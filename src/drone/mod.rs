//! Execution targets and the calls dispatched to them.
//!
//! - [`Call`]: one named method invocation, batched per drone
//! - [`Drone`]: a local or ssh-reachable host with its queue of calls
//! - [`DroneConnection`]: how a batch reaches the drone's helper
//! - [`DroneRegistry`]: every known drone plus one-time initialization state
//! - [`DroneUtility`]: the helper that runs a batch on the drone side

pub mod call;
pub mod connection;
pub mod host;
pub mod registry;
pub mod utility;

pub use call::{Call, RemoteResponse};
pub use connection::{DroneConnection, LocalConnection, SshConnection};
pub use host::{Drone, DroneClient, LOCALHOST};
pub use registry::DroneRegistry;
pub use utility::DroneUtility;
