pub mod config;
pub mod dispatch;
pub mod drone;
pub mod error;
pub mod notify;
pub mod offload;
pub mod shutdown;

pub use error::{DispatchError, Result};
