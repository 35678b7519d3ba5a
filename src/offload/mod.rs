//! Job result directory lifecycle and offloading.
//!
//! A job directory moves through these states:
//!
//! 1. running: the completion service has no finish time for it
//! 2. finished but younger than the age limit
//! 3. eligible: finished and old enough
//! 4. attempted: enqueued at least once, directory still present
//! 5. offloaded: directory gone (terminal)
//!
//! Only the first three are decided here; the attempt count is kept on the
//! [`JobDirectory`], and success is observed lazily by checking whether the
//! directory still exists.

pub mod command;
pub mod completion;
pub mod job_directory;
pub mod offloader;
pub mod report;
pub mod sanitize;

pub use command::OffloadFn;
pub use completion::{CompletionService, InMemoryCompletionService, StatusFileCompletionService};
pub use job_directory::{JobDirectory, JobKind, OffloadOutcome, OffloadRequest};
pub use offloader::{CycleSummary, Offloader};
