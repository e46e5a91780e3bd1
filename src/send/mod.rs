//! Outbound fax jobs
//!
//! `send` is invoked by the scheduler for one job at a time. The job's
//! documents are combined into a single TIFF, dialed out through the switch,
//! and the queue file is updated as the call progresses.

mod error;
mod fax_file;
mod qfile_sender;
mod transmission;

pub use qfile_sender::run_send;

// Public API re-exports for the job runner's callers
#[allow(unused_imports)]
pub use error::{SendError, SendOutcome};
