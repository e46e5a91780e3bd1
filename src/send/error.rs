use std::fmt;

use thiserror::Error;

use super::fax_file::FaxFileError;
use crate::hylafax::{DynamicConfigError, QfileError};

/// Failed transmission attempt, with a hint whether trying again can help
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct FaxError {
    message: String,
    retry: bool,
}

impl FaxError {
    pub fn new(message: impl Into<String>, retry: bool) -> Self {
        Self {
            message: message.into(),
            retry,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn retry(&self) -> bool {
        self.retry
    }
}

/// What the scheduler should do with the job next; the value is the exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Retry = 0,
    Failed = 1,
    Done = 2,
    /// Part of the scheduler's protocol, never produced here
    #[allow(dead_code)]
    Reformat = 3,
}

impl SendOutcome {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for SendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendOutcome::Retry => write!(f, "retry"),
            SendOutcome::Failed => write!(f, "failed"),
            SendOutcome::Done => write!(f, "done"),
            SendOutcome::Reformat => write!(f, "reformat"),
        }
    }
}

/// Job runner errors
#[derive(Error, Debug)]
pub enum SendError {
    #[error("Cannot open qfile {path}: {source}")]
    Qfile { path: String, source: QfileError },

    #[error("Error calling DynamicConfig: {0}")]
    DynamicConfig(#[from] DynamicConfigError),

    #[error("Transmission rejected by DynamicConfig")]
    Rejected,

    #[error("Cannot open session log: {0}")]
    SessionLog(std::io::Error),

    #[error("No fax file(s) found in qfile")]
    NoFaxFiles,

    #[error(transparent)]
    FaxFile(#[from] FaxFileError),

    #[error(transparent)]
    Fax(#[from] FaxError),
}

impl SendError {
    /// Exit code for a job that ended with this error
    pub fn outcome(&self) -> SendOutcome {
        match self {
            SendError::Fax(e) if e.retry() => SendOutcome::Retry,
            _ => SendOutcome::Failed,
        }
    }
}
