//! Per-call session log
//!
//! Each call is assigned a communication id from `log/seqf`. Log lines go to
//! the process log and to `log/c<commid>` in the spool, where HylaFAX tools
//! expect to find them.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;

use super::spool::{append_line, sequence_for};

pub const LOG_DIR: &str = "log";

#[derive(Debug, Clone)]
pub struct SessionLog {
    job_id: u32,
    comm_seq: u64,
    comm_id: String,
    path: PathBuf,
}

impl SessionLog {
    /// Allocate a commid and derive the log file name; `job_id` 0 means no job
    pub async fn open(spool: &Path, job_id: u32) -> io::Result<Self> {
        let comm_seq = sequence_for(spool, LOG_DIR).await?;
        let comm_id = format!("{:08}", comm_seq);
        let path = spool.join(LOG_DIR).join(format!("c{}", comm_id));

        Ok(Self {
            job_id,
            comm_seq,
            comm_id,
            path,
        })
    }

    pub fn comm_seq(&self) -> u64 {
        self.comm_seq
    }

    pub fn comm_id(&self) -> &str {
        &self.comm_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, message: impl fmt::Display) {
        let message = message.to_string();
        if self.job_id != 0 {
            tracing::info!(commid = %self.comm_id, "({}) {}", self.job_id, message);
        } else {
            tracing::info!(commid = %self.comm_id, "{}", message);
        }

        let line = format!("{} {}", Local::now().format("%Y/%m/%d %H:%M:%S%.6f"), message);
        if let Err(e) = append_line(&self.path, &line) {
            tracing::warn!("Cannot write session log {}: {}", self.path.display(), e);
        }
    }
}
