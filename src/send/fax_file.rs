//! Combining the documents of a job into one TIFF

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum FaxFileError {
    #[error("Error parsing fax file entry {0:?}")]
    Entry(String),

    #[error("Fax file {path}: {source}")]
    Missing { path: String, source: io::Error },

    #[error("No part files found to combine")]
    Empty,

    #[error("tiffcp failed: {0}")]
    Tiffcp(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FaxItem {
    /// First TIFF directory to send
    start_dir: u32,
    path: PathBuf,
}

/// Queue file `fax` entries, resolved against the spool directory
#[derive(Debug)]
pub struct FaxFile {
    base: PathBuf,
    items: Vec<FaxItem>,
}

impl FaxFile {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            items: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Add a `startdir:subaddr:path` entry; the file must exist
    pub fn add_item(&mut self, entry: &str) -> Result<(), FaxFileError> {
        let mut parts = entry.splitn(3, ':');
        let (Some(start_dir), Some(_subaddr), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(FaxFileError::Entry(entry.to_string()));
        };
        let start_dir = start_dir
            .parse()
            .map_err(|_| FaxFileError::Entry(entry.to_string()))?;

        let path = self.base.join(path);
        std::fs::metadata(&path).map_err(|source| FaxFileError::Missing {
            path: path.display().to_string(),
            source,
        })?;

        self.items.push(FaxItem { start_dir, path });
        Ok(())
    }

    fn tiffcp_args(&self, out: &Path) -> Vec<String> {
        let mut args = Vec::with_capacity(self.items.len() + 2);
        args.push("-x".to_string());
        for item in &self.items {
            // tiffcp cannot handle ',' in file names
            args.push(format!("{},{},", item.path.display(), item.start_dir));
        }
        args.push(out.display().to_string());
        args
    }

    /// Write all parts into `out` with `tiffcp` (or a compatible `tool`)
    pub async fn write_to(&self, out: &Path, tool: &str) -> Result<(), FaxFileError> {
        if self.items.is_empty() {
            return Err(FaxFileError::Empty);
        }

        let output = Command::new(tool)
            .args(self.tiffcp_args(out))
            .output()
            .await
            .map_err(|e| FaxFileError::Tiffcp(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!("tiffcp: {}", stderr.trim());
            return Err(FaxFileError::Tiffcp(output.status.to_string()));
        }
        Ok(())
    }
}
