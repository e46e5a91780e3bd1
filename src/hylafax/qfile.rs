//! HylaFAX job queue files
//!
//! A queue file is a list of `tag:value` lines. The file stays exclusively
//! locked for as long as the [`Qfile`] is open so the scheduler cannot rewrite
//! it underneath a running job.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use nix::fcntl::Flock;
use thiserror::Error;

use super::spool::lock_exclusive;

#[derive(Error, Debug)]
pub enum QfileError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{path}: error parsing line {line}")]
    Parse { path: String, line: usize },
}

pub struct Qfile {
    path: PathBuf,
    params: Vec<(String, String)>,
    file: Option<Flock<File>>,
}

impl std::fmt::Debug for Qfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Qfile")
            .field("path", &self.path)
            .field("params", &self.params)
            .field("locked", &self.file.is_some())
            .finish()
    }
}

impl Qfile {
    /// Open and lock a queue file on disk
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QfileError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut file = lock_exclusive(file)?;

        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let params = parse(&content, &path.display().to_string())?;

        Ok(Self {
            path,
            params,
            file: Some(file),
        })
    }

    /// In-memory queue file; `write` does nothing
    pub fn parse(content: &str) -> Result<Self, QfileError> {
        Ok(Self {
            path: PathBuf::new(),
            params: parse(content, "<memory>")?,
            file: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// First value for `tag`, or the empty string
    pub fn get_string(&self, tag: &str) -> &str {
        self.params
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    pub fn get_all(&self, tag: &str) -> Vec<&str> {
        self.params
            .iter()
            .filter(|(t, _)| t == tag)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// First value for `tag` as integer; `None` when missing or not a number
    pub fn get_int(&self, tag: &str) -> Option<i64> {
        self.get_string(tag).parse().ok()
    }

    /// Replace the first value for `tag`; returns false if the tag is absent
    pub fn set(&mut self, tag: &str, value: impl Into<String>) -> bool {
        match self.params.iter_mut().find(|(t, _)| t == tag) {
            Some(param) => {
                param.1 = value.into();
                true
            }
            None => false,
        }
    }

    /// Append another `tag:value` line
    pub fn add(&mut self, tag: &str, value: impl Into<String>) {
        self.params.push((tag.to_string(), value.into()));
    }

    /// Rewrite the locked file with the current parameters
    pub fn write(&mut self) -> Result<(), QfileError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        let mut content = String::new();
        for (tag, value) in &self.params {
            content.push_str(tag);
            content.push(':');
            content.push_str(value);
            content.push('\n');
        }

        file.seek(SeekFrom::Start(0))?;
        file.write_all(content.as_bytes())?;
        file.set_len(content.len() as u64)?;
        file.sync_all()?;
        Ok(())
    }
}

fn parse(content: &str, origin: &str) -> Result<Vec<(String, String)>, QfileError> {
    content
        .lines()
        .enumerate()
        .map(|(idx, line)| {
            line.split_once(':')
                .map(|(tag, value)| (tag.trim().to_string(), value.trim().to_string()))
                .ok_or_else(|| QfileError::Parse {
                    path: origin.to_string(),
                    line: idx + 1,
                })
        })
        .collect()
}
