//! Named pipes
//!
//! - `ensure_fifo` creates a modem control FIFO, refusing to reuse other files
//! - `send_fifo` writes one NUL-terminated message to a FIFO
//! - `FifoStream` turns every writer's payload into a message on a channel

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use tokio::sync::{mpsc, oneshot};

/// Create the FIFO at `path` unless one already exists there
pub fn ensure_fifo(path: &Path) -> io::Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => Ok(()),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a FIFO", path.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o600)).map_err(io::Error::from)
        }
        Err(e) => Err(e),
    }
}

/// Write a NUL-terminated message; blocks until a reader has the FIFO open
pub fn send_fifo(path: &Path, message: &str) -> io::Result<()> {
    let mut fifo = OpenOptions::new().write(true).open(path)?;
    let mut payload = Vec::with_capacity(message.len() + 1);
    payload.extend_from_slice(message.as_bytes());
    payload.push(0);
    fifo.write_all(&payload)
}

/// Messages read from a FIFO, plus the error that stopped the reader
pub struct FifoStream {
    pub messages: mpsc::UnboundedReceiver<String>,
    pub errors: oneshot::Receiver<io::Error>,
}

impl FifoStream {
    /// Start reading `path`
    ///
    /// The FIFO is reopened after every complete read since each open
    /// delivers exactly one writer's payload. Reading happens on a dedicated
    /// thread so a FIFO without writers never holds up the async runtime.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let (message_tx, messages) = mpsc::unbounded_channel();
        let (error_tx, errors) = oneshot::channel();

        let name = format!("fifo-{}", path.display());
        std::thread::Builder::new().name(name).spawn(move || {
            let err = loop {
                match std::fs::read(&path) {
                    Ok(payload) => {
                        let text = String::from_utf8_lossy(&payload);
                        let message = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
                        if message.is_empty() {
                            continue;
                        }
                        if message_tx.send(message.to_string()).is_err() {
                            // Owner is gone
                            return;
                        }
                    }
                    Err(e) => break e,
                }
            };
            let _ = error_tx.send(err);
        })?;

        Ok(Self { messages, errors })
    }
}
