//! Spool files shared with HylaFAX processes
//!
//! Status files, sequence counters and append-only logs are read and written
//! by several processes at once, so every access happens under an exclusive
//! `flock` held only for the read/modify/write itself.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

/// Name of the sequence counter inside a spool area
pub const SEQ_FILE: &str = "seqf";

/// Block until an exclusive lock on `file` is held
pub fn lock_exclusive(file: File) -> io::Result<Flock<File>> {
    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| io::Error::from(errno))
}

/// Run blocking file work off the async runtime
pub async fn run_blocking<F, T>(work: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(io::Error::other)?
}

/// Replace the contents of a modem status file
pub fn write_status_file(path: &Path, message: &str) -> io::Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o666)
        .open(path)?;
    let mut file = lock_exclusive(file)?;

    // Only truncate once the lock is held
    file.set_len(0)?;
    file.write_all(message.as_bytes())?;
    Ok(())
}

/// Increment and return the counter stored in `path`
///
/// A missing or empty counter file counts as zero.
pub fn next_sequence(path: &Path) -> io::Result<u64> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o666)
        .open(path)?;
    let mut file = lock_exclusive(file)?;

    let mut current = String::new();
    file.read_to_string(&mut current)?;
    let current = match current.trim() {
        "" => 0,
        value => value.parse::<u64>().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: invalid sequence number {:?}: {}", path.display(), value, e),
            )
        })?,
    };

    let next = current + 1;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", next)?;
    Ok(next)
}

/// Append one line to a shared log file
pub fn append_line(path: &Path, line: &str) -> io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o666)
        .open(path)?;
    let mut file = lock_exclusive(file)?;
    file.write_all(format!("{}\n", line).as_bytes())
}

/// Allocate the next number of a spool area (`log`, `recvq`, ...)
pub async fn sequence_for(spool: &Path, area: &str) -> io::Result<u64> {
    let path: PathBuf = spool.join(area).join(SEQ_FILE);
    run_blocking(move || next_sequence(&path)).await
}
