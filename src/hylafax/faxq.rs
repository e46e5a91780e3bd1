//! Notifications to the HylaFAX queue manager
//!
//! All messages go through one long-lived writer task, so the queue manager
//! sees them in exactly the order `send` was called. Each caller gets back
//! the outcome of its own write.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::fifo::send_fifo;
use super::spool::run_blocking;

/// Modem capabilities announced when a device becomes ready.
/// No polling; Class 2.0 style `(0,1),(0-5),(0-4),(0-2),(0-3),(0-3),(0),(0-7)`.
pub const CAPABILITIES: &str = "pcbffff01";

/// Queue manager FIFO inside the spool directory
pub const FAXQ_FIFO: &str = "FIFO";

const QUEUE_DEPTH: usize = 64;

#[derive(Error, Debug)]
pub enum FaxqError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("notifier is not running")]
    Closed,
}

/// Where notification messages end up
#[async_trait]
pub trait NotifySink: Send {
    async fn write(&mut self, message: &str) -> Result<(), FaxqError>;
}

/// The queue manager's control FIFO
pub struct FifoSink {
    path: PathBuf,
}

impl FifoSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl NotifySink for FifoSink {
    async fn write(&mut self, message: &str) -> Result<(), FaxqError> {
        let path = self.path.clone();
        let message = message.to_string();
        run_blocking(move || send_fifo(&path, &message)).await?;
        Ok(())
    }
}

struct NotifyRequest {
    message: String,
    reply: oneshot::Sender<Result<(), FaxqError>>,
}

/// Handle to the serialized notification writer
#[derive(Clone)]
pub struct FaxqNotifier {
    tx: mpsc::Sender<NotifyRequest>,
}

impl FaxqNotifier {
    /// Start the writer task on `sink`
    pub fn spawn<S>(mut sink: S) -> Self
    where
        S: NotifySink + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<NotifyRequest>(QUEUE_DEPTH);

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let result = sink.write(&request.message).await;
                if let Err(e) = &result {
                    tracing::warn!("Failed to notify faxq ({}): {}", request.message, e);
                }
                // Caller may have given up waiting
                let _ = request.reply.send(result);
            }
            tracing::debug!("faxq notifier stopped");
        });

        Self { tx }
    }

    /// Writer for `<spool>/FIFO`
    pub fn for_spool(spool: &Path) -> Self {
        Self::spawn(FifoSink::new(spool.join(FAXQ_FIFO)))
    }

    pub async fn send(&self, message: impl Into<String>) -> Result<(), FaxqError> {
        let message = message.into();
        tracing::debug!("Sending message to faxq: {}", message);

        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(NotifyRequest { message, reply })
            .await
            .map_err(|_| FaxqError::Closed)?;
        outcome.await.map_err(|_| FaxqError::Closed)?
    }

    /// `+modem:code`
    pub async fn modem_status(&self, modem: &str, code: &str) -> Result<(), FaxqError> {
        self.send(format!("+{}:{}", modem, code)).await
    }

    /// Announce full receive capabilities
    pub async fn modem_status_ready(&self, modem: &str) -> Result<(), FaxqError> {
        self.modem_status(modem, &format!("R{}", CAPABILITIES)).await
    }

    /// `@modem:code`
    pub async fn receive_status(&self, modem: &str, code: &str) -> Result<(), FaxqError> {
        self.send(format!("@{}:{}", modem, code)).await
    }

    /// `*jobid:code`
    pub async fn job_status(&self, job_id: &str, code: &str) -> Result<(), FaxqError> {
        self.send(format!("*{}:{}", job_id, code)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{drain, MemorySink};

    /// Fails every message containing "bad"
    struct PickySink {
        accepted: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl NotifySink for PickySink {
        async fn write(&mut self, message: &str) -> Result<(), FaxqError> {
            if message.contains("bad") {
                return Err(FaxqError::Io(std::io::Error::other("rejected")));
            }
            let _ = self.accepted.send(message.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_message_shapes() {
        let (sink, mut rx) = MemorySink::new();
        let faxq = FaxqNotifier::spawn(sink);

        faxq.modem_status("freeswitch0", "N").await.unwrap();
        faxq.modem_status_ready("freeswitch0").await.unwrap();
        faxq.receive_status("freeswitch0", "B").await.unwrap();
        faxq.job_status("17", "D").await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                "+freeswitch0:N",
                "+freeswitch0:Rpcbffff01",
                "@freeswitch0:B",
                "*17:D",
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_sends_are_all_delivered_in_caller_order() {
        let (sink, mut rx) = MemorySink::new();
        let faxq = FaxqNotifier::spawn(sink);

        let mut handles = Vec::new();
        for caller in 0..100 {
            let faxq = faxq.clone();
            handles.push(tokio::spawn(async move {
                faxq.send(format!("caller{}:first", caller)).await?;
                faxq.send(format!("caller{}:second", caller)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let written = drain(&mut rx);
        assert_eq!(written.len(), 200);
        for caller in 0..100 {
            let first = written
                .iter()
                .position(|m| *m == format!("caller{}:first", caller))
                .unwrap();
            let second = written
                .iter()
                .position(|m| *m == format!("caller{}:second", caller))
                .unwrap();
            assert!(first < second);
        }
    }

    #[tokio::test]
    async fn test_each_caller_gets_its_own_outcome() {
        let (accepted, mut rx) = mpsc::unbounded_channel();
        let faxq = FaxqNotifier::spawn(PickySink { accepted });

        let mut handles = Vec::new();
        for i in 0..100 {
            let faxq = faxq.clone();
            let message = if i % 10 == 0 {
                format!("bad{}", i)
            } else {
                format!("good{}", i)
            };
            handles.push(tokio::spawn(async move { (message.clone(), faxq.send(message).await) }));
        }

        for handle in handles {
            let (message, result) = handle.await.unwrap();
            assert_eq!(result.is_err(), message.starts_with("bad"), "{}", message);
        }
        assert_eq!(drain(&mut rx).len(), 90);
    }

    #[tokio::test]
    async fn test_fifo_sink_writes_nul_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FAXQ_FIFO);
        crate::hylafax::ensure_fifo(&path).unwrap();

        let reader_path = path.clone();
        let reader = std::thread::spawn(move || std::fs::read(reader_path).unwrap());

        let faxq = FaxqNotifier::for_spool(dir.path());
        faxq.modem_status("freeswitch1", "D").await.unwrap();

        assert_eq!(reader.join().unwrap(), b"+freeswitch1:D\0");
    }
}
