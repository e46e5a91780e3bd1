//! Virtual modems
//!
//! Each device is an actor: one task owns its state and performs the
//! side effects of every transition (queue manager notification, status file)
//! in order. A second task turns messages from the device's control FIFO into
//! transitions.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::hylafax::{ensure_fifo, run_blocking, write_status_file, FaxqNotifier, FifoStream};

pub const FIFO_PREFIX: &str = "FIFO.";
pub const STATUS_DIR: &str = "status";

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No available modem found")]
    NoneAvailable,

    #[error("Device {0} is not running")]
    Stopped(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Ready,
    Busy,
    Down,
    Locked,
}

/// A requested state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Ready,
    Busy { reason: String, outbound: bool },
    Down,
    Locked,
}

impl Transition {
    pub fn state(&self) -> DeviceState {
        match self {
            Transition::Ready => DeviceState::Ready,
            Transition::Busy { .. } => DeviceState::Busy,
            Transition::Down => DeviceState::Down,
            Transition::Locked => DeviceState::Locked,
        }
    }

    /// Parse a control FIFO message: `H`, `L`, `SR` or `SB`
    pub fn from_fifo(message: &str) -> Option<Self> {
        let mut chars = message.chars();
        match chars.next()? {
            'H' => Some(Transition::Ready),
            'L' => Some(Transition::Locked),
            'S' => match chars.next()? {
                'R' => Some(Transition::Ready),
                'B' => Some(Transition::Busy {
                    reason: "Sending facsimile".to_string(),
                    outbound: true,
                }),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Ready => write!(f, "READY"),
            DeviceState::Busy => write!(f, "BUSY"),
            DeviceState::Down => write!(f, "DOWN"),
            DeviceState::Locked => write!(f, "LOCKED"),
        }
    }
}

enum DeviceCommand {
    Set(Transition),
    Get(oneshot::Sender<DeviceState>),
    /// Ready -> Busy as one step; replies whether it happened
    TryAcquire {
        reason: String,
        reply: oneshot::Sender<bool>,
    },
}

/// Handle to a running device actor
#[derive(Clone)]
pub struct Device {
    name: String,
    tx: mpsc::UnboundedSender<DeviceCommand>,
}

struct DeviceActor {
    name: String,
    status_file: PathBuf,
    state: DeviceState,
    faxq: FaxqNotifier,
}

impl Device {
    /// Create the FIFO, start the actor and the FIFO reader, announce Ready
    pub fn spawn(name: &str, spool: &Path, faxq: FaxqNotifier) -> Result<Self, DeviceError> {
        let fifo = spool.join(format!("{}{}", FIFO_PREFIX, name));
        ensure_fifo(&fifo)?;
        let fifo_stream = FifoStream::open(&fifo)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let actor = DeviceActor {
            name: name.to_string(),
            status_file: spool.join(STATUS_DIR).join(name),
            state: DeviceState::Ready,
            faxq,
        };
        tokio::spawn(actor.run(rx));

        let device = Self {
            name: name.to_string(),
            tx,
        };
        tokio::spawn(device.clone().fifo_loop(fifo_stream, fifo));

        device.set_ready();
        Ok(device)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn set(&self, transition: Transition) {
        if self.tx.send(DeviceCommand::Set(transition)).is_err() {
            tracing::warn!("Device {} is not running", self.name);
        }
    }

    pub fn set_ready(&self) {
        self.set(Transition::Ready);
    }

    pub fn set_busy(&self, reason: &str, outbound: bool) {
        self.set(Transition::Busy {
            reason: reason.to_string(),
            outbound,
        });
    }

    pub fn set_down(&self) {
        self.set(Transition::Down);
    }

    pub fn set_locked(&self) {
        self.set(Transition::Locked);
    }

    /// Current state, after every transition requested so far
    pub async fn state(&self) -> Result<DeviceState, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DeviceCommand::Get(reply))
            .map_err(|_| DeviceError::Stopped(self.name.clone()))?;
        rx.await.map_err(|_| DeviceError::Stopped(self.name.clone()))
    }

    /// Mark the device busy (inbound) if and only if it is ready
    pub async fn try_acquire(&self, reason: &str) -> Result<bool, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DeviceCommand::TryAcquire {
                reason: reason.to_string(),
                reply,
            })
            .map_err(|_| DeviceError::Stopped(self.name.clone()))?;
        rx.await.map_err(|_| DeviceError::Stopped(self.name.clone()))
    }

    async fn fifo_loop(self, mut stream: FifoStream, fifo: PathBuf) {
        while let Some(message) = stream.messages.recv().await {
            tracing::info!("{} received message: {}", fifo.display(), message);
            match Transition::from_fifo(&message) {
                Some(transition) => self.set(transition),
                None => tracing::warn!("Unhandled message: {}", message),
            }
        }
        if let Ok(e) = stream.errors.await {
            tracing::error!("Error in stream for FIFO {}: {}", fifo.display(), e);
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device").field("name", &self.name).finish()
    }
}

impl DeviceActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DeviceCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                DeviceCommand::Set(transition) => self.apply(transition).await,
                DeviceCommand::Get(reply) => {
                    let _ = reply.send(self.state);
                }
                DeviceCommand::TryAcquire { reason, reply } => {
                    let acquired = self.state == DeviceState::Ready;
                    if acquired {
                        self.apply(Transition::Busy {
                            reason,
                            outbound: false,
                        })
                        .await;
                    }
                    let _ = reply.send(acquired);
                }
            }
        }
        tracing::debug!("Device {} stopped", self.name);
    }

    async fn apply(&mut self, transition: Transition) {
        tracing::info!("Changing state of modem {} to {}", self.name, transition.state());
        self.state = transition.state();

        match transition {
            Transition::Ready => {
                self.notify("N").await;
                self.write_status("Running and idle").await;
                if let Err(e) = self.faxq.modem_status_ready(&self.name).await {
                    tracing::warn!("Cannot announce {} as ready: {}", self.name, e);
                }
            }
            Transition::Busy { reason, outbound } => {
                self.notify(if outbound { "U" } else { "B" }).await;
                let reason = if reason.is_empty() { "Busy".to_string() } else { reason };
                self.write_status(&reason).await;
            }
            Transition::Down => {
                self.notify("D").await;
                self.write_status("Down").await;
            }
            Transition::Locked => {
                self.write_status("Locked for sending").await;
            }
        }
    }

    async fn notify(&self, code: &str) {
        if let Err(e) = self.faxq.modem_status(&self.name, code).await {
            tracing::warn!("Cannot send modem status for {}: {}", self.name, e);
        }
    }

    async fn write_status(&self, message: &str) {
        let path = self.status_file.clone();
        let message = message.to_string();
        if let Err(e) = run_blocking(move || write_status_file(&path, &message)).await {
            tracing::warn!("Cannot write status file {}: {}", self.status_file.display(), e);
        }
    }
}
