//! Inbound fax daemon
//!
//! This module hosts everything `serve` runs:
//! - Virtual modems and the pool they are allocated from
//! - The event socket listener the switch connects to for incoming calls
//! - One inbound session per connection

pub mod device;
pub mod inbound;
pub mod manager;

pub use device::DeviceError;
pub use inbound::InboundSession;
pub use manager::{DeviceManager, MODEM_PREFIX};

// Public API re-exports for external use
#[allow(unused_imports)]
pub use device::{Device, DeviceState};

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::esl::EslConnection;
use crate::hylafax::FaxqNotifier;

/// Inbound daemon errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

/// Process-wide handles shared by every inbound session
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<GatewayConfig>,
    pub faxq: FaxqNotifier,
    pub devices: Arc<DeviceManager>,
    /// Cancelled on shutdown; running sessions destroy their channels
    pub kill: CancellationToken,
}

impl ServerContext {
    pub fn new(config: Arc<GatewayConfig>, faxq: FaxqNotifier, devices: Arc<DeviceManager>) -> Self {
        Self {
            config,
            faxq,
            devices,
            kill: CancellationToken::new(),
        }
    }

    /// Start the queue manager notifier and the modem pool for `config`
    pub fn start(config: GatewayConfig) -> Result<Self, ServerError> {
        let spool = config.hylafax.spool_dir.clone();
        let faxq = FaxqNotifier::for_spool(&spool);
        let devices = DeviceManager::new(MODEM_PREFIX, config.hylafax.modems, &spool, &faxq)?;
        Ok(Self::new(Arc::new(config), faxq, Arc::new(devices)))
    }

    /// Kill all running calls and take the modems down
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down, killing running sessions");
        self.kill.cancel();
        self.devices.set_all_down().await;
    }
}

/// Listener for event socket connections from the switch
pub struct EventSocketServer {
    listener: TcpListener,
    ctx: ServerContext,
}

impl EventSocketServer {
    pub async fn bind(ctx: ServerContext) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&ctx.config.inbound.socket).await?;
        tracing::info!(
            "Listening for event socket connections on {}",
            listener.local_addr()?
        );
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails
    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            tracing::debug!("Accepted event socket connection from {}", peer);
            let session = InboundSession::new(self.ctx.clone(), EslConnection::accept(stream));
            tokio::spawn(session.run());
        }
    }
}
