//! FreeSWITCH event socket client
//!
//! Speaks the switch's plain-text control protocol in both directions:
//! - Dialing the switch's inbound socket (outbound faxes, key/value store)
//! - Accepting connections the switch makes to us (inbound calls)
//! - Splitting command replies from asynchronous events
//! - `api db` access used by the softmodem fallback flag

mod codec;
mod connection;
mod db;
mod event;

pub use connection::{EslConnection, EventStream};
pub use db::KeyValueStore;
pub use event::Event;

use thiserror::Error;

/// Control socket errors
#[derive(Error, Debug)]
pub enum EslError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// `-ERR` reply; the text is the trimmed remainder (the hangup cause for originate)
    #[error("{0}")]
    CommandFailed(String),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}
