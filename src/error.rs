//! Library error type.
//!
//! Protocol-level `-ERR` replies are NOT errors: they come back to the
//! caller as ordinary reply events, and the caller classifies them.  This
//! enum covers transport failures, handshake failures, lifecycle rules
//! (terminal channels), and correlation outcomes (timeout, interruption).

use esl_wire::{VarMap, WireError};

#[derive(Debug, thiserror::Error)]
pub enum EslError {
    /// Transport failed or the writer half closed mid-send.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The initial connect did not complete within the configured timeout.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The server rejected the password.
    #[error("authentication failed: server rejected password")]
    Authentication,

    /// A command was issued before the connection was established.
    #[error("not connected")]
    NotConnected,

    /// The connection was closed while an operation was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// An operation was attempted on a channel that already hung up.
    #[error("channel {0} has gone away")]
    SessionGoneAway(String),

    /// The channel is in a state that forbids the operation
    /// (e.g. bridge after hangup).
    #[error("channel error: {0}")]
    Channel(String),

    /// A wait for a state, event, or command result timed out.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// An execute was aborted by a hangup on its channel.
    #[error("operation {app_uuid} on channel {channel_uuid} interrupted by hangup")]
    OperationInterrupted {
        app_uuid: String,
        channel_uuid: String,
    },

    /// A bgapi originate returned `-ERR`, or the new leg died immediately.
    #[error("originate to '{destination}' failed: {message}")]
    Originate {
        message: String,
        destination: String,
        variables: VarMap,
    },

    /// The server broke the protocol shape (e.g. a bgapi reply without a
    /// Job-UUID confirmation).
    #[error("protocol: {0}")]
    Protocol(String),

    /// A load-balancer backend failed.
    #[error("balancer: {0}")]
    Balancer(String),

    #[error("wire: {0}")]
    Wire(#[from] WireError),
}

impl EslError {
    /// True for the errors a cleanup path is allowed to swallow.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            EslError::Timeout(_) | EslError::ConnectionClosed | EslError::OperationInterrupted { .. }
        )
    }
}
