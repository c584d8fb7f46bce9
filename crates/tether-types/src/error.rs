//! Shared error types for Tether.

use crate::contact::Contact;
use thiserror::Error;

/// Top-level error type for every Tether crate.
#[derive(Error, Debug)]
pub enum TetherError {
    /// The key resolved to no owner, or the owner no longer holds it.
    #[error("Object vanished: {0}")]
    ObjectVanished(String),

    /// The target method is absent on the resolved object.
    #[error("Missing method: {0}")]
    MissingMethod(String),

    /// The target property is absent on the resolved object.
    #[error("Missing property: {0}")]
    MissingProperty(String),

    /// Permission denied for the requested member.
    #[error("Member access denied: {0}")]
    MemberAccess(String),

    /// No matching reply arrived within the bound.
    #[error("No response from {contact} after {attempts} attempt(s)")]
    NoResponse {
        /// The contact that was asked.
        contact: Contact,
        /// How many times the request was sent.
        attempts: u32,
    },

    /// A frame failed checksum verification.
    #[error("Corrupt message: checksum {actual:#010x} does not match {expected:#010x}")]
    CorruptMessage {
        /// Checksum carried by the frame.
        expected: i32,
        /// Checksum computed over the received payload.
        actual: i32,
    },

    /// An awaited request would be answered by the receive loop it blocks.
    #[error("Deadlock detected: request to {endpoint} issued from its own receive loop (nested={nested})")]
    DeadlockDetected {
        /// The endpoint whose receive loop is running the caller.
        endpoint: Contact,
        /// Whether the triggering message itself came from a remote receive loop.
        nested: bool,
    },

    /// The configured architecture is not implemented.
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// The configured caching mode is not implemented.
    #[error("Unsupported caching mode: {0}")]
    UnsupportedCaching(String),

    /// An outbound connection could not be established.
    #[error("Connection to {contact} failed: {reason}")]
    ConnectionFailed {
        /// The contact we tried to reach.
        contact: Contact,
        /// Why the attempt failed.
        reason: String,
    },

    /// The connection was closed by the remote side.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A frame announced a payload outside the accepted range.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Announced payload length.
        size: i64,
        /// Largest accepted payload length.
        max: i32,
    },

    /// A message was sent without a correlation id.
    #[error("Message has no correlation id")]
    MissingCorrelationId,

    /// A message carried a type tag outside the protocol.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(i32),

    /// A serialized value carried a type tag nobody registered.
    #[error("Unknown type: {0}")]
    UnknownType(String),

    /// The node has not been bound yet.
    #[error("Node is not bound")]
    NotBound,

    /// The node is already bound.
    #[error("Node is already bound to {0}")]
    AlreadyBound(Contact),

    /// The node has been closed.
    #[error("Node is closed")]
    Closed,

    /// A request carried a missing or malformed argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An error raised on the remote side while executing a request.
    #[error("Remote error: {0}")]
    Remote(String),

    /// A message handler panicked.
    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TetherError {
    /// Whether this error is a graceful end of a connection rather than a failure.
    ///
    /// End-of-stream, closed connections and aborted/reset/timed-out sockets
    /// all end a receive loop quietly.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TetherError::ConnectionClosed => true,
            TetherError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// Alias for Result with TetherError.
pub type TetherResult<T> = Result<T, TetherError>;
