//! # Error Types
//!
//! Error handling for the debugging transport and router.
//!
//! This module defines every error variant that can occur while framing packets,
//! driving a transport, or rewriting traffic across connections.
//!
//! ## Error Categories
//! - **Framing Errors**: Malformed length fields, runaway delimiters, invalid JSON
//! - **Stream Errors**: The channel was closed, reset, refused, or went offline
//! - **Protocol Errors**: Replies that match no pending request
//! - **Router Errors**: Cyclic actor paths, missing exchanges, unknown actors
//! - **Bulk Errors**: Unsupported or abandoned bulk transfers
//!
//! Framing, stream and protocol errors are fatal to the transport they occur on.
//! [`ProtocolError::MissingExchange`] is the only recoverable router error; the
//! relay layer waits for the exchange and retries.
//!
//! ## Example Usage
//! ```rust
//! use devtools_transport::error::{CloseReason, ProtocolError, Result};
//! use std::io;
//!
//! fn check_length(field: &str) -> Result<usize> {
//!     field
//!         .parse::<usize>()
//!         .map_err(|_| ProtocolError::Framing(format!("invalid length field: {field:?}")))
//! }
//!
//! assert!(check_length("16").is_ok());
//! assert!(check_length("1x").is_err());
//!
//! let reason = CloseReason::from_io(&io::Error::from(io::ErrorKind::ConnectionReset));
//! assert_eq!(reason, CloseReason::Reset);
//! ```

use std::fmt;
use std::io;
use thiserror::Error;

use crate::router::exchange::ExchangeId;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Framing errors
    pub const ERR_INVALID_LENGTH: &str = "Invalid packet length field";
    pub const ERR_INVALID_UTF8: &str = "Packet payload is not valid UTF-8";
    pub const ERR_TRUNCATED_PACKET: &str = "Channel closed in the middle of a packet";

    /// Bulk transfer errors
    pub const ERR_BULK_ABANDONED: &str = "Bulk stream handle dropped before copy completed";
}

/// Why a transport closed.
///
/// Channel failures are mapped from [`io::ErrorKind`] by [`CloseReason::from_io`];
/// the remaining variants are raised by the transport itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The channel reached end of stream or was shut down.
    StreamClosed,
    /// The peer reset the connection.
    Reset,
    /// The connection was refused.
    Refused,
    /// The network is unreachable.
    Offline,
    /// Incoming bytes could not be framed into a packet.
    Framing(String),
    /// Request/reply synchronization was lost.
    Protocol(String),
    /// A bulk consumer failed or gave up mid-transfer.
    Bulk(String),
    /// The owner asked the transport to close.
    Requested,
}

impl CloseReason {
    /// Classify an I/O error from the underlying channel.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => Self::Reset,
            io::ErrorKind::ConnectionRefused => Self::Refused,
            io::ErrorKind::NotConnected | io::ErrorKind::AddrNotAvailable => Self::Offline,
            _ => Self::StreamClosed,
        }
    }

    /// Map any crate error to the reason a transport should close with.
    pub fn from_error(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => Self::from_io(e),
            ProtocolError::Framing(msg) => Self::Framing(msg.clone()),
            ProtocolError::DelimiterLimit { .. } | ProtocolError::OversizedPacket(_) => {
                Self::Framing(err.to_string())
            }
            ProtocolError::Json(e) => Self::Framing(e.to_string()),
            ProtocolError::UnmatchedReply { .. } => Self::Protocol(err.to_string()),
            ProtocolError::BulkAbandoned | ProtocolError::BulkShortInput { .. } => {
                Self::Bulk(err.to_string())
            }
            ProtocolError::Closed(reason) => reason.clone(),
            _ => Self::StreamClosed,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamClosed => f.write_str("stream closed"),
            Self::Reset => f.write_str("connection reset"),
            Self::Refused => f.write_str("connection refused"),
            Self::Offline => f.write_str("offline"),
            Self::Framing(msg) => write!(f, "framing error: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Bulk(msg) => write!(f, "bulk transfer failed: {msg}"),
            Self::Requested => f.write_str("closed by owner"),
        }
    }
}

// ProtocolError is the primary error type for all transport and router operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Delimiter {delimiter:?} not found within {limit} bytes")]
    DelimiterLimit { delimiter: char, limit: usize },

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Transport closed: {0}")]
    Closed(CloseReason),

    #[error("Reply from {actor} does not match any pending request")]
    UnmatchedReply { actor: String },

    #[error("Cyclic actor path: {0} was announced by its own exchange")]
    CyclicActorPath(String),

    #[error("Exchange {0} has not been observed yet")]
    MissingExchange(ExchangeId),

    #[error("Actor {0} was never announced on this connection")]
    UnknownActor(String),

    #[error("Exchange {exchange} has no actor at {key_path}")]
    PathMismatch { exchange: ExchangeId, key_path: String },

    #[error("Can't send bulk data to child processes")]
    BulkUnsupported,

    #[error("Bulk stream handle dropped before copy completed")]
    BulkAbandoned,

    #[error("Bulk input ended after {copied} of {expected} bytes")]
    BulkShortInput { copied: u64, expected: u64 },

    #[error("Unknown connection: {0}")]
    UnknownConnection(u64),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// Whether the router should wait and retry instead of giving up.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::MissingExchange(_))
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
