use thiserror::Error;

use crate::{
    board::device_error_is_link_level,
    ioloop::ntrip::NtripError,
    message::{MsgType, ParseError},
};

/// Errors that propagate out of connections, device sessions and the I/O loop.
///
/// Decoding failures are not part of this type: a [crate::message::Message]
/// carries its own [ParseError] instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("settings cache error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownMessageType(MsgType),

    #[error("cannot encode field \"{0}\"")]
    Encode(String),

    #[error("no response to {0} request")]
    Timeout(MsgType),

    #[error("device error {code}: {reason}")]
    Device { code: i64, reason: &'static str },

    #[error("expected {expected} response, got {got}")]
    UnexpectedResponse { expected: MsgType, got: MsgType },

    #[error("invalid response: {0}")]
    InvalidResponse(ParseError),

    #[error("incomplete response: {0}")]
    IncompleteResponse(String),

    #[error("no port/baud combination answered")]
    Discovery,

    #[error("{0} is not supported on this connection")]
    Unsupported(&'static str),

    #[error("connection closed")]
    Closed,

    #[error("I/O loop: {0}")]
    IoLoop(String),

    #[error("NTRIP: {0}")]
    Ntrip(#[from] NtripError),
}

impl Error {
    /// True for failures consistent with a transient link issue,
    /// where repeating the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_)
            | Self::InvalidResponse(_)
            | Self::UnexpectedResponse { .. }
            | Self::IncompleteResponse(_) => true,
            Self::Device { code, .. } => device_error_is_link_level(*code),
            _ => false,
        }
    }
}
