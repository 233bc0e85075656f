use std::io;

use thiserror::Error;

/// Failures reported by a [`Transport`](crate::transport::Transport).
///
/// Any of these during an active session is fatal to that session.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport handle is invalid or already closed")]
    InvalidHandle,
    #[error("Zero-length transport request")]
    ZeroLength,
    #[error("Transport I/O failure: {0}")]
    Io(#[from] io::Error),
    #[error("Peer closed the connection")]
    Closed,
}

/// A message that could not be decoded, or arrived in the wrong direction.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Unexpected {0} message from client")]
    UnexpectedMessage(&'static str),
    #[error("Message exceeds {0} bytes without a line break")]
    TooLarge(usize),
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ChannelError {
    /// Whether the owning session has to be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChannelError::Transport(_))
    }
}

/// A request that was understood but could not be served.
///
/// These are answered with an error response; the session carries on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Unknown command \"{0}\"")]
    UnknownCommand(String),
    #[error("Invalid arguments for \"{command}\": {reason}")]
    InvalidArguments { command: String, reason: String },
    #[error("Frame index {index} is out of range, stack depth is {depth}")]
    FrameOutOfRange { index: usize, depth: usize },
    #[error("Evaluation error: {0}")]
    Evaluation(String),
    #[error("\"{0}\" requires a paused program")]
    NotPaused(String),
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Invalid debugger address \"{0}\", expected host:port")]
    InvalidAddress(String),
    #[error("Failed to resolve \"{address}\": {source}")]
    Resolve { address: String, source: io::Error },
    #[error("Failed to connect to {address}: {source}")]
    Connect { address: String, source: io::Error },
    #[error("Failed to listen on {address}: {source}")]
    Bind { address: String, source: io::Error },
    #[error("Failed to accept a debugger connection: {0}")]
    Accept(io::Error),
    #[error("A debugger is already attached")]
    AlreadyAttached,
    #[error("Debugger handshake failed: {0}")]
    Handshake(#[from] TransportError),
}
