use thiserror::Error;

use crate::validation::ValidationError;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame length invalid: {reason}")]
    FrameLengthInvalid { reason: String },

    #[error("Frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },

    #[error("Frame crc mismatch: expected {expected:#010x} got {got:#010x}")]
    FrameCrcMismatch { expected: u32, got: u32 },

    #[error("Codec error: {0}")]
    Codec(#[from] postcard::Error),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage { expected: &'static str, got: &'static str },

    #[error("Peer reported error: {0}")]
    Remote(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,
}

impl ProtoError {
    /// Errors worth reconnecting for; everything else means the peer misbehaved
    pub fn is_transient(&self) -> bool {
        matches!(self, ProtoError::Io(_) | ProtoError::ConnectionClosed)
    }
}

pub type Result<T> = std::result::Result<T, ProtoError>;
