// Error types for the wire protocol.
//
// `ValidationError` covers field values outside their legal range; it is
// raised before anything is written and again on decode, so neither side
// ever acts on an out-of-range value. `ProtocolError` is what the codec
// returns: malformed frames, plus the two ways a stream can end. `Closed`
// is an orderly end-of-stream at a frame boundary (the remote hung up);
// `ConnectionLost` is every other I/O failure, including EOF mid-frame.

use std::io;

use thiserror::Error;

/// A field value outside the range the protocol allows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("sample rate {0} is out of range (0 to stop, 1..=48000 to play)")]
    SampleRate(u32),

    #[error("volume {0} is out of range (0..=100)")]
    Volume(u32),

    #[error("name is {0} bytes long, frames carry at most 1021")]
    NameTooLong(usize),
}

/// Errors returned by `Codec` send/receive.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("received frame with unknown type tag {0}")]
    UnknownTag(u8),

    #[error("declared payload of {declared} bytes is shorter than the {minimum} bytes tag {tag} needs")]
    PayloadTooShort {
        tag: u8,
        declared: usize,
        minimum: usize,
    },

    #[error("declared payload of {declared} bytes exceeds the {maximum} byte limit")]
    PayloadTooLong { declared: usize, maximum: usize },

    #[error("announce name is not valid UTF-8")]
    InvalidName,

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("connection closed by remote")]
    Closed,

    #[error("connection lost: {0}")]
    ConnectionLost(#[from] io::Error),
}

impl ProtocolError {
    /// True when the stream itself is gone (orderly close or I/O failure),
    /// as opposed to the peer sending something malformed.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Closed | Self::ConnectionLost(_))
    }
}
