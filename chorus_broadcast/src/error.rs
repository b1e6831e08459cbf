// Error taxonomy for the broadcast server and the endpoint client.
//
// Four families, matching how each one is handled:
// - Protocol / ConnectionLost: a malformed frame or a dead socket. Fatal to
//   the connection it happened on; the server drops that session, the client
//   reconnects.
// - Validation: an out-of-range sample rate or volume, refused before any
//   bytes are sent and handed back to whoever called the server API.
// - AlreadyPlaying / NotPlaying / StoppedDuringSetup / UserNotFound: state
//   errors, reported to the operator, harmless to the server.
// - Audio / Config / Dial / Io: collaborators and startup. Bind or resolve
//   failures end the process.
//
// `From<ProtocolError>` sorts codec errors into the first three families so
// `?` on a codec call lands in the right variant.

use std::io;
use std::net::SocketAddr;

use chorus_protocol::{ProtocolError, ValidationError};
use thiserror::Error;

use crate::audio::AudioError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(#[source] ProtocolError),

    #[error("connection lost: {0}")]
    ConnectionLost(#[source] ProtocolError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("music is already playing")]
    AlreadyPlaying,

    #[error("music is currently not playing")]
    NotPlaying,

    #[error("playback was stopped while waiting for endpoints")]
    StoppedDuringSetup,

    #[error("no user with name '{0}' found")]
    UserNotFound(String),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unable to connect to {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Invalid(e) => Self::Validation(e),
            e if e.is_connection_loss() => Self::ConnectionLost(e),
            e => Self::Protocol(e),
        }
    }
}

impl Error {
    /// Connection-level failure built from a plain I/O error.
    pub fn connection_lost(source: io::Error) -> Self {
        Self::ConnectionLost(ProtocolError::ConnectionLost(source))
    }

    /// True for failures that mean the remote side is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Dial { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_sorted_by_family() {
        let err: Error = ProtocolError::Closed.into();
        assert!(matches!(err, Error::ConnectionLost(ProtocolError::Closed)));
        assert!(err.is_connection_loss());

        let err: Error = ProtocolError::UnknownTag(4).into();
        assert!(matches!(err, Error::Protocol(ProtocolError::UnknownTag(4))));
        assert!(!err.is_connection_loss());

        let err: Error = ProtocolError::Invalid(ValidationError::Volume(150)).into();
        assert!(matches!(err, Error::Validation(ValidationError::Volume(150))));
    }

    #[test]
    fn state_errors_read_well() {
        assert_eq!(Error::AlreadyPlaying.to_string(), "music is already playing");
        assert_eq!(
            Error::UserNotFound("alice".into()).to_string(),
            "no user with name 'alice' found"
        );
    }
}
