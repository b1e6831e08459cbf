// Wire-level constants and the message tag type.
//
// Everything here is shared by `message.rs` (payload layout and validation)
// and `framing.rs` (header encoding and buffer sizing). The server and the
// endpoints must agree on every value in this file; changing one is a
// protocol break.

/// Size of the frame header: 1 tag byte + 2 bytes of big-endian payload length.
pub const HEADER_SIZE: usize = 3;

/// Capacity of the per-connection receive buffer. No frame (header included)
/// may exceed it, and raw reads on the data channel are capped at it.
pub const RECEIVE_BUFFER_SIZE: usize = 1024;

/// Largest payload that still fits a full frame in the receive buffer.
pub const MAX_PAYLOAD_SIZE: usize = RECEIVE_BUFFER_SIZE - HEADER_SIZE;

/// Highest sample rate an endpoint can be asked to play at.
pub const MAX_SAMPLE_RATE: u32 = 48_000;

/// Highest OS volume value (percent).
pub const MAX_VOLUME: u32 = 100;

/// Default TCP port for the framed control channel.
pub const DEFAULT_CONTROL_PORT: u16 = 12345;

/// Default TCP port for the raw PCM data channel.
pub const DEFAULT_DATA_PORT: u16 = 12346;

/// One-byte type tag at the start of every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Announce,
    PlaybackSetup,
    VolumeControl,
}

impl MessageKind {
    pub fn tag(self) -> u8 {
        match self {
            Self::Announce => 0,
            Self::PlaybackSetup => 1,
            Self::VolumeControl => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Announce),
            1 => Some(Self::PlaybackSetup),
            2 => Some(Self::VolumeControl),
            _ => None,
        }
    }

    /// Smallest payload length a receiver accepts for this kind. Announce
    /// names may be empty; the fixed-size kinds need their full field.
    pub fn min_payload_len(self) -> usize {
        match self {
            Self::Announce => 0,
            Self::PlaybackSetup => 2,
            Self::VolumeControl => 1,
        }
    }
}
