// Protocol messages exchanged on the control channel.
//
// Three variants, one per frame tag (see `types.rs`):
// - `Announce`: endpoint → server, carries the endpoint's display name.
// - `PlaybackSetup`: server → endpoint, 0 tears the playback pipeline down,
//   anything else (up to 48 kHz) builds one at that sample rate.
// - `VolumeControl`: server → endpoint, OS output volume in percent.
//
// Payload layout is fixed and big-endian: Announce is the raw UTF-8 name
// with no terminator, PlaybackSetup is a u16, VolumeControl is a u8. The
// constructors take `u32` so callers feeding user input get a range error
// instead of a silent truncation.

use crate::error::{ProtocolError, ValidationError};
use crate::types::{MAX_PAYLOAD_SIZE, MAX_SAMPLE_RATE, MAX_VOLUME, MessageKind};

/// A single control-channel message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// A freshly connected endpoint introduces itself.
    Announce { name: String },
    /// Create (non-zero) or destroy (zero) the endpoint's playback pipeline.
    PlaybackSetup { sample_rate: u16 },
    /// Set the endpoint's OS output volume.
    VolumeControl { volume: u8 },
}

impl Message {
    pub fn announce(name: impl Into<String>) -> Result<Self, ValidationError> {
        let msg = Self::Announce { name: name.into() };
        msg.validate()?;
        Ok(msg)
    }

    pub fn playback_setup(sample_rate: u32) -> Result<Self, ValidationError> {
        validate_sample_rate(sample_rate)?;
        let sample_rate =
            u16::try_from(sample_rate).map_err(|_| ValidationError::SampleRate(sample_rate))?;
        Ok(Self::PlaybackSetup { sample_rate })
    }

    pub fn volume_control(volume: u32) -> Result<Self, ValidationError> {
        validate_volume(volume)?;
        let volume = u8::try_from(volume).map_err(|_| ValidationError::Volume(volume))?;
        Ok(Self::VolumeControl { volume })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Announce { .. } => MessageKind::Announce,
            Self::PlaybackSetup { .. } => MessageKind::PlaybackSetup,
            Self::VolumeControl { .. } => MessageKind::VolumeControl,
        }
    }

    /// Check every field against its legal range. The variants are public,
    /// so the codec re-checks before writing anything.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Announce { name } => {
                if name.len() > MAX_PAYLOAD_SIZE {
                    return Err(ValidationError::NameTooLong(name.len()));
                }
                Ok(())
            }
            Self::PlaybackSetup { sample_rate } => validate_sample_rate(u32::from(*sample_rate)),
            Self::VolumeControl { volume } => validate_volume(u32::from(*volume)),
        }
    }

    /// Number of payload bytes `encode_payload` will append.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Announce { name } => name.len(),
            Self::PlaybackSetup { .. } => 2,
            Self::VolumeControl { .. } => 1,
        }
    }

    /// Append the payload (no header) to `out`.
    pub fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Self::Announce { name } => out.extend_from_slice(name.as_bytes()),
            Self::PlaybackSetup { sample_rate } => out.extend_from_slice(&sample_rate.to_be_bytes()),
            Self::VolumeControl { volume } => out.push(*volume),
        }
    }

    /// Decode a payload whose length has already been checked against
    /// `kind.min_payload_len()`. Bytes past a fixed-size field are ignored.
    pub fn decode_payload(kind: MessageKind, payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < kind.min_payload_len() {
            return Err(ProtocolError::PayloadTooShort {
                tag: kind.tag(),
                declared: payload.len(),
                minimum: kind.min_payload_len(),
            });
        }
        let msg = match kind {
            MessageKind::Announce => {
                let name = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidName)?;
                Self::Announce { name: name.to_owned() }
            }
            MessageKind::PlaybackSetup => Self::PlaybackSetup {
                sample_rate: u16::from_be_bytes([payload[0], payload[1]]),
            },
            MessageKind::VolumeControl => Self::VolumeControl { volume: payload[0] },
        };
        msg.validate()?;
        Ok(msg)
    }
}

pub fn validate_sample_rate(sample_rate: u32) -> Result<(), ValidationError> {
    if sample_rate > MAX_SAMPLE_RATE {
        return Err(ValidationError::SampleRate(sample_rate));
    }
    Ok(())
}

pub fn validate_volume(volume: u32) -> Result<(), ValidationError> {
    if volume > MAX_VOLUME {
        return Err(ValidationError::Volume(volume));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_rate_bounds() {
        assert!(Message::playback_setup(0).is_ok());
        assert!(Message::playback_setup(1).is_ok());
        assert!(Message::playback_setup(48_000).is_ok());
        assert_eq!(
            Message::playback_setup(48_001),
            Err(ValidationError::SampleRate(48_001))
        );
        // What a negative number turns into once it has gone through an
        // unsigned conversion.
        assert_eq!(
            Message::playback_setup(u32::MAX),
            Err(ValidationError::SampleRate(u32::MAX))
        );
    }

    #[test]
    fn volume_bounds() {
        assert!(Message::volume_control(0).is_ok());
        assert!(Message::volume_control(100).is_ok());
        assert_eq!(Message::volume_control(101), Err(ValidationError::Volume(101)));
        assert_eq!(
            Message::volume_control(u32::MAX),
            Err(ValidationError::Volume(u32::MAX))
        );
    }

    #[test]
    fn oversized_name_rejected() {
        let name = "x".repeat(MAX_PAYLOAD_SIZE + 1);
        assert_eq!(
            Message::announce(name),
            Err(ValidationError::NameTooLong(MAX_PAYLOAD_SIZE + 1))
        );
        assert!(Message::announce("x".repeat(MAX_PAYLOAD_SIZE)).is_ok());
    }

    #[test]
    fn raw_variant_with_bad_value_fails_validation() {
        let msg = Message::PlaybackSetup { sample_rate: 50_000 };
        assert_eq!(msg.validate(), Err(ValidationError::SampleRate(50_000)));
        let msg = Message::VolumeControl { volume: 200 };
        assert_eq!(msg.validate(), Err(ValidationError::Volume(200)));
    }

    #[test]
    fn sample_rate_is_big_endian() {
        let mut out = Vec::new();
        Message::PlaybackSetup { sample_rate: 44_100 }.encode_payload(&mut out);
        assert_eq!(out, vec![0xAC, 0x44]);
    }

    #[test]
    fn decode_ignores_trailing_bytes_on_fixed_fields() {
        let msg = Message::decode_payload(MessageKind::VolumeControl, &[42, 0xFF, 0xFF]).unwrap();
        assert_eq!(msg, Message::VolumeControl { volume: 42 });
    }

    #[test]
    fn decode_rejects_out_of_range_values() {
        let err = Message::decode_payload(MessageKind::VolumeControl, &[101]).unwrap_err();
        assert!(matches!(err, ProtocolError::Invalid(ValidationError::Volume(101))));
        let err = Message::decode_payload(MessageKind::PlaybackSetup, &[0xFF, 0xFF]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Invalid(ValidationError::SampleRate(65_535))
        ));
    }

    #[test]
    fn decode_rejects_invalid_utf8_name() {
        let err = Message::decode_payload(MessageKind::Announce, &[0xC3, 0x28]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidName));
    }

    #[test]
    fn decode_accepts_empty_name() {
        let msg = Message::decode_payload(MessageKind::Announce, &[]).unwrap();
        assert_eq!(msg, Message::Announce { name: String::new() });
    }
}
