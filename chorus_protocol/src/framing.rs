// Length-prefixed message framing over a byte stream.
//
// Wire format of a control frame: 1 byte type tag, 2 bytes big-endian payload
// length, then the payload (see `message.rs`). `Codec::send` builds the whole
// frame in its send buffer and hands it to the stream with a single
// `write_all`, so concurrent writers serialized by a mutex never interleave
// partial frames.
//
// `Codec::receive` loops over short reads until the header and then exactly
// the declared payload are in the receive buffer. TCP is free to hand us a
// frame one byte at a time; nothing above this module has to care.
//
// The data channel skips framing entirely: `send_raw` writes a PCM chunk
// as-is and `receive_raw` returns whatever a single read produced.
//
// The receive buffer is fixed at `RECEIVE_BUFFER_SIZE` (1 KiB). A declared
// length that would overflow it is rejected before any payload is read, which
// caps what a misbehaving peer can make us allocate or wait for.

use std::io::{self, Read, Write};

use crate::error::ProtocolError;
use crate::message::Message;
use crate::types::{HEADER_SIZE, MAX_PAYLOAD_SIZE, MessageKind, RECEIVE_BUFFER_SIZE};

/// One side of a connection: a stream plus its send/receive buffers.
pub struct Codec<S> {
    stream: S,
    send_buffer: Vec<u8>,
    receive_buffer: Box<[u8; RECEIVE_BUFFER_SIZE]>,
}

impl<S> Codec<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            send_buffer: Vec::with_capacity(RECEIVE_BUFFER_SIZE),
            receive_buffer: Box::new([0u8; RECEIVE_BUFFER_SIZE]),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Write> Codec<S> {
    /// Validate, frame and write one message.
    pub fn send(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        msg.validate()?;
        let len = msg.payload_len();
        // `validate` already bounds the only variable-length payload.
        debug_assert!(len <= MAX_PAYLOAD_SIZE);
        let len_bytes = u16::try_from(len)
            .map_err(|_| ProtocolError::PayloadTooLong {
                declared: len,
                maximum: MAX_PAYLOAD_SIZE,
            })?
            .to_be_bytes();

        self.send_buffer.clear();
        self.send_buffer.push(msg.kind().tag());
        self.send_buffer.extend_from_slice(&len_bytes);
        msg.encode_payload(&mut self.send_buffer);

        self.stream.write_all(&self.send_buffer)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Write a chunk with no framing (data channel).
    pub fn send_raw(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.stream.write_all(data)?;
        self.stream.flush()?;
        Ok(())
    }
}

impl<S: Read> Codec<S> {
    /// Block until one complete frame has arrived and decode it.
    ///
    /// Returns `Closed` if the stream ends cleanly before the first header
    /// byte, and `ConnectionLost` if it ends anywhere inside a frame.
    pub fn receive(&mut self) -> Result<Message, ProtocolError> {
        if !fill(&mut self.stream, &mut self.receive_buffer[..HEADER_SIZE])? {
            return Err(ProtocolError::Closed);
        }

        let tag = self.receive_buffer[0];
        let kind = MessageKind::from_tag(tag).ok_or(ProtocolError::UnknownTag(tag))?;
        let declared = usize::from(u16::from_be_bytes([
            self.receive_buffer[1],
            self.receive_buffer[2],
        ]));

        if declared < kind.min_payload_len() {
            return Err(ProtocolError::PayloadTooShort {
                tag,
                declared,
                minimum: kind.min_payload_len(),
            });
        }
        if declared > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLong {
                declared,
                maximum: MAX_PAYLOAD_SIZE,
            });
        }

        let payload = &mut self.receive_buffer[..declared];
        if !fill(&mut self.stream, payload)? && declared > 0 {
            return Err(unexpected_eof().into());
        }
        Message::decode_payload(kind, payload)
    }

    /// Read whatever the stream yields next (data channel). The returned slice
    /// borrows the receive buffer and is valid until the next receive.
    pub fn receive_raw(&mut self) -> Result<&[u8], ProtocolError> {
        let n = loop {
            match self.stream.read(&mut self.receive_buffer[..]) {
                Ok(0) => return Err(ProtocolError::Closed),
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        Ok(&self.receive_buffer[..n])
    }
}

/// Read until `buf` is full. Returns `Ok(false)` if the stream was already at
/// end-of-stream before the first byte (or `buf` is empty), and an
/// `UnexpectedEof` error if it ends part-way through.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(unexpected_eof()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(!buf.is_empty())
}

fn unexpected_eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "stream ended inside a frame")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::error::ValidationError;

    /// Reader that hands out at most one byte per `read` call.
    struct Trickle<R>(R);

    impl<R: Read> Read for Trickle<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let len = buf.len().min(1);
            self.0.read(&mut buf[..len])
        }
    }

    /// Writer that fails every write, standing in for a dead socket.
    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn encode(msg: &Message) -> Vec<u8> {
        let mut codec = Codec::new(Vec::new());
        codec.send(msg).unwrap();
        codec.into_inner()
    }

    fn decode(bytes: Vec<u8>) -> Result<Message, ProtocolError> {
        Codec::new(Cursor::new(bytes)).receive()
    }

    #[test]
    fn header_layout() {
        let wire = encode(&Message::Announce { name: "alice".into() });
        assert_eq!(&wire[..3], &[0, 0, 5]);
        assert_eq!(&wire[3..], b"alice");

        let wire = encode(&Message::PlaybackSetup { sample_rate: 48_000 });
        assert_eq!(wire, vec![1, 0, 2, 0xBB, 0x80]);

        let wire = encode(&Message::VolumeControl { volume: 100 });
        assert_eq!(wire, vec![2, 0, 1, 100]);
    }

    #[test]
    fn roundtrip_announce() {
        for name in ["", "alice", "Ünïcødé speaker", &"n".repeat(MAX_PAYLOAD_SIZE)] {
            let msg = Message::Announce { name: name.into() };
            assert_eq!(decode(encode(&msg)).unwrap(), msg);
        }
    }

    #[test]
    fn roundtrip_playback_setup_edges() {
        for sample_rate in [0, 1, 8_000, 22_050, 44_100, 47_999, 48_000] {
            let msg = Message::PlaybackSetup { sample_rate };
            assert_eq!(decode(encode(&msg)).unwrap(), msg);
        }
    }

    #[test]
    fn roundtrip_volume_full_range() {
        for volume in 0..=100u8 {
            let msg = Message::VolumeControl { volume };
            assert_eq!(decode(encode(&msg)).unwrap(), msg);
        }
    }

    #[test]
    fn reassembles_byte_at_a_time() {
        let messages = vec![
            Message::Announce { name: "kitchen".into() },
            Message::PlaybackSetup { sample_rate: 44_100 },
            Message::VolumeControl { volume: 37 },
        ];
        let mut wire = Vec::new();
        for msg in &messages {
            wire.extend(encode(msg));
        }

        let mut codec = Codec::new(Trickle(Cursor::new(wire)));
        for expected in &messages {
            assert_eq!(&codec.receive().unwrap(), expected);
        }
        assert!(matches!(codec.receive(), Err(ProtocolError::Closed)));
    }

    #[test]
    fn rejects_unknown_tag() {
        let err = decode(vec![7, 0, 1, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTag(7)));
    }

    #[test]
    fn rejects_short_declared_length() {
        // PlaybackSetup needs 2 payload bytes.
        let err = decode(vec![1, 0, 1, 0xAA]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::PayloadTooShort {
                tag: 1,
                declared: 1,
                minimum: 2
            }
        ));
        // VolumeControl needs 1.
        let err = decode(vec![2, 0, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooShort { tag: 2, .. }));
    }

    #[test]
    fn rejects_length_beyond_buffer() {
        let err = decode(vec![0, 0x04, 0x00]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::PayloadTooLong {
                declared: 1024,
                maximum: MAX_PAYLOAD_SIZE
            }
        ));
    }

    #[test]
    fn clean_close_before_header_is_closed() {
        assert!(matches!(decode(Vec::new()), Err(ProtocolError::Closed)));
    }

    #[test]
    fn eof_inside_frame_is_connection_lost() {
        let err = decode(vec![0, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionLost(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));

        let err = decode(vec![0, 0, 4, b'a', b'b']).unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionLost(_)));
    }

    #[test]
    fn send_validates_before_writing() {
        let mut codec = Codec::new(Vec::new());
        let err = codec
            .send(&Message::VolumeControl { volume: 101 })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Invalid(ValidationError::Volume(101))));
        assert!(codec.get_ref().is_empty());
    }

    #[test]
    fn write_failure_is_connection_lost() {
        let mut codec = Codec::new(Broken);
        let err = codec
            .send(&Message::VolumeControl { volume: 5 })
            .unwrap_err();
        assert!(err.is_connection_loss());
        assert!(codec.send_raw(&[1, 2, 3]).unwrap_err().is_connection_loss());
    }

    #[test]
    fn raw_mode_passes_bytes_through() {
        let mut writer = Codec::new(Vec::new());
        writer.send_raw(&[1, 2, 3, 4]).unwrap();
        writer.send_raw(&[5]).unwrap();
        assert_eq!(writer.get_ref(), &vec![1, 2, 3, 4, 5]);

        let mut reader = Codec::new(Cursor::new(vec![9u8; 1500]));
        assert_eq!(reader.receive_raw().unwrap().len(), RECEIVE_BUFFER_SIZE);
        assert_eq!(reader.receive_raw().unwrap().len(), 1500 - RECEIVE_BUFFER_SIZE);
        assert!(matches!(reader.receive_raw(), Err(ProtocolError::Closed)));
    }
}
