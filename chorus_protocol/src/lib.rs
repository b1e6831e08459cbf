// chorus_protocol — wire protocol between the Chorus server and its endpoints.
//
// This crate defines the control messages, their validation rules, and the
// framing codec used on both TCP channels. It is shared by the server and the
// client side and has no networking of its own: `Codec` works over any
// `Read`/`Write` stream, so tests drive it with in-memory buffers.
//
// Module overview:
// - `types.rs`:    Wire constants (header size, buffer capacity, default
//                  ports, field limits) and the `MessageKind` tag.
// - `message.rs`:  The `Message` enum, payload encode/decode, range checks.
// - `framing.rs`:  `Codec`: 3-byte header framing for the control channel,
//                  unframed raw mode for the PCM data channel.
// - `error.rs`:    `ValidationError` and `ProtocolError`.
//
// Design decisions:
// - **Binary, fixed layout.** Three tiny message types do not need a
//   serialization framework; every payload is a handful of big-endian bytes.
// - **Validate on both ends.** Out-of-range sample rates or volumes are
//   refused before they are written and again when they are decoded.
// - **No async runtime.** Blocking `std::io` only, one thread per stream.

pub mod error;
pub mod framing;
pub mod message;
pub mod types;

pub use error::{ProtocolError, ValidationError};
pub use framing::Codec;
pub use message::Message;
pub use types::{
    DEFAULT_CONTROL_PORT, DEFAULT_DATA_PORT, HEADER_SIZE, MAX_PAYLOAD_SIZE, MAX_SAMPLE_RATE,
    MAX_VOLUME, MessageKind, RECEIVE_BUFFER_SIZE,
};
