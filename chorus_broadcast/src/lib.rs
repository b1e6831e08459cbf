// chorus_broadcast — synchronized audio broadcast over TCP.
//
// One server streams a single PCM stream to many playback endpoints. Every
// endpoint keeps two TCP connections to the server: a framed control channel
// (see `chorus_protocol`) for announce / playback setup / volume, and a raw
// data channel that carries PCM while music plays.
//
// Module overview:
// - `endpoint.rs`:  `EndpointSession`: one connected endpoint, its control
//                   listener thread and its data sender thread.
// - `registry.rs`:  Sessions keyed by peer IP, the readiness barrier, and the
//                   dispatcher that drops disconnected sessions.
// - `server.rs`:    Listeners, playback state machine, broadcast loop and the
//                   operator API (`play_music`, `stop_music`, `set_volume`).
// - `client.rs`:    The endpoint side: reconnect loop, control listener, data
//                   listener feeding an `AudioSink`.
// - `audio/`:       Decoder / sink / mixer interfaces; `symphonia` file
//                   decoding, `cpal` device output, shell-command volume.
// - `console.rs`:   Line-oriented operator commands for the server.
// - `config.rs`:    JSON-loadable `ServerConfig` and `ClientConfig`.
// - `error.rs`:     The crate's `Error` type.
//
// Everything is blocking `std::net` with one thread per connection; nothing
// here needs an async runtime. The `chorus` binary (`main.rs`) wires these
// together as `chorus server` and `chorus client`.

pub mod audio;
pub mod client;
pub mod config;
pub mod console;
pub mod endpoint;
pub mod error;
pub mod registry;
pub mod server;

pub use client::{Client, ClientState, SessionEnd};
pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};
pub use server::{PlaybackState, Server, VolumeTarget};
