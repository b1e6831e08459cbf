// Runtime configuration for both process roles.
//
// `ServerConfig` and `ClientConfig` hold every tunable the server and the
// endpoint client read: ports, the readiness barrier timeout, the broadcast
// chunk size, the reconnect backoff, the output device and volume commands.
// Defaults reproduce the reference policy (ports 12345/12346, 5 s barrier,
// 512-byte chunks, 5 s reconnect delay).
//
// Both structs load from JSON with `#[serde(default)]`, so a config file only
// needs the keys it changes. `main.rs` applies command-line overrides on top.
// Durations are stored as integer milliseconds to keep the file format plain.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use chorus_protocol::{DEFAULT_CONTROL_PORT, DEFAULT_DATA_PORT};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Server-side settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface both listeners bind to.
    pub bind_address: IpAddr,
    pub control_port: u16,
    pub data_port: u16,
    /// How long `play_music` waits for every endpoint to attach its data
    /// channel before streaming anyway.
    pub ready_timeout_ms: u64,
    /// Bytes of PCM pulled from the decoder and sent per broadcast step.
    /// 512 bytes = 128 frames of 16-bit stereo.
    pub chunk_size: usize,
    /// Write timeout on data channels. A peer that stops reading for longer
    /// than this loses its data channel instead of stalling the broadcast.
    pub data_write_timeout_ms: u64,
    /// Idle time before TCP keepalive checks start on control connections,
    /// so a peer that vanished without closing is eventually dropped and
    /// can reconnect. 0 disables keepalive.
    pub control_keepalive_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control_port: DEFAULT_CONTROL_PORT,
            data_port: DEFAULT_DATA_PORT,
            ready_timeout_ms: 5_000,
            chunk_size: 512,
            data_write_timeout_ms: 2_000,
            control_keepalive_ms: 30_000,
        }
    }
}

impl ServerConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// `None` disables the timeout.
    pub fn data_write_timeout(&self) -> Option<Duration> {
        (self.data_write_timeout_ms > 0).then(|| Duration::from_millis(self.data_write_timeout_ms))
    }

    /// `None` disables keepalive.
    pub fn control_keepalive(&self) -> Option<Duration> {
        (self.control_keepalive_ms > 0).then(|| Duration::from_millis(self.control_keepalive_ms))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&read_config_file(path)?)
    }

    fn validate(&self) -> Result<()> {
        // PCM frames are 4 bytes; a chunk must hold at least one whole frame.
        if self.chunk_size < 4 || self.chunk_size % 4 != 0 {
            return Err(Error::Config(format!(
                "chunk_size must be a positive multiple of 4, got {}",
                self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Endpoint-side settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host name or address of the server.
    pub server: String,
    pub control_port: u16,
    pub data_port: u16,
    /// Name announced to the server. Falls back to the OS user name.
    pub name: Option<String>,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay_ms: u64,
    /// Stop instead of reconnecting when the server closes the control
    /// channel cleanly.
    pub exit_on_remote_close: bool,
    /// Shell command used to set the OS volume; `{volume}` is replaced by the
    /// percentage. Without it, volume changes are only logged.
    pub volume_command: Option<String>,
    /// Shell command run before each volume change to unmute the output.
    pub unmute_command: Option<String>,
    /// Output device name; the host default when unset or not found.
    pub output_device: Option<String>,
    /// Audio queued ahead of the output device.
    pub output_buffer_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".into(),
            control_port: DEFAULT_CONTROL_PORT,
            data_port: DEFAULT_DATA_PORT,
            name: None,
            reconnect_delay_ms: 5_000,
            exit_on_remote_close: false,
            volume_command: None,
            unmute_command: None,
            output_device: None,
            output_buffer_ms: 250,
        }
    }
}

impl ClientConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn output_buffer(&self) -> Duration {
        Duration::from_millis(self.output_buffer_ms)
    }

    /// Configured name, or the current OS user.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(os_username)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&read_config_file(path)?)
    }
}

fn read_config_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))
}

/// Current user name from the environment. Windows names of the form
/// `DOMAIN\user` lose the domain part.
pub fn os_username() -> String {
    let raw = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    let name = strip_domain(&raw);
    if name.is_empty() {
        "endpoint".into()
    } else {
        name.into()
    }
}

fn strip_domain(name: &str) -> &str {
    match name.rfind('\\') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}
