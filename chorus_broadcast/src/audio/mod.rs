// Audio collaborators: where PCM comes from and where it goes.
//
// The broadcast core never decodes or plays audio itself. It talks to three
// narrow interfaces:
// - `SourceLoader` / `AudioSource` (server side): open a file, report its
//   sample rate, hand out PCM a buffer at a time until end of stream.
// - `AudioSink` (endpoint side): build a pipeline at a sample rate, accept
//   PCM (blocking as long as the device needs), tear the pipeline down.
// - `Mixer` (endpoint side): OS output volume. `unmute` may report
//   `MixerError::NotMuted`, which callers ignore.
//
// PCM everywhere is 16-bit little-endian interleaved stereo, 4 bytes per
// frame.
//
// Submodules:
// - `decoder.rs`: `MediaLoader` (MP3 and friends through `symphonia`, the
//                 server default) and `WavLoader` (16-bit WAV through
//                 `hound`).
// - `output.rs`:  `DeviceSink` (sound card through `cpal`, the client
//                 default), `PipeSink` (raw PCM to stdout or a file) and
//                 `NullSink`.
// - `mixer.rs`:   `CommandMixer` (configured shell commands) and `NullMixer`.

mod decoder;
mod mixer;
mod output;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use decoder::{DecodedStream, MediaLoader, WavLoader, WavSource};
pub use mixer::{CommandMixer, NullMixer};
pub use output::{DeviceSink, NullSink, PipeSink};

/// Bytes per 16-bit stereo frame.
pub const FRAME_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("cannot read {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("cannot decode {path}: {source}")]
    Media {
        path: PathBuf,
        #[source]
        source: symphonia::core::errors::Error,
    },

    #[error("unsupported audio format: {0}")]
    Unsupported(String),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("audio output failed: {0}")]
    Output(#[from] io::Error),
}

impl AudioError {
    /// Attach the file name to a decode error raised before it was known.
    fn with_path(self, path: &Path) -> Self {
        match self {
            Self::Decode { source, .. } => Self::Decode {
                path: path.to_owned(),
                source,
            },
            Self::Media { source, .. } => Self::Media {
                path: path.to_owned(),
                source,
            },
            other => other,
        }
    }
}

#[derive(Debug, Error)]
pub enum MixerError {
    /// The output was not muted to begin with. Expected, and ignored.
    #[error("output is not muted")]
    NotMuted,

    #[error("volume command failed: {0}")]
    Command(String),

    #[error("cannot run volume command: {0}")]
    Io(#[from] io::Error),
}

/// A decoded stream of 16-bit stereo PCM.
pub trait AudioSource: Send {
    fn sample_rate(&self) -> u32;

    /// Fill `buf` with whole frames. Returns the number of bytes written;
    /// 0 means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError>;
}

/// Opens audio files for `Server::play_music`.
pub trait SourceLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Box<dyn AudioSource>, AudioError>;
}

/// Local playback pipeline fed from the data channel.
pub trait AudioSink: Send {
    /// (Re)build the pipeline at `sample_rate`.
    fn prepare(&mut self, sample_rate: u32) -> Result<(), AudioError>;

    /// Play a buffer of PCM. May block until the output has room.
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError>;

    /// Tear the pipeline down. Closing an idle sink is not an error.
    fn close(&mut self) -> Result<(), AudioError>;
}

/// OS output volume control.
pub trait Mixer: Send {
    fn unmute(&mut self) -> Result<(), MixerError>;
    fn set_volume(&mut self, volume: u8) -> Result<(), MixerError>;
}

/// PCM already in memory. Useful for generated tones and tests.
pub struct PcmSource {
    sample_rate: u32,
    pcm: Vec<u8>,
    position: usize,
}

impl PcmSource {
    pub fn new(sample_rate: u32, pcm: Vec<u8>) -> Self {
        Self {
            sample_rate,
            pcm,
            position: 0,
        }
    }
}

impl AudioSource for PcmSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        let remaining = &self.pcm[self.position..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }
}

/// Pull from `source` until `buf` is full or the stream ends. Returns the
/// number of bytes filled; less than `buf.len()` only at end of stream.
pub fn read_chunk(source: &mut dyn AudioSource, buf: &mut [u8]) -> Result<usize, AudioError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
