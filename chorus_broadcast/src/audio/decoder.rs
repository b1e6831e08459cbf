// File decoding for the server.
//
// `MediaLoader` is what `chorus server` plays from: it detects the format with
// `symphonia` (MP3 plus the default containers such as WAV, FLAC and Ogg
// Vorbis) and decodes one packet at a time as `read` asks for more, so a
// long track never sits in memory as PCM. `WavLoader` is the small `hound`
// path for 16-bit WAV only.
//
// Both produce interleaved S16LE stereo. Mono is duplicated onto both
// channels; anything wider than stereo is refused, as are sample rates the
// wire protocol cannot announce (above `MAX_SAMPLE_RATE`).

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use chorus_protocol::MAX_SAMPLE_RATE;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, info, warn};

use super::{AudioError, AudioSource, FRAME_SIZE, SourceLoader};

fn check_layout(sample_rate: u32, channels: usize) -> Result<(), AudioError> {
    if channels == 0 || channels > 2 {
        return Err(AudioError::Unsupported(format!(
            "{channels} channels (need mono or stereo)"
        )));
    }
    if sample_rate == 0 || sample_rate > MAX_SAMPLE_RATE {
        return Err(AudioError::Unsupported(format!(
            "sample rate {sample_rate} Hz (need 1..={MAX_SAMPLE_RATE})"
        )));
    }
    Ok(())
}

fn media_error(source: SymphoniaError) -> AudioError {
    AudioError::Media {
        path: PathBuf::new(),
        source,
    }
}

// ---------------------------------------------------------------------------
// symphonia
// ---------------------------------------------------------------------------

/// Loads any format `symphonia` recognizes. The file extension is passed on as
/// a format hint.
#[derive(Clone, Copy, Debug, Default)]
pub struct MediaLoader;

impl SourceLoader for MediaLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn AudioSource>, AudioError> {
        let file = File::open(path)
            .map_err(|e| media_error(SymphoniaError::IoError(e)).with_path(path))?;
        let stream = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(extension);
        }

        let source = DecodedStream::open(stream, &hint).map_err(|e| e.with_path(path))?;
        info!(
            "Loaded {} ({} Hz, {} channel(s))",
            path.display(),
            source.sample_rate,
            source.channels
        );
        Ok(Box::new(source))
    }
}

/// Packet-by-packet decoder producing interleaved stereo frames.
pub struct DecodedStream {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: usize,
    /// Converted frames of the last decoded packet, consumed from `offset`.
    pending: Vec<u8>,
    offset: usize,
    finished: bool,
}

impl DecodedStream {
    /// Detect the format of `stream` and decode the first packet, which settles the sample
    /// rate and channel count.
    pub fn open(stream: MediaSourceStream, hint: &Hint) -> Result<Self, AudioError> {
        let detected = symphonia::default::get_probe()
            .format(
                hint,
                stream,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(media_error)?;
        let format = detected.format;

        let (track_id, params) = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .map(|t| (t.id, t.codec_params.clone()))
            .ok_or_else(|| AudioError::Unsupported("no audio track".into()))?;
        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(media_error)?;

        let mut source = Self {
            format,
            decoder,
            track_id,
            sample_rate: params.sample_rate.unwrap_or(0),
            channels: params.channels.map_or(0, |c| c.count()),
            pending: Vec::new(),
            offset: 0,
            finished: false,
        };
        if !source.decode_next()? {
            source.finished = true;
        }
        check_layout(source.sample_rate, source.channels)?;
        Ok(source)
    }

    /// Decode packets until one yields audio. Returns `false` at end of
    /// stream.
    fn decode_next(&mut self) -> Result<bool, AudioError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(false),
                Err(e) => return Err(media_error(e)),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("Skipping undecodable packet: {e}");
                    continue;
                }
                Err(e) => return Err(media_error(e)),
            };
            if decoded.frames() == 0 {
                continue;
            }

            let spec = *decoded.spec();
            let channels = spec.channels.count();
            check_layout(spec.rate, channels)?;
            if self.sample_rate != 0 && spec.rate != self.sample_rate {
                debug!(
                    "Sample rate changed mid-stream from {} to {} Hz",
                    self.sample_rate, spec.rate
                );
            }
            self.sample_rate = spec.rate;
            self.channels = channels;

            let mut samples = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
            samples.copy_interleaved_ref(decoded);

            self.pending.clear();
            self.offset = 0;
            for frame in samples.samples().chunks_exact(channels) {
                let (left, right) = match *frame {
                    [mono] => (mono, mono),
                    [left, right] => (left, right),
                    _ => continue,
                };
                self.pending.extend_from_slice(&left.to_le_bytes());
                self.pending.extend_from_slice(&right.to_le_bytes());
            }
            return Ok(true);
        }
    }
}

impl AudioSource for DecodedStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        let whole = buf.len() - buf.len() % FRAME_SIZE;
        let mut written = 0;
        while written < whole {
            if self.offset == self.pending.len() {
                if self.finished || !self.decode_next()? {
                    self.finished = true;
                    break;
                }
                continue;
            }
            let available = &self.pending[self.offset..];
            let n = available.len().min(whole - written);
            buf[written..written + n].copy_from_slice(&available[..n]);
            self.offset += n;
            written += n;
        }
        Ok(written)
    }
}

// ---------------------------------------------------------------------------
// hound
// ---------------------------------------------------------------------------

/// Loads 16-bit PCM WAV files.
#[derive(Clone, Copy, Debug, Default)]
pub struct WavLoader;

impl SourceLoader for WavLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn AudioSource>, AudioError> {
        let file = File::open(path).map_err(|e| AudioError::Decode {
            path: path.to_owned(),
            source: hound::Error::IoError(e),
        })?;
        let source = WavSource::new(BufReader::new(file)).map_err(|e| e.with_path(path))?;
        info!(
            "Loaded {} ({} Hz, {} channel(s))",
            path.display(),
            source.sample_rate,
            source.channels
        );
        Ok(Box::new(source))
    }
}

/// WAV decoder producing interleaved stereo frames.
pub struct WavSource<R> {
    reader: hound::WavReader<R>,
    sample_rate: u32,
    channels: u16,
}

impl<R: Read> WavSource<R> {
    pub fn new(reader: R) -> Result<Self, AudioError> {
        let reader = hound::WavReader::new(reader).map_err(wav_error)?;
        let spec = reader.spec();
        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(AudioError::Unsupported(format!(
                "{}-bit {:?} samples (need 16-bit integer PCM)",
                spec.bits_per_sample, spec.sample_format
            )));
        }
        check_layout(spec.sample_rate, usize::from(spec.channels))?;
        Ok(Self {
            reader,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        })
    }
}

impl<R: Read + Send> AudioSource for WavSource<R> {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        let stereo = self.channels == 2;
        let mut samples = self.reader.samples::<i16>();
        let mut written = 0;
        for frame in buf.chunks_exact_mut(FRAME_SIZE) {
            let left = match samples.next() {
                Some(sample) => sample.map_err(wav_error)?,
                None => break,
            };
            let right = if stereo {
                match samples.next() {
                    Some(sample) => sample.map_err(wav_error)?,
                    None => break,
                }
            } else {
                left
            };
            frame[..2].copy_from_slice(&left.to_le_bytes());
            frame[2..].copy_from_slice(&right.to_le_bytes());
            written += FRAME_SIZE;
        }
        Ok(written)
    }
}

fn wav_error(source: hound::Error) -> AudioError {
    AudioError::Decode {
        path: PathBuf::new(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn wav_bytes(channels: u16, sample_rate: u32, samples: &[i16]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    /// MPEG-1 Layer III frames at 128 kbit/s, 44.1 kHz, with empty side
    /// information and main data, which decode to silence.
    fn silent_mp3(frames: usize, mono: bool) -> Vec<u8> {
        const FRAME_LEN: usize = 417;
        let mode = if mono { 0xC4 } else { 0x64 };
        let mut bytes = Vec::with_capacity(frames * FRAME_LEN);
        for _ in 0..frames {
            bytes.extend_from_slice(&[0xFF, 0xFB, 0x90, mode]);
            bytes.resize(bytes.len() + FRAME_LEN - 4, 0);
        }
        bytes
    }

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn drain(source: &mut dyn AudioSource) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let n = source.read(&mut buf).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn mp3_decodes_to_stereo_pcm() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "silence.mp3", &silent_mp3(20, false));

        let mut source = MediaLoader.load(&path).unwrap();
        assert_eq!(source.sample_rate(), 44_100);
        let pcm = drain(source.as_mut());
        assert!(!pcm.is_empty());
        assert_eq!(pcm.len() % FRAME_SIZE, 0);
        assert!(pcm.iter().all(|&b| b == 0));
    }

    #[test]
    fn mono_mp3_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "mono.mp3", &silent_mp3(20, true));

        let mut source = MediaLoader.load(&path).unwrap();
        assert_eq!(source.sample_rate(), 44_100);
        assert_eq!(drain(source.as_mut()).len() % FRAME_SIZE, 0);
    }

    #[test]
    fn media_loader_upmixes_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "mono.wav", &wav_bytes(1, 8_000, &[7, -2, 300]));

        let mut source = MediaLoader.load(&path).unwrap();
        assert_eq!(source.sample_rate(), 8_000);
        assert_eq!(
            drain(source.as_mut()),
            vec![7, 0, 7, 0, 0xFE, 0xFF, 0xFE, 0xFF, 0x2C, 1, 0x2C, 1]
        );
    }

    #[test]
    fn media_loader_keeps_stereo_order() {
        let dir = tempfile::tempdir().unwrap();
        let samples: Vec<i16> = (0..2_000).map(|i| (i * 13 - 9_000) as i16).collect();
        let path = write_file(dir.path(), "stereo.wav", &wav_bytes(2, 44_100, &samples));

        let mut source = MediaLoader.load(&path).unwrap();
        let expected: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        assert_eq!(drain(source.as_mut()), expected);
    }

    #[test]
    fn media_loader_rejects_high_sample_rates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "hires.wav", &wav_bytes(2, 96_000, &[0; 64]));
        assert!(matches!(
            MediaLoader.load(&path),
            Err(AudioError::Unsupported(_))
        ));
    }

    #[test]
    fn media_loader_reports_missing_and_garbage_files() {
        let err = MediaLoader
            .load(Path::new("/nonexistent/song.mp3"))
            .err()
            .unwrap();
        assert!(matches!(err, AudioError::Media { .. }));
        assert!(err.to_string().contains("/nonexistent/song.mp3"));

        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "noise.bin", b"definitely not audio at all");
        assert!(matches!(
            MediaLoader.load(&path),
            Err(AudioError::Media { .. })
        ));
    }

    #[test]
    fn odd_buffers_get_whole_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "short.wav", &wav_bytes(2, 8_000, &[1, 2, 3, 4]));

        let mut source = MediaLoader.load(&path).unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(source.read(&mut buf).unwrap(), 4);
        assert_eq!(source.read(&mut buf).unwrap(), 4);
        assert_eq!(source.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn stereo_wav_decodes_to_interleaved_le() {
        let bytes = wav_bytes(2, 44_100, &[1, -1, 256, 512]);
        let mut source = WavSource::new(Cursor::new(bytes)).unwrap();
        assert_eq!(source.sample_rate(), 44_100);

        let mut buf = [0u8; 16];
        let n = source.read(&mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(&buf[..8], &[1, 0, 0xFF, 0xFF, 0, 1, 0, 2]);
        assert_eq!(source.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn mono_wav_is_duplicated_to_both_channels() {
        let bytes = wav_bytes(1, 22_050, &[7, 9]);
        let mut source = WavSource::new(Cursor::new(bytes)).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(source.read(&mut buf).unwrap(), 8);
        assert_eq!(buf, [7, 0, 7, 0, 9, 0, 9, 0]);
    }

    #[test]
    fn wav_sample_rate_above_limit_is_unsupported() {
        let bytes = wav_bytes(2, 96_000, &[0, 0]);
        assert!(matches!(
            WavSource::new(Cursor::new(bytes)),
            Err(AudioError::Unsupported(_))
        ));
    }

    #[test]
    fn garbage_is_a_wav_decode_error() {
        let result = WavSource::new(Cursor::new(b"definitely not a wav file".to_vec()));
        assert!(matches!(result, Err(AudioError::Decode { .. })));
    }

    #[test]
    fn missing_wav_reports_path() {
        let err = WavLoader
            .load(Path::new("/nonexistent/song.wav"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("/nonexistent/song.wav"));
    }
}
