// Playback sinks for the endpoint client.
//
// `DeviceSink` plays on the sound card through `cpal`. `prepare(rate)` opens
// a 16-bit stereo output stream at the announced rate on a dedicated output
// thread (cpal streams cannot move between threads), fed from a `ringbuf`
// queue. `write` converts the incoming bytes to samples and blocks while the
// queue is full, which paces the data channel to the device clock. The
// device callback pads with silence when the queue runs dry.
//
// `PipeSink` writes raw PCM to stdout or a file for an external player, and
// `NullSink` discards everything.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleFormat, SampleRate, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, error, info, warn};

use super::{AudioError, AudioSink};

const CHANNELS: u16 = 2;
const DEFAULT_BUFFER: Duration = Duration::from_millis(250);
/// How long `write` waits for the device to make room before giving up.
const STALL_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

// ---------------------------------------------------------------------------
// Sound device
// ---------------------------------------------------------------------------

/// Plays PCM on an output device.
pub struct DeviceSink {
    device_name: Option<String>,
    buffer: Duration,
    output: Option<DeviceOutput>,
}

/// One prepared pipeline: the writer side of the queue plus the thread that
/// owns the cpal stream.
struct DeviceOutput {
    queue: HeapProd<i16>,
    /// Odd byte left over from the previous `write`.
    carry: Option<u8>,
    failed: Arc<AtomicBool>,
    stop: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl DeviceSink {
    /// `device_name` selects an output by name; `None` (or a name that is
    /// not found) uses the host's default output.
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            buffer: DEFAULT_BUFFER,
            output: None,
        }
    }

    /// Amount of audio queued ahead of the device.
    pub fn with_buffer(mut self, buffer: Duration) -> Self {
        self.buffer = buffer;
        self
    }

    /// Names of the host's output devices.
    pub fn list_devices() -> Result<Vec<String>, AudioError> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| AudioError::Device(format!("cannot enumerate devices: {e}")))?
            .filter_map(|device| device.name().ok())
            .collect();
        Ok(devices)
    }

    pub fn is_prepared(&self) -> bool {
        self.output.is_some()
    }

    fn queue_len(&self, sample_rate: u32) -> usize {
        let frames = u128::from(sample_rate) * self.buffer.as_millis() / 1000;
        let frames = usize::try_from(frames).unwrap_or(usize::MAX / 4);
        frames.max(256) * usize::from(CHANNELS)
    }
}

impl AudioSink for DeviceSink {
    fn prepare(&mut self, sample_rate: u32) -> Result<(), AudioError> {
        self.close()?;

        let (producer, consumer) = HeapRb::<i16>::new(self.queue_len(sample_rate)).split();
        let failed = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = {
            let device_name = self.device_name.clone();
            let failed = Arc::clone(&failed);
            thread::Builder::new()
                .name("audio-output".into())
                .spawn(move || {
                    match open_stream(device_name.as_deref(), sample_rate, consumer, failed) {
                        Ok(stream) => {
                            let _ = ready_tx.send(Ok(()));
                            // Keep the stream alive until the sink closes.
                            let _ = stop_rx.recv();
                            drop(stream);
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                        }
                    }
                })?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("Output device ready: 16-bit stereo at {sample_rate} Hz");
                self.output = Some(DeviceOutput {
                    queue: producer,
                    carry: None,
                    failed,
                    stop: stop_tx,
                    thread,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::Device("output thread exited".into()))
            }
        }
    }

    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        let Some(output) = self.output.as_mut() else {
            return Ok(());
        };
        let samples = decode_samples(&mut output.carry, pcm);
        push_blocking(&mut output.queue, &samples, &output.failed, STALL_TIMEOUT)
    }

    fn close(&mut self) -> Result<(), AudioError> {
        if let Some(output) = self.output.take() {
            let _ = output.stop.send(());
            if output.thread.join().is_err() {
                warn!("Output thread panicked");
            }
            debug!("Output device closed");
        }
        Ok(())
    }
}

impl Drop for DeviceSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn open_stream(
    device_name: Option<&str>,
    sample_rate: u32,
    mut queue: HeapCons<i16>,
    failed: Arc<AtomicBool>,
) -> Result<Stream, AudioError> {
    let device = pick_device(device_name)?;
    let format = pick_format(&device, sample_rate)?;
    let config = StreamConfig {
        channels: CHANNELS,
        sample_rate: SampleRate(sample_rate),
        buffer_size: BufferSize::Default,
    };
    let on_error = move |err: cpal::StreamError| {
        error!("Audio stream error: {err}");
        failed.store(true, Ordering::SeqCst);
    };

    let stream = match format {
        SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| fill_i16(&mut queue, data),
            on_error,
            None,
        ),
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| fill_f32(&mut queue, data),
            on_error,
            None,
        ),
        SampleFormat::U16 => device.build_output_stream(
            &config,
            move |data: &mut [u16], _: &cpal::OutputCallbackInfo| fill_u16(&mut queue, data),
            on_error,
            None,
        ),
        other => {
            return Err(AudioError::Unsupported(format!(
                "device sample format {other:?}"
            )));
        }
    }
    .map_err(|e| AudioError::Device(format!("cannot build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| AudioError::Device(format!("cannot start output stream: {e}")))?;
    Ok(stream)
}

fn pick_device(name: Option<&str>) -> Result<Device, AudioError> {
    let host = cpal::default_host();
    if let Some(name) = name {
        let mut devices = host
            .output_devices()
            .map_err(|e| AudioError::Device(format!("cannot enumerate devices: {e}")))?;
        match devices.find(|d| d.name().ok().as_deref() == Some(name)) {
            Some(device) => return Ok(device),
            None => warn!("Output device '{name}' not found, using the default device"),
        }
    }
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::Device("no default output device".into()))?;
    debug!(
        "Using output device {}",
        device.name().unwrap_or_else(|_| "(unnamed)".into())
    );
    Ok(device)
}

/// Best sample format the device offers for stereo at `sample_rate`.
fn pick_format(device: &Device, sample_rate: u32) -> Result<SampleFormat, AudioError> {
    let offered: Vec<SampleFormat> = device
        .supported_output_configs()
        .map_err(|e| AudioError::Device(format!("cannot query device formats: {e}")))?
        .filter(|c| {
            c.channels() == CHANNELS
                && c.min_sample_rate().0 <= sample_rate
                && c.max_sample_rate().0 >= sample_rate
        })
        .map(|c| c.sample_format())
        .collect();

    [SampleFormat::I16, SampleFormat::F32, SampleFormat::U16]
        .into_iter()
        .find(|format| offered.contains(format))
        .ok_or_else(|| {
            AudioError::Unsupported(format!(
                "output device cannot play stereo at {sample_rate} Hz"
            ))
        })
}

/// Turn little-endian bytes into samples, holding an odd trailing byte in
/// `carry` until the next call.
fn decode_samples(carry: &mut Option<u8>, pcm: &[u8]) -> Vec<i16> {
    let mut samples = Vec::with_capacity(pcm.len() / 2 + 1);
    let mut rest = pcm;
    if let Some(low) = carry.take() {
        match rest.split_first() {
            Some((&high, tail)) => {
                samples.push(i16::from_le_bytes([low, high]));
                rest = tail;
            }
            None => {
                *carry = Some(low);
                return samples;
            }
        }
    }
    let mut pairs = rest.chunks_exact(2);
    samples.extend(pairs.by_ref().map(|b| i16::from_le_bytes([b[0], b[1]])));
    *carry = pairs.remainder().first().copied();
    samples
}

/// Push every sample, waiting while the queue is full. Fails if the stream
/// reported an error or the device stopped draining for `stall`.
fn push_blocking(
    queue: &mut HeapProd<i16>,
    samples: &[i16],
    failed: &AtomicBool,
    stall: Duration,
) -> Result<(), AudioError> {
    let mut pending = samples;
    let mut last_progress = Instant::now();
    while !pending.is_empty() {
        if failed.load(Ordering::SeqCst) {
            return Err(AudioError::Device("output stream failed".into()));
        }
        let n = queue.push_slice(pending);
        if n > 0 {
            pending = &pending[n..];
            last_progress = Instant::now();
            continue;
        }
        if last_progress.elapsed() > stall {
            return Err(AudioError::Device("output device stopped playing".into()));
        }
        thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

fn fill_i16(queue: &mut HeapCons<i16>, out: &mut [i16]) {
    let n = queue.pop_slice(out);
    out[n..].fill(0);
}

fn fill_f32(queue: &mut HeapCons<i16>, out: &mut [f32]) {
    for sample in out {
        *sample = queue.try_pop().map_or(0.0, |s| f32::from(s) / 32_768.0);
    }
}

fn fill_u16(queue: &mut HeapCons<i16>, out: &mut [u16]) {
    for sample in out {
        *sample = queue.try_pop().map_or(0x8000, |s| (s as u16) ^ 0x8000);
    }
}

// ---------------------------------------------------------------------------
// Pipes
// ---------------------------------------------------------------------------

/// Writes raw PCM to any `Write`, e.g. stdout piped into
/// `aplay -f S16_LE -c 2 -r <rate>`. Data arriving with no pipeline prepared
/// is dropped.
pub struct PipeSink<W> {
    output: W,
    sample_rate: Option<u32>,
}

impl<W: Write> PipeSink<W> {
    pub fn new(output: W) -> Self {
        Self {
            output,
            sample_rate: None,
        }
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    pub fn get_ref(&self) -> &W {
        &self.output
    }
}

impl PipeSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl PipeSink<File> {
    pub fn create(path: &Path) -> Result<Self, AudioError> {
        Ok(Self::new(File::create(path)?))
    }
}

impl<W: Write + Send> AudioSink for PipeSink<W> {
    fn prepare(&mut self, sample_rate: u32) -> Result<(), AudioError> {
        info!("Output pipeline ready: S16_LE stereo at {sample_rate} Hz");
        self.sample_rate = Some(sample_rate);
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        if self.sample_rate.is_none() {
            return Ok(());
        }
        self.output.write_all(pcm)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), AudioError> {
        if self.sample_rate.take().is_some() {
            self.output.flush()?;
        }
        Ok(())
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn prepare(&mut self, _sample_rate: u32) -> Result<(), AudioError> {
        Ok(())
    }

    fn write(&mut self, _pcm: &[u8]) -> Result<(), AudioError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), AudioError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odd_byte_is_carried_to_the_next_write() {
        let mut carry = None;
        assert_eq!(decode_samples(&mut carry, &[0x01, 0x00, 0xFF]), vec![1]);
        assert_eq!(carry, Some(0xFF));
        assert_eq!(decode_samples(&mut carry, &[]), Vec::<i16>::new());
        assert_eq!(carry, Some(0xFF));
        assert_eq!(decode_samples(&mut carry, &[0xFF, 0x00, 0x01]), vec![-1, 256]);
        assert_eq!(carry, None);
    }

    #[test]
    fn queue_delivers_every_sample_in_order() {
        let (mut producer, mut consumer) = HeapRb::<i16>::new(64).split();
        let failed = AtomicBool::new(false);
        let samples: Vec<i16> = (0..5_000).map(|i| (i % 3_000) as i16 - 1_500).collect();

        let reader = thread::spawn(move || {
            let mut received = Vec::new();
            let mut buf = [0i16; 48];
            while received.len() < 5_000 {
                let n = consumer.pop_slice(&mut buf);
                received.extend_from_slice(&buf[..n]);
                thread::sleep(Duration::from_millis(1));
            }
            received
        });

        // Far more than the queue holds: the writer has to wait for the reader.
        push_blocking(&mut producer, &samples, &failed, Duration::from_secs(10)).unwrap();
        assert_eq!(reader.join().unwrap(), samples);
    }

    #[test]
    fn full_queue_without_a_reader_stalls_out() {
        let (mut producer, _consumer) = HeapRb::<i16>::new(4).split();
        let failed = AtomicBool::new(false);
        let err = push_blocking(
            &mut producer,
            &[1; 16],
            &failed,
            Duration::from_millis(50),
        )
        .unwrap_err();
        assert!(matches!(err, AudioError::Device(_)));
    }

    #[test]
    fn stream_failure_stops_the_writer() {
        let (mut producer, _consumer) = HeapRb::<i16>::new(4).split();
        let failed = AtomicBool::new(true);
        assert!(push_blocking(&mut producer, &[1, 2], &failed, STALL_TIMEOUT).is_err());
    }

    #[test]
    fn callbacks_pad_with_silence() {
        let (mut producer, mut consumer) = HeapRb::<i16>::new(8).split();
        assert_eq!(producer.push_slice(&[5, -5]), 2);
        let mut ints = [9i16; 4];
        fill_i16(&mut consumer, &mut ints);
        assert_eq!(ints, [5, -5, 0, 0]);

        assert_eq!(producer.push_slice(&[i16::MIN, -1, 0, i16::MAX]), 4);

        let mut floats = [1.0f32; 6];
        fill_f32(&mut consumer, &mut floats);
        assert_eq!(floats, [-1.0, -1.0 / 32_768.0, 0.0, 32_767.0 / 32_768.0, 0.0, 0.0]);

        assert_eq!(producer.push_slice(&[i16::MIN, 0, i16::MAX]), 3);
        let mut unsigned = [1u16; 4];
        fill_u16(&mut consumer, &mut unsigned);
        assert_eq!(unsigned, [0, 0x8000, 0xFFFF, 0x8000]);
    }

    #[test]
    fn unprepared_device_sink_drops_writes() {
        let mut sink = DeviceSink::new(None).with_buffer(Duration::from_millis(100));
        assert!(!sink.is_prepared());
        sink.write(&[1, 2, 3, 4]).unwrap();
        sink.close().unwrap();
        assert_eq!(sink.queue_len(8_000), 1_600);
        assert_eq!(sink.queue_len(10), 512);
    }

    #[test]
    fn pipe_sink_drops_data_until_prepared() {
        let mut sink = PipeSink::new(Vec::new());
        sink.write(&[1, 2, 3, 4]).unwrap();
        assert!(sink.get_ref().is_empty());

        sink.prepare(44_100).unwrap();
        assert_eq!(sink.sample_rate(), Some(44_100));
        sink.write(&[5, 6, 7, 8]).unwrap();
        sink.close().unwrap();
        sink.write(&[9, 9, 9, 9]).unwrap();
        assert_eq!(sink.get_ref(), &vec![5, 6, 7, 8]);
        assert_eq!(sink.sample_rate(), None);
    }
}
