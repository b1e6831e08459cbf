// Endpoint client: keeps a connection to the server alive and plays what it
// receives.
//
// `run()` is a reconnect loop around `run_once()`. One session is:
//   dial the control port -> send Announce -> read control messages until
//   the connection fails.
// The caller's thread is the control listener. Control messages drive the
// local pipeline:
// - `PlaybackSetup(rate)` with rate > 0 tears down the current pipeline,
//   prepares the sink at `rate`, dials the data port and spawns the data
//   listener thread.
// - `PlaybackSetup(0)` tears the pipeline down.
// - `VolumeControl(v)` unmutes (a `NotMuted` answer is expected and ignored)
//   and sets the volume. Mixer failures are logged, never fatal.
//
// The data listener copies raw PCM from the data channel into the sink. An
// orderly close from the server is how `stop` detaches data channels, so it
// ends the listener quietly. An I/O or sink failure ends the whole session:
// the listener records the error and shuts the control stream down, which
// makes the control listener's next receive fail and sends `run()` around
// the reconnect loop.
//
// Between sessions the client sleeps for a fixed `reconnect_delay`. With
// `exit_on_remote_close` set, an orderly close of the control channel ends
// `run()` instead.

use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use chorus_protocol::{Codec, Message, ProtocolError};
use tracing::{debug, info, warn};

use crate::audio::{AudioSink, Mixer, MixerError};
use crate::config::ClientConfig;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Announced,
    Playing { sample_rate: u32 },
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Announced => f.write_str("announced"),
            Self::Playing { sample_rate } => write!(f, "playing at {sample_rate} Hz"),
        }
    }
}

/// How one connection ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The server closed the control channel in an orderly way.
    RemoteClosed,
    /// Dial failure, I/O error, protocol error, or a failed data listener.
    Lost(Error),
}

/// Read-only view of a client's state, usable from other threads.
#[derive(Clone, Debug)]
pub struct StateHandle(Arc<Mutex<ClientState>>);

impl StateHandle {
    pub fn get(&self) -> ClientState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: ClientState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

type SharedSink = Arc<Mutex<Box<dyn AudioSink>>>;
type FailureSlot = Arc<Mutex<Option<Error>>>;

struct DataPipeline {
    stream: TcpStream,
    cancelled: Arc<AtomicBool>,
    listener: JoinHandle<()>,
}

pub struct Client {
    config: ClientConfig,
    name: String,
    control_addr: SocketAddr,
    data_addr: SocketAddr,
    sink: SharedSink,
    mixer: Box<dyn Mixer>,
    state: StateHandle,
    pipeline: Option<DataPipeline>,
}

impl Client {
    /// Resolve the server address and check the announce name. Fails if the
    /// host does not resolve or the name does not fit in one frame.
    pub fn new(
        config: ClientConfig,
        sink: Box<dyn AudioSink>,
        mixer: Box<dyn Mixer>,
    ) -> Result<Self> {
        let name = config.display_name();
        Message::announce(name.as_str())?;
        let control_addr = resolve(&config.server, config.control_port)?;
        let data_addr = resolve(&config.server, config.data_port)?;
        Ok(Self {
            config,
            name,
            control_addr,
            data_addr,
            sink: Arc::new(Mutex::new(sink)),
            mixer,
            state: StateHandle(Arc::new(Mutex::new(ClientState::Disconnected))),
            pipeline: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ClientState {
        self.state.get()
    }

    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    /// Connect, serve, and reconnect forever. Returns only when the server
    /// closes the connection and `exit_on_remote_close` is set.
    pub fn run(&mut self) {
        loop {
            match self.run_once() {
                SessionEnd::RemoteClosed if self.config.exit_on_remote_close => {
                    info!("Server closed the connection, exiting");
                    return;
                }
                SessionEnd::RemoteClosed => info!("Server closed the connection"),
                SessionEnd::Lost(e) => warn!("Connection lost: {e}"),
            }
            info!(
                "Reconnecting in {} ms",
                self.config.reconnect_delay().as_millis()
            );
            thread::sleep(self.config.reconnect_delay());
        }
    }

    /// One connect / announce / listen cycle.
    pub fn run_once(&mut self) -> SessionEnd {
        let failure: FailureSlot = Arc::new(Mutex::new(None));
        let result = self.serve(&failure);
        self.teardown_pipeline();
        self.state.set(ClientState::Disconnected);

        let data_failure = failure.lock().unwrap_or_else(PoisonError::into_inner).take();
        match (data_failure, result) {
            (Some(e), _) => SessionEnd::Lost(e),
            (None, Err(Error::ConnectionLost(ProtocolError::Closed)) | Ok(())) => {
                SessionEnd::RemoteClosed
            }
            (None, Err(e)) => SessionEnd::Lost(e),
        }
    }

    fn serve(&mut self, failure: &FailureSlot) -> Result<()> {
        self.state.set(ClientState::Connecting);
        let stream = TcpStream::connect(self.control_addr).map_err(|source| Error::Dial {
            addr: self.control_addr,
            source,
        })?;
        let control = stream.try_clone()?;
        let mut codec = Codec::new(stream);
        codec.send(&Message::announce(self.name.as_str())?)?;
        self.state.set(ClientState::Announced);
        info!("Connected to {} as '{}'", self.control_addr, self.name);

        loop {
            match codec.receive()? {
                Message::PlaybackSetup { sample_rate: 0 } => {
                    self.teardown_pipeline();
                    self.state.set(ClientState::Announced);
                    info!("Playback stopped");
                }
                Message::PlaybackSetup { sample_rate } => {
                    let sample_rate = u32::from(sample_rate);
                    self.teardown_pipeline();
                    self.lock_sink().prepare(sample_rate)?;
                    self.open_pipeline(&control, failure)?;
                    self.state.set(ClientState::Playing { sample_rate });
                    info!("Playback prepared at {sample_rate} Hz");
                }
                Message::VolumeControl { volume } => self.apply_volume(volume),
                Message::Announce { .. } => debug!("Ignoring announce from server"),
            }
        }
    }

    fn open_pipeline(&mut self, control: &TcpStream, failure: &FailureSlot) -> Result<()> {
        let stream = TcpStream::connect(self.data_addr).map_err(|source| Error::Dial {
            addr: self.data_addr,
            source,
        })?;
        let reader = stream.try_clone()?;
        let control = control.try_clone()?;
        let cancelled = Arc::new(AtomicBool::new(false));
        let listener = {
            let sink = Arc::clone(&self.sink);
            let cancelled = Arc::clone(&cancelled);
            let failure = Arc::clone(failure);
            thread::spawn(move || receive_pcm(reader, sink, cancelled, failure, control))
        };
        self.pipeline = Some(DataPipeline {
            stream,
            cancelled,
            listener,
        });
        Ok(())
    }

    fn teardown_pipeline(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.cancelled.store(true, Ordering::SeqCst);
            let _ = pipeline.stream.shutdown(Shutdown::Both);
            let _ = pipeline.listener.join();
        }
        if let Err(e) = self.lock_sink().close() {
            warn!("Closing the output failed: {e}");
        }
    }

    fn apply_volume(&mut self, volume: u8) {
        match self.mixer.unmute() {
            Ok(()) | Err(MixerError::NotMuted) => {}
            Err(e) => warn!("Unmuting failed: {e}"),
        }
        match self.mixer.set_volume(volume) {
            Ok(()) => info!("Volume set to {volume}%"),
            Err(e) => warn!("Setting volume to {volume}% failed: {e}"),
        }
    }

    fn lock_sink(&self) -> MutexGuard<'_, Box<dyn AudioSink>> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("cannot resolve {host}: {e}")))?
        .next()
        .ok_or_else(|| Error::Config(format!("{host} has no addresses")))
}

fn receive_pcm(
    stream: TcpStream,
    sink: SharedSink,
    cancelled: Arc<AtomicBool>,
    failure: FailureSlot,
    control: TcpStream,
) {
    let mut codec = Codec::new(stream);
    let error = loop {
        match codec.receive_raw() {
            Ok(pcm) => {
                let written = sink
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .write(pcm);
                if let Err(e) = written {
                    break Error::from(e);
                }
            }
            Err(ProtocolError::Closed) => {
                debug!("Data channel closed by server");
                return;
            }
            Err(e) => break Error::from(e),
        }
    };

    if cancelled.load(Ordering::SeqCst) {
        return;
    }
    warn!("Data channel failed: {error}");
    *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    let _ = control.shutdown(Shutdown::Both);
}
