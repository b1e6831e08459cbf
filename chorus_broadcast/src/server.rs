// Broadcast server: listeners, playback state and the broadcast loop.
//
// Architecture: thread-per-connection on blocking `std::net`.
//
// - **Accept threads** (control port, data port): blocking `accept()` loops.
//   Each new control connection becomes an `EndpointSession` in the
//   registry; each data connection is attached to the session registered
//   for the same peer IP. The threads hold a `Weak<Server>` and exit once
//   the server is gone.
// - **Broadcast thread** (one per playback): pulls fixed-size PCM chunks
//   from the decoder and hands each one to every session. A failing
//   endpoint is logged and skipped; the loop never stops for one peer.
// - **Caller thread** (console or embedding code): `play_music`,
//   `stop_music`, `set_volume`, `connected_users`.
//
// Playback is a small state machine: NotLoaded -> Loaded (waiting on the
// barrier) -> Streaming. A generation counter, bumped by every play and
// stop, lets a broadcast thread or a `play_music` call that is waiting on
// the barrier notice that it has been superseded. When a source runs out the
// state stays Streaming with `finished` set, so a new `play` is accepted
// without an explicit `stop`.
//
// Lock order: playback, then registry, then session. The barrier wait in
// `play_music` happens with the playback lock released so data channels can
// attach meanwhile.

use std::fmt;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use chorus_protocol::Message;
use chorus_protocol::message::validate_volume;
use tracing::{debug, error, info, warn};

use crate::audio::{AudioError, AudioSource, SourceLoader, read_chunk};
use crate::config::ServerConfig;
use crate::endpoint::{EndpointSession, enable_keepalive};
use crate::error::{Error, Result};
use crate::registry::{BroadcastReport, Registry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    NotLoaded,
    Loaded,
    Streaming,
}

/// Who a volume change applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VolumeTarget {
    All,
    User(String),
}

impl VolumeTarget {
    /// `all` is the wildcard; anything else names one endpoint.
    pub fn parse(target: &str) -> Self {
        if target == "all" {
            Self::All
        } else {
            Self::User(target.to_owned())
        }
    }
}

impl fmt::Display for VolumeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::User(name) => f.write_str(name),
        }
    }
}

struct Playback {
    state: PlaybackState,
    generation: u64,
    /// The current source reached end of stream.
    finished: bool,
}

impl Playback {
    fn is_busy(&self) -> bool {
        match self.state {
            PlaybackState::NotLoaded => false,
            PlaybackState::Loaded => true,
            PlaybackState::Streaming => !self.finished,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum ChannelKind {
    Control,
    Data,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control => f.write_str("control"),
            Self::Data => f.write_str("data"),
        }
    }
}

pub struct Server {
    config: ServerConfig,
    loader: Box<dyn SourceLoader>,
    registry: Arc<Registry>,
    playback: Arc<Mutex<Playback>>,
    control_addr: Option<SocketAddr>,
    data_addr: Option<SocketAddr>,
}

impl Server {
    /// A server with no listeners. Connections are handed in through
    /// `accept_control` / `accept_data`.
    pub fn new(config: ServerConfig, loader: Box<dyn SourceLoader>) -> Arc<Self> {
        Arc::new(Self::build(config, loader, None, None))
    }

    /// Bind both listeners from `config` and start accepting.
    pub fn start(config: ServerConfig, loader: Box<dyn SourceLoader>) -> Result<Arc<Self>> {
        let control = TcpListener::bind((config.bind_address, config.control_port))?;
        let data = TcpListener::bind((config.bind_address, config.data_port))?;
        Self::with_listeners(config, loader, control, data)
    }

    /// Start accepting on already-bound listeners.
    pub fn with_listeners(
        config: ServerConfig,
        loader: Box<dyn SourceLoader>,
        control: TcpListener,
        data: TcpListener,
    ) -> Result<Arc<Self>> {
        let control_addr = control.local_addr()?;
        let data_addr = data.local_addr()?;
        let server = Arc::new(Self::build(
            config,
            loader,
            Some(control_addr),
            Some(data_addr),
        ));

        info!("Listening for control connections on {control_addr}");
        info!("Listening for data connections on {data_addr}");
        let weak = Arc::downgrade(&server);
        thread::spawn(move || accept_loop(control, weak, ChannelKind::Control));
        let weak = Arc::downgrade(&server);
        thread::spawn(move || accept_loop(data, weak, ChannelKind::Data));
        Ok(server)
    }

    fn build(
        config: ServerConfig,
        loader: Box<dyn SourceLoader>,
        control_addr: Option<SocketAddr>,
        data_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            config,
            loader,
            registry: Registry::new(),
            playback: Arc::new(Mutex::new(Playback {
                state: PlaybackState::NotLoaded,
                generation: 0,
                finished: false,
            })),
            control_addr,
            data_addr,
        }
    }

    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control_addr
    }

    pub fn data_addr(&self) -> Option<SocketAddr> {
        self.data_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.lock_playback().state
    }

    /// Display names of connected endpoints, unordered.
    pub fn connected_users(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Register a new control connection from `peer`.
    pub fn accept_control(&self, peer: IpAddr, stream: TcpStream) {
        let keepalive = self
            .config
            .control_keepalive()
            .map(|idle| enable_keepalive(&stream, idle));
        if let Some(Err(e)) = keepalive {
            warn!("Cannot enable keepalive for {peer}: {e}");
        }
        let session = match EndpointSession::spawn(
            peer,
            stream,
            self.config.data_write_timeout(),
            self.registry.events(),
        ) {
            Ok(session) => session,
            Err(e) => {
                warn!("Cannot set up session for {peer}: {e}");
                return;
            }
        };

        if self.registry.insert_if_absent(Arc::clone(&session)) {
            info!("Endpoint {peer} connected");
        } else {
            debug!("Refusing duplicate control connection from {peer}");
            session.close();
        }
    }

    /// Attach a data connection from `peer` to its session.
    pub fn accept_data(&self, peer: IpAddr, stream: TcpStream) {
        let playback = self.lock_playback();
        if playback.state == PlaybackState::Streaming {
            debug!("Refusing data connection from {peer}: broadcast in progress");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        let Some(session) = self.registry.get(peer) else {
            debug!("Refusing data connection from {peer}: no control session");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        };

        match session.attach_data(stream) {
            Ok(()) => {
                debug!("Data channel attached for {}", session.display_name());
                drop(playback);
                self.registry.notify_changed();
            }
            Err(e) => debug!("Refusing data connection from {peer}: {e}"),
        }
    }

    /// Load `path`, prepare every endpoint, wait for their data channels and
    /// start broadcasting. Returns once the broadcast thread is running.
    pub fn play_music(&self, path: &Path) -> Result<()> {
        if self.lock_playback().is_busy() {
            return Err(Error::AlreadyPlaying);
        }

        let source = self.loader.load(path)?;
        let sample_rate = source.sample_rate();
        // Rate 0 means "stop" on the wire, so a source can never use it.
        if sample_rate == 0 {
            return Err(AudioError::Unsupported("sample rate 0 Hz".into()).into());
        }
        Message::playback_setup(sample_rate)?;

        let generation = {
            let mut playback = self.lock_playback();
            if playback.is_busy() {
                return Err(Error::AlreadyPlaying);
            }
            playback.state = PlaybackState::Loaded;
            playback.finished = false;
            playback.generation += 1;

            // Data channels from a previous song are stale: the endpoints
            // rebuild their pipelines on the new setup and reconnect.
            self.registry.for_each(|s| {
                s.detach_data();
            });
            let report = self.registry.broadcast(|s| s.prepare_playback(sample_rate));
            log_failures(&report, "send playback setup");
            playback.generation
        };

        info!(
            "Waiting for {} endpoint(s) to open their data channels",
            self.registry.len()
        );
        let playback = Arc::clone(&self.playback);
        let superseded = move || lock(&playback).generation != generation;
        if !self
            .registry
            .wait_until_ready_or(self.config.ready_timeout(), superseded)
        {
            warn!("Waiting for endpoints timed out");
        }

        {
            let mut playback = self.lock_playback();
            if playback.generation != generation || playback.state != PlaybackState::Loaded {
                return Err(Error::StoppedDuringSetup);
            }
            playback.state = PlaybackState::Streaming;
        }

        info!("Playing {} at {sample_rate} Hz", path.display());
        let registry = Arc::clone(&self.registry);
        let playback = Arc::clone(&self.playback);
        let chunk_size = self.config.chunk_size;
        thread::spawn(move || broadcast_loop(registry, playback, generation, source, chunk_size));
        Ok(())
    }

    /// Stop playback and tell every endpoint to tear its pipeline down.
    pub fn stop_music(&self) -> Result<()> {
        {
            let mut playback = self.lock_playback();
            if playback.state == PlaybackState::NotLoaded {
                return Err(Error::NotPlaying);
            }
            playback.state = PlaybackState::NotLoaded;
            playback.finished = false;
            playback.generation += 1;

            let report = self.registry.broadcast(|s| s.prepare_playback(0));
            log_failures(&report, "send playback stop");
            self.registry.for_each(|s| {
                s.detach_data();
            });
        }
        self.registry.notify_changed();
        info!("Playback stopped");
        Ok(())
    }

    /// Change the output volume of one endpoint or of all of them.
    pub fn set_volume(&self, target: &VolumeTarget, volume: u32) -> Result<()> {
        validate_volume(volume)?;
        match target {
            VolumeTarget::User(name) => {
                let session = self
                    .registry
                    .find_by_name(name)
                    .ok_or_else(|| Error::UserNotFound(name.clone()))?;
                session.set_volume(volume)?;
                info!("Volume of {name} set to {volume}%");
            }
            VolumeTarget::All => {
                let report = self.registry.broadcast(|s| s.set_volume(volume));
                log_failures(&report, "set volume");
                info!(
                    "Volume set to {volume}% on {} endpoint(s)",
                    report.succeeded()
                );
            }
        }
        Ok(())
    }

    fn lock_playback(&self) -> MutexGuard<'_, Playback> {
        lock(&self.playback)
    }
}

fn lock(playback: &Mutex<Playback>) -> MutexGuard<'_, Playback> {
    playback.lock().unwrap_or_else(PoisonError::into_inner)
}

fn log_failures(report: &BroadcastReport, what: &str) {
    for failure in &report.failures {
        warn!(
            "Failed to {what} for {} ({}): {}",
            failure.name, failure.addr, failure.error
        );
    }
}

fn accept_loop(listener: TcpListener, server: Weak<Server>, kind: ChannelKind) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to accept {kind} connection: {e}");
                thread::sleep(Duration::from_millis(50));
                continue;
            }
        };
        let Some(server) = server.upgrade() else {
            break;
        };
        let peer = match stream.peer_addr() {
            Ok(addr) => addr.ip(),
            Err(e) => {
                debug!("Dropping {kind} connection without peer address: {e}");
                continue;
            }
        };
        match kind {
            ChannelKind::Control => server.accept_control(peer, stream),
            ChannelKind::Data => server.accept_data(peer, stream),
        }
    }
}

fn broadcast_loop(
    registry: Arc<Registry>,
    playback: Arc<Mutex<Playback>>,
    generation: u64,
    mut source: Box<dyn AudioSource>,
    chunk_size: usize,
) {
    let mut chunk = vec![0u8; chunk_size];
    loop {
        {
            let state = lock(&playback);
            if state.generation != generation || state.state != PlaybackState::Streaming {
                debug!("Broadcast superseded, stopping");
                return;
            }
        }

        let n = match read_chunk(source.as_mut(), &mut chunk) {
            Ok(n) => n,
            Err(e) => {
                error!("Decoding failed: {e}");
                0
            }
        };
        if n == 0 {
            let mut state = lock(&playback);
            if state.generation == generation {
                state.finished = true;
            }
            info!("Reached end of stream");
            return;
        }

        let report = registry.broadcast(|s| s.stream_samples(&chunk[..n]));
        for failure in &report.failures {
            debug!(
                "Streaming to {} ({}) failed: {}",
                failure.name, failure.addr, failure.error
            );
        }
    }
}
