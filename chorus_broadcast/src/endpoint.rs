// Per-endpoint session state on the server.
//
// An `EndpointSession` exists for every live control connection. It owns the
// control-channel writer (behind a mutex, so sends from the console thread
// and the broadcast thread never interleave frames) and, while the endpoint
// is streaming, a data channel.
//
// Threads:
// - **Control listener** (one per session): reads framed messages from the
//   endpoint. `Announce` records the display name. Anything else coming from
//   an endpoint is ignored. The first receive failure tears the session
//   down and reports `SessionEvent::Disconnected` to the registry, which
//   removes it.
// - **Data sender** (one per attached data channel): drains a one-slot queue
//   of PCM chunks onto the data stream. A write error or write timeout ends
//   the thread; the next `stream_samples` call notices the closed queue,
//   detaches the data channel and reports `ConnectionLost`. The control
//   channel, and therefore the session, survives.
//
// Lifecycle: Connected -> Announced -> Streaming -> Disconnected. Detaching
// the data channel moves a streaming session back to Announced (Connected if
// it never announced). Name, state and data channel share one mutex so state
// changes are atomic with data-channel changes.
//
// A peer that disappears without closing (power loss, cable pulled) would
// otherwise hold its address in the registry until the next control send.
// `enable_keepalive` turns on TCP keepalive for accepted control streams so
// the listener's read fails and the session is removed.

use std::fmt;
use std::io;
use std::net::{IpAddr, Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use chorus_protocol::{Codec, Message, ProtocolError};
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Announced,
    Streaming,
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connected => "connected",
            Self::Announced => "announced",
            Self::Streaming => "streaming",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Sent from a session's control listener to the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Announced {
        addr: IpAddr,
        id: u64,
        name: String,
    },
    Disconnected {
        addr: IpAddr,
        id: u64,
        name: Option<String>,
    },
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("endpoint already has a data channel")]
    AlreadyStreaming,

    #[error("endpoint is disconnected")]
    Disconnected,

    #[error("cannot set up data channel: {0}")]
    Io(#[from] io::Error),
}

struct DataChannel {
    serial: u64,
    samples: SyncSender<Vec<u8>>,
    /// Handle used to shut the stream down; the sender thread owns a clone.
    stream: TcpStream,
}

struct SessionInner {
    name: Option<String>,
    state: SessionState,
    data: Option<DataChannel>,
    next_data_serial: u64,
}

impl SessionInner {
    fn idle_state(&self) -> SessionState {
        if self.name.is_some() {
            SessionState::Announced
        } else {
            SessionState::Connected
        }
    }

    /// Drop the data channel and fall back to the idle state.
    fn close_data(&mut self) -> bool {
        let Some(channel) = self.data.take() else {
            return false;
        };
        let _ = channel.stream.shutdown(Shutdown::Both);
        if self.state == SessionState::Streaming {
            self.state = self.idle_state();
        }
        true
    }
}

pub struct EndpointSession {
    id: u64,
    addr: IpAddr,
    control: Mutex<Codec<TcpStream>>,
    control_handle: TcpStream,
    inner: Mutex<SessionInner>,
    data_write_timeout: Option<Duration>,
}

impl EndpointSession {
    /// Wrap an accepted control connection and start its listener thread.
    pub fn spawn(
        addr: IpAddr,
        stream: TcpStream,
        data_write_timeout: Option<Duration>,
        events: Sender<SessionEvent>,
    ) -> io::Result<Arc<Self>> {
        let reader = Codec::new(stream.try_clone()?);
        let control_handle = stream.try_clone()?;
        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            control: Mutex::new(Codec::new(stream)),
            control_handle,
            inner: Mutex::new(SessionInner {
                name: None,
                state: SessionState::Connected,
                data: None,
                next_data_serial: 0,
            }),
            data_write_timeout,
        });

        let listener = Arc::clone(&session);
        thread::spawn(move || listener.listen(reader, events));
        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Announced name, if any.
    pub fn name(&self) -> Option<String> {
        self.lock_inner().name.clone()
    }

    /// Announced name, or the peer address for endpoints that have not
    /// announced yet.
    pub fn display_name(&self) -> String {
        self.name().unwrap_or_else(|| self.addr.to_string())
    }

    pub fn state(&self) -> SessionState {
        self.lock_inner().state
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    /// Attach `stream` as this endpoint's data channel. On rejection the
    /// stream is shut down.
    pub fn attach_data(&self, stream: TcpStream) -> std::result::Result<(), AttachError> {
        let mut inner = self.lock_inner();
        let rejection = match inner.state {
            SessionState::Streaming => Some(AttachError::AlreadyStreaming),
            SessionState::Disconnected => Some(AttachError::Disconnected),
            SessionState::Connected | SessionState::Announced => None,
        };
        if let Some(err) = rejection {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(err);
        }

        stream.set_write_timeout(self.data_write_timeout)?;
        let writer = Codec::new(stream.try_clone()?);
        let (samples, queue) = mpsc::sync_channel(1);
        let addr = self.addr;
        thread::spawn(move || send_loop(addr, writer, queue));

        inner.next_data_serial += 1;
        inner.data = Some(DataChannel {
            serial: inner.next_data_serial,
            samples,
            stream,
        });
        inner.state = SessionState::Streaming;
        Ok(())
    }

    /// Close the data channel, if there is one. Returns whether one was
    /// attached.
    pub fn detach_data(&self) -> bool {
        self.lock_inner().close_data()
    }

    /// Tell the endpoint to build (rate > 0) or tear down (rate 0) its
    /// playback pipeline.
    pub fn prepare_playback(&self, sample_rate: u32) -> Result<()> {
        self.send(&Message::playback_setup(sample_rate)?)
    }

    pub fn set_volume(&self, volume: u32) -> Result<()> {
        self.send(&Message::volume_control(volume)?)
    }

    /// Queue one PCM chunk for the data channel. Blocks while the previous
    /// chunk is still being written. Does nothing when no data channel is
    /// attached.
    pub fn stream_samples(&self, pcm: &[u8]) -> Result<()> {
        let (serial, samples) = {
            let inner = self.lock_inner();
            match &inner.data {
                Some(channel) => (channel.serial, channel.samples.clone()),
                None => return Ok(()),
            }
        };

        if samples.send(pcm.to_vec()).is_err() {
            let mut inner = self.lock_inner();
            if inner.data.as_ref().is_some_and(|c| c.serial == serial) {
                inner.close_data();
            }
            return Err(Error::connection_lost(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "data channel closed",
            )));
        }
        Ok(())
    }

    /// Shut the control connection down. The listener thread notices and
    /// performs the cleanup.
    pub fn close(&self) {
        let _ = self.control_handle.shutdown(Shutdown::Both);
    }

    fn send(&self, msg: &Message) -> Result<()> {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        control.send(msg)?;
        Ok(())
    }

    fn lock_inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listen(self: Arc<Self>, mut reader: Codec<TcpStream>, events: Sender<SessionEvent>) {
        let error = loop {
            match reader.receive() {
                Ok(Message::Announce { name }) => {
                    info!("Endpoint {} announced as '{name}'", self.addr);
                    {
                        let mut inner = self.lock_inner();
                        inner.name = Some(name.clone());
                        if inner.state == SessionState::Connected {
                            inner.state = SessionState::Announced;
                        }
                    }
                    let _ = events.send(SessionEvent::Announced {
                        addr: self.addr,
                        id: self.id,
                        name,
                    });
                }
                Ok(other) => {
                    debug!(
                        "Ignoring {:?} message from endpoint {}",
                        other.kind(),
                        self.addr
                    );
                }
                Err(e) => break e,
            }
        };

        match &error {
            ProtocolError::Closed => debug!("Endpoint {} closed its control channel", self.addr),
            e => warn!("Control channel of {} failed: {e}", self.addr),
        }

        let name = {
            let mut inner = self.lock_inner();
            inner.close_data();
            inner.state = SessionState::Disconnected;
            inner.name.clone()
        };
        let _ = self.control_handle.shutdown(Shutdown::Both);
        let _ = events.send(SessionEvent::Disconnected {
            addr: self.addr,
            id: self.id,
            name,
        });
    }

    /// Make every later control send fail, as if the peer had vanished.
    #[cfg(test)]
    pub(crate) fn break_control_writer(&self) {
        let _ = self.control_handle.shutdown(Shutdown::Write);
    }
}

impl fmt::Debug for EndpointSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointSession")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

fn send_loop(addr: IpAddr, mut writer: Codec<TcpStream>, queue: Receiver<Vec<u8>>) {
    for chunk in queue {
        if let Err(e) = writer.send_raw(&chunk) {
            debug!("Data channel to {addr} failed: {e}");
            return;
        }
    }
}

/// Start keepalive checks after `idle` without traffic.
pub fn enable_keepalive(stream: &TcpStream, idle: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(idle);
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    let keepalive = keepalive.with_interval(idle / 3);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::{Ipv4Addr, TcpListener};
    use std::time::Instant;

    use chorus_protocol::ValidationError;

    use super::*;

    /// Create a TCP pair: (client_stream, server_stream) on localhost.
    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        (client, server)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    fn session() -> (Arc<EndpointSession>, Codec<TcpStream>, Receiver<SessionEvent>) {
        let (client, server) = tcp_pair();
        let (tx, rx) = mpsc::channel();
        let session = EndpointSession::spawn(PEER, server, None, tx).unwrap();
        (session, Codec::new(client), rx)
    }

    #[test]
    fn announce_names_the_session() {
        let (session, mut client, events) = session();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.display_name(), "10.0.0.1");

        client.send(&Message::announce("kitchen").unwrap()).unwrap();
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            event,
            SessionEvent::Announced {
                addr: PEER,
                id: session.id(),
                name: "kitchen".into()
            }
        );
        assert_eq!(session.name().as_deref(), Some("kitchen"));
        assert_eq!(session.state(), SessionState::Announced);
    }

    #[test]
    fn unexpected_messages_are_ignored() {
        let (session, mut client, events) = session();
        client.send(&Message::volume_control(5).unwrap()).unwrap();
        client.send(&Message::announce("den").unwrap()).unwrap();
        assert!(matches!(
            events.recv_timeout(Duration::from_secs(5)).unwrap(),
            SessionEvent::Announced { .. }
        ));
        assert_eq!(session.state(), SessionState::Announced);
    }

    #[test]
    fn control_close_disconnects() {
        let (session, client, events) = session();
        drop(client);
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            event,
            SessionEvent::Disconnected {
                addr: PEER,
                id: session.id(),
                name: None
            }
        );
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn garbage_on_control_channel_disconnects() {
        let (session, mut client, events) = session();
        client.send_raw(&[9, 0, 0]).unwrap();
        assert!(matches!(
            events.recv_timeout(Duration::from_secs(5)).unwrap(),
            SessionEvent::Disconnected { .. }
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn prepare_and_volume_reach_the_endpoint() {
        let (session, mut client, _events) = session();
        session.prepare_playback(44_100).unwrap();
        session.set_volume(30).unwrap();
        session.prepare_playback(0).unwrap();
        assert_eq!(
            client.receive().unwrap(),
            Message::PlaybackSetup { sample_rate: 44_100 }
        );
        assert_eq!(client.receive().unwrap(), Message::VolumeControl { volume: 30 });
        assert_eq!(client.receive().unwrap(), Message::PlaybackSetup { sample_rate: 0 });
    }

    #[test]
    fn out_of_range_values_are_rejected_before_sending() {
        let (session, mut client, _events) = session();
        assert!(matches!(
            session.prepare_playback(48_001),
            Err(Error::Validation(ValidationError::SampleRate(48_001)))
        ));
        assert!(matches!(
            session.set_volume(101),
            Err(Error::Validation(ValidationError::Volume(101)))
        ));
        session.set_volume(100).unwrap();
        assert_eq!(client.receive().unwrap(), Message::VolumeControl { volume: 100 });
    }

    #[test]
    fn broken_control_writer_is_connection_lost() {
        let (session, _client, _events) = session();
        session.break_control_writer();
        let err = session.set_volume(10).unwrap_err();
        assert!(err.is_connection_loss(), "unexpected error: {err}");
    }

    #[test]
    fn data_channel_carries_samples() {
        let (session, _client, _events) = session();
        let (mut data_client, data_server) = tcp_pair();

        session.attach_data(data_server).unwrap();
        assert_eq!(session.state(), SessionState::Streaming);

        session.stream_samples(&[1, 2, 3, 4]).unwrap();
        session.stream_samples(&[5, 6, 7, 8]).unwrap();
        let mut received = [0u8; 8];
        data_client.read_exact(&mut received).unwrap();
        assert_eq!(received, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn second_attach_is_rejected_and_closed() {
        let (session, _client, _events) = session();
        let (_first_client, first_server) = tcp_pair();
        let (mut second_client, second_server) = tcp_pair();

        session.attach_data(first_server).unwrap();
        assert!(matches!(
            session.attach_data(second_server),
            Err(AttachError::AlreadyStreaming)
        ));
        let mut buf = [0u8; 1];
        assert_eq!(second_client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn detach_returns_to_previous_state() {
        let (session, mut client, events) = session();
        let (mut data_client, data_server) = tcp_pair();

        session.attach_data(data_server).unwrap();
        assert!(session.detach_data());
        assert_eq!(session.state(), SessionState::Connected);
        assert!(!session.detach_data());
        let mut buf = [0u8; 1];
        assert_eq!(data_client.read(&mut buf).unwrap(), 0);

        client.send(&Message::announce("porch").unwrap()).unwrap();
        events.recv_timeout(Duration::from_secs(5)).unwrap();
        let (_data_client, data_server) = tcp_pair();
        session.attach_data(data_server).unwrap();
        session.detach_data();
        assert_eq!(session.state(), SessionState::Announced);
    }

    #[test]
    fn stream_without_data_channel_is_a_no_op() {
        let (session, _client, _events) = session();
        session.stream_samples(&[0; 16]).unwrap();
    }

    #[test]
    fn dead_data_channel_detaches_but_session_survives() {
        let (session, _client, _events) = session();
        let (data_client, data_server) = tcp_pair();
        session.attach_data(data_server).unwrap();
        drop(data_client);

        let chunk = vec![0u8; 512];
        let mut failed = false;
        for _ in 0..10_000 {
            if let Err(e) = session.stream_samples(&chunk) {
                assert!(e.is_connection_loss());
                failed = true;
                break;
            }
        }
        assert!(failed, "writes to a closed peer never failed");
        assert_eq!(session.state(), SessionState::Connected);
        session.stream_samples(&chunk).unwrap();
    }

    #[test]
    fn attach_after_disconnect_is_rejected() {
        let (session, client, events) = session();
        drop(client);
        events.recv_timeout(Duration::from_secs(5)).unwrap();
        wait_for(|| session.state() == SessionState::Disconnected);

        let (_data_client, data_server) = tcp_pair();
        assert!(matches!(
            session.attach_data(data_server),
            Err(AttachError::Disconnected)
        ));
    }

    #[test]
    fn keepalive_is_enabled_on_control_streams() {
        let (_client, server) = tcp_pair();
        assert!(!SockRef::from(&server).keepalive().unwrap());
        enable_keepalive(&server, Duration::from_secs(30)).unwrap();
        assert!(SockRef::from(&server).keepalive().unwrap());
    }

    #[test]
    fn session_ids_are_unique() {
        let (a, _ca, _ea) = session();
        let (b, _cb, _eb) = session();
        assert_ne!(a.id(), b.id());
    }
}
