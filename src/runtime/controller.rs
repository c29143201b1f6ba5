//! Selector controller: one reactor thread driving a private connection set.
//!
//! Readiness-based model: the controller thread blocks in `Poll::poll`,
//! then performs non-blocking reads and writes for each ready connection.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Ownership
//!
//! Only the controller thread touches the poll registry and its connections.
//! Other threads talk to it through a command queue (registration, sends,
//! closes, shutdown) followed by a `Waker` nudge, so a registration made while
//! the thread is blocked is picked up immediately. The connection count is the
//! only state shared across threads and is kept in an atomic.
//!
//! ## Fairness
//!
//! A readable event reads at most `read_budget` chunks. A connection that
//! still has bytes waiting is carried over to the next loop turn, and the
//! poll does not block while any are carried, since mio will not report the
//! same edge again. A connection whose peer is not draining replies stops
//! being read once `write_high_water` bytes are queued for it.
//!
//! ## Lifecycle
//!
//! `Created → Running → Stopping → Stopped`. A stopped controller is never
//! restarted.

use super::connection::{Connection, ConnectionId, ReadOutcome};
use super::handler::MessageHandler;
use crate::codec::Codec;
use crate::error::{ConnectionError, PoolError};
use crate::frame::DEFAULT_MAX_FRAME_SIZE;
use crossbeam::channel::{self, Receiver, Sender};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Shared handle to a controller.
pub type ControllerHandle = Arc<SelectorController>;

/// Lifecycle state of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControllerState {
    /// Allocated, no poll or thread yet.
    Created = 0,
    /// Thread running and accepting registrations.
    Running = 1,
    /// Shutdown requested, connections being closed.
    Stopping = 2,
    /// Thread exited. Terminal.
    Stopped = 3,
}

impl ControllerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ControllerState::Created,
            1 => ControllerState::Running,
            2 => ControllerState::Stopping,
            _ => ControllerState::Stopped,
        }
    }
}

/// Per-controller tuning.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Readiness events fetched per poll.
    pub events_capacity: usize,
    /// Largest encoded or uncompressed payload accepted in one frame.
    pub max_frame_size: usize,
    /// Bytes requested from the channel per read call.
    pub read_chunk: usize,
    /// Read calls allowed per connection per loop turn.
    pub read_budget: usize,
    /// Queued outbound bytes above which a connection is no longer read.
    pub write_high_water: usize,
}

impl ControllerSettings {
    /// Reject settings a controller cannot run with.
    pub fn validate(&self) -> Result<(), PoolError> {
        let fields = [
            ("events_capacity", self.events_capacity),
            ("max_frame_size", self.max_frame_size),
            ("read_chunk", self.read_chunk),
            ("read_budget", self.read_budget),
            ("write_high_water", self.write_high_water),
        ];
        match fields.into_iter().find(|&(_, value)| value == 0) {
            Some((name, value)) => Err(PoolError::InvalidSetting { name, value }),
            None => Ok(()),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            events_capacity: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_chunk: 16 * 1024,
            read_budget: 16,
            write_high_water: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Work handed to the controller thread.
enum Command {
    Register {
        id: ConnectionId,
        stream: TcpStream,
        codec: Arc<dyn Codec>,
    },
    Send {
        id: ConnectionId,
        payload: Vec<u8>,
    },
    Close {
        id: ConnectionId,
    },
    Shutdown,
}

/// Sending side of a controller's command queue.
#[derive(Clone)]
struct Mailbox {
    controller: usize,
    commands: Sender<Command>,
    waker: Arc<Waker>,
}

impl Mailbox {
    fn post(&self, command: Command) -> Result<(), PoolError> {
        self.commands
            .send(command)
            .map_err(|_| PoolError::InvalidState {
                controller: self.controller,
                state: ControllerState::Stopped,
            })?;
        self.waker.wake()?;
        Ok(())
    }
}

/// Handle to a registered connection, usable from any thread.
///
/// Operations are queued to the owning controller; they take effect on its
/// thread in the order they were posted.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    mailbox: Mailbox,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Id of the controller that owns this connection.
    pub fn controller_id(&self) -> usize {
        self.mailbox.controller
    }

    /// Queue an outbound message. It is compressed on the controller thread.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), PoolError> {
        self.mailbox.post(Command::Send {
            id: self.id,
            payload,
        })
    }

    /// Request the connection be closed. Closing twice is harmless.
    pub fn close(&self) -> Result<(), PoolError> {
        self.mailbox.post(Command::Close { id: self.id })
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("controller", &self.mailbox.controller)
            .finish()
    }
}

/// A reactor owning one poll instance and the connections assigned to it.
pub struct SelectorController {
    id: usize,
    state: AtomicU8,
    connection_count: AtomicUsize,
    next_conn_id: AtomicU64,
    settings: ControllerSettings,
    handler: Arc<dyn MessageHandler>,
    commands: Sender<Command>,
    inbox: Mutex<Option<Receiver<Command>>>,
    waker: OnceLock<Arc<Waker>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SelectorController {
    /// Allocate a controller in the `Created` state.
    pub fn new(
        id: usize,
        settings: ControllerSettings,
        handler: Arc<dyn MessageHandler>,
    ) -> ControllerHandle {
        let (commands, inbox) = channel::unbounded();
        Arc::new(Self {
            id,
            state: AtomicU8::new(ControllerState::Created as u8),
            connection_count: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(0),
            settings,
            handler,
            commands,
            inbox: Mutex::new(Some(inbox)),
            waker: OnceLock::new(),
            thread: Mutex::new(None),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> ControllerState {
        ControllerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Connections owned or queued for registration. Load signal for assigners.
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Acquire)
    }

    /// Create the poll, spawn the controller thread and enter `Running`.
    pub fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        self.settings.validate()?;
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        // Set before entering Running so a concurrent shutdown can always wake the thread
        let _ = self.waker.set(Arc::clone(&waker));
        self.transition(ControllerState::Created, ControllerState::Running)?;

        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let inbox = match inbox {
            Some(inbox) => inbox,
            None => {
                self.state
                    .store(ControllerState::Stopped as u8, Ordering::Release);
                return Err(self.invalid_state());
            }
        };

        let reactor = Reactor {
            controller: Arc::clone(self),
            poll,
            inbox,
            connections: HashMap::new(),
            carried_reads: Vec::new(),
        };
        let spawned = thread::Builder::new()
            .name(format!("controller-{}", self.id))
            .spawn(move || reactor.run());

        match spawned {
            Ok(handle) => {
                *self
                    .thread
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.state
                    .store(ControllerState::Stopped as u8, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Queue `stream` for registration on the controller thread.
    ///
    /// Safe to call from any thread. The connection count rises immediately so
    /// load-based assigners see registrations still in flight.
    pub fn register(
        &self,
        stream: TcpStream,
        codec: Arc<dyn Codec>,
    ) -> Result<ConnectionHandle, PoolError> {
        let mailbox = self.mailbox()?;
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

        self.connection_count.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = mailbox.post(Command::Register { id, stream, codec }) {
            self.connection_count.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }

        Ok(ConnectionHandle { id, mailbox })
    }

    /// Close every connection, stop the thread and wait for it to exit.
    ///
    /// Idempotent. When called from the controller's own thread (e.g. by a
    /// handler) the thread is signalled but not joined.
    pub fn shutdown(&self) {
        match self.transition(ControllerState::Running, ControllerState::Stopping) {
            Ok(()) => {
                if let Ok(mailbox) = self.mailbox_unchecked() {
                    if let Err(e) = mailbox.post(Command::Shutdown) {
                        warn!(controller = self.id, error = %e, "Failed to signal shutdown");
                    }
                }
            }
            Err(_) => {
                if self
                    .transition(ControllerState::Created, ControllerState::Stopped)
                    .is_ok()
                {
                    info!(controller = self.id, "Controller discarded before start");
                    return;
                }
            }
        }

        let handle = {
            let mut thread = self
                .thread
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match thread.as_ref() {
                Some(h) if h.thread().id() == thread::current().id() => None,
                _ => thread.take(),
            }
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(controller = self.id, "Controller thread panicked");
                self.state
                    .store(ControllerState::Stopped as u8, Ordering::Release);
            }
        }
    }

    fn transition(&self, from: ControllerState, to: ControllerState) -> Result<(), PoolError> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| self.invalid_state())
    }

    fn invalid_state(&self) -> PoolError {
        PoolError::InvalidState {
            controller: self.id,
            state: self.state(),
        }
    }

    fn mailbox(&self) -> Result<Mailbox, PoolError> {
        if self.state() != ControllerState::Running {
            return Err(self.invalid_state());
        }
        self.mailbox_unchecked()
    }

    fn mailbox_unchecked(&self) -> Result<Mailbox, PoolError> {
        let waker = self.waker.get().ok_or_else(|| self.invalid_state())?;
        Ok(Mailbox {
            controller: self.id,
            commands: self.commands.clone(),
            waker: Arc::clone(waker),
        })
    }

    #[cfg(test)]
    pub(crate) fn add_load(&self, n: usize) {
        self.connection_count.fetch_add(n, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for SelectorController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorController")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// Connection plus the interest it is currently registered with.
struct Entry {
    conn: Connection<TcpStream>,
    interest: Interest,
    /// A readable edge was skipped because too many replies are queued.
    read_paused: bool,
}

impl Entry {
    /// Lift the read pause once queued replies drop below `high_water`.
    /// Returns `true` if the connection should be read again.
    fn resume_reading(&mut self, high_water: usize) -> bool {
        if self.read_paused && self.conn.pending_write_bytes() < high_water {
            self.read_paused = false;
            return true;
        }
        false
    }
}

/// What to do with a connection after driving it.
enum Disposition {
    Keep,
    /// Bytes may still be waiting; read again on the next loop turn.
    ReadAgain,
    Close,
}

/// State owned by the controller thread.
struct Reactor {
    controller: ControllerHandle,
    poll: Poll,
    inbox: Receiver<Command>,
    connections: HashMap<ConnectionId, Entry>,
    /// Connections to read on the next turn without waiting for an event.
    carried_reads: Vec<ConnectionId>,
}

impl Reactor {
    fn run(mut self) {
        let controller_id = self.controller.id;
        let mut events = Events::with_capacity(self.controller.settings.events_capacity);

        info!(controller = controller_id, "Controller started");

        loop {
            let timeout = if self.carried_reads.is_empty() {
                None
            } else {
                Some(Duration::ZERO)
            };
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(controller = controller_id, error = %e, "Poll failed");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {}
                    Token(token) => {
                        // Errors and hangups surface through read/write
                        let readable =
                            event.is_readable() || event.is_read_closed() || event.is_error();
                        let writable = event.is_writable() || event.is_write_closed();
                        self.on_ready(token as ConnectionId, readable, writable);
                    }
                }
            }

            let carried = std::mem::take(&mut self.carried_reads);
            for id in carried {
                // Already read again by an event this turn
                if !self.carried_reads.contains(&id) {
                    self.on_ready(id, true, false);
                }
            }

            if !self.drain_commands() {
                break;
            }
        }

        self.finish();
        info!(controller = controller_id, "Controller stopped");
    }

    /// Apply queued commands. Returns `false` once shutdown is requested.
    fn drain_commands(&mut self) -> bool {
        while let Ok(command) = self.inbox.try_recv() {
            match command {
                Command::Register { id, stream, codec } => self.add_connection(id, stream, codec),
                Command::Send { id, payload } => self.send_to(id, &payload),
                Command::Close { id } => self.close_connection(id),
                Command::Shutdown => return false,
            }
        }
        self.controller.state() == ControllerState::Running
    }

    fn add_connection(&mut self, id: ConnectionId, stream: TcpStream, codec: Arc<dyn Codec>) {
        let settings = &self.controller.settings;
        let peer = stream.peer_addr().ok();
        let mut conn = Connection::new(
            id,
            stream,
            codec,
            settings.max_frame_size,
            settings.read_chunk,
        );

        if let Err(e) =
            self.poll
                .registry()
                .register(conn.stream_mut(), Token(id as usize), Interest::READABLE)
        {
            warn!(controller = self.controller.id, conn_id = id, error = %e, "Registration failed");
            self.controller
                .connection_count
                .fetch_sub(1, Ordering::AcqRel);
            return;
        }

        debug!(
            controller = self.controller.id,
            conn_id = id,
            peer = ?peer,
            codec = %conn.codec_kind(),
            "Registered connection"
        );
        self.connections.insert(
            id,
            Entry {
                conn,
                interest: Interest::READABLE,
                read_paused: false,
            },
        );
    }

    fn on_ready(&mut self, id: ConnectionId, readable: bool, writable: bool) {
        // Tokens are never reused, so events for removed connections are dropped here
        if !self.connections.contains_key(&id) {
            return;
        }

        match self.drive(id, readable, writable) {
            Ok(Disposition::Keep) => {}
            Ok(Disposition::ReadAgain) => self.carry_read(id),
            Ok(Disposition::Close) => self.close_connection(id),
            Err(e) => {
                debug!(controller = self.controller.id, conn_id = id, error = %e, "Connection error");
                self.close_connection(id);
            }
        }
    }

    fn drive(
        &mut self,
        id: ConnectionId,
        readable: bool,
        writable: bool,
    ) -> Result<Disposition, ConnectionError> {
        let settings = &self.controller.settings;
        let entry = match self.connections.get_mut(&id) {
            Some(entry) => entry,
            None => return Ok(Disposition::Keep),
        };

        let mut outcome = ReadOutcome::default();
        if readable {
            if entry.conn.pending_write_bytes() >= settings.write_high_water {
                entry.read_paused = true;
            } else {
                outcome = entry.conn.read_ready(settings.read_budget)?;
                for payload in outcome.frames.drain(..) {
                    if let Some(reply) = self.controller.handler.on_message(id, payload) {
                        entry.conn.send(&reply)?;
                    }
                }
            }
        }

        if writable || entry.conn.has_pending_writes() {
            let flushed = entry.conn.write_ready();
            // A read failure wins over a failed flush of the replies before it
            if let Some(e) = outcome.error {
                return Err(e);
            }
            flushed?;
        } else if let Some(e) = outcome.error {
            return Err(e);
        }

        if outcome.eof {
            return Ok(Disposition::Close);
        }

        let read_again = entry.resume_reading(settings.write_high_water) || outcome.exhausted;
        Self::update_interest(self.poll.registry(), id, entry)?;
        if read_again {
            Ok(Disposition::ReadAgain)
        } else {
            Ok(Disposition::Keep)
        }
    }

    fn carry_read(&mut self, id: ConnectionId) {
        if !self.carried_reads.contains(&id) {
            self.carried_reads.push(id);
        }
    }

    fn send_to(&mut self, id: ConnectionId, payload: &[u8]) {
        if !self.connections.contains_key(&id) {
            debug!(controller = self.controller.id, conn_id = id, "Send to unknown connection");
            return;
        }
        match self.queue_and_flush(id, payload) {
            Ok(true) => self.carry_read(id),
            Ok(false) => {}
            Err(e) => {
                debug!(controller = self.controller.id, conn_id = id, error = %e, "Connection error");
                self.close_connection(id);
            }
        }
    }

    /// Returns `true` if a paused connection may be read again.
    fn queue_and_flush(&mut self, id: ConnectionId, payload: &[u8]) -> Result<bool, ConnectionError> {
        let high_water = self.controller.settings.write_high_water;
        let entry = match self.connections.get_mut(&id) {
            Some(entry) => entry,
            None => return Ok(false),
        };
        entry.conn.send(payload)?;
        entry.conn.write_ready()?;
        let read_again = entry.resume_reading(high_water);
        Self::update_interest(self.poll.registry(), id, entry)?;
        Ok(read_again)
    }

    /// Watch for writability only while bytes are queued.
    fn update_interest(registry: &Registry, id: ConnectionId, entry: &mut Entry) -> io::Result<()> {
        let wanted = if entry.conn.has_pending_writes() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if wanted != entry.interest {
            registry.reregister(entry.conn.stream_mut(), Token(id as usize), wanted)?;
            entry.interest = wanted;
        }
        Ok(())
    }

    fn close_connection(&mut self, id: ConnectionId) {
        if let Some(mut entry) = self.connections.remove(&id) {
            self.release(&mut entry);
            debug!(controller = self.controller.id, conn_id = id, "Connection closed");
        }
    }

    fn release(&mut self, entry: &mut Entry) {
        let _ = self.poll.registry().deregister(entry.conn.stream_mut());
        entry.conn.close();
        self.controller
            .connection_count
            .fetch_sub(1, Ordering::AcqRel);
        self.controller.handler.on_close(entry.conn.id());
    }

    /// Flush and close every connection, discard queued registrations.
    fn finish(&mut self) {
        self.controller
            .state
            .store(ControllerState::Stopping as u8, Ordering::Release);

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            if let Some(mut entry) = self.connections.remove(&id) {
                if entry.conn.has_pending_writes() {
                    entry.conn.flush_and_close();
                }
                self.release(&mut entry);
            }
        }

        while let Ok(command) = self.inbox.try_recv() {
            if let Command::Register { id, .. } = command {
                debug!(controller = self.controller.id, conn_id = id, "Dropping queued registration");
                self.controller
                    .connection_count
                    .fetch_sub(1, Ordering::AcqRel);
            }
        }

        self.controller
            .state
            .store(ControllerState::Stopped as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecKind, Decompressor, NullCodec};
    use crate::frame::{self, FrameHeader};
    use crate::runtime::handler::EchoHandler;
    use bytes::BytesMut;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpListener};
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    fn started(handler: Arc<dyn MessageHandler>) -> ControllerHandle {
        let controller = SelectorController::new(0, ControllerSettings::default(), handler);
        controller.start().unwrap();
        controller
    }

    /// Connected (client, server) pair over loopback.
    fn socket_pair() -> (std::net::TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, TcpStream::from_std(server))
    }

    fn write_frame(client: &mut std::net::TcpStream, payload: &[u8]) {
        let frame = frame::encode(&NullCodec, payload).unwrap();
        client.write_all(&frame).unwrap();
    }

    fn read_frame(client: &mut std::net::TcpStream) -> io::Result<Vec<u8>> {
        let mut header = [0u8; frame::HEADER_LEN];
        client.read_exact(&mut header)?;
        let header = FrameHeader::parse(&header).unwrap();
        let mut body = vec![0u8; header.encoded_len as usize];
        client.read_exact(&mut body)?;
        assert_eq!(header.encoded_len, header.uncompressed_len);
        Ok(body)
    }

    /// True once the peer has closed (EOF or reset).
    fn is_closed_by_peer(client: &mut std::net::TcpStream) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match client.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return false,
                Err(_) => return true,
            }
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn test_lifecycle_states() {
        let controller =
            SelectorController::new(3, ControllerSettings::default(), Arc::new(EchoHandler));
        assert_eq!(controller.state(), ControllerState::Created);

        controller.start().unwrap();
        assert_eq!(controller.state(), ControllerState::Running);
        assert!(controller.start().is_err());

        controller.shutdown();
        assert_eq!(controller.state(), ControllerState::Stopped);

        // Idempotent, and a stopped controller never restarts
        controller.shutdown();
        assert_eq!(controller.state(), ControllerState::Stopped);
        assert!(controller.start().is_err());
    }

    #[test]
    fn test_start_rejects_zero_events_capacity() {
        let settings = ControllerSettings {
            events_capacity: 0,
            ..Default::default()
        };
        let controller = SelectorController::new(0, settings, Arc::new(EchoHandler));

        assert!(matches!(
            controller.start(),
            Err(PoolError::InvalidSetting {
                name: "events_capacity",
                value: 0
            })
        ));
        assert_eq!(controller.state(), ControllerState::Created);
    }

    #[test]
    fn test_register_requires_running() {
        let controller =
            SelectorController::new(1, ControllerSettings::default(), Arc::new(EchoHandler));
        let (_client, server) = socket_pair();

        let err = controller.register(server, Arc::new(NullCodec)).unwrap_err();
        assert!(matches!(
            err,
            PoolError::InvalidState {
                controller: 1,
                state: ControllerState::Created
            }
        ));
        assert_eq!(controller.connection_count(), 0);
    }

    #[test]
    fn test_register_and_echo() {
        let controller = started(Arc::new(EchoHandler));
        let (mut client, server) = socket_pair();

        let handle = controller.register(server, Arc::new(NullCodec)).unwrap();
        assert_eq!(handle.controller_id(), 0);
        assert_eq!(controller.connection_count(), 1);

        write_frame(&mut client, b"hello reactor");
        assert_eq!(read_frame(&mut client).unwrap(), b"hello reactor");

        controller.shutdown();
    }

    #[test]
    fn test_frames_processed_in_receipt_order() {
        let controller = started(Arc::new(EchoHandler));
        let (mut client, server) = socket_pair();
        controller.register(server, Arc::new(NullCodec)).unwrap();

        let mut burst = Vec::new();
        for i in 0..50u32 {
            burst.extend_from_slice(&frame::encode(&NullCodec, &i.to_be_bytes()).unwrap());
        }
        client.write_all(&burst).unwrap();

        for i in 0..50u32 {
            assert_eq!(read_frame(&mut client).unwrap(), i.to_be_bytes());
        }

        controller.shutdown();
    }

    #[test]
    fn test_lz4_connection() {
        let controller = started(Arc::new(EchoHandler));
        let (mut client, server) = socket_pair();
        controller
            .register(server, CodecKind::Lz4.build())
            .unwrap();

        let codec = CodecKind::Lz4.build();
        let payload = b"abcabcabcabcabcabcabcabcabcabcabcabc".to_vec();
        client
            .write_all(&frame::encode(codec.as_ref(), &payload).unwrap())
            .unwrap();

        let mut header = [0u8; frame::HEADER_LEN];
        client.read_exact(&mut header).unwrap();
        let header = FrameHeader::parse(&header).unwrap();
        assert_eq!(header.uncompressed_len as usize, payload.len());
        let mut body = vec![0u8; header.encoded_len as usize];
        client.read_exact(&mut body).unwrap();

        let decoded = codec
            .decompress(&body, 0, body.len(), header.uncompressed_len as usize)
            .unwrap();
        assert_eq!(decoded, payload);

        controller.shutdown();
    }

    #[test]
    fn test_decode_failure_is_isolated() {
        let controller = started(Arc::new(EchoHandler));

        let mut healthy = Vec::new();
        for _ in 0..3 {
            let (client, server) = socket_pair();
            controller.register(server, Arc::new(NullCodec)).unwrap();
            healthy.push(client);
        }
        let (mut bad, server) = socket_pair();
        controller.register(server, Arc::new(NullCodec)).unwrap();
        assert!(wait_until(|| controller.connection_count() == 4));

        // Null codec frame whose lengths disagree
        let mut frame = BytesMut::new();
        FrameHeader {
            encoded_len: 3,
            uncompressed_len: 2,
        }
        .put(&mut frame);
        frame.extend_from_slice(b"abc");
        bad.write_all(&frame).unwrap();

        assert!(is_closed_by_peer(&mut bad));
        assert!(wait_until(|| controller.connection_count() == 3));

        for (i, client) in healthy.iter_mut().enumerate() {
            let msg = format!("still alive {i}");
            write_frame(client, msg.as_bytes());
            assert_eq!(read_frame(client).unwrap(), msg.as_bytes());
        }
        assert_eq!(controller.state(), ControllerState::Running);

        controller.shutdown();
    }

    #[test]
    fn test_channel_error_mid_write_closes_only_that_connection() {
        let big = Arc::new(vec![0xC3u8; 32 * 1024 * 1024]);
        let reply = Arc::clone(&big);
        let handler = move |_conn: ConnectionId, payload: Vec<u8>| -> Option<Vec<u8>> {
            if payload == b"big" {
                Some(reply.to_vec())
            } else {
                Some(payload)
            }
        };
        let controller = started(Arc::new(handler));

        let (mut sibling, server) = socket_pair();
        controller.register(server, Arc::new(NullCodec)).unwrap();
        let (mut stalled, server) = socket_pair();
        controller.register(server, Arc::new(NullCodec)).unwrap();
        assert!(wait_until(|| controller.connection_count() == 2));

        // Never read the reply, so the controller is left holding a partial write
        write_frame(&mut stalled, b"big");
        thread::sleep(Duration::from_millis(200));

        // Abortive close sends RST to the controller mid-write
        socket2::SockRef::from(&stalled)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(stalled);

        assert!(wait_until(|| controller.connection_count() == 1));

        write_frame(&mut sibling, b"unaffected");
        assert_eq!(read_frame(&mut sibling).unwrap(), b"unaffected");
        assert_eq!(controller.connection_count(), 1);

        controller.shutdown();
    }

    #[test]
    fn test_flooding_peer_does_not_starve_sibling() {
        let controller = started(Arc::new(EchoHandler));
        let (flood, server) = socket_pair();
        controller.register(server, Arc::new(NullCodec)).unwrap();
        let (mut sibling, server) = socket_pair();
        controller.register(server, Arc::new(NullCodec)).unwrap();
        assert!(wait_until(|| controller.connection_count() == 2));

        // Drain the flood's echoes so its replies never pause it
        flood.set_read_timeout(None).unwrap();
        let mut drain = flood.try_clone().unwrap();
        let reader = thread::spawn(move || {
            let mut buf = vec![0u8; 64 * 1024];
            while matches!(drain.read(&mut buf), Ok(n) if n > 0) {}
        });

        let stop = Arc::new(AtomicBool::new(false));
        let mut writer = flood.try_clone().unwrap();
        let flooder = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut burst = Vec::new();
                for _ in 0..4096 {
                    burst.extend_from_slice(&frame::encode(&NullCodec, b"x").unwrap());
                }
                while !stop.load(Ordering::Relaxed) {
                    if writer.write_all(&burst).is_err() {
                        break;
                    }
                }
            })
        };
        thread::sleep(Duration::from_millis(100));

        for i in 0..20 {
            let msg = format!("ping {i}");
            let sent = Instant::now();
            write_frame(&mut sibling, msg.as_bytes());
            assert_eq!(read_frame(&mut sibling).unwrap(), msg.as_bytes());
            let latency = sent.elapsed();
            assert!(latency < Duration::from_secs(2), "echo {i} took {latency:?}");
        }

        stop.store(true, Ordering::Relaxed);
        let _ = flood.shutdown(Shutdown::Both);
        flooder.join().unwrap();
        reader.join().unwrap();
        controller.shutdown();
    }

    #[test]
    fn test_paused_connection_resumes_after_peer_drains() {
        let settings = ControllerSettings {
            write_high_water: 64 * 1024,
            ..Default::default()
        };
        let controller = SelectorController::new(0, settings, Arc::new(EchoHandler));
        controller.start().unwrap();
        let (mut client, server) = socket_pair();
        controller.register(server, Arc::new(NullCodec)).unwrap();

        const FRAMES: usize = 4096;
        let payload = vec![0x11u8; 1024];
        let mut writer = client.try_clone().unwrap();
        let sender = {
            let payload = payload.clone();
            thread::spawn(move || {
                for _ in 0..FRAMES {
                    write_frame(&mut writer, &payload);
                }
            })
        };

        // Replies pile up past the high-water mark before anything is read
        thread::sleep(Duration::from_millis(200));

        for _ in 0..FRAMES {
            assert_eq!(read_frame(&mut client).unwrap(), payload);
        }
        sender.join().unwrap();
        assert_eq!(controller.connection_count(), 1);

        controller.shutdown();
    }

    #[test]
    fn test_send_and_close_through_handle() {
        let controller = started(Arc::new(|_conn: ConnectionId, _payload: Vec<u8>| None));
        let (mut client, server) = socket_pair();
        let handle = controller.register(server, Arc::new(NullCodec)).unwrap();

        handle.send(b"pushed".to_vec()).unwrap();
        assert_eq!(read_frame(&mut client).unwrap(), b"pushed");

        handle.close().unwrap();
        handle.close().unwrap();
        assert!(is_closed_by_peer(&mut client));
        assert!(wait_until(|| controller.connection_count() == 0));

        controller.shutdown();
        assert!(handle.send(b"late".to_vec()).is_err());
    }

    #[test]
    fn test_peer_close_removes_connection() {
        let controller = started(Arc::new(EchoHandler));
        let (client, server) = socket_pair();
        controller.register(server, Arc::new(NullCodec)).unwrap();
        assert!(wait_until(|| controller.connection_count() == 1));

        client.shutdown(Shutdown::Both).unwrap();
        assert!(wait_until(|| controller.connection_count() == 0));

        controller.shutdown();
    }

    #[test]
    fn test_shutdown_closes_connections() {
        let closed = Arc::new(AtomicUsize::new(0));

        struct CountingHandler(Arc<AtomicUsize>);
        impl MessageHandler for CountingHandler {
            fn on_message(&self, _conn: ConnectionId, payload: Vec<u8>) -> Option<Vec<u8>> {
                Some(payload)
            }
            fn on_close(&self, _conn: ConnectionId) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let controller = started(Arc::new(CountingHandler(Arc::clone(&closed))));
        let mut clients = Vec::new();
        for _ in 0..2 {
            let (client, server) = socket_pair();
            controller.register(server, Arc::new(NullCodec)).unwrap();
            clients.push(client);
        }
        assert!(wait_until(|| controller.connection_count() == 2));

        controller.shutdown();

        assert_eq!(controller.state(), ControllerState::Stopped);
        assert_eq!(controller.connection_count(), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        for client in clients.iter_mut() {
            assert!(is_closed_by_peer(client));
        }

        let (_client, server) = socket_pair();
        assert!(controller.register(server, Arc::new(NullCodec)).is_err());
    }
}
