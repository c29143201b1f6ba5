//! Acceptor thread feeding the controller pool.
//!
//! The acceptor owns the listening socket and its own poll. It never touches
//! a controller's poll; every accepted stream is handed to
//! `ControllerPool::accept_channel`, which queues it on the chosen controller.

use crate::runtime::ControllerPool;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Pause after an accept failure such as running out of descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Listening socket plus the thread accepting on it.
pub struct Acceptor {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
}

impl Acceptor {
    /// Bind `addr` and start accepting into `pool`.
    pub fn spawn(addr: SocketAddr, pool: Arc<ControllerPool>) -> io::Result<Self> {
        let listener = create_listener(addr)?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("acceptor".to_string())
                .spawn(move || {
                    if let Err(e) = accept_loop(poll, listener, &pool, &stop) {
                        error!(error = %e, "Acceptor failed");
                    }
                })?
        };

        info!(addr = %local_addr, "Acceptor listening");

        Ok(Self {
            local_addr,
            stop,
            waker,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Block until the acceptor thread exits.
    pub fn join(mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Stop accepting and wait for the thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake acceptor");
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}

fn accept_loop(
    mut poll: Poll,
    mut listener: TcpListener,
    pool: &ControllerPool,
    stop: &AtomicBool,
) -> io::Result<()> {
    let mut events = Events::with_capacity(16);

    while !stop.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                accept_connections(poll.registry(), &mut listener, pool);
            }
        }
    }

    info!("Acceptor stopped");
    Ok(())
}

/// Accept until the backlog is empty.
///
/// The listener is edge-triggered, so bailing out on an error would strand
/// whatever is still queued. It is re-armed instead, which reports the
/// remaining backlog on the next poll.
fn accept_connections(registry: &Registry, listener: &mut TcpListener, pool: &ControllerPool) {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                }
                // On failure the stream is dropped, which closes it
                if let Err(e) = pool.accept_channel(stream) {
                    warn!(peer = %peer_addr, error = %e, "Rejecting connection");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Accept error: {}", e);
                thread::sleep(ACCEPT_ERROR_BACKOFF);
                if let Err(e) = rearm(registry, listener) {
                    error!(error = %e, "Failed to re-arm listener");
                }
                break;
            }
        }
    }
}

fn rearm(registry: &Registry, listener: &mut TcpListener) -> io::Result<()> {
    registry.reregister(listener, LISTENER_TOKEN, Interest::READABLE)
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
