//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Scheduling
//!
//! Readable connections are not serviced straight from the event batch.
//! They are queued in a backlog, and every loop turn services each queued
//! connection once: drain its socket into the read buffer, take exactly one
//! protocol unit off it, and act on that unit. A connection that still has
//! buffered input goes to the back of the backlog for the next turn, so one
//! chatty client cannot starve the rest. While the backlog is non-empty the
//! poll does not block.
//!
//! Forwarded frames are written without blocking. Whatever the transport
//! does not accept stays in the recipient's output buffer and is flushed on
//! writable readiness.

use crate::config::Config;
use crate::runtime::connection::{Connection, ConnectionRegistry, ReadStatus, Registered};
use crate::runtime::protocol::{Frame, ParseResult};
use crate::runtime::router::{self, RouteOutcome};
use crate::runtime::token::{ConnId, LISTENER, WAKER};
use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Events fetched per poll call.
const EVENT_CAPACITY: usize = 256;

/// Readiness of one token, copied out of the event batch.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
}

/// Stops a running [`Server`] from another thread.
#[derive(Clone)]
#[cfg_attr(not(test), allow(dead_code))]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

#[cfg_attr(not(test), allow(dead_code))]
impl ShutdownHandle {
    /// Ask the loop to stop; `run` returns after the current turn.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake event loop");
        }
    }
}

/// Single-threaded relay server.
pub struct Server {
    poll: Poll,
    events: Events,
    ready: Vec<Readiness>,
    listener: TcpListener,
    registry: ConnectionRegistry<TcpStream>,
    backlog: VecDeque<ConnId>,
    accept_retry: bool,
    config: Config,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    last_stats: Instant,
}

impl Server {
    /// Bind the listening socket and set up the poller.
    pub fn bind(config: Config) -> io::Result<Self> {
        let addr = config
            .listen
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no address for '{}'", config.listen),
                )
            })?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr, config.backlog)?);
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            ready: Vec::with_capacity(EVENT_CAPACITY),
            listener,
            registry: ConnectionRegistry::new(config.max_connections),
            backlog: VecDeque::new(),
            accept_retry: false,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
            last_stats: Instant::now(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Serve until shut down. Only poll failures are returned as errors.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr()?,
            max_connections = self.registry.capacity(),
            max_frame_size = self.config.max_frame_size,
            name_policy = ?self.config.name_policy,
            "Relay listening"
        );

        while !self.shutdown.load(Ordering::Acquire) {
            self.turn()?;
        }

        info!(connections = self.registry.len(), "Relay stopped");
        Ok(())
    }

    fn turn(&mut self) -> io::Result<()> {
        let timeout = if self.backlog.is_empty() {
            self.config.poll_timeout
        } else {
            Duration::ZERO
        };

        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        self.ready.clear();
        for event in self.events.iter() {
            self.ready.push(Readiness {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable(),
            });
        }

        // The listener will not signal again for connections that were
        // already queued when accept last failed.
        if std::mem::take(&mut self.accept_retry) {
            self.accept();
        }

        let ready = std::mem::take(&mut self.ready);
        for readiness in &ready {
            match readiness.token {
                LISTENER => self.accept(),
                WAKER => {}
                token => {
                    let Some(id) = ConnId::from_token(token) else {
                        continue;
                    };
                    if readiness.writable {
                        self.on_writable(id);
                    }
                    if readiness.readable {
                        self.schedule(id);
                    }
                }
            }
        }
        self.ready = ready;

        let round = self.backlog.len();
        for _ in 0..round {
            let Some(id) = self.backlog.pop_front() else {
                break;
            };
            self.service(id);
        }

        self.housekeeping();
        Ok(())
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let Some(id) = self.registry.insert(Connection::new(stream)) else {
                        warn!(peer = %peer_addr, "Connection limit reached");
                        continue;
                    };

                    let registered = match self.registry.get_mut(id) {
                        Some(conn) => self.poll.registry().register(
                            conn.stream_mut(),
                            id.token(),
                            Interest::READABLE,
                        ),
                        None => continue,
                    };
                    if let Err(e) = registered {
                        error!(peer = %peer_addr, error = %e, "Failed to register connection");
                        self.registry.remove(id);
                        continue;
                    }

                    debug!(conn_id = %id, peer = %peer_addr, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    self.accept_retry = true;
                    break;
                }
            }
        }
    }

    /// Queue a connection for the next service round, at most once.
    fn schedule(&mut self, id: ConnId) {
        if let Some(conn) = self.registry.get_mut(id) {
            if !conn.scheduled {
                conn.scheduled = true;
                self.backlog.push_back(id);
            }
        }
    }

    /// Read available input and handle at most one protocol unit.
    fn service(&mut self, id: ConnId) {
        let max_frame_size = self.config.max_frame_size;
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        conn.scheduled = false;

        let status = match conn.fill(max_frame_size) {
            Ok(status) => status,
            Err(e) => {
                debug!(conn_id = %id, error = %e, "Read error");
                self.teardown(id, "read error");
                return;
            }
        };

        let result = conn.next_frame(max_frame_size);
        let more_input = status == ReadStatus::Full || conn.buffered() > 0;
        let peer_closed = conn.peer_closed();

        match result {
            ParseResult::Complete(frame) => {
                self.handle_frame(id, frame);
                if more_input || peer_closed {
                    self.schedule(id);
                }
            }
            ParseResult::Incomplete if peer_closed => self.teardown(id, "peer closed"),
            ParseResult::Incomplete if status == ReadStatus::Full => {
                self.teardown(id, "frame too large")
            }
            ParseResult::Incomplete => {}
            ParseResult::Error(e) => {
                warn!(conn_id = %id, error = %e, "Protocol error");
                self.teardown(id, "protocol error");
            }
        }
    }

    fn handle_frame(&mut self, id: ConnId, frame: Frame) {
        match frame {
            Frame::Register { name } => self.register(id, name),
            Frame::Message { destination, body } => {
                match router::route(
                    &mut self.registry,
                    id,
                    &destination,
                    &body,
                    self.config.max_pending_output,
                ) {
                    RouteOutcome::Delivered(dest) | RouteOutcome::Queued(dest) => {
                        self.update_interest(dest)
                    }
                    RouteOutcome::Dropped => {}
                    RouteOutcome::Failed(dest) => self.teardown(dest, "forward failed"),
                }
            }
            Frame::Disconnect => self.teardown(id, "client quit"),
        }
    }

    fn register(&mut self, id: ConnId, name: Bytes) {
        let shown = String::from_utf8_lossy(&name).into_owned();
        match self.registry.register(id, name, self.config.name_policy) {
            Ok(Registered::Bound) => {
                info!(conn_id = %id, name = %shown, "Registered");
            }
            Ok(Registered::Replaced { previous }) => {
                info!(conn_id = %id, name = %shown, previous = %previous, "Registered, replacing previous holder");
                self.teardown(previous, "name taken over");
            }
            Err(e) => {
                warn!(conn_id = %id, name = %shown, error = %e, "Registration rejected");
                self.teardown(id, "registration rejected");
            }
        }
    }

    /// Track writable interest only while output is pending.
    fn update_interest(&mut self, id: ConnId) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        let want_write = conn.pending_output() > 0;
        if want_write == conn.write_interest {
            return;
        }

        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        match self
            .poll
            .registry()
            .reregister(conn.stream_mut(), id.token(), interest)
        {
            Ok(()) => conn.write_interest = want_write,
            Err(e) => {
                warn!(conn_id = %id, error = %e, "Failed to update interest");
                self.teardown(id, "reregister failed");
            }
        }
    }

    fn on_writable(&mut self, id: ConnId) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        match conn.flush() {
            Ok(_) => self.update_interest(id),
            Err(e) => {
                debug!(conn_id = %id, error = %e, "Write error");
                self.teardown(id, "write failed");
            }
        }
    }

    /// Remove a connection from the poller and the registry, closing it.
    ///
    /// Calling this for an already removed connection does nothing.
    fn teardown(&mut self, id: ConnId, reason: &str) {
        let Some(mut conn) = self.registry.remove(id) else {
            return;
        };
        // The slot may be reused by the next accept; a stale entry would
        // service the new connection twice in one round.
        self.backlog.retain(|queued| *queued != id);
        if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
            trace!(conn_id = %id, error = %e, "Deregister failed");
        }

        let name = conn.name().map(|n| String::from_utf8_lossy(n).into_owned());
        debug!(conn_id = %id, name = ?name, state = ?conn.state(), reason, "Connection closed");
    }

    fn housekeeping(&mut self) {
        if self.config.stats_interval.is_zero()
            || self.last_stats.elapsed() < self.config.stats_interval
        {
            return;
        }
        self.last_stats = Instant::now();

        let backlogged = self
            .registry
            .iter()
            .filter(|(_, conn)| conn.pending_output() > 0)
            .count();
        info!(
            connections = self.registry.len(),
            registered = self.registry.registered(),
            backlogged,
            "Relay stats"
        );
    }
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
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
    socket.listen(backlog)?;

    Ok(socket.into())
}
