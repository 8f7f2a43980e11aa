//! Connection state and the connection registry.
//!
//! Each connection owns its socket, its inbound and outbound byte buffers,
//! and the parse state of the relay protocol. The registry owns every live
//! connection and indexes registered ones by user name.

use crate::config::NamePolicy;
use crate::runtime::protocol::{self, ParseResult, ParseState};
use crate::runtime::token::ConnId;
use bytes::{Buf, Bytes, BytesMut};
use slab::Slab;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};

/// Bytes requested from the socket per read call.
const READ_CHUNK: usize = 4096;

/// Outcome of draining readable bytes from a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The socket has nothing more to give right now.
    Drained,
    /// The read buffer hit its limit; the socket may hold more.
    Full,
    /// The peer closed its side of the stream.
    Closed,
}

/// Outcome of flushing pending output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Every queued byte was accepted by the transport.
    Done,
    /// The transport is full; the rest waits for writable readiness.
    Pending,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    name: Option<Bytes>,
    state: ParseState,
    read_buf: BytesMut,
    write_buf: BytesMut,
    peer_closed: bool,
    /// Queued in the event loop's backlog.
    pub(crate) scheduled: bool,
    /// Registered for writable readiness.
    pub(crate) write_interest: bool,
}

impl<S: Read + Write> Connection<S> {
    /// Create an anonymous connection awaiting registration.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            name: None,
            state: ParseState::Unregistered,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            peer_closed: false,
            scheduled: false,
            write_interest: false,
        }
    }

    /// Registered user name, if any.
    pub fn name(&self) -> Option<&Bytes> {
        self.name.as_ref()
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Whether the peer has closed its side.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Bytes received but not yet consumed by the parser.
    pub fn buffered(&self) -> usize {
        self.read_buf.len()
    }

    /// Bytes queued for the peer but not yet written.
    pub fn pending_output(&self) -> usize {
        self.write_buf.len()
    }

    /// Read whatever the socket has, up to `limit` buffered bytes.
    pub fn fill(&mut self, limit: usize) -> io::Result<ReadStatus> {
        if self.peer_closed {
            return Ok(ReadStatus::Closed);
        }

        loop {
            let filled = self.read_buf.len();
            if filled >= limit {
                return Ok(ReadStatus::Full);
            }

            let want = (limit - filled).min(READ_CHUNK);
            self.read_buf.resize(filled + want, 0);

            match self.stream.read(&mut self.read_buf[filled..]) {
                Ok(0) => {
                    self.read_buf.truncate(filled);
                    self.peer_closed = true;
                    return Ok(ReadStatus::Closed);
                }
                Ok(n) => self.read_buf.truncate(filled + n),
                Err(e) => {
                    self.read_buf.truncate(filled);
                    match e.kind() {
                        io::ErrorKind::WouldBlock => return Ok(ReadStatus::Drained),
                        io::ErrorKind::Interrupted => continue,
                        _ => return Err(e),
                    }
                }
            }
        }
    }

    /// Take at most one protocol unit off the read buffer.
    pub fn next_frame(&mut self, max_frame_size: usize) -> ParseResult {
        protocol::parse(self.state, &mut self.read_buf, max_frame_size)
    }

    /// Append an encoded frame to the output buffer.
    pub fn queue_delivery(&mut self, sender: &[u8], body: &[u8]) {
        protocol::encode_delivery(sender, body, &mut self.write_buf);
    }

    /// Write as much pending output as the transport accepts.
    ///
    /// A short write leaves the remainder queued; it is never reported as
    /// done.
    pub fn flush(&mut self) -> io::Result<FlushStatus> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.write_buf.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushStatus::Pending)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(FlushStatus::Done)
    }
}

/// Reasons a registration is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// Another live connection holds the name.
    NameTaken { holder: ConnId },
    /// The connection already completed registration.
    AlreadyRegistered,
    /// The connection is not in the registry.
    UnknownConnection,
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationError::NameTaken { holder } => {
                write!(f, "name already held by connection {holder}")
            }
            RegistrationError::AlreadyRegistered => write!(f, "connection already registered"),
            RegistrationError::UnknownConnection => write!(f, "unknown connection"),
        }
    }
}

impl std::error::Error for RegistrationError {}

/// Successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registered {
    /// The name was free.
    Bound,
    /// The name was taken over from `previous`, which must be torn down.
    Replaced { previous: ConnId },
}

/// Registry of live connections.
///
/// The slab is the owner; the name map only points into it. A name maps to
/// a connection exactly while that connection is live and registered under
/// that name.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    names: HashMap<Bytes, ConnId>,
    max_connections: usize,
}

impl<S: Read + Write> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            names: HashMap::new(),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection<S>) -> Option<ConnId> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(ConnId::new(self.connections.insert(conn)))
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection<S>> {
        self.connections.get(id.index())
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id.index())
    }

    /// Connection currently registered as `name`.
    pub fn lookup(&self, name: &[u8]) -> Option<ConnId> {
        self.names.get(name).copied()
    }

    /// Bind `name` to connection `id` and move it to the ready state.
    pub fn register(
        &mut self,
        id: ConnId,
        name: Bytes,
        policy: NamePolicy,
    ) -> Result<Registered, RegistrationError> {
        let conn = self
            .connections
            .get(id.index())
            .ok_or(RegistrationError::UnknownConnection)?;
        if conn.name.is_some() {
            return Err(RegistrationError::AlreadyRegistered);
        }

        let outcome = match self.names.get(&name).copied() {
            None => Registered::Bound,
            Some(holder) => match policy {
                NamePolicy::Reject => return Err(RegistrationError::NameTaken { holder }),
                NamePolicy::Replace => Registered::Replaced { previous: holder },
            },
        };

        if let Registered::Replaced { previous } = outcome {
            // The previous holder keeps running until torn down but no
            // longer answers to the name.
            if let Some(prev) = self.connections.get_mut(previous.index()) {
                prev.name = None;
            }
        }

        self.names.insert(name.clone(), id);
        if let Some(conn) = self.connections.get_mut(id.index()) {
            conn.name = Some(name);
            conn.state = ParseState::Ready;
        }
        Ok(outcome)
    }

    /// Remove a connection and its name binding.
    ///
    /// Returns `None` if the connection was already removed.
    pub fn remove(&mut self, id: ConnId) -> Option<Connection<S>> {
        let conn = self.connections.try_remove(id.index())?;
        if let Some(name) = &conn.name {
            if self.names.get(name) == Some(&id) {
                self.names.remove(name);
            }
        }
        Some(conn)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Number of registered names.
    pub fn registered(&self) -> usize {
        self.names.len()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Iterate over all live connections.
    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &Connection<S>)> {
        self.connections.iter().map(|(idx, conn)| (ConnId::new(idx), conn))
    }

    /// Iterate over all name bindings.
    #[cfg(test)]
    pub fn names(&self) -> impl Iterator<Item = (&Bytes, ConnId)> {
        self.names.iter().map(|(name, id)| (name, *id))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};

    /// In-memory stream with scripted reads and a bounded write window.
    #[derive(Debug, Default)]
    pub struct MockStream {
        /// Chunks returned by successive reads; an empty chunk means EOF.
        pub reads: VecDeque<Vec<u8>>,
        /// Everything the connection wrote.
        pub written: Vec<u8>,
        /// Bytes accepted before writes return `WouldBlock`.
        pub write_budget: Option<usize>,
        /// Fail every write with this error kind.
        pub write_error: Option<io::ErrorKind>,
        /// Fail the next read with this error kind.
        pub read_error: Option<io::ErrorKind>,
    }

    impl MockStream {
        pub fn with_reads(chunks: &[&[u8]]) -> Self {
            Self {
                reads: chunks.iter().map(|c| c.to_vec()).collect(),
                ..Self::default()
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(kind) = self.read_error.take() {
                return Err(kind.into());
            }
            match self.reads.pop_front() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.reads.push_front(chunk[n..].to_vec());
                    }
                    Ok(n)
                }
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(kind) = self.write_error {
                return Err(kind.into());
            }
            let n = match self.write_budget {
                Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
                Some(budget) => {
                    let n = budget.min(buf.len());
                    self.write_budget = Some(budget - n);
                    n
                }
                None => buf.len(),
            };
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockStream;
    use super::*;
    use crate::runtime::protocol::Frame;

    fn registry(cap: usize) -> ConnectionRegistry<MockStream> {
        ConnectionRegistry::new(cap)
    }

    fn add(reg: &mut ConnectionRegistry<MockStream>) -> ConnId {
        reg.insert(Connection::new(MockStream::default())).unwrap()
    }

    /// Every name points at a live connection registered under that name.
    fn assert_consistent(reg: &ConnectionRegistry<MockStream>) {
        for (name, id) in reg.names() {
            let conn = reg.get(id).expect("dangling name binding");
            assert_eq!(conn.name(), Some(name));
        }
        let named = reg.iter().filter(|(_, c)| c.name().is_some()).count();
        assert_eq!(named, reg.registered());
    }

    #[test]
    fn test_fill_until_would_block() {
        let mut conn = Connection::new(MockStream::with_reads(&[b"ali", b"ce\n"]));
        assert_eq!(conn.fill(1024).unwrap(), ReadStatus::Drained);
        assert_eq!(conn.buffered(), 6);
        assert!(matches!(
            conn.next_frame(1024),
            ParseResult::Complete(Frame::Register { .. })
        ));
        assert_eq!(conn.buffered(), 0);
    }

    #[test]
    fn test_fill_respects_limit() {
        let mut conn = Connection::new(MockStream::with_reads(&[&[b'a'; 100]]));
        assert_eq!(conn.fill(40).unwrap(), ReadStatus::Full);
        assert_eq!(conn.buffered(), 40);
    }

    #[test]
    fn test_fill_reports_close() {
        let mut conn = Connection::new(MockStream::with_reads(&[b"bob", b""]));
        assert_eq!(conn.fill(1024).unwrap(), ReadStatus::Closed);
        assert!(conn.peer_closed());
        assert_eq!(conn.buffered(), 3);
        assert_eq!(conn.fill(1024).unwrap(), ReadStatus::Closed);
    }

    #[test]
    fn test_fill_retries_interrupted() {
        let mut stream = MockStream::with_reads(&[b"x"]);
        stream.read_error = Some(io::ErrorKind::Interrupted);
        let mut conn = Connection::new(stream);
        assert_eq!(conn.fill(1024).unwrap(), ReadStatus::Drained);
        assert_eq!(conn.buffered(), 1);
    }

    #[test]
    fn test_fill_propagates_errors() {
        let mut stream = MockStream::default();
        stream.read_error = Some(io::ErrorKind::ConnectionReset);
        let mut conn = Connection::new(stream);
        assert!(conn.fill(1024).is_err());
    }

    #[test]
    fn test_flush_short_writes() {
        let mut stream = MockStream::default();
        stream.write_budget = Some(4);
        let mut conn = Connection::new(stream);
        conn.queue_delivery(b"alice", b"hi");

        assert_eq!(conn.flush().unwrap(), FlushStatus::Pending);
        assert_eq!(conn.pending_output(), 5);

        conn.stream_mut().write_budget = None;
        assert_eq!(conn.flush().unwrap(), FlushStatus::Done);
        assert_eq!(conn.stream_mut().written, b"alice\nhi\n");
    }

    #[test]
    fn test_registry_capacity() {
        let mut reg = registry(2);
        add(&mut reg);
        add(&mut reg);
        assert!(reg.insert(Connection::new(MockStream::default())).is_none());
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.capacity(), 2);
    }

    #[test]
    fn test_register_and_lookup() {
        let mut reg = registry(8);
        let id = add(&mut reg);
        assert_eq!(reg.get(id).unwrap().state(), ParseState::Unregistered);

        let outcome = reg.register(id, Bytes::from_static(b"alice"), NamePolicy::Reject);
        assert_eq!(outcome, Ok(Registered::Bound));
        assert_eq!(reg.lookup(b"alice"), Some(id));
        assert_eq!(reg.get(id).unwrap().state(), ParseState::Ready);
        assert_consistent(&reg);
    }

    #[test]
    fn test_register_twice() {
        let mut reg = registry(8);
        let id = add(&mut reg);
        reg.register(id, Bytes::from_static(b"alice"), NamePolicy::Reject)
            .unwrap();
        assert_eq!(
            reg.register(id, Bytes::from_static(b"eve"), NamePolicy::Reject),
            Err(RegistrationError::AlreadyRegistered)
        );
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut reg = registry(8);
        let first = add(&mut reg);
        let second = add(&mut reg);
        reg.register(first, Bytes::from_static(b"bob"), NamePolicy::Reject)
            .unwrap();

        assert_eq!(
            reg.register(second, Bytes::from_static(b"bob"), NamePolicy::Reject),
            Err(RegistrationError::NameTaken { holder: first })
        );
        assert_eq!(reg.lookup(b"bob"), Some(first));
        assert!(reg.get(second).unwrap().name().is_none());
        assert_consistent(&reg);
    }

    #[test]
    fn test_duplicate_name_replaced() {
        let mut reg = registry(8);
        let first = add(&mut reg);
        let second = add(&mut reg);
        reg.register(first, Bytes::from_static(b"bob"), NamePolicy::Replace)
            .unwrap();

        assert_eq!(
            reg.register(second, Bytes::from_static(b"bob"), NamePolicy::Replace),
            Ok(Registered::Replaced { previous: first })
        );
        assert_eq!(reg.lookup(b"bob"), Some(second));
        assert_consistent(&reg);

        // Tearing down the displaced holder must not unbind the new one.
        reg.remove(first);
        assert_eq!(reg.lookup(b"bob"), Some(second));
        assert_consistent(&reg);
    }

    #[test]
    fn test_remove_clears_name() {
        let mut reg = registry(8);
        let id = add(&mut reg);
        reg.register(id, Bytes::from_static(b"bob"), NamePolicy::Reject)
            .unwrap();

        assert!(reg.remove(id).is_some());
        assert_eq!(reg.lookup(b"bob"), None);
        assert_eq!(reg.registered(), 0);
        assert_eq!(reg.len(), 0);

        // Idempotent
        assert!(reg.remove(id).is_none());
    }

    #[test]
    fn test_name_free_after_remove() {
        let mut reg = registry(8);
        let old = add(&mut reg);
        reg.register(old, Bytes::from_static(b"bob"), NamePolicy::Reject)
            .unwrap();
        reg.remove(old);

        let new = add(&mut reg);
        assert_eq!(
            reg.register(new, Bytes::from_static(b"bob"), NamePolicy::Reject),
            Ok(Registered::Bound)
        );
        assert_eq!(reg.lookup(b"bob"), Some(new));
        assert_consistent(&reg);
    }

    #[test]
    fn test_register_unknown_connection() {
        let mut reg = registry(8);
        let id = add(&mut reg);
        reg.remove(id);
        assert_eq!(
            reg.register(id, Bytes::from_static(b"ghost"), NamePolicy::Reject),
            Err(RegistrationError::UnknownConnection)
        );
        assert_eq!(reg.registered(), 0);
    }
}
