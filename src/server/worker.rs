//! Network worker: one mio reactor and one slave cache per thread.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use crossbeam_channel::Receiver;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::client::{Blocker, ClientEvent, ClientState};
use crate::entry::ClientId;
use crate::error::Result;
use crate::http::{self, Parsed};
use crate::key::Key;
use crate::master::CoordinatorHandle;
use crate::slave::{SlaveCache, SlaveWaker};

/// Token of the worker's waker.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// Upper bound on one `poll` call, so timeouts and eviction run even when
/// the worker is idle.
const TICK: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 16 * 1024;

impl SlaveWaker for Waker {
    fn wake(&self) {
        if let Err(e) = Waker::wake(self) {
            warn!(error = %e, "failed to wake worker");
        }
    }
}

/// Per-worker settings.
#[derive(Debug, Clone)]
pub(crate) struct WorkerSettings {
    pub(crate) client_timeout: Duration,
    pub(crate) stale_batch: usize,
}

struct Connection {
    stream: TcpStream,
    generation: u32,
    state: ClientState,
    read_buf: BytesMut,
    write_queue: VecDeque<Bytes>,
    /// Key of the pending entry this client is registered on.
    awaiting: Option<Key>,
    registered: bool,
    close_after_write: bool,
    last_active: Instant,
}

impl Connection {
    /// Writes as much queued output as the socket accepts. Returns true once
    /// the queue is empty.
    fn flush(&mut self) -> io::Result<bool> {
        while let Some(front) = self.write_queue.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.last_active = Instant::now();
                    front.advance(n);
                    if front.is_empty() {
                        self.write_queue.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Reads until the socket would block. Returns false on EOF.
    fn fill(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn interest(&self) -> Option<Interest> {
        match (self.state.wants_read(), self.state.wants_write()) {
            (_, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, false) => None,
        }
    }

    /// Brings the poll registration in line with the client state. A
    /// blocked client is deregistered entirely.
    fn sync_interest(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        match (self.registered, self.interest()) {
            (false, Some(interest)) => {
                registry.register(&mut self.stream, token, interest)?;
                self.registered = true;
            }
            (true, Some(interest)) => registry.reregister(&mut self.stream, token, interest)?,
            (true, None) => {
                registry.deregister(&mut self.stream)?;
                self.registered = false;
            }
            (false, None) => {}
        }
        Ok(())
    }
}

fn client_id(slot: usize, generation: u32) -> ClientId {
    ClientId::new((u64::from(generation) << 32) | slot as u64)
}

fn split_client_id(client: ClientId) -> (usize, u32) {
    let raw = client.get();
    ((raw & 0xffff_ffff) as usize, (raw >> 32) as u32)
}

/// The worker's connection table.
struct Connections {
    slab: Slab<Connection>,
    registry: Registry,
    next_generation: u32,
}

impl Connections {
    fn get_mut(&mut self, client: ClientId) -> Option<&mut Connection> {
        let (slot, generation) = split_client_id(client);
        self.slab
            .get_mut(slot)
            .filter(|conn| conn.generation == generation)
    }

    fn update(&mut self, slot: usize, event: ClientEvent) {
        let Some(conn) = self.slab.get_mut(slot) else {
            return;
        };
        conn.state = conn.state.on(event);
        if let Err(e) = conn.sync_interest(&self.registry, Token(slot)) {
            warn!(slot, error = %e, "failed to update interest");
            conn.close_after_write = true;
            conn.write_queue.clear();
        }
    }
}

impl Blocker for Connections {
    fn block_client(&mut self, client: ClientId) {
        let (slot, _) = split_client_id(client);
        if self.get_mut(client).is_some() {
            self.update(slot, ClientEvent::RequestPending);
        }
    }

    fn unblock_client(&mut self, client: ClientId, reply: Bytes) {
        let (slot, _) = split_client_id(client);
        let Some(conn) = self.get_mut(client) else {
            return;
        };
        if !conn.state.is_blocked() {
            return;
        }
        conn.awaiting = None;
        conn.write_queue.push_back(reply);
        conn.last_active = Instant::now();
        self.update(slot, ClientEvent::Fulfilled);
    }
}

/// A network worker thread.
pub(crate) struct Worker {
    id: usize,
    poll: Poll,
    incoming: Receiver<TcpStream>,
    slave: SlaveCache,
    coordinator: CoordinatorHandle,
    settings: WorkerSettings,
    shutdown: Arc<AtomicBool>,
    conns: Connections,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        poll: Poll,
        incoming: Receiver<TcpStream>,
        slave: SlaveCache,
        coordinator: CoordinatorHandle,
        settings: WorkerSettings,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let registry = poll.registry().try_clone()?;
        Ok(Worker {
            id,
            poll,
            incoming,
            slave,
            coordinator,
            settings,
            shutdown,
            conns: Connections {
                slab: Slab::with_capacity(1024),
                registry,
                next_generation: 0,
            },
        })
    }

    /// Runs until the shutdown flag is raised.
    pub(crate) fn run(mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);
        debug!(worker = self.id, "worker started");

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(TICK)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                let slot = event.token().0;
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    self.on_readable(slot);
                }
                if event.is_writable() {
                    self.process_requests(slot);
                }
            }

            self.accept_incoming();
            self.apply_fulfilments();
            if self.coordinator.should_free_some_data() {
                self.slave.delete_stale_entries(self.settings.stale_batch);
            }
            self.expire_clients();
        }

        debug!(
            worker = self.id,
            connections = self.conns.slab.len(),
            metrics = ?self.slave.metrics(),
            "worker stopped"
        );
        Ok(())
    }

    fn accept_incoming(&mut self) {
        while let Ok(stream) = self.incoming.try_recv() {
            let generation = self.conns.next_generation;
            self.conns.next_generation = generation.wrapping_add(1);

            let entry = self.conns.slab.vacant_entry();
            let slot = entry.key();
            let mut conn = Connection {
                stream,
                generation,
                state: ClientState::Idle,
                read_buf: BytesMut::with_capacity(1024),
                write_queue: VecDeque::new(),
                awaiting: None,
                registered: false,
                close_after_write: false,
                last_active: Instant::now(),
            };
            if let Err(e) = conn.sync_interest(&self.conns.registry, Token(slot)) {
                warn!(worker = self.id, error = %e, "failed to register connection");
                continue;
            }
            entry.insert(conn);
            trace!(worker = self.id, slot, "connection accepted");
        }
    }

    fn on_readable(&mut self, slot: usize) {
        let Some(conn) = self.conns.slab.get_mut(slot) else {
            return;
        };
        if !conn.state.wants_read() {
            return;
        }
        match conn.fill() {
            Ok(true) => {
                conn.last_active = Instant::now();
                self.process_requests(slot);
            }
            Ok(false) => self.close(slot),
            Err(e) => {
                debug!(worker = self.id, slot, error = %e, "read failed");
                self.close(slot);
            }
        }
    }

    /// Handles every complete request in the connection's buffer and
    /// flushes the replies, until the client blocks, the socket stops
    /// accepting output or the buffer runs dry.
    fn process_requests(&mut self, slot: usize) {
        loop {
            let Some(conn) = self.conns.slab.get_mut(slot) else {
                return;
            };
            if conn.state.wants_read() && !conn.close_after_write {
                match http::parse_request(&conn.read_buf) {
                    Parsed::Request { uri, consumed } => {
                        conn.read_buf.advance(consumed);
                        self.handle_request(slot, uri);
                        continue;
                    }
                    Parsed::Invalid => {
                        conn.read_buf.clear();
                        conn.write_queue
                            .push_back(Bytes::from_static(http::BAD_REQUEST_REPLY));
                        conn.close_after_write = true;
                        self.conns.update(slot, ClientEvent::RequestHit);
                    }
                    Parsed::Incomplete => {}
                }
            }
            if !self.flush(slot) {
                return;
            }
        }
    }

    /// Writes queued replies. Returns true if the queue drained and the
    /// client can take more requests.
    fn flush(&mut self, slot: usize) -> bool {
        let Some(conn) = self.conns.slab.get_mut(slot) else {
            return false;
        };
        if !conn.state.wants_write() {
            return false;
        }
        match conn.flush() {
            Ok(true) if conn.close_after_write => {
                self.close(slot);
                false
            }
            Ok(true) => {
                self.conns.update(slot, ClientEvent::WriteDone);
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!(worker = self.id, slot, error = %e, "write failed");
                self.close(slot);
                false
            }
        }
    }

    fn handle_request(&mut self, slot: usize, uri: Key) {
        let value = self.slave.find(&uri).value().cloned();
        let Some(conn) = self.conns.slab.get_mut(slot) else {
            return;
        };

        match value {
            Some(reply) => {
                trace!(worker = self.id, key = %uri, "hit");
                conn.write_queue.push_back(reply);
                self.conns.update(slot, ClientEvent::RequestHit);
            }
            None => {
                let client = client_id(slot, conn.generation);
                trace!(worker = self.id, key = %uri, client = client.get(), "blocked");
                self.slave.add_watcher(uri.as_bytes(), client);
                conn.awaiting = Some(uri);
                self.conns.block_client(client);
            }
        }
    }

    fn apply_fulfilments(&mut self) {
        for (client, reply) in self.slave.process_inbox() {
            self.conns.unblock_client(client, reply);
            let (slot, _) = split_client_id(client);
            if self.conns.get_mut(client).is_some() {
                self.process_requests(slot);
            }
        }
    }

    fn expire_clients(&mut self) {
        let now = Instant::now();
        let timeout = self.settings.client_timeout;
        let expired: Vec<usize> = self
            .conns
            .slab
            .iter()
            .filter(|(_, conn)| now.duration_since(conn.last_active) > timeout)
            .map(|(slot, _)| slot)
            .collect();
        for slot in expired {
            debug!(worker = self.id, slot, "client timed out");
            self.close(slot);
        }
    }

    /// Frees a connection. A client still registered on a pending entry is
    /// detached first so the reply is never routed to a reused slot.
    fn close(&mut self, slot: usize) {
        let Some(mut conn) = self.conns.slab.try_remove(slot) else {
            return;
        };
        if let Some(key) = conn.awaiting.take() {
            self.slave
                .remove_watcher(key.as_bytes(), client_id(slot, conn.generation));
        }
        if conn.registered {
            let _ = self.conns.registry.deregister(&mut conn.stream);
        }
        trace!(worker = self.id, slot, "connection closed");
    }
}
