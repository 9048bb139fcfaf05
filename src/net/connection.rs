//! A single TCP connection driven by completion callbacks.
//!
//! Owns the socket, the read and send buffers, and the in-flight state for
//! each operation kind. At most one read and one send may be outstanding at
//! a time; arming a second one while the first is in flight is a logged
//! programming error and the call is dropped.

use crate::addr::AddressV4;
use crate::buffer::GrowableBuffer;
use crate::error::Error;
use crate::net::consumer::Consumer;
use crate::net::socket;
use crate::operation::{self, OpKind};
use crate::reactor::core::Reactor;
use crate::registry::Key;

use io_uring::{opcode, types};
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Lifecycle of a connection.
///
/// `Open` accepts new operations. `Closing` means shutdown was requested or
/// an operation failed; remaining completions drain as bookkeeping-only
/// no-ops. `Closed` is terminal: every completion has landed and the
/// registry entry is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

struct ReadHalf {
    buf: GrowableBuffer,
    in_flight: bool,
}

struct SendHalf {
    /// Bytes staged by `queue_send`, not yet handed to the kernel.
    staged: GrowableBuffer,
    /// Bytes the kernel is (or was last) sending. Stable allocation: only
    /// touched while no send is in flight.
    wire: Vec<u8>,
    in_flight: bool,
}

/// One live TCP connection.
///
/// Created by a [`Listener`](crate::net::listener::Listener) on a completed
/// accept or by [`Self::connect`] for the outbound side, and kept alive by
/// the reactor's registry until it is closed and every outstanding
/// operation has landed.
///
/// Reads re-arm themselves: after a successful read the payload goes to the
/// attached [`Consumer`] and the next receive is already armed. Sends are
/// demand-driven: stage bytes with [`Self::queue_send`], then arm with
/// [`Self::async_send`].
pub struct Connection {
    fd: OwnedFd,
    peer_address: AddressV4,
    peer_port: u16,
    consumer: Arc<dyn Consumer>,
    key: OnceLock<Key>,
    state: AtomicU8,
    /// Operations submitted whose completions have not been observed yet.
    pending: AtomicU32,
    read: Mutex<ReadHalf>,
    send: Mutex<SendHalf>,
    /// Pinned destination address while a connect is in flight.
    connect: Mutex<Option<Box<libc::sockaddr_in>>>,
    /// Serializes payload hand-off so `on_data` sees read order.
    delivery: Mutex<()>,
    ops_submitted: AtomicU64,
    reads_rejected: AtomicU64,
    sends_rejected: AtomicU64,
}

impl Connection {
    /// Opens an outbound connection to `address:port`.
    ///
    /// Creates and configures the socket, registers it with the reactor,
    /// and arms the asynchronous connect. The consumer's `on_connected`
    /// fires once the connect completes, after which the first read is
    /// armed automatically.
    ///
    /// # Arguments
    /// * `reactor` - The reactor that will carry this connection's I/O
    /// * `address` - Peer IPv4 address
    /// * `port` - Peer TCP port
    /// * `consumer` - Callbacks for data and lifecycle events
    ///
    /// # Returns
    /// The registered connection, or an error if socket setup or
    /// registration failed.
    ///
    /// # Example
    /// ```ignore
    /// let conn = Connection::connect(&reactor, AddressV4::loopback(), 9000, Arc::new(Echo))?;
    /// ```
    pub fn connect(
        reactor: &Reactor,
        address: AddressV4,
        port: u16,
        consumer: Arc<dyn Consumer>,
    ) -> Result<Arc<Self>, Error> {
        let fd = socket::tcp_socket().map_err(Error::Resource)?;
        if reactor.config().nodelay {
            socket::set_nodelay(fd.as_raw_fd(), true).map_err(Error::Resource)?;
        }

        let connection = Arc::new(Self::with_parts(fd, (address, port), consumer));
        reactor.register_connection(&connection)?;
        connection.arm_connect(reactor, address, port);

        Ok(connection)
    }

    /// Wraps a freshly accepted socket and registers it.
    ///
    /// Takes ownership of `fd`; on any failure the descriptor is closed.
    pub(crate) fn adopt(
        reactor: &Reactor,
        fd: RawFd,
        peer: (AddressV4, u16),
        consumer: Arc<dyn Consumer>,
    ) -> Result<Arc<Self>, Error> {
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        if reactor.config().nodelay {
            if let Err(err) = socket::set_nodelay(fd.as_raw_fd(), true) {
                warn!("nodelay on accepted socket failed: {err}");
            }
        }

        let connection = Arc::new(Self::with_parts(fd, peer, consumer));
        reactor.register_connection(&connection)?;

        Ok(connection)
    }

    /// Arms the next receive.
    ///
    /// Returns immediately; the result arrives through the consumer. A
    /// synchronous submission failure is delivered through the same
    /// completion path as an asynchronous one. Calling this while a read is
    /// already outstanding drops the call and counts the rejection.
    pub fn async_read(self: &Arc<Self>, reactor: &Reactor) {
        let Some(key) = self.key() else { return };

        let (ptr, capacity) = {
            let mut half = self.read.lock();
            if half.in_flight {
                self.reads_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "read already outstanding on {}:{}",
                    self.peer_address, self.peer_port
                );
                return;
            }
            half.in_flight = true;

            let spare = half.buf.unfilled_mut(reactor.config().read_chunk);
            (spare.as_mut_ptr(), spare.len().min(u32::MAX as usize) as u32)
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.state() != ConnectionState::Open {
            self.read.lock().in_flight = false;
            self.complete_one(reactor);
            return;
        }

        let entry = opcode::Recv::new(types::Fd(self.raw_fd()), ptr, capacity)
            .build()
            .user_data(operation::encode(OpKind::Read, key));

        match reactor.submit_entry(&entry) {
            Ok(()) => {
                self.ops_submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => self.on_read_complete(reactor, Err(Error::Io(err))),
        }
    }

    /// Stages `data` for sending without arming anything.
    pub fn queue_send(&self, data: &[u8]) {
        self.send.lock().staged.write(data);
    }

    /// Arms a send over the staged bytes.
    ///
    /// Same unified failure path as [`Self::async_read`]. A call while a
    /// send is outstanding is dropped and counted; the staged bytes stay
    /// intact. A partial completion leaves the remainder staged for the
    /// next call.
    pub fn async_send(self: &Arc<Self>, reactor: &Reactor) {
        let Some(key) = self.key() else { return };

        let (ptr, length) = {
            let mut half = self.send.lock();
            if half.in_flight {
                self.sends_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "send already outstanding on {}:{}",
                    self.peer_address, self.peer_port
                );
                return;
            }

            if half.wire.is_empty() {
                half.wire = half.staged.take_unread();
            }
            if half.wire.is_empty() {
                trace!(
                    "send armed with nothing staged for {}:{}",
                    self.peer_address, self.peer_port
                );
                return;
            }
            half.in_flight = true;

            (half.wire.as_ptr(), half.wire.len().min(u32::MAX as usize) as u32)
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.state() != ConnectionState::Open {
            self.send.lock().in_flight = false;
            self.complete_one(reactor);
            return;
        }

        let entry = opcode::Send::new(types::Fd(self.raw_fd()), ptr, length)
            .build()
            .user_data(operation::encode(OpKind::Write, key));

        match reactor.submit_entry(&entry) {
            Ok(()) => {
                self.ops_submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => self.on_send_complete(reactor, Err(Error::Io(err))),
        }
    }

    /// Requests an orderly local close.
    ///
    /// Idempotent and safe to call concurrently with completions or from
    /// inside a consumer callback. Outstanding operations are forced to
    /// land by shutting the socket down at the OS level; the state reaches
    /// [`ConnectionState::Closed`] once the last of them drains.
    pub fn shutdown(self: &Arc<Self>, reactor: &Reactor) {
        self.close_with(reactor, Error::Cancelled);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Peer IPv4 address.
    pub fn peer_address(&self) -> AddressV4 {
        self.peer_address
    }

    /// Peer TCP port.
    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }

    /// Bytes staged or partially sent but not yet on the wire.
    pub fn send_pending(&self) -> usize {
        let half = self.send.lock();
        half.wire.len() + half.staged.len()
    }

    /// `true` while a receive is outstanding.
    pub fn read_in_flight(&self) -> bool {
        self.read.lock().in_flight
    }

    /// `true` while a send is outstanding.
    pub fn send_in_flight(&self) -> bool {
        self.send.lock().in_flight
    }

    /// Operations handed to the kernel over this connection's lifetime.
    pub fn submitted_ops(&self) -> u64 {
        self.ops_submitted.load(Ordering::Relaxed)
    }

    /// Number of `async_read` calls dropped because one was outstanding.
    pub fn rejected_reads(&self) -> u64 {
        self.reads_rejected.load(Ordering::Relaxed)
    }

    /// Number of `async_send` calls dropped because one was outstanding.
    pub fn rejected_sends(&self) -> u64 {
        self.sends_rejected.load(Ordering::Relaxed)
    }

    pub(crate) fn on_connect_complete(
        self: &Arc<Self>,
        reactor: &Reactor,
        outcome: Result<u32, Error>,
    ) {
        self.connect.lock().take();

        match outcome {
            Ok(_) if self.state() == ConnectionState::Open => {
                debug!("connected to {}:{}", self.peer_address, self.peer_port);
                self.consumer.on_connected(reactor, self);
                self.async_read(reactor);
            }
            Ok(_) => {}
            Err(err) => self.close_with(reactor, err),
        }

        self.complete_one(reactor);
    }

    pub(crate) fn on_read_complete(
        self: &Arc<Self>,
        reactor: &Reactor,
        outcome: Result<u32, Error>,
    ) {
        // Harvest under the same lock that clears `in_flight`, so a read
        // armed right after cannot overlap the uncommitted tail.
        let payload = {
            let mut half = self.read.lock();
            half.in_flight = false;
            match &outcome {
                Ok(count) => {
                    half.buf.commit(*count as usize);
                    half.buf.take_unread()
                }
                Err(_) => Vec::new(),
            }
        };

        match outcome {
            Ok(0) => {
                self.close_with(reactor, Error::PeerClosed);
            }
            Ok(count) if self.state() == ConnectionState::Open => {
                trace!(
                    "read {count} bytes from {}:{}",
                    self.peer_address, self.peer_port
                );

                // Re-arm first; the delivery guard keeps payloads in read
                // order when the next completion lands on a sibling worker.
                let _ordered = self.delivery.lock();
                self.async_read(reactor);
                self.consumer.on_data(reactor, self, &payload);
            }
            Ok(_) => {}
            Err(err) => self.close_with(reactor, err),
        }

        self.complete_one(reactor);
    }

    pub(crate) fn on_send_complete(
        self: &Arc<Self>,
        reactor: &Reactor,
        outcome: Result<u32, Error>,
    ) {
        {
            let mut half = self.send.lock();
            half.in_flight = false;
            if let Ok(count) = &outcome {
                let count = (*count as usize).min(half.wire.len());
                half.wire.drain(..count);
            }
        }

        match outcome {
            Ok(count) if self.state() == ConnectionState::Open => {
                trace!(
                    "sent {count} bytes to {}:{}",
                    self.peer_address, self.peer_port
                );
                let remaining = self.send_pending();
                if remaining > 0 {
                    debug!(
                        "partial send to {}:{}; {remaining} bytes still staged",
                        self.peer_address, self.peer_port
                    );
                }
                self.consumer.on_sent(reactor, self, count as usize);
            }
            Ok(_) => {}
            Err(err) => self.close_with(reactor, err),
        }

        self.complete_one(reactor);
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn bind_key(&self, key: Key) {
        let _ = self.key.set(key);
    }

    fn with_parts(fd: OwnedFd, peer: (AddressV4, u16), consumer: Arc<dyn Consumer>) -> Self {
        Self {
            fd,
            peer_address: peer.0,
            peer_port: peer.1,
            consumer,
            key: OnceLock::new(),
            state: AtomicU8::new(ConnectionState::Open as u8),
            pending: AtomicU32::new(0),
            read: Mutex::new(ReadHalf {
                buf: GrowableBuffer::new(),
                in_flight: false,
            }),
            send: Mutex::new(SendHalf {
                staged: GrowableBuffer::new(),
                wire: Vec::new(),
                in_flight: false,
            }),
            connect: Mutex::new(None),
            delivery: Mutex::new(()),
            ops_submitted: AtomicU64::new(0),
            reads_rejected: AtomicU64::new(0),
            sends_rejected: AtomicU64::new(0),
        }
    }

    fn arm_connect(self: &Arc<Self>, reactor: &Reactor, address: AddressV4, port: u16) {
        let Some(key) = self.key() else { return };

        let addr = Box::new(socket::sockaddr_in_for(address, port));
        let addr_ptr = (&*addr) as *const libc::sockaddr_in as *const libc::sockaddr;
        *self.connect.lock() = Some(addr);

        self.pending.fetch_add(1, Ordering::SeqCst);
        let entry = opcode::Connect::new(
            types::Fd(self.raw_fd()),
            addr_ptr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
        .build()
        .user_data(operation::encode(OpKind::Connect, key));

        match reactor.submit_entry(&entry) {
            Ok(()) => {
                self.ops_submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => self.on_connect_complete(reactor, Err(Error::Io(err))),
        }
    }

    /// Winner of the open-to-closing race shuts the socket down and
    /// notifies the consumer exactly once.
    fn close_with(self: &Arc<Self>, reactor: &Reactor, reason: Error) {
        let won = self
            .state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if !won {
            return;
        }

        if reason.is_orderly() {
            debug!(
                "closing {}:{} ({reason})",
                self.peer_address, self.peer_port
            );
        } else {
            error!(
                "closing {}:{} after failure: {reason}",
                self.peer_address, self.peer_port
            );
        }

        // Forces outstanding kernel operations on this socket to land.
        socket::shutdown_both(self.raw_fd());
        self.consumer.on_close(reactor, self, &reason);
        self.maybe_retire(reactor);
    }

    fn complete_one(self: &Arc<Self>, reactor: &Reactor) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.maybe_retire(reactor);
    }

    /// Erases the registry entry once closing and fully drained. The entry
    /// holds the `Arc` that pins the buffers the kernel writes into, so it
    /// must outlive every outstanding operation.
    fn maybe_retire(&self, reactor: &Reactor) {
        if self.state() == ConnectionState::Open || self.pending.load(Ordering::SeqCst) != 0 {
            return;
        }

        self.state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
        if let Some(key) = self.key.get() {
            if reactor.deregister(*key) {
                debug!(
                    "connection {}:{} closed",
                    self.peer_address, self.peer_port
                );
            }
        }
    }

    fn key(&self) -> Option<Key> {
        let key = self.key.get().copied();
        if key.is_none() {
            warn!(
                "operation on unregistered connection {}:{}",
                self.peer_address, self.peer_port
            );
        }

        key
    }
}
