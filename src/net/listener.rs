//! TCP listener for accepting incoming connections.
//!
//! Provides [`Listener`], which keeps one asynchronous accept outstanding
//! and spawns a registered [`Connection`] per completed accept.
//!
//! # Usage
//!
//! ```ignore
//! use proactor::{AddressV4, Echo, Listener, ReactorBuilder};
//! use std::sync::Arc;
//!
//! let reactor = Arc::new(ReactorBuilder::new().build()?);
//! let listener = Listener::new(&reactor, AddressV4::loopback(), 0, Arc::new(Echo))?;
//! println!("listening on port {}", listener.port());
//!
//! listener.async_accept(&reactor);
//! let workers = reactor.start_workers(2);
//! ```

use crate::addr::AddressV4;
use crate::error::Error;
use crate::net::connection::Connection;
use crate::net::consumer::Consumer;
use crate::net::socket;
use crate::operation::{self, OpKind};
use crate::reactor::core::Reactor;
use crate::registry::Key;

use io_uring::{opcode, types};
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

struct AcceptSlot {
    in_flight: bool,
    /// Scratch the kernel writes the peer address into; owned by the one
    /// accept allowed in flight.
    peer: Box<libc::sockaddr_storage>,
    peer_len: Box<libc::socklen_t>,
}

/// A TCP listener that accepts connections through the completion queue.
///
/// `Listener::new` binds and registers the socket; [`Self::async_accept`]
/// arms the accept loop. Each completed accept configures the new socket,
/// wraps it in a [`Connection`] sharing this listener's [`Consumer`], arms
/// that connection's first read, and re-arms the accept, so one call keeps
/// the listener accepting until [`Self::shutdown`].
pub struct Listener {
    fd: OwnedFd,
    address: AddressV4,
    port: u16,
    consumer: Arc<dyn Consumer>,
    key: OnceLock<Key>,
    closed: AtomicBool,
    /// Operations submitted whose completions have not been observed yet.
    pending: AtomicU32,
    accept: Mutex<AcceptSlot>,
    accepts_submitted: AtomicU64,
    accepts_rejected: AtomicU64,
}

impl Listener {
    /// Binds a listener and registers it with the reactor.
    ///
    /// This method performs the following:
    /// 1. Creates the socket and applies address reuse, bounded linger, and
    ///    the configured Nagle and deferred-accept settings
    /// 2. Binds to `address:port` (port 0 picks a free port)
    /// 3. Starts listening with the configured backlog
    /// 4. Resolves the bound port and registers with the reactor
    ///
    /// Any failing step closes the partially constructed socket and returns
    /// the error; nothing is retried.
    ///
    /// # Arguments
    /// * `reactor` - The reactor whose queue carries this listener's accepts
    /// * `address` - Local IPv4 address to bind
    /// * `port` - Local TCP port, or 0 for an ephemeral port
    /// * `consumer` - Callbacks inherited by every accepted connection
    ///
    /// # Returns
    /// The registered [`Listener`] on success, or an [`Error`]
    ///
    /// # Example
    /// ```ignore
    /// let listener = Listener::new(&reactor, AddressV4::any(), 8080, Arc::new(Echo))?;
    /// ```
    pub fn new(
        reactor: &Reactor,
        address: AddressV4,
        port: u16,
        consumer: Arc<dyn Consumer>,
    ) -> Result<Arc<Self>, Error> {
        let fd = socket::tcp_socket().map_err(Error::Resource)?;
        let raw = fd.as_raw_fd();

        socket::set_reuse_addr(raw, true).map_err(Error::Resource)?;
        socket::set_linger(raw, reactor.config().linger_secs).map_err(Error::Resource)?;
        if reactor.config().nodelay {
            socket::set_nodelay(raw, true).map_err(Error::Resource)?;
        }
        if reactor.config().defer_accept {
            socket::set_defer_accept(raw, 1).map_err(Error::Resource)?;
        }

        socket::bind(raw, address, port).map_err(Error::Resource)?;
        socket::listen(raw, reactor.config().backlog).map_err(Error::Resource)?;
        let port = socket::local_port(raw).map_err(Error::Resource)?;

        let listener = Arc::new(Self {
            fd,
            address,
            port,
            consumer,
            key: OnceLock::new(),
            closed: AtomicBool::new(false),
            pending: AtomicU32::new(0),
            accept: Mutex::new(AcceptSlot {
                in_flight: false,
                peer: Box::new(unsafe { mem::zeroed() }),
                peer_len: Box::new(0),
            }),
            accepts_submitted: AtomicU64::new(0),
            accepts_rejected: AtomicU64::new(0),
        });
        reactor.register_listener(&listener)?;

        debug!("listening on {}:{}", listener.address, listener.port);
        Ok(listener)
    }

    /// Arms the accept loop.
    ///
    /// Must only be called when no accept is outstanding: the single peer
    /// scratch would be written by two kernel operations at once. A second
    /// call while one is in flight is dropped, logged, and counted.
    pub fn async_accept(self: &Arc<Self>, reactor: &Reactor) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("accept requested on closed listener port {}", self.port);
            return;
        }
        let Some(key) = self.key() else { return };

        let (addr_ptr, len_ptr) = {
            let mut slot = self.accept.lock();
            if slot.in_flight {
                self.accepts_rejected.fetch_add(1, Ordering::Relaxed);
                warn!("accept already outstanding on port {}", self.port);
                return;
            }
            slot.in_flight = true;
            *slot.peer_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

            (
                (&mut *slot.peer) as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                (&mut *slot.peer_len) as *mut libc::socklen_t,
            )
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        // Re-check after the increment: a shutdown that still saw
        // pending == 0 has already retired the entry pinning the scratch.
        if self.closed.load(Ordering::SeqCst) {
            self.accept.lock().in_flight = false;
            self.complete_one(reactor);
            return;
        }

        let entry = opcode::Accept::new(types::Fd(self.raw_fd()), addr_ptr, len_ptr)
            .build()
            .user_data(operation::encode(OpKind::Accept, key));

        if let Err(err) = reactor.submit_entry(&entry) {
            self.accept.lock().in_flight = false;
            error!("accept submission failed on port {}: {err}", self.port);
            self.complete_one(reactor);
            return;
        }
        self.accepts_submitted.fetch_add(1, Ordering::Relaxed);

        // A shutdown that raced the arming reaps it here.
        if self.closed.load(Ordering::SeqCst) {
            reactor.cancel(operation::encode(OpKind::Accept, key));
        }
    }

    /// Stops accepting.
    ///
    /// Idempotent: only the first call wins the closed flag. The in-flight
    /// accept (if any) is cancelled, and its eventual completion spawns
    /// nothing. Connections already accepted are unaffected.
    pub fn shutdown(self: &Arc<Self>, reactor: &Reactor) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("listener on port {} shutting down", self.port);

        if let Some(key) = self.key.get() {
            // Reaps the outstanding accept if one is armed; a miss is
            // harmless.
            reactor.cancel(operation::encode(OpKind::Accept, *key));
        }
        self.maybe_retire(reactor);
    }

    /// The port this listener is bound to, resolved after binding port 0.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The local address this listener is bound to.
    pub fn address(&self) -> AddressV4 {
        self.address
    }

    /// `true` until [`Self::shutdown`] is called.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Accepts handed to the kernel over this listener's lifetime.
    pub fn submitted_accepts(&self) -> u64 {
        self.accepts_submitted.load(Ordering::Relaxed)
    }

    /// Number of `async_accept` calls dropped because one was outstanding.
    pub fn rejected_accepts(&self) -> u64 {
        self.accepts_rejected.load(Ordering::Relaxed)
    }

    pub(crate) fn on_accept_complete(
        self: &Arc<Self>,
        reactor: &Reactor,
        outcome: Result<u32, Error>,
    ) {
        // Harvest under the same lock that clears `in_flight`, so an accept
        // armed right after cannot overwrite the peer scratch first.
        let landed_peer = {
            let mut slot = self.accept.lock();
            slot.in_flight = false;
            socket::peer_endpoint(&slot.peer, *slot.peer_len)
        };

        if self.closed.load(Ordering::SeqCst) {
            // Shut down while the accept was in flight: the completion is
            // a no-op, but an accepted socket must not leak.
            if let Ok(fd) = outcome {
                socket::close_raw(fd as RawFd);
                trace!("accept after shutdown on port {}; socket dropped", self.port);
            }
            self.complete_one(reactor);
            return;
        }

        match outcome {
            Ok(fd) => {
                let peer = landed_peer.unwrap_or((AddressV4::any(), 0));

                match Connection::adopt(reactor, fd as RawFd, peer, Arc::clone(&self.consumer)) {
                    Ok(connection) => {
                        debug!("accepted {}:{} on port {}", peer.0, peer.1, self.port);
                        self.consumer.on_connected(reactor, &connection);
                        connection.async_read(reactor);
                    }
                    Err(err) => {
                        error!("accepted connection rejected: {err}");
                    }
                }

                // Keep exactly one accept outstanding while open.
                self.async_accept(reactor);
            }
            Err(Error::Cancelled) => {
                debug!("accept cancelled on port {}", self.port);
            }
            Err(err) => {
                // Stalled listener; a fresh async_accept restarts the loop.
                error!("accept failed on port {}: {err}", self.port);
            }
        }

        self.complete_one(reactor);
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn bind_key(&self, key: Key) {
        let _ = self.key.set(key);
    }

    fn complete_one(self: &Arc<Self>, reactor: &Reactor) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.maybe_retire(reactor);
    }

    /// Erases the registry entry once closed and drained; the listening
    /// socket closes when the last owner drops.
    fn maybe_retire(&self, reactor: &Reactor) {
        if !self.closed.load(Ordering::SeqCst) || self.pending.load(Ordering::SeqCst) != 0 {
            return;
        }

        if let Some(key) = self.key.get() {
            if reactor.deregister(*key) {
                debug!("listener on port {} closed", self.port);
            }
        }
    }

    fn key(&self) -> Option<Key> {
        let key = self.key.get().copied();
        if key.is_none() {
            warn!("operation on unregistered listener port {}", self.port);
        }

        key
    }
}
