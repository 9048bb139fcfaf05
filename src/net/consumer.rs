//! Consumer seam: application callbacks driven by completions.
//!
//! A [`Consumer`] is attached to a listener and inherited by every
//! connection it accepts (or given directly to an outbound connection).
//! Its methods run on reactor worker threads.

use crate::error::Error;
use crate::net::connection::Connection;
use crate::reactor::core::Reactor;

use std::sync::Arc;

/// Application-side handler for connection events.
///
/// All methods are invoked from within the completion loop, so they must
/// not block. Payloads for one connection arrive in read order; events for
/// different connections may run concurrently.
///
/// Only [`Self::on_data`] is mandatory; the lifecycle hooks default to
/// no-ops.
pub trait Consumer: Send + Sync {
    /// A connection became usable: an accepted socket is registered and
    /// about to arm its first read, or an outbound connect completed.
    fn on_connected(&self, _reactor: &Reactor, _connection: &Arc<Connection>) {}

    /// A read completed with `data`. Stage a response with
    /// [`Connection::queue_send`] and arm it with [`Connection::async_send`]
    /// to reply.
    fn on_data(&self, reactor: &Reactor, connection: &Arc<Connection>, data: &[u8]);

    /// A send completed, covering `bytes` bytes. If
    /// [`Connection::send_pending`] is non-zero the remainder stays staged
    /// until the next [`Connection::async_send`].
    fn on_sent(&self, _reactor: &Reactor, _connection: &Arc<Connection>, _bytes: usize) {}

    /// The connection left the open state. `reason` is
    /// [`Error::PeerClosed`] for an orderly remote close and
    /// [`Error::Cancelled`] for a local shutdown.
    fn on_close(&self, _reactor: &Reactor, _connection: &Arc<Connection>, _reason: &Error) {}
}

/// Reference consumer: echoes every received payload back to the peer.
///
/// # Example
/// ```ignore
/// let listener = Listener::new(&reactor, AddressV4::loopback(), 0, Arc::new(Echo))?;
/// listener.async_accept(&reactor);
/// ```
pub struct Echo;

impl Consumer for Echo {
    fn on_data(&self, reactor: &Reactor, connection: &Arc<Connection>, data: &[u8]) {
        connection.queue_send(data);
        // A send may still be draining an earlier payload; its completion
        // picks the new bytes up through `on_sent`.
        if !connection.send_in_flight() {
            connection.async_send(reactor);
        }
    }

    fn on_sent(&self, reactor: &Reactor, connection: &Arc<Connection>, _bytes: usize) {
        // Drain whatever a partial send left behind.
        if connection.send_pending() > 0 {
            connection.async_send(reactor);
        }
    }
}
