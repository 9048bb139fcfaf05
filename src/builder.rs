//! Fluent builder for Reactor construction.
//!
//! Provides a builder pattern interface for creating and configuring Reactor
//! instances.

use crate::error::Error;
use crate::reactor::core::Reactor;

/// Tuning applied at build time and consulted by the components the reactor
/// later spawns.
pub(crate) struct Config {
    pub(crate) queue_depth: u32,
    pub(crate) max_handles: usize,
    pub(crate) read_chunk: usize,
    pub(crate) backlog: i32,
    pub(crate) linger_secs: u16,
    pub(crate) nodelay: bool,
    pub(crate) defer_accept: bool,
}

/// Builder for constructing Reactor instances with fluent API.
///
/// Every knob has a working default; `build()` is all a basic echo server
/// needs to call.
///
/// # Example
/// ```ignore
/// let reactor = ReactorBuilder::new()
///     .queue_depth(512)
///     .max_handles(4096)
///     .build()?;
/// ```
pub struct ReactorBuilder {
    queue_depth: u32,
    max_handles: usize,
    read_chunk: usize,
    backlog: i32,
    linger_secs: u16,
    nodelay: bool,
    defer_accept: bool,
}

impl Default for ReactorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactorBuilder {
    /// Creates a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            queue_depth: 256,
            max_handles: 1024,
            read_chunk: 16 * 1024,
            backlog: 128,
            linger_secs: 30,
            nodelay: true,
            defer_accept: false,
        }
    }

    /// Number of submission queue entries for the completion ring.
    pub fn queue_depth(mut self, entries: u32) -> Self {
        self.queue_depth = entries.max(1);
        self
    }

    /// Maximum number of simultaneously registered handles and posted tasks.
    pub fn max_handles(mut self, handles: usize) -> Self {
        self.max_handles = handles.max(1);
        self
    }

    /// Number of bytes each armed receive asks the kernel to fill.
    pub fn read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = bytes.max(1);
        self
    }

    /// Listen backlog applied when a listener binds.
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog.max(1);
        self
    }

    /// Grace period in seconds for `SO_LINGER` on listening sockets.
    pub fn linger_secs(mut self, seconds: u16) -> Self {
        self.linger_secs = seconds;
        self
    }

    /// Whether Nagle's algorithm is disabled on listeners and connections.
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    /// Defers accept completions until the peer has sent data.
    ///
    /// Off by default; only useful for protocols where the client speaks
    /// first.
    pub fn defer_accept(mut self, enabled: bool) -> Self {
        self.defer_accept = enabled;
        self
    }

    /// Builds and returns a configured Reactor instance.
    ///
    /// Consumes the builder, creates the completion ring, and sizes the
    /// handle registry.
    ///
    /// # Returns
    /// A newly constructed Reactor, or [`Error::Resource`] if the ring
    /// cannot be created.
    ///
    /// # Example
    /// ```ignore
    /// let reactor = ReactorBuilder::new().build()?;
    /// ```
    pub fn build(self) -> Result<Reactor, Error> {
        Reactor::with_config(Config {
            queue_depth: self.queue_depth,
            max_handles: self.max_handles,
            read_chunk: self.read_chunk,
            backlog: self.backlog,
            linger_secs: self.linger_secs,
            nodelay: self.nodelay,
            defer_accept: self.defer_accept,
        })
    }
}
