//! TCP networking primitives.
//!
//! This module provides completion-driven TCP networking primitives:
//! - [`listener`]: [`Listener`] for accepting connections
//! - [`connection`]: [`Connection`] for reading/writing data
//! - [`consumer`]: The [`Consumer`] trait for payload delivery plus the
//!   [`Echo`] reference consumer
//! - [`socket`]: Raw socket configuration helpers
//!
//! # Example
//!
//! ```ignore
//! use proactor::net::listener::Listener;
//! use proactor::net::consumer::Echo;
//!
//! let reactor = Arc::new(Reactor::new()?);
//! let listener = Listener::new(&reactor, AddressV4::loopback(), 8080, Arc::new(Echo))?;
//! listener.async_accept(&reactor);
//! reactor.run();
//! ```
//!
//! [`Listener`]: listener::Listener
//! [`Connection`]: connection::Connection
//! [`Consumer`]: consumer::Consumer
//! [`Echo`]: consumer::Echo

pub mod connection;
pub mod consumer;
pub mod listener;
pub(crate) mod socket;
