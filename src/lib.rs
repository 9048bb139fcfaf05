//! Completion-driven TCP networking built on io_uring.
//!
//! This crate provides a proactor-style reactor: callers arm asynchronous
//! accept, connect, read, and send operations, the kernel performs them, and
//! worker threads dispatch each completion to the component that armed it.
//!
//! # Architecture
//!
//! - **Reactor**: Owns the io_uring instance and the handle registry; its
//!   `run` loop waits for completions and routes them by routing word
//! - **Listener**: A bound, listening TCP socket that keeps one accept
//!   outstanding and wraps accepted sockets in connections
//! - **Connection**: One TCP peer; owns its read and send buffers and
//!   exposes `async_read`, `queue_send`, and `async_send`
//! - **Consumer**: Receives connection events; `Echo` is the reference
//!   implementation that writes every payload back to its sender
//! - **GrowableBuffer**: Cursor-tracked byte buffer whose storage stays
//!   pinned for the lifetime of an armed operation
//! - **AddressV4**: Dotted-quad IPv4 address value type
//! - **ReactorBuilder**: Fluent builder pattern for reactor instantiation

mod addr;
mod buffer;
mod builder;
mod error;
mod operation;
mod reactor;
mod registry;

pub mod net;

pub use addr::AddressV4;
pub use buffer::GrowableBuffer;
pub use builder::ReactorBuilder;
pub use error::{Error, RegistrationError};
pub use net::connection::{Connection, ConnectionState};
pub use net::consumer::{Consumer, Echo};
pub use net::listener::Listener;
pub use reactor::core::Reactor;
