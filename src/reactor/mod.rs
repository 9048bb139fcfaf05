//! Completion-driven I/O reactor module.
//!
//! This module provides the core completion-queue handling built on io_uring.
//! It includes:
//! - [`core`]: The main reactor implementation: ring ownership, submission,
//!   the handle registry, and the worker dispatch loop

pub mod core;
