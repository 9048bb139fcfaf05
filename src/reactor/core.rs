use crate::builder::{Config, ReactorBuilder};
use crate::error::Error;
use crate::net::connection::Connection;
use crate::net::listener::Listener;
use crate::net::socket;
use crate::operation::{self, OpKind};
use crate::registry::{Entry, Key, Registry};

use io_uring::{IoUring, cqueue, opcode, squeue};
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// The completion-queue reactor.
///
/// Owns one io_uring instance for its whole lifetime plus the registry of
/// live listeners, connections, and posted tasks. [`Self::run`] is the
/// blocking dispatch loop; any number of worker threads may run it against
/// the same reactor, and each completion is handled by exactly one of them.
///
/// # Example
/// ```ignore
/// let reactor = Arc::new(ReactorBuilder::new().build()?);
/// let listener = Listener::new(&reactor, AddressV4::loopback(), 0, Arc::new(Echo))?;
/// listener.async_accept(&reactor);
///
/// let workers = reactor.start_workers(2);
/// // ... serve ...
/// reactor.stop();
/// for worker in workers {
///     let _ = worker.join();
/// }
/// ```
pub struct Reactor {
    /// Declared before `registry`: ring teardown reaps kernel-owned
    /// operations before any pinned buffers are freed.
    ring: IoUring,
    sq_lock: Mutex<()>,
    cq_lock: Mutex<()>,
    registry: Mutex<Registry>,
    stopped: AtomicBool,
    cfg: Config,
}

impl Reactor {
    /// Creates a reactor with the default configuration.
    ///
    /// Equivalent to `ReactorBuilder::new().build()`.
    pub fn new() -> Result<Self, Error> {
        ReactorBuilder::new().build()
    }

    pub(crate) fn with_config(cfg: Config) -> Result<Self, Error> {
        let ring = IoUring::new(cfg.queue_depth).map_err(Error::Resource)?;
        debug!("completion ring ready with {} entries", cfg.queue_depth);

        Ok(Self {
            ring,
            sq_lock: Mutex::new(()),
            cq_lock: Mutex::new(()),
            registry: Mutex::new(Registry::with_capacity(cfg.max_handles)),
            stopped: AtomicBool::new(false),
            cfg,
        })
    }

    /// Blocking dispatch loop.
    ///
    /// Waits for one completion at a time, routes it to its owner, and
    /// invokes the matching completion handler. Returns once [`Self::stop`]
    /// is observed; nothing else ends the loop. An operation that completed
    /// with an error is delivered to its owner like any other completion,
    /// and a failed queue wait is logged and the loop continues.
    ///
    /// May be called from multiple threads concurrently; exactly one thread
    /// handles each completion, and completions for different components
    /// proceed in parallel.
    pub fn run(&self) {
        trace!("worker entering completion loop");

        while !self.stopped.load(Ordering::SeqCst) {
            match self.wait_one() {
                Ok(cqe) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    self.dispatch(cqe);
                }
                Err(err) => {
                    error!("completion wait failed: {err}");
                }
            }
        }

        // Hand the wake token to the next blocked worker.
        self.post_wake();
        trace!("worker leaving completion loop");
    }

    /// Stops the dispatch loop on every worker.
    ///
    /// Sets the stop flag and posts a wake sentinel so blocked workers
    /// observe it. Idempotent; callable from any thread, including from
    /// inside a completion handler. In-flight operations are not cancelled:
    /// their completions stay queued and are reaped when the reactor drops.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("reactor stopping");
        self.post_wake();
    }

    /// `true` once [`Self::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Queues `callback` to run on a worker thread with a zero-byte
    /// outcome.
    ///
    /// If the reactor is already stopped, or the task cannot be queued, the
    /// callback is invoked immediately on the calling thread with the
    /// failure instead. It runs exactly once either way, so callers must
    /// not block assuming queuing succeeded.
    pub fn post<F>(&self, callback: F)
    where
        F: FnOnce(&Reactor, Result<u32, Error>) + Send + 'static,
    {
        if self.stopped.load(Ordering::SeqCst) {
            callback(self, Err(Error::Cancelled));
            return;
        }

        let inserted = {
            self.registry
                .lock()
                .insert(Entry::Posted(Box::new(callback)), None)
        };
        let key = match inserted {
            Ok(key) => key,
            Err((err, entry)) => {
                warn!("posted task rejected: {err}");
                if let Entry::Posted(callback) = entry {
                    callback(self, Err(Error::Registration(err)));
                }
                return;
            }
        };

        let entry = opcode::Nop::new()
            .build()
            .user_data(operation::encode(OpKind::Posted, key));

        if let Err(err) = self.submit_entry(&entry) {
            let task = { self.registry.lock().take_posted(key) };
            if let Some(task) = task {
                warn!("posted task submission failed: {err}");
                task(self, Err(Error::Io(err)));
            }
        }
    }

    /// Spawns `count` worker threads, each blocked in [`Self::run`].
    ///
    /// # Returns
    /// The join handles; join them after calling [`Self::stop`].
    pub fn start_workers(self: &Arc<Self>, count: usize) -> Vec<thread::JoinHandle<()>> {
        (0..count)
            .map(|_| {
                let reactor = Arc::clone(self);
                thread::spawn(move || reactor.run())
            })
            .collect()
    }

    /// Number of live registry entries (listeners, connections, queued
    /// tasks).
    pub fn handle_count(&self) -> usize {
        self.registry.lock().len()
    }

    pub(crate) fn register_listener(&self, listener: &Arc<Listener>) -> Result<(), Error> {
        let inserted = {
            self.registry.lock().insert(
                Entry::Listener(Arc::clone(listener)),
                Some(listener.raw_fd()),
            )
        };

        match inserted {
            Ok(key) => {
                listener.bind_key(key);
                trace!(
                    "listener fd {} registered in slot {}",
                    listener.raw_fd(),
                    key.index
                );
                Ok(())
            }
            Err((err, _)) => Err(Error::Registration(err)),
        }
    }

    pub(crate) fn register_connection(&self, connection: &Arc<Connection>) -> Result<(), Error> {
        let inserted = {
            self.registry.lock().insert(
                Entry::Connection(Arc::clone(connection)),
                Some(connection.raw_fd()),
            )
        };

        match inserted {
            Ok(key) => {
                connection.bind_key(key);
                trace!(
                    "connection fd {} registered in slot {}",
                    connection.raw_fd(),
                    key.index
                );
                Ok(())
            }
            Err((err, _)) => Err(Error::Registration(err)),
        }
    }

    /// Frees a registry slot. Returns `false` when the key was already
    /// retired, making concurrent retirement attempts safe.
    pub(crate) fn deregister(&self, key: Key) -> bool {
        let removed = { self.registry.lock().remove(key) };

        match removed {
            Some(_) => {
                trace!("slot {} retired", key.index);
                true
            }
            None => false,
        }
    }

    /// Asks the kernel to cancel the operation submitted under
    /// `user_data`. A miss (already completed) is harmless.
    pub(crate) fn cancel(&self, user_data: u64) {
        let entry = opcode::AsyncCancel::new(user_data)
            .build()
            .user_data(operation::encode_bare(OpKind::Cancel));

        if let Err(err) = self.submit_entry(&entry) {
            warn!("cancel submission failed: {err}");
        }
    }

    /// Pushes one submission entry and flushes it to the kernel.
    ///
    /// The caller guarantees any buffer the entry points at stays valid
    /// until the matching completion is observed.
    pub(crate) fn submit_entry(&self, entry: &squeue::Entry) -> io::Result<()> {
        {
            let _guard = self.sq_lock.lock();
            let mut sq = unsafe { self.ring.submission_shared() };
            if sq.is_full() {
                // Flush so the kernel frees submission slots.
                self.enter()?;
                sq.sync();
            }
            if unsafe { sq.push(entry) }.is_err() {
                return Err(io::Error::other("submission queue full"));
            }
        }

        self.enter()?;
        Ok(())
    }

    pub(crate) fn config(&self) -> &Config {
        &self.cfg
    }

    /// Pops one completion, blocking in the kernel while the queue is
    /// empty. No lock is held across the kernel wait, so submitters and
    /// sibling workers always make progress.
    fn wait_one(&self) -> io::Result<cqueue::Entry> {
        loop {
            {
                let _guard = self.cq_lock.lock();
                let mut cq = unsafe { self.ring.completion_shared() };
                if let Some(cqe) = cq.next() {
                    return Ok(cqe);
                }
            }

            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => {}
                // Completion-queue overflow pressure; resolves as entries
                // are popped.
                Err(err) if err.raw_os_error() == Some(libc::EBUSY) => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn dispatch(&self, cqe: cqueue::Entry) {
        let (kind, key) = operation::decode(cqe.user_data());
        let Some(kind) = kind else {
            warn!(
                "completion with unknown routing word {:#018x}",
                cqe.user_data()
            );
            return;
        };
        let outcome = operation::decode_result(cqe.result());
        trace!(
            "completion kind={kind:?} slot={} result={}",
            key.index,
            cqe.result()
        );

        match kind {
            OpKind::Wake => {}
            OpKind::Cancel => {}
            OpKind::Posted => {
                let task = { self.registry.lock().take_posted(key) };
                if let Some(task) = task {
                    task(self, outcome);
                }
            }
            OpKind::Accept => {
                let listener = { self.registry.lock().listener(key) };
                match listener {
                    Some(listener) => listener.on_accept_complete(self, outcome),
                    None => {
                        // The listener retired first; the accepted socket
                        // must not leak.
                        if let Ok(fd) = outcome {
                            socket::close_raw(fd as RawFd);
                            debug!("accept for retired listener dropped");
                        }
                    }
                }
            }
            OpKind::Connect => {
                let connection = { self.registry.lock().connection(key) };
                if let Some(connection) = connection {
                    connection.on_connect_complete(self, outcome);
                }
            }
            OpKind::Read => {
                let connection = { self.registry.lock().connection(key) };
                if let Some(connection) = connection {
                    connection.on_read_complete(self, outcome);
                }
            }
            OpKind::Write => {
                let connection = { self.registry.lock().connection(key) };
                if let Some(connection) = connection {
                    connection.on_send_complete(self, outcome);
                }
            }
        }
    }

    fn post_wake(&self) {
        let entry = opcode::Nop::new()
            .build()
            .user_data(operation::encode_bare(OpKind::Wake));

        if let Err(err) = self.submit_entry(&entry) {
            warn!("wake submission failed: {err}");
        }
    }

    /// `io_uring_enter`, retried through signal interruptions.
    fn enter(&self) -> io::Result<usize> {
        loop {
            match self.ring.submit() {
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => {}
                other => return other,
            }
        }
    }
}
