//! Keyed registry of live listeners, connections, and posted tasks.
//!
//! Slots are recycled through a free list; each recycle bumps the slot's
//! generation, so a routing key minted for a retired occupant no longer
//! resolves. The registry also holds the shared ownership that keeps a
//! component alive while the kernel still references its buffers.

use crate::error::{Error, RegistrationError};
use crate::net::connection::Connection;
use crate::net::listener::Listener;
use crate::operation::GENERATION_MASK;
use crate::reactor::core::Reactor;

use std::collections::HashSet;
use std::os::fd::RawFd;
use std::sync::Arc;

/// A queued callback delivered through the completion loop.
pub(crate) type PostedTask = Box<dyn FnOnce(&Reactor, Result<u32, Error>) + Send>;

/// Routing key handed out at registration: slot index plus the generation
/// the slot had when the component moved in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Key {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

pub(crate) enum Entry {
    Listener(Arc<Listener>),
    Connection(Arc<Connection>),
    Posted(PostedTask),
}

struct Slot {
    generation: u32,
    fd: Option<RawFd>,
    entry: Option<Entry>,
}

pub(crate) struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    fds: HashSet<RawFd>,
    live: usize,
    capacity: usize,
}

impl Registry {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            fds: HashSet::new(),
            live: 0,
            capacity,
        }
    }

    /// Adds an entry, minting the key completions will route through.
    ///
    /// On rejection the entry is handed back so the caller can fail it
    /// through its own path.
    pub(crate) fn insert(
        &mut self,
        entry: Entry,
        fd: Option<RawFd>,
    ) -> Result<Key, (RegistrationError, Entry)> {
        if self.live >= self.capacity {
            return Err((RegistrationError::Exhausted, entry));
        }

        if let Some(fd) = fd {
            if !self.fds.insert(fd) {
                return Err((RegistrationError::AlreadyRegistered, entry));
            }
        }

        let index = if let Some(index) = self.free.pop() {
            index
        } else {
            self.slots.push(Slot {
                generation: 0,
                fd: None,
                entry: None,
            });
            (self.slots.len() - 1) as u32
        };

        let slot = &mut self.slots[index as usize];
        slot.fd = fd;
        slot.entry = Some(entry);
        self.live += 1;

        Ok(Key {
            index,
            generation: slot.generation,
        })
    }

    pub(crate) fn listener(&self, key: Key) -> Option<Arc<Listener>> {
        match &self.occupied(key)?.entry {
            Some(Entry::Listener(listener)) => Some(Arc::clone(listener)),
            _ => None,
        }
    }

    pub(crate) fn connection(&self, key: Key) -> Option<Arc<Connection>> {
        match &self.occupied(key)?.entry {
            Some(Entry::Connection(connection)) => Some(Arc::clone(connection)),
            _ => None,
        }
    }

    /// Removes and returns a posted task. Leaves non-task entries alone.
    pub(crate) fn take_posted(&mut self, key: Key) -> Option<PostedTask> {
        if !matches!(self.occupied(key)?.entry, Some(Entry::Posted(_))) {
            return None;
        }

        match self.remove(key) {
            Some(Entry::Posted(task)) => Some(task),
            _ => None,
        }
    }

    /// Frees a slot, recycling it under the next generation.
    pub(crate) fn remove(&mut self, key: Key) -> Option<Entry> {
        self.occupied(key)?;

        let slot = &mut self.slots[key.index as usize];
        let entry = slot.entry.take();
        if let Some(fd) = slot.fd.take() {
            self.fds.remove(&fd);
        }
        slot.generation = (slot.generation + 1) & GENERATION_MASK;

        self.free.push(key.index);
        self.live -= 1;

        entry
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    fn occupied(&self, key: Key) -> Option<&Slot> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation & GENERATION_MASK || slot.entry.is_none() {
            return None;
        }

        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::{Entry, Key, Registry, RegistrationError};
    use std::os::fd::RawFd;

    fn task_entry() -> Entry {
        Entry::Posted(Box::new(|_, _| {}))
    }

    fn must_insert(registry: &mut Registry, fd: Option<RawFd>) -> Key {
        match registry.insert(task_entry(), fd) {
            Ok(key) => key,
            Err((err, _)) => panic!("insert failed: {err}"),
        }
    }

    #[test]
    fn insert_then_take_round_trips() {
        let mut registry = Registry::with_capacity(4);
        let key = must_insert(&mut registry, None);

        assert_eq!(registry.len(), 1);
        assert!(registry.take_posted(key).is_some());
        assert_eq!(registry.len(), 0);
        assert!(registry.take_posted(key).is_none());
    }

    #[test]
    fn stale_generation_does_not_resolve() {
        let mut registry = Registry::with_capacity(4);
        let old = must_insert(&mut registry, None);
        registry.remove(old);

        let reused = must_insert(&mut registry, None);
        assert_eq!(reused.index, old.index);
        assert_ne!(reused.generation, old.generation);
        assert!(registry.take_posted(old).is_none());
        assert!(registry.take_posted(reused).is_some());
    }

    #[test]
    fn duplicate_fd_is_rejected() {
        let mut registry = Registry::with_capacity(4);
        let key = must_insert(&mut registry, Some(9));

        let err = registry.insert(task_entry(), Some(9));
        assert!(matches!(
            err,
            Err((RegistrationError::AlreadyRegistered, _))
        ));

        // Releasing the slot frees the descriptor for re-registration.
        registry.remove(key);
        assert!(registry.insert(task_entry(), Some(9)).is_ok());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut registry = Registry::with_capacity(2);
        must_insert(&mut registry, None);
        must_insert(&mut registry, None);

        let err = registry.insert(task_entry(), None);
        assert!(matches!(err, Err((RegistrationError::Exhausted, _))));
    }

    #[test]
    fn mismatched_variant_is_left_in_place() {
        let mut registry = Registry::with_capacity(4);
        let key = must_insert(&mut registry, None);

        assert!(registry.listener(key).is_none());
        assert!(registry.connection(key).is_none());
        assert_eq!(registry.len(), 1);
    }
}
