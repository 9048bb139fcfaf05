//! Growable byte buffer with independent read and write cursors.
//!
//! Backs the per-connection read and send paths. The kernel fills the spare
//! tail of the storage during a receive, so the storage address must stay
//! stable while an operation is outstanding; all growth happens between
//! operations, never while one is in flight.

/// A contiguous byte buffer that grows on demand and rewinds without
/// deallocating.
///
/// Two cursors track the unread region: bytes are appended at the write
/// cursor and drained from the read cursor. When the last unread byte is
/// consumed both cursors rewind to the start so the storage is reused.
///
/// # Example
/// ```ignore
/// let mut buf = GrowableBuffer::new();
/// buf.write(b"ping");
/// assert_eq!(buf.data(), b"ping");
/// buf.consume(4);
/// assert!(buf.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct GrowableBuffer {
    storage: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl GrowableBuffer {
    /// Creates an empty buffer with no allocation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty buffer with `capacity` bytes pre-allocated.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Appends `data` after the last written byte, growing storage as needed.
    pub fn write(&mut self, data: &[u8]) {
        self.ensure_tail(data.len());
        self.storage[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    /// Copies unread bytes into `dst` and advances the read cursor.
    ///
    /// # Returns
    /// The number of bytes copied, at most `dst.len()`.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.len());
        dst[..count].copy_from_slice(&self.storage[self.read_pos..self.read_pos + count]);
        self.consume(count);

        count
    }

    /// The unread region.
    pub fn data(&self) -> &[u8] {
        &self.storage[self.read_pos..self.write_pos]
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// `true` when no unread bytes remain.
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// Total allocated storage in bytes.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Rewinds both cursors without deallocating storage.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Advances the read cursor past `count` bytes without copying them.
    ///
    /// Rewinds both cursors once the buffer drains.
    pub fn consume(&mut self, count: usize) {
        self.read_pos = (self.read_pos + count).min(self.write_pos);
        if self.read_pos == self.write_pos {
            self.reset();
        }
    }

    /// Exposes the writable tail, guaranteeing at least `min` spare bytes.
    ///
    /// The returned slice is where an in-progress receive lands; call
    /// [`Self::commit`] afterwards with the number of bytes actually filled.
    pub fn unfilled_mut(&mut self, min: usize) -> &mut [u8] {
        self.ensure_tail(min);

        &mut self.storage[self.write_pos..]
    }

    /// Marks `count` bytes of the writable tail as filled.
    pub fn commit(&mut self, count: usize) {
        self.write_pos = (self.write_pos + count).min(self.storage.len());
    }

    /// Moves the unread region out as an owned vector and rewinds.
    pub fn take_unread(&mut self) -> Vec<u8> {
        let out = self.data().to_vec();
        self.reset();

        out
    }

    fn ensure_tail(&mut self, min: usize) {
        let spare = self.storage.len() - self.write_pos;
        if spare < min {
            let grown = (self.write_pos + min).max(self.storage.len() * 2);
            self.storage.resize(grown, 0);
        }
    }
}
