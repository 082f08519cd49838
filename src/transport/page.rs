//! Fixed-capacity page

use bytes::BytesMut;

/// Opaque page identifier, reused when the page is recycled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u32);

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "page-{}", self.0)
    }
}

/// One reusable buffer with a write cursor
///
/// The buffer is allocated once; `reset` rewinds the cursor without freeing
/// it. `len()` is the write offset and never exceeds `capacity()`.
#[derive(Debug)]
pub struct Page {
    id: PageId,
    buf: BytesMut,
    capacity: usize,
}

impl Page {
    pub fn new(id: PageId, capacity: usize) -> Self {
        Self {
            id,
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    /// Copies as much of `data` as fits and returns the number of bytes taken
    ///
    /// The caller resubmits `data[taken..]` to the next page.
    pub fn append(&mut self, data: &[u8]) -> usize {
        debug_assert!(!data.is_empty(), "append called with an empty slice");

        let taken = data.len().min(self.remaining());
        self.buf.extend_from_slice(&data[..taken]);
        taken
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Write offset
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() == self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}
