//! Slice buffer: an ordered sequence of reference-counted byte ranges.
//!
//! Uses `bytes::Bytes` for zero-copy range management. A [`SliceBuffer`] is
//! the unit of data exchange between the secure endpoint, the framers, and
//! the wrapped transport: append and swap are O(1), and splitting a prefix
//! only clones range handles (the underlying storage is shared).

use std::collections::VecDeque;

use bytes::Bytes;

/// Ordered sequence of byte ranges with O(1) amortized append, prefix-split,
/// and swap. Length is the sum of range lengths.
#[derive(Debug, Default)]
pub struct SliceBuffer {
    slices: VecDeque<Bytes>,
    len: usize,
}

impl SliceBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            slices: VecDeque::new(),
            len: 0,
        }
    }

    /// Total byte length across all slices.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slices.
    #[inline]
    pub fn count(&self) -> usize {
        self.slices.len()
    }

    /// Indexed slice access.
    ///
    /// # Panics
    ///
    /// Panics if `index >= count()`.
    #[inline]
    pub fn slice_at(&self, index: usize) -> &Bytes {
        &self.slices[index]
    }

    /// Append a slice, taking ownership of the range handle.
    ///
    /// Zero-length slices are dropped.
    pub fn append(&mut self, slice: Bytes) {
        if slice.is_empty() {
            return;
        }
        self.len += slice.len();
        self.slices.push_back(slice);
    }

    /// Append by copying raw bytes into a freshly owned slice.
    pub fn append_copy(&mut self, data: &[u8]) {
        self.append(Bytes::copy_from_slice(data));
    }

    /// Drop all slices, releasing their range handles.
    pub fn reset(&mut self) {
        self.slices.clear();
        self.len = 0;
    }

    /// Exchange contents with another buffer.
    pub fn swap(&mut self, other: &mut SliceBuffer) {
        std::mem::swap(self, other);
    }

    /// Split off the first `n` bytes as a new buffer, mutating `self`.
    ///
    /// A slice straddling the boundary is split; both halves share storage.
    ///
    /// # Panics
    ///
    /// Panics if `n > len()`.
    pub fn split_prefix(&mut self, n: usize) -> SliceBuffer {
        assert!(n <= self.len, "split_prefix past end of buffer");
        let mut head = SliceBuffer::new();
        let mut remaining = n;
        while remaining > 0 {
            // Invariant: len() counts only non-empty slices, so front exists.
            let mut slice = self.slices.pop_front().unwrap();
            self.len -= slice.len();
            if slice.len() <= remaining {
                remaining -= slice.len();
                head.append(slice);
            } else {
                head.append(slice.split_to(remaining));
                remaining = 0;
                self.len += slice.len();
                self.slices.push_front(slice);
            }
        }
        head
    }

    /// Move the first `n` bytes into `dst`, preserving order.
    ///
    /// # Panics
    ///
    /// Panics if `n > len()`.
    pub fn move_first_n_into(&mut self, n: usize, dst: &mut SliceBuffer) {
        let mut head = self.split_prefix(n);
        while let Some(slice) = head.slices.pop_front() {
            dst.append(slice);
        }
    }

    /// Iterate over the slices in order.
    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.slices.iter()
    }

    /// Flatten into a single contiguous vector. Intended for small buffers;
    /// copies every byte.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for slice in &self.slices {
            out.extend_from_slice(slice);
        }
        out
    }
}

impl From<Vec<Bytes>> for SliceBuffer {
    fn from(slices: Vec<Bytes>) -> Self {
        let mut buf = SliceBuffer::new();
        for slice in slices {
            buf.append(slice);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_len() {
        let mut buf = SliceBuffer::new();
        assert!(buf.is_empty());

        buf.append(Bytes::from_static(b"hello"));
        buf.append_copy(b" world");

        assert_eq!(buf.len(), 11);
        assert_eq!(buf.count(), 2);
        assert_eq!(buf.to_vec(), b"hello world");
    }

    #[test]
    fn test_empty_slices_are_dropped() {
        let mut buf = SliceBuffer::new();
        buf.append(Bytes::new());
        assert_eq!(buf.count(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reset() {
        let mut buf = SliceBuffer::new();
        buf.append_copy(b"data");
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.count(), 0);
    }

    #[test]
    fn test_swap() {
        let mut a = SliceBuffer::new();
        let mut b = SliceBuffer::new();
        a.append_copy(b"aaa");
        b.append_copy(b"bb");

        a.swap(&mut b);
        assert_eq!(a.to_vec(), b"bb");
        assert_eq!(b.to_vec(), b"aaa");
    }

    #[test]
    fn test_split_prefix_on_boundary() {
        let mut buf = SliceBuffer::new();
        buf.append_copy(b"abc");
        buf.append_copy(b"def");

        let head = buf.split_prefix(3);
        assert_eq!(head.to_vec(), b"abc");
        assert_eq!(buf.to_vec(), b"def");
        assert_eq!(buf.count(), 1);
    }

    #[test]
    fn test_split_prefix_mid_slice() {
        let mut buf = SliceBuffer::new();
        buf.append_copy(b"abcdef");

        let head = buf.split_prefix(2);
        assert_eq!(head.to_vec(), b"ab");
        assert_eq!(buf.to_vec(), b"cdef");
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_split_prefix_everything() {
        let mut buf = SliceBuffer::new();
        buf.append_copy(b"abc");
        let head = buf.split_prefix(3);
        assert_eq!(head.to_vec(), b"abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_move_first_n_into() {
        let mut src = SliceBuffer::new();
        let mut dst = SliceBuffer::new();
        src.append_copy(b"0123");
        src.append_copy(b"4567");
        dst.append_copy(b"pre-");

        src.move_first_n_into(6, &mut dst);
        assert_eq!(dst.to_vec(), b"pre-012345");
        assert_eq!(src.to_vec(), b"67");
    }

    #[test]
    fn test_shared_storage_after_split() {
        let mut buf = SliceBuffer::new();
        buf.append(Bytes::from_static(b"shared-storage"));

        let head = buf.split_prefix(6);
        // Both halves read correctly even though they alias the same range.
        assert_eq!(head.to_vec(), b"shared");
        assert_eq!(buf.to_vec(), b"-storage");
    }
}
