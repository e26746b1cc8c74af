use std::collections::VecDeque;

/// Fixed-capacity input buffer for a connection.
///
/// Message callbacks see the readable region and consume any prefix of it;
/// unconsumed bytes persist across deliveries. After each delivery the
/// buffer is compacted so the spare region is contiguous for the next read.
pub struct InputBuf {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl InputBuf {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    /// The readable region: bytes received but not yet consumed.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Marks `n` bytes at the front of the readable region as consumed.
    ///
    /// # Panics
    ///
    /// Panics when `n` exceeds the readable length.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consuming more bytes than are buffered");
        self.start += n;
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() == self.data.len()
    }

    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.end..]
    }

    /// Commits `n` bytes just read into the spare region.
    pub(crate) fn fill(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.data.len());
        self.end += n;
    }

    /// Moves the unconsumed suffix to the front of the buffer.
    pub(crate) fn compact(&mut self) {
        if self.start > 0 {
            self.data.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }
}

/// Ordered queue of pending write buffers.
///
/// Unbounded; the connection watches the byte total against its high-water
/// mark. The front buffer may be partially written, tracked by an offset so
/// a partial write never copies or reallocates.
pub(crate) struct OutputQueue {
    buffers: VecDeque<Vec<u8>>,
    front_written: usize,
    total: usize,
}

impl OutputQueue {
    pub(crate) fn new() -> Self {
        Self {
            buffers: VecDeque::new(),
            front_written: 0,
            total: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Unwritten bytes across all queued buffers.
    pub(crate) fn total_bytes(&self) -> usize {
        self.total
    }

    pub(crate) fn push(&mut self, buffer: Vec<u8>) {
        self.total += buffer.len();
        self.buffers.push_back(buffer);
    }

    /// The unwritten remainder of the front buffer.
    pub(crate) fn front(&self) -> Option<&[u8]> {
        self.buffers.front().map(|b| &b[self.front_written..])
    }

    /// Records `n` bytes of the front buffer as written, popping it once
    /// fully drained.
    pub(crate) fn advance(&mut self, n: usize) {
        let front_len = self.buffers.front().map(|b| b.len()).unwrap_or(0);
        debug_assert!(self.front_written + n <= front_len);

        self.front_written += n;
        self.total -= n;

        if self.front_written == front_len {
            self.buffers.pop_front();
            self.front_written = 0;
        }
    }
}
