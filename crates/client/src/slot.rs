//! Transfer slots
//!
//! A slot is a fixed-capacity buffer plus the length of its current
//! payload. Slots move by value between the feeder, the transport and the
//! event loop, so only the current owner can touch the buffer.

/// Which data path a slot belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host
    Inbound,
    /// Host to device
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Free,
    Busy,
}

#[derive(Debug)]
pub struct TransferSlot {
    id: usize,
    direction: Direction,
    buf: Box<[u8]>,
    len: usize,
    status: SlotStatus,
}

impl TransferSlot {
    pub fn new(id: usize, direction: Direction, capacity: usize) -> Self {
        Self {
            id,
            direction,
            buf: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            status: SlotStatus::Free,
        }
    }

    /// `count` slots with ids `0..count`
    pub fn pool(direction: Direction, count: usize, capacity: usize) -> Vec<Self> {
        (0..count)
            .map(|id| Self::new(id, direction, capacity))
            .collect()
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn status(&self) -> SlotStatus {
        self.status
    }

    /// Claim the slot for a submission carrying `len` bytes
    pub fn mark_busy(&mut self, len: usize) {
        debug_assert_eq!(self.status, SlotStatus::Free, "slot {} double-claimed", self.id);
        self.len = len.min(self.buf.len());
        self.status = SlotStatus::Busy;
    }

    /// Return the slot to its pool
    pub fn mark_free(&mut self) {
        self.len = 0;
        self.status = SlotStatus::Free;
    }

    /// Record how many bytes a completed transfer actually moved
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.buf.len());
    }

    /// Current payload
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Whole buffer, for filling before submission
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Buffer pointer handed to the transport while the slot is in flight
    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buf.as_mut_ptr()
    }
}
