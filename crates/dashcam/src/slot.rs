//! Buffer slots carried between the capture stage and the delivery worker

use std::fmt;
use std::io::{self, Read};

/// Flags attached to a delivered buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotFlags(pub u8);

impl SlotFlags {
    /// No further payload follows for the current still.
    pub const END_OF_FRAME: u8 = 0b0000_0001;
    /// The producer failed part-way through the still.
    pub const TRANSMISSION_FAILED: u8 = 0b0000_0010;

    pub fn is_end_of_frame(&self) -> bool {
        self.0 & Self::END_OF_FRAME != 0
    }

    pub fn is_transmission_failed(&self) -> bool {
        self.0 & Self::TRANSMISSION_FAILED != 0
    }

    /// Either marker ends the session.
    pub fn is_terminal(&self) -> bool {
        self.0 & (Self::END_OF_FRAME | Self::TRANSMISSION_FAILED) != 0
    }

    pub fn set_end_of_frame(&mut self) {
        self.0 |= Self::END_OF_FRAME;
    }

    pub fn set_transmission_failed(&mut self) {
        self.0 |= Self::TRANSMISSION_FAILED;
    }

    /// Create flags with end-of-frame set
    pub fn end_of_frame() -> Self {
        Self(Self::END_OF_FRAME)
    }
}

/// Which party currently owns a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Sitting in the pool's free queue.
    Free,
    /// Submitted to the stage (or queued on the delivery channel).
    InFlight,
    /// Being handled by the delivery worker.
    InDelivery,
}

/// A fixed-capacity buffer recycled between pipeline stages.
///
/// Slots are not `Clone`: at any instant exactly one owner holds each one,
/// and the pool's accounting relies on that.
pub struct BufferSlot {
    index: usize,
    data: Box<[u8]>,
    len: usize,
    flags: SlotFlags,
    state: SlotState,
}

impl BufferSlot {
    pub(crate) fn new(index: usize, capacity: usize) -> Self {
        Self {
            index,
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            flags: SlotFlags::default(),
            state: SlotState::Free,
        }
    }

    /// Position of this slot within its pool
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes produced into this slot
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn flags(&self) -> SlotFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: SlotFlags) {
        self.flags = flags;
    }

    pub fn flags_mut(&mut self) -> &mut SlotFlags {
        &mut self.flags
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SlotState) {
        self.state = state;
    }

    /// Copy as much of `src` as fits after the current payload.
    ///
    /// Returns the number of bytes taken.
    pub fn fill(&mut self, src: &[u8]) -> usize {
        let room = self.data.len() - self.len;
        let n = room.min(src.len());
        self.data[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    /// Read from `reader` until the slot is full or the reader hits EOF.
    ///
    /// Returns `true` if EOF was reached.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> io::Result<bool> {
        while self.len < self.data.len() {
            match reader.read(&mut self.data[self.len..]) {
                Ok(0) => return Ok(true),
                Ok(n) => self.len += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Drop the payload and flags before the slot is reused
    pub(crate) fn reset(&mut self) {
        self.len = 0;
        self.flags = SlotFlags::default();
    }
}

impl fmt::Debug for BufferSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSlot")
            .field("index", &self.index)
            .field("capacity", &self.data.len())
            .field("len", &self.len)
            .field("flags", &self.flags)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn flags_terminal_on_either_marker() {
        let mut flags = SlotFlags::default();
        assert!(!flags.is_terminal());

        flags.set_transmission_failed();
        assert!(flags.is_terminal());
        assert!(!flags.is_end_of_frame());

        assert!(SlotFlags::end_of_frame().is_terminal());
    }

    #[test]
    fn fill_stops_at_capacity() {
        let mut slot = BufferSlot::new(0, 4);
        assert_eq!(slot.fill(b"abcdef"), 4);
        assert_eq!(slot.payload(), b"abcd");
        assert_eq!(slot.fill(b"x"), 0);
    }

    #[test]
    fn fill_from_reports_eof() {
        let mut reader = Cursor::new(b"hello world".to_vec());

        let mut first = BufferSlot::new(0, 8);
        assert!(!first.fill_from(&mut reader).unwrap());
        assert_eq!(first.payload(), b"hello wo");

        let mut second = BufferSlot::new(1, 8);
        assert!(second.fill_from(&mut reader).unwrap());
        assert_eq!(second.payload(), b"rld");
    }

    #[test]
    fn fill_from_exact_boundary_needs_another_read_for_eof() {
        let mut reader = Cursor::new(b"1234".to_vec());
        let mut slot = BufferSlot::new(0, 4);
        assert!(!slot.fill_from(&mut reader).unwrap());

        let mut tail = BufferSlot::new(1, 4);
        assert!(tail.fill_from(&mut reader).unwrap());
        assert!(tail.is_empty());
    }

    #[test]
    fn reset_clears_payload_and_flags() {
        let mut slot = BufferSlot::new(3, 8);
        slot.fill(b"data");
        slot.set_flags(SlotFlags::end_of_frame());
        slot.reset();
        assert!(slot.is_empty());
        assert_eq!(slot.flags(), SlotFlags::default());
        assert_eq!(slot.index(), 3);
    }
}
