//! # Reply Rings
//!
//! In performant mode firmware does not post completions to a polled FIFO;
//! it DMA-writes them into per-vector reply rings. Each entry carries the
//! completed tag and a cycle bit. Firmware writes entries with the current
//! cycle phase and flips the phase every wrap; the consumer chases the ring
//! expecting the current phase, so a stale entry from the previous lap is
//! never mistaken for a fresh one.

use static_assertions::const_assert_eq;

use ciss_hal::dma::{DmaAllocator, DmaBuffer};
use ciss_hal::HalResult;

/// Wire layout of one reply ring entry
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ReplyEntryLayout {
    /// Completed tag, raw
    pub tag: u32,
    /// Entry flags; bit 0 is the producer cycle phase
    pub flags: u32,
}

const_assert_eq!(core::mem::size_of::<ReplyEntryLayout>(), 8);

/// Size of one serialized reply entry
pub const REPLY_ENTRY_SIZE: usize = 8;

const CYCLE_BIT: u32 = 1 << 0;

/// One DMA-backed completion ring and its consumer cursor
pub struct ReplyRing {
    buf: DmaBuffer,
    depth: usize,
    next: usize,
    expect_phase: bool,
}

impl ReplyRing {
    /// Allocate a zeroed ring of `depth` entries
    pub fn new(dma: &dyn DmaAllocator, depth: usize) -> HalResult<Self> {
        let buf = dma.alloc(depth * REPLY_ENTRY_SIZE)?;
        Ok(Self { buf, depth, next: 0, expect_phase: true })
    }

    /// Entries the ring can hold
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The ring's DMA buffer; firmware (and firmware simulations) write
    /// entries here
    pub fn buffer(&self) -> &DmaBuffer {
        &self.buf
    }

    /// Consumer cursor, written back to hardware after a drain
    pub fn consumed_index(&self) -> u32 {
        self.next as u32
    }

    /// Pop the next completion if one is present at the current phase
    pub fn pop(&mut self) -> Option<u32> {
        let offset = self.next * REPLY_ENTRY_SIZE;
        let flags = self.buf.read_u32(offset + 4).ok()?;
        let phase = flags & CYCLE_BIT != 0;
        if phase != self.expect_phase {
            return None;
        }
        let tag = self.buf.read_u32(offset).ok()?;
        self.next += 1;
        if self.next == self.depth {
            self.next = 0;
            self.expect_phase = !self.expect_phase;
        }
        Some(tag)
    }

    /// Producer-side helper: write an entry the way firmware would.
    /// Used by board simulations and tests; the driver itself never
    /// produces into a reply ring.
    pub fn produce(buf: &DmaBuffer, index: usize, tag: u32, phase: bool) {
        let offset = index * REPLY_ENTRY_SIZE;
        let flags = if phase { CYCLE_BIT } else { 0 };
        let _ = buf.write_u32(offset, tag);
        let _ = buf.write_u32(offset + 4, flags);
    }
}

impl core::fmt::Debug for ReplyRing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReplyRing")
            .field("depth", &self.depth)
            .field("next", &self.next)
            .field("expect_phase", &self.expect_phase)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciss_hal::dma::HeapDmaAllocator;

    #[test]
    fn test_empty_ring_yields_nothing() {
        let dma = HeapDmaAllocator::default();
        let mut ring = ReplyRing::new(&dma, 4).unwrap();
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_fifo_order_within_ring() {
        let dma = HeapDmaAllocator::default();
        let mut ring = ReplyRing::new(&dma, 4).unwrap();
        let buf = ring.buffer().clone();
        ReplyRing::produce(&buf, 0, 0x10, true);
        ReplyRing::produce(&buf, 1, 0x20, true);
        ReplyRing::produce(&buf, 2, 0x30, true);
        assert_eq!(ring.pop(), Some(0x10));
        assert_eq!(ring.pop(), Some(0x20));
        assert_eq!(ring.pop(), Some(0x30));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_wrap_flips_expected_phase() {
        let dma = HeapDmaAllocator::default();
        let mut ring = ReplyRing::new(&dma, 2).unwrap();
        let buf = ring.buffer().clone();
        // First lap at phase 1.
        ReplyRing::produce(&buf, 0, 0x1, true);
        ReplyRing::produce(&buf, 1, 0x2, true);
        assert_eq!(ring.pop(), Some(0x1));
        assert_eq!(ring.pop(), Some(0x2));
        // Stale phase-1 entries must not be consumed again.
        assert_eq!(ring.pop(), None);
        // Second lap at phase 0.
        ReplyRing::produce(&buf, 0, 0x3, false);
        assert_eq!(ring.pop(), Some(0x3));
    }

    #[test]
    fn test_consumed_index_tracks_cursor() {
        let dma = HeapDmaAllocator::default();
        let mut ring = ReplyRing::new(&dma, 4).unwrap();
        let buf = ring.buffer().clone();
        assert_eq!(ring.consumed_index(), 0);
        ReplyRing::produce(&buf, 0, 0x1, true);
        let _ = ring.pop();
        assert_eq!(ring.consumed_index(), 1);
    }
}
