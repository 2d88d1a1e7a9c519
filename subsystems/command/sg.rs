//! # Scatter/Gather Lists
//!
//! Each command carries a small inline scatter/gather array; transfers with
//! more segments spill into a per-slot chain block that hardware follows via
//! a chain descriptor planted in the last inline position. Chain blocks are
//! pre-allocated alongside their pool slot, so building a list never
//! allocates.

use arrayvec::ArrayVec;
use static_assertions::const_assert_eq;

use ciss_hal::dma::DmaBuffer;
use ciss_hal::BusAddr;

use crate::{CommandError, CommandResult};

/// Scatter/gather entries embedded directly in a command block
pub const MAX_INLINE_SG: usize = 8;

/// Scatter/gather entries a chain block can hold
pub const MAX_CHAIN_SG: usize = 64;

bitflags::bitflags! {
    /// Flags in a scatter/gather descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SgFlags: u32 {
        /// This descriptor points at a block of further descriptors
        const CHAIN = 1 << 0;
        /// Final descriptor of the transfer
        const LAST = 1 << 1;
    }
}

/// One scatter/gather descriptor as hardware reads it
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    /// Bus address of the data segment (or chain block)
    pub addr: u64,
    /// Segment length in bytes
    pub len: u32,
    /// Descriptor flags, [`SgFlags`]
    pub flags: u32,
}

const_assert_eq!(core::mem::size_of::<SgEntry>(), 16);

/// Size of one serialized descriptor
pub const SG_ENTRY_SIZE: usize = 16;

impl SgEntry {
    /// Descriptor for a plain data segment
    pub fn segment(addr: BusAddr, len: u32) -> Self {
        Self { addr: addr.as_u64(), len, flags: SgFlags::empty().bits() }
    }

    /// Descriptor pointing at a chain block holding `len` bytes of
    /// further descriptors
    pub fn chain(addr: BusAddr, len: u32) -> Self {
        Self { addr: addr.as_u64(), len, flags: SgFlags::CHAIN.bits() }
    }

    /// Mark this descriptor as the last of the transfer
    pub fn mark_last(&mut self) {
        self.flags |= SgFlags::LAST.bits();
    }

    /// Serialize to the wire layout
    pub fn to_bytes(&self) -> [u8; SG_ENTRY_SIZE] {
        let mut out = [0u8; SG_ENTRY_SIZE];
        out[0..8].copy_from_slice(&self.addr.to_le_bytes());
        out[8..12].copy_from_slice(&self.len.to_le_bytes());
        out[12..16].copy_from_slice(&self.flags.to_le_bytes());
        out
    }
}

/// A fully built scatter/gather list for one command
#[derive(Debug, Clone, Default)]
pub struct SgList {
    inline: ArrayVec<SgEntry, MAX_INLINE_SG>,
    total_segments: usize,
    total_bytes: u64,
    chained: bool,
}

impl SgList {
    /// An empty list (no data phase)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a list from data segments, spilling into `chain` when the
    /// inline array is too small.
    ///
    /// Fails with [`CommandError::TooManySegments`] when the overflow does
    /// not fit the chain block either.
    pub fn build(segments: &[(BusAddr, u32)], chain: Option<&DmaBuffer>) -> CommandResult<Self> {
        let total_segments = segments.len();
        let total_bytes = segments.iter().map(|(_, len)| *len as u64).sum();

        if total_segments <= MAX_INLINE_SG {
            let mut inline = ArrayVec::new();
            for (addr, len) in segments {
                inline.push(SgEntry::segment(*addr, *len));
            }
            if let Some(last) = inline.last_mut() {
                last.mark_last();
            }
            return Ok(Self { inline, total_segments, total_bytes, chained: false });
        }

        // Overflow: last inline position becomes the chain descriptor.
        let chain = chain.ok_or(CommandError::TooManySegments)?;
        let spill = &segments[MAX_INLINE_SG - 1..];
        if spill.len() > MAX_CHAIN_SG || spill.len() * SG_ENTRY_SIZE > chain.len() {
            return Err(CommandError::TooManySegments);
        }

        for (i, (addr, len)) in spill.iter().enumerate() {
            let mut entry = SgEntry::segment(*addr, *len);
            if i == spill.len() - 1 {
                entry.mark_last();
            }
            chain
                .write_bytes(i * SG_ENTRY_SIZE, &entry.to_bytes())
                .map_err(|_| CommandError::TooManySegments)?;
        }

        let mut inline = ArrayVec::new();
        for (addr, len) in &segments[..MAX_INLINE_SG - 1] {
            inline.push(SgEntry::segment(*addr, *len));
        }
        inline.push(SgEntry::chain(
            chain.bus_addr(),
            (spill.len() * SG_ENTRY_SIZE) as u32,
        ));

        Ok(Self { inline, total_segments, total_bytes, chained: true })
    }

    /// Descriptors embedded in the command block itself
    pub fn inline_entries(&self) -> &[SgEntry] {
        &self.inline
    }

    /// Number of data segments across inline and chain
    pub fn total_segments(&self) -> usize {
        self.total_segments
    }

    /// Bytes the transfer covers
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Whether a chain block is in play
    pub fn is_chained(&self) -> bool {
        self.chained
    }

    /// Drop all entries; the list can be rebuilt for the next use of the slot
    pub fn reset(&mut self) {
        self.inline.clear();
        self.total_segments = 0;
        self.total_bytes = 0;
        self.chained = false;
    }
}
