//! # Fast Command Pool and the Blocking Allocation Path
//!
//! The pool is a fixed slab of command blocks over one DMA-mapped region,
//! indexed by a bitmap. Allocation is a first-clear-bit scan and never
//! sleeps; exhaustion is reported to the caller, which signals "busy"
//! upward. The pool always keeps a few slots in reserve below the
//! hardware-reported maximum so internally generated management commands
//! can make progress while the midlayer has the advertised depth filled.
//!
//! Callers that may sleep use [`allocate_blocking`] instead: a standalone
//! DMA allocation per command, unrelated to the bitmap.
//!
//! The pool itself is not synchronized; the owning controller serializes
//! access with its per-controller lock, the same lock that orders every
//! command state transition.

use alloc::vec::Vec;

use ciss_hal::dma::DmaAllocator;

use crate::block::{CommandBlock, CommandKind, Slot};
use crate::sg::{MAX_CHAIN_SG, SG_ENTRY_SIZE};
use crate::tags::Tag;
use crate::{CommandError, CommandResult, ControllerId, BLOCK_STRIDE};

/// Pool geometry
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Slots backed by DMA-mapped block storage (the hardware maximum)
    pub total_slots: usize,
    /// Slots withheld from SCSI traffic for internal commands
    pub reserved_slots: usize,
    /// Bytes of chain storage per slot
    pub chain_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            total_slots: 32,
            reserved_slots: 4,
            chain_bytes: MAX_CHAIN_SG * SG_ENTRY_SIZE,
        }
    }
}

/// Fixed-size command block pool
pub struct CommandPool {
    slots: Vec<Option<CommandBlock>>,
    bitmap: Vec<u64>,
    total: usize,
    reserved: usize,
    allocated: usize,
}

impl CommandPool {
    /// Build the pool: one contiguous DMA region carved into block-stride
    /// slots, plus a pre-allocated chain block per slot (indexed by the
    /// same slot number, so slot ownership implies chain ownership).
    pub fn new(
        dma: &dyn DmaAllocator,
        owner: ControllerId,
        config: PoolConfig,
    ) -> CommandResult<Self> {
        if config.total_slots == 0 || config.reserved_slots >= config.total_slots {
            return Err(CommandError::PoolExhausted);
        }
        let region = dma
            .alloc(config.total_slots * BLOCK_STRIDE)
            .map_err(|_| CommandError::OutOfMemory)?;

        let mut slots = Vec::with_capacity(config.total_slots);
        for i in 0..config.total_slots {
            let block_region = region
                .subregion(i * BLOCK_STRIDE, BLOCK_STRIDE)
                .map_err(|_| CommandError::OutOfMemory)?;
            let chain = dma
                .alloc(config.chain_bytes)
                .map_err(|_| CommandError::OutOfMemory)?;
            slots.push(Some(CommandBlock::assemble(
                Slot::Pool(i as u16),
                Tag::for_slot(i),
                owner,
                block_region,
                Some(chain),
            )));
        }

        let words = config.total_slots.div_ceil(64);
        Ok(Self {
            slots,
            bitmap: alloc::vec![0u64; words],
            total: config.total_slots,
            reserved: config.reserved_slots,
            allocated: 0,
        })
    }

    /// Queue depth advertised upward; strictly below the hardware maximum
    pub fn usable_depth(&self) -> usize {
        self.total - self.reserved
    }

    /// Total slots including the internal reserve
    pub fn total_slots(&self) -> usize {
        self.total
    }

    /// Slots currently handed out
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    #[inline]
    fn bit_set(&mut self, i: usize) {
        self.bitmap[i / 64] |= 1 << (i % 64);
    }

    #[inline]
    fn bit_clear(&mut self, i: usize) {
        self.bitmap[i / 64] &= !(1 << (i % 64));
    }

    #[inline]
    fn bit_test(&self, i: usize) -> bool {
        self.bitmap[i / 64] & (1 << (i % 64)) != 0
    }

    /// Allocate a block for the given kind of work. SCSI traffic stops at
    /// the advertised depth; management and internal commands may dig into
    /// the reserve. Returns `None` on exhaustion; the caller must signal
    /// busy, never wait.
    pub fn allocate(&mut self, kind: CommandKind) -> Option<CommandBlock> {
        if matches!(kind, CommandKind::Scsi) && self.allocated >= self.usable_depth() {
            return None;
        }
        for i in 0..self.total {
            if !self.bit_test(i) {
                self.bit_set(i);
                self.allocated += 1;
                let block = self.slots[i].take();
                debug_assert!(block.is_some(), "bitmap and slot storage out of sync");
                return block;
            }
        }
        None
    }

    /// Return a block to its slot. Releasing a slot that is not currently
    /// allocated is a detectable error, never silent corruption.
    pub fn release(&mut self, mut block: CommandBlock) -> CommandResult<()> {
        let index = match block.slot() {
            Slot::Pool(i) => i as usize,
            Slot::Dynamic => return Err(CommandError::WrongPool),
        };
        if index >= self.total || !self.bit_test(index) || self.slots[index].is_some() {
            return Err(CommandError::NotAllocated);
        }
        block.reset_for_reuse();
        self.slots[index] = Some(block);
        self.bit_clear(index);
        self.allocated -= 1;
        Ok(())
    }
}

/// Allocate a standalone, DMA-backed command block for a path that may
/// sleep. Its tag is derived from the block's bus address and resolves by
/// in-flight scan, not pool index.
pub fn allocate_blocking(
    dma: &dyn DmaAllocator,
    owner: ControllerId,
) -> CommandResult<CommandBlock> {
    let region = dma.alloc(BLOCK_STRIDE).map_err(|_| CommandError::OutOfMemory)?;
    let chain = dma
        .alloc(MAX_CHAIN_SG * SG_ENTRY_SIZE)
        .map_err(|_| CommandError::OutOfMemory)?;
    let tag = Tag::for_bus_addr(region.bus_addr());
    Ok(CommandBlock::assemble(Slot::Dynamic, tag, owner, region, Some(chain)))
}

/// Release a blocking-path block, freeing its DMA storage immediately
pub fn release_blocking(block: CommandBlock) -> CommandResult<()> {
    match block.slot() {
        Slot::Dynamic => Ok(()), // storage drops with the block
        Slot::Pool(_) => Err(CommandError::WrongPool),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciss_hal::dma::HeapDmaAllocator;

    fn pool(total: usize, reserved: usize) -> CommandPool {
        let dma = HeapDmaAllocator::default();
        CommandPool::new(
            &dma,
            ControllerId::new(1),
            PoolConfig { total_slots: total, reserved_slots: reserved, ..Default::default() },
        )
        .unwrap()
    }

    #[test]
    fn test_exclusive_indices() {
        let mut p = pool(8, 2);
        let mut seen = alloc::vec::Vec::new();
        while let Some(b) = p.allocate(CommandKind::Internal) {
            let Slot::Pool(i) = b.slot() else { panic!() };
            assert!(!seen.iter().any(|(j, _)| *j == i), "index {} handed out twice", i);
            seen.push((i, b));
        }
        assert_eq!(seen.len(), 8);
        assert!(p.allocate(CommandKind::Internal).is_none());
    }

    #[test]
    fn test_scsi_stops_at_usable_depth() {
        let mut p = pool(8, 2);
        let mut held = alloc::vec::Vec::new();
        for _ in 0..6 {
            held.push(p.allocate(CommandKind::Scsi).unwrap());
        }
        // Advertised depth consumed; SCSI sees exhaustion...
        assert!(p.allocate(CommandKind::Scsi).is_none());
        // ...while internal commands still have headroom.
        assert!(p.allocate(CommandKind::Internal).is_some());
        assert!(p.allocate(CommandKind::Management).is_some());
        assert!(p.allocate(CommandKind::Internal).is_none());
        for b in held {
            p.release(b).unwrap();
        }
    }

    #[test]
    fn test_release_makes_slot_reusable() {
        let mut p = pool(4, 1);
        let a = p.allocate(CommandKind::Scsi).unwrap();
        let tag = a.tag();
        p.release(a).unwrap();
        // First-clear-bit scan hands the same slot back.
        let b = p.allocate(CommandKind::Scsi).unwrap();
        assert_eq!(b.tag(), tag);
        assert_eq!(b.state(), crate::CommandState::Created);
    }

    #[test]
    fn test_release_of_unallocated_detected() {
        let mut p1 = pool(4, 1);
        let mut p2 = pool(4, 1);
        let foreign = p2.allocate(CommandKind::Scsi).unwrap();
        // Same index, but p1 never allocated it.
        assert_eq!(p1.release(foreign).unwrap_err(), CommandError::NotAllocated);
    }

    #[test]
    fn test_tag_bijection_over_pool() {
        let mut p = pool(32, 4);
        let mut held = alloc::vec::Vec::new();
        while let Some(b) = p.allocate(CommandKind::Internal) {
            let Slot::Pool(i) = b.slot() else { panic!() };
            assert_eq!(b.tag().slot_index(), Some(i as usize));
            held.push(b);
        }
        assert_eq!(held.len(), 32);
    }

    #[test]
    fn test_blocking_allocation() {
        let dma = HeapDmaAllocator::default();
        let b = allocate_blocking(&dma, ControllerId::new(1)).unwrap();
        assert_eq!(b.slot(), Slot::Dynamic);
        assert!(!b.tag().is_direct());
        release_blocking(b).unwrap();
    }

    #[test]
    fn test_blocking_release_rejects_pool_block() {
        let mut p = pool(4, 1);
        let b = p.allocate(CommandKind::Scsi).unwrap();
        assert_eq!(release_blocking(b).unwrap_err(), CommandError::WrongPool);
    }

    #[test]
    fn test_degenerate_geometry_rejected() {
        let dma = HeapDmaAllocator::default();
        let bad = PoolConfig { total_slots: 4, reserved_slots: 4, ..Default::default() };
        assert!(CommandPool::new(&dma, ControllerId::new(1), bad).is_err());
    }
}
