//! # Controller Register Map
//!
//! Byte offsets and bit definitions for the controller's primary register
//! window. Offsets are consumed through [`RegisterWindow`](crate::RegisterWindow);
//! nothing outside this crate hardcodes a register number.

/// Host-to-controller doorbell
pub const HOST_DOORBELL: usize = 0x20;

/// Raw interrupt status, read-only
pub const INTERRUPT_STATUS: usize = 0x30;

/// Interrupt mask; a set bit suppresses delivery
pub const INTERRUPT_MASK: usize = 0x34;

/// Inbound post queue: writing a tag here submits a command (simple mode,
/// and tag posting in performant mode)
pub const INBOUND_POST: usize = 0x40;

/// Outbound fetch queue: reading pops one completed tag (simple mode)
pub const OUTBOUND_FETCH: usize = 0x44;

/// Abort request register: writing a tag asks firmware to cancel it
pub const ABORT_REQUEST: usize = 0x48;

/// Board identity word, stable across resets
pub const BOARD_ID: usize = 0x60;

/// Firmware scratchpad; carries the board-state handshake values
pub const SCRATCHPAD: usize = 0xB0;

/// Per-ring consumed-index registers, one 32-bit slot per reply ring
pub const REPLY_CONSUMED_BASE: usize = 0xC0;

/// Stride between consecutive reply consumed-index registers
pub const REPLY_CONSUMED_STRIDE: usize = 0x4;

/// Base of the controller configuration table within the window
pub const CONFIG_TABLE: usize = 0x100;

/// Value returned by [`OUTBOUND_FETCH`] when the completion FIFO is empty
pub const FIFO_EMPTY: u32 = 0xFFFF_FFFF;

bitflags::bitflags! {
    /// Bits in [`HOST_DOORBELL`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Doorbell: u32 {
        /// Request a firmware-level hard reset
        const RESET = 1 << 0;
        /// Latch the requested transport mode from the config table
        const MODE_CHANGE = 1 << 1;
        /// Acknowledge a soft-reset message without a full reinit
        const SOFT_RESET_ACK = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Bits in [`INTERRUPT_STATUS`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntStatus: u32 {
        /// At least one completion is waiting
        const COMPLETION_PENDING = 1 << 0;
        /// The inbound post FIFO cannot take another tag
        const FIFO_FULL = 1 << 1;
        /// Firmware fault; board needs recovery
        const FAULT = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Bits in [`INTERRUPT_MASK`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntMask: u32 {
        /// Mask completion interrupts
        const COMPLETIONS = 1 << 0;
        /// Mask everything this device can raise
        const ALL = 0xFFFF_FFFF;
    }
}

/// Scratchpad handshake values published by firmware
pub mod board_state {
    /// Firmware is re-initializing and must not be touched
    pub const NOT_READY: u32 = 0xFFFF_0000;
    /// Firmware is ready for driver initialization
    pub const READY: u32 = 0xFFFF_0001;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_offsets_distinct() {
        let offs = [
            HOST_DOORBELL,
            INTERRUPT_STATUS,
            INTERRUPT_MASK,
            INBOUND_POST,
            OUTBOUND_FETCH,
            ABORT_REQUEST,
            BOARD_ID,
            SCRATCHPAD,
            REPLY_CONSUMED_BASE,
            CONFIG_TABLE,
        ];
        for (i, a) in offs.iter().enumerate() {
            for b in offs.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_doorbell_bits_disjoint() {
        assert!((Doorbell::RESET & Doorbell::MODE_CHANGE).is_empty());
        assert!((Doorbell::RESET & Doorbell::SOFT_RESET_ACK).is_empty());
    }
}
