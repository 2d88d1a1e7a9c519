//! # Controller Configuration Table
//!
//! A small structure firmware exposes inside the register window. It carries
//! transport capability negotiation, the heartbeat counter the lockup
//! detector samples, and a driver-owned scratch word used to positively
//! confirm that a reset actually cycled the firmware.

use static_assertions::const_assert_eq;

use crate::{regs, RegisterWindow};

/// Signature word firmware publishes at the head of the table
pub const TABLE_SIGNATURE: u32 = u32::from_le_bytes(*b"CISS");

// Field offsets within the table. The layout struct below is the normative
// picture; these must track it.
const OFF_SIGNATURE: usize = 0x00;
const OFF_TRANSPORT_SUPPORT: usize = 0x04;
const OFF_TRANSPORT_REQUEST: usize = 0x08;
const OFF_HEARTBEAT: usize = 0x0C;
const OFF_DRIVER_SUPPORT: usize = 0x10;
const OFF_MAX_OUTSTANDING: usize = 0x14;
const OFF_MAX_SG_ENTRIES: usize = 0x18;
const OFF_REPLY_RING_COUNT: usize = 0x1C;
const OFF_REPLY_RING_DEPTH: usize = 0x20;

/// Wire layout of the configuration table
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ConfigTableLayout {
    /// Table signature, [`TABLE_SIGNATURE`]
    pub signature: u32,
    /// Transport methods firmware supports, [`TransportSupport`]
    pub transport_support: u32,
    /// Transport method the driver requests
    pub transport_request: u32,
    /// Firmware heartbeat; changes while firmware is alive
    pub heartbeat: u32,
    /// Driver-owned word, surviving value checked after resets
    pub driver_support: u32,
    /// Maximum simultaneously outstanding commands
    pub max_outstanding: u32,
    /// Maximum scatter/gather entries per command
    pub max_sg_entries: u32,
    /// Reply rings firmware can service
    pub reply_ring_count: u32,
    /// Entries per reply ring
    pub reply_ring_depth: u32,
}

const_assert_eq!(core::mem::size_of::<ConfigTableLayout>(), 36);

bitflags::bitflags! {
    /// Transport capability / request bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransportSupport: u32 {
        /// Polled FIFO transport
        const SIMPLE = 1 << 0;
        /// DMA reply-ring transport
        const PERFORMANT = 1 << 1;
        /// Doorbell-initiated hard reset is implemented
        const DOORBELL_RESET = 1 << 2;
        /// Reset-message soft reset is implemented
        const SOFT_RESET = 1 << 3;
    }
}

/// Typed accessor over the configuration table of a mapped window
pub struct ConfigTable<'a> {
    win: &'a dyn RegisterWindow,
}

impl<'a> ConfigTable<'a> {
    /// Wrap a register window; the table lives at [`regs::CONFIG_TABLE`]
    pub fn new(win: &'a dyn RegisterWindow) -> Self {
        Self { win }
    }

    #[inline]
    fn read(&self, field: usize) -> u32 {
        self.win.read32(regs::CONFIG_TABLE + field)
    }

    #[inline]
    fn write(&self, field: usize, value: u32) {
        self.win.write32(regs::CONFIG_TABLE + field, value);
    }

    /// True when the signature word is present
    pub fn is_valid(&self) -> bool {
        self.read(OFF_SIGNATURE) == TABLE_SIGNATURE
    }

    /// Transport methods and reset styles firmware advertises
    pub fn transport_support(&self) -> TransportSupport {
        TransportSupport::from_bits_truncate(self.read(OFF_TRANSPORT_SUPPORT))
    }

    /// Request a transport method; latched by a doorbell mode-change
    pub fn request_transport(&self, request: TransportSupport) {
        self.write(OFF_TRANSPORT_REQUEST, request.bits());
    }

    /// Transport request currently latched
    pub fn transport_request(&self) -> TransportSupport {
        TransportSupport::from_bits_truncate(self.read(OFF_TRANSPORT_REQUEST))
    }

    /// Current heartbeat counter value
    pub fn heartbeat(&self) -> u32 {
        self.read(OFF_HEARTBEAT)
    }

    /// Driver-owned scratch word
    pub fn driver_support(&self) -> u32 {
        self.read(OFF_DRIVER_SUPPORT)
    }

    /// Overwrite the driver-owned scratch word
    pub fn set_driver_support(&self, value: u32) {
        self.write(OFF_DRIVER_SUPPORT, value);
    }

    /// Hardware's maximum outstanding command count
    pub fn max_outstanding(&self) -> u32 {
        self.read(OFF_MAX_OUTSTANDING)
    }

    /// Maximum scatter/gather entries per command
    pub fn max_sg_entries(&self) -> u32 {
        self.read(OFF_MAX_SG_ENTRIES)
    }

    /// Number of reply rings firmware can service
    pub fn reply_ring_count(&self) -> u32 {
        self.read(OFF_REPLY_RING_COUNT)
    }

    /// Entries per reply ring
    pub fn reply_ring_depth(&self) -> u32 {
        self.read(OFF_REPLY_RING_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::StubBoard;

    #[test]
    fn test_signature_and_fields() {
        let board = StubBoard::new();
        let table = ConfigTable::new(&board);
        assert!(table.is_valid());
        assert!(table.transport_support().contains(TransportSupport::SIMPLE));
    }

    #[test]
    fn test_driver_support_round_trip() {
        let board = StubBoard::new();
        let table = ConfigTable::new(&board);
        table.set_driver_support(0x5A5A_D00D);
        assert_eq!(table.driver_support(), 0x5A5A_D00D);
    }

    #[test]
    fn test_transport_request_latch() {
        let board = StubBoard::new();
        let table = ConfigTable::new(&board);
        table.request_transport(TransportSupport::PERFORMANT);
        assert_eq!(table.transport_request(), TransportSupport::PERFORMANT);
    }
}
