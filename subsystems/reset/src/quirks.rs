//! # Board Variant Policy Table
//!
//! Reset capability and abort-tag encoding differ by board generation, and
//! the differences are not discoverable from the hardware itself. They are
//! recorded here, keyed by board identity, so the reset and abort code
//! stays free of per-variant conditionals and a new variant is one table
//! row.

use ciss_pipeline::AbortEncoding;

bitflags::bitflags! {
    /// Hardware-variant quirks the driver must honor
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BoardQuirks: u32 {
        /// No reset method works; a wedged board of this variant is
        /// unrecoverable
        const NO_RESET = 1 << 0;
        /// Physical resets brick the board; only the reset message works
        const SOFT_RESET_ONLY = 1 << 1;
    }
}

/// Static description of one supported board variant
#[derive(Debug, Clone, Copy)]
pub struct BoardProfile {
    /// Identity word read from the board-id register
    pub board_id: u32,
    /// Marketing name, for logs
    pub name: &'static str,
    /// Variant quirks
    pub quirks: BoardQuirks,
    /// Tag byte order its firmware expects in abort requests
    pub abort_encoding: AbortEncoding,
}

/// Supported board variants
pub static BOARD_TABLE: &[BoardProfile] = &[
    BoardProfile {
        board_id: 0x1000_0001,
        name: "SA E200",
        quirks: BoardQuirks::empty(),
        abort_encoding: AbortEncoding::Native,
    },
    BoardProfile {
        board_id: 0x1000_0002,
        name: "SA E200i",
        quirks: BoardQuirks::SOFT_RESET_ONLY,
        abort_encoding: AbortEncoding::Native,
    },
    BoardProfile {
        board_id: 0x1000_0003,
        name: "SA P400",
        quirks: BoardQuirks::NO_RESET,
        abort_encoding: AbortEncoding::Both,
    },
    BoardProfile {
        board_id: 0x1000_0004,
        name: "SA P410",
        quirks: BoardQuirks::empty(),
        abort_encoding: AbortEncoding::Swapped,
    },
    BoardProfile {
        board_id: 0x1000_0005,
        name: "SA P212",
        quirks: BoardQuirks::empty(),
        abort_encoding: AbortEncoding::Both,
    },
];

/// Look a board up by its identity word
pub fn lookup(board_id: u32) -> Option<&'static BoardProfile> {
    BOARD_TABLE.iter().find(|p| p.board_id == board_id)
}
