//! # Abort Encoding Policy
//!
//! Field experience with this controller family: some firmware revisions
//! expect the tag in an abort request byte-swapped relative to the
//! completion encoding. Rather than an inline conditional in the abort
//! path, the expectation is a per-board policy value carried in the board
//! profile; unknown-quirk boards use [`AbortEncoding::Both`] and let
//! firmware ignore the encoding it doesn't recognize.

use ciss_command::Tag;
use ciss_hal::{regs, RegisterWindow};

/// Which tag byte order(s) firmware wants in an abort request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbortEncoding {
    /// Same byte order as completions
    Native,
    /// Byte-swapped
    Swapped,
    /// Send both; the firmware takes the one it understands
    #[default]
    Both,
}

/// Outcome of an abort request, as surfaced to the SCSI collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// The victim is gone: completed-as-aborted locally, finished on its
    /// own, or cancelled by firmware
    Success,
    /// The victim survived the full polling budget
    Failed,
}

/// Polling budget for a firmware-side abort
#[derive(Debug, Clone, Copy)]
pub struct AbortConfig {
    /// Times to check the in-flight list before giving up
    pub attempts: u32,
    /// Delay between checks
    pub poll_ms: u64,
}

impl Default for AbortConfig {
    fn default() -> Self {
        Self { attempts: 20, poll_ms: 100 }
    }
}

/// Write the abort request register in the encoding(s) the board expects
pub fn issue_abort_request(hw: &dyn RegisterWindow, victim: Tag, encoding: AbortEncoding) {
    match encoding {
        AbortEncoding::Native => hw.write32(regs::ABORT_REQUEST, victim.raw()),
        AbortEncoding::Swapped => hw.write32(regs::ABORT_REQUEST, victim.swapped()),
        AbortEncoding::Both => {
            hw.write32(regs::ABORT_REQUEST, victim.raw());
            hw.write32(regs::ABORT_REQUEST, victim.swapped());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciss_hal::board::StubBoard;

    #[test]
    fn test_native_encoding() {
        let board = StubBoard::new();
        let tag = Tag::for_slot(5);
        issue_abort_request(&board, tag, AbortEncoding::Native);
        assert_eq!(board.abort_requests(), alloc::vec![tag.raw()]);
    }

    #[test]
    fn test_swapped_encoding() {
        let board = StubBoard::new();
        let tag = Tag::for_slot(5);
        issue_abort_request(&board, tag, AbortEncoding::Swapped);
        assert_eq!(board.abort_requests(), alloc::vec![tag.swapped()]);
    }

    #[test]
    fn test_both_encodings_in_order() {
        let board = StubBoard::new();
        let tag = Tag::for_slot(5);
        issue_abort_request(&board, tag, AbortEncoding::Both);
        assert_eq!(board.abort_requests(), alloc::vec![tag.raw(), tag.swapped()]);
    }
}
