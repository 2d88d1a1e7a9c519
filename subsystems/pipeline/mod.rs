//! # Submission & Completion Pipeline
//!
//! Moves fully prepared command blocks from the software ready list into
//! hardware, and routes raw completion values back to the blocks they name.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     COMMAND PIPELINE                             │
//! │                                                                  │
//! │   submit ──► [ READY LIST ] ── drain ──► [ IN-FLIGHT LIST ]      │
//! │                                 │               ▲                │
//! │                                 ▼               │ resolve        │
//! │                        inbound post reg   completion tag         │
//! │                                 │               │                │
//! │          ┌──────────────────────┴───────────────┴─────────────┐  │
//! │          │   simple mode: polled FIFO registers               │  │
//! │          │   performant mode: DMA reply rings, one per vector │  │
//! │          └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Within one reply ring completions are serviced in strict FIFO hardware
//! order; across rings there is no ordering guarantee. The ready and
//! in-flight lists, the pool bitmap, and every command state transition are
//! serialized by one per-controller lock.

#![no_std]

extern crate alloc;

// =============================================================================
// Module Declarations
// =============================================================================

pub mod abort;
pub mod engine;
pub mod interrupt;
pub mod rings;
pub mod stats;

mod engine_tests;

// =============================================================================
// Re-exports
// =============================================================================

pub use abort::{AbortConfig, AbortEncoding, AbortOutcome};
pub use engine::{Pipeline, PipelineConfig, TransportMode};
pub use interrupt::InterruptOutcome;
pub use rings::{ReplyRing, REPLY_ENTRY_SIZE};
pub use stats::{PipelineStats, StatsSnapshot};

use ciss_command::CommandError;

// =============================================================================
// Pipeline Error Types
// =============================================================================

/// Errors from pipeline operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineError {
    /// The controller is no longer accepting work (lockup declared)
    NotAccepting,
    /// Outstanding-command budget exhausted; signal busy upward
    Busy,
    /// Command-layer failure
    Command(CommandError),
    /// DMA allocation for rings or pool failed
    OutOfMemory,
    /// A ring index outside the configured ring count
    BadRing,
}

impl From<CommandError> for PipelineError {
    fn from(err: CommandError) -> Self {
        PipelineError::Command(err)
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
