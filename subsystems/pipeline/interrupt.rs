//! # Interrupt Demultiplexer
//!
//! Entry points the interrupt collaborator invokes. Two delivery styles:
//!
//! - **Shared legacy line**: many devices multiplex one line, so the
//!   handler must first establish the interrupt is ours (completion
//!   pending *and* our delivery enabled) before consuming anything.
//!   Draining another device's window on a shared line loses interrupts.
//! - **Per-ring vectors (MSI-X)**: the vector identifies both controller
//!   and ring; the handler goes straight to that ring.
//!
//! A third, deliberately blunt variant exists for recovery only:
//! [`Pipeline::discard_drain`] consumes every pending completion and drops
//! it without touching command state, flushing stale completions that
//! arrive after a soft reset but before reinitialization.

use core::sync::atomic::Ordering;

use ciss_hal::{regs, Nanoseconds, RegisterWindow};

use crate::engine::{Pipeline, TransportMode};
use crate::stats::PipelineStats;
use crate::{PipelineError, PipelineResult};

/// What an interrupt invocation found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// Not this controller's interrupt (shared line), or delivery disabled
    NotOurs,
    /// Ours; carries the number of completions handled
    Serviced(usize),
}

impl Pipeline {
    /// Unmask completion delivery
    pub fn enable_interrupts(&self, hw: &dyn RegisterWindow) {
        hw.write32(regs::INTERRUPT_MASK, 0);
        self.interrupts_enabled_flag().store(true, Ordering::Release);
    }

    /// Mask all delivery from this controller
    pub fn disable_interrupts(&self, hw: &dyn RegisterWindow) {
        hw.write32(regs::INTERRUPT_MASK, regs::IntMask::ALL.bits());
        self.interrupts_enabled_flag().store(false, Ordering::Release);
    }

    /// Whether delivery is currently enabled
    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled_flag().load(Ordering::Acquire)
    }

    /// Shared-line handler. Confirms the interrupt source before draining;
    /// a foreign or masked interrupt is handed back untouched.
    pub fn handle_interrupt(&self, hw: &dyn RegisterWindow, now: Nanoseconds) -> InterruptOutcome {
        if !self.interrupts_enabled() {
            return InterruptOutcome::NotOurs;
        }
        let status = regs::IntStatus::from_bits_truncate(hw.read32(regs::INTERRUPT_STATUS));
        if !status.contains(regs::IntStatus::COMPLETION_PENDING) {
            return InterruptOutcome::NotOurs;
        }
        PipelineStats::bump(&self.stats().interrupts_serviced);
        let handled = self.pump(hw, now);
        InterruptOutcome::Serviced(handled)
    }

    /// Dedicated-vector handler for one reply ring
    pub fn handle_ring_interrupt(
        &self,
        ring: usize,
        hw: &dyn RegisterWindow,
        now: Nanoseconds,
    ) -> PipelineResult<InterruptOutcome> {
        if !self.interrupts_enabled() {
            return Ok(InterruptOutcome::NotOurs);
        }
        if ring >= self.ring_count() && self.mode() == TransportMode::Performant {
            return Err(PipelineError::BadRing);
        }
        PipelineStats::bump(&self.stats().interrupts_serviced);
        let handled = match self.mode() {
            TransportMode::Simple => self.process_completions(hw, now),
            TransportMode::Performant => self.process_ring(ring, hw, now)?,
        };
        Ok(InterruptOutcome::Serviced(handled))
    }

    /// Recovery-time flush: drain every completion source and drop the
    /// values without resolving them to commands. Strictly for the window
    /// between a soft reset and reinitialization, when anything hardware
    /// still posts refers to commands that no longer exist.
    pub fn discard_drain(&self, hw: &dyn RegisterWindow) -> usize {
        let mut dropped = 0;
        match self.mode() {
            TransportMode::Simple => loop {
                let raw = hw.read32(regs::OUTBOUND_FETCH);
                if raw == regs::FIFO_EMPTY {
                    break;
                }
                dropped += 1;
            },
            TransportMode::Performant => {
                for (i, slot) in self.rings().iter().enumerate() {
                    let mut ring = slot.lock();
                    let mut n = 0;
                    while ring.pop().is_some() {
                        n += 1;
                    }
                    if n > 0 {
                        hw.write32(
                            regs::REPLY_CONSUMED_BASE + i * regs::REPLY_CONSUMED_STRIDE,
                            ring.consumed_index(),
                        );
                    }
                    dropped += n;
                }
            }
        }
        if dropped > 0 {
            log::info!(
                "ctlr {}: discarded {} stale completions during recovery",
                self.owner().raw(),
                dropped
            );
            for _ in 0..dropped {
                PipelineStats::bump(&self.stats().discarded_in_recovery);
            }
        }
        dropped
    }
}
