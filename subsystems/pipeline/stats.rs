//! # Pipeline Statistics
//!
//! Running counters for the administrative surface and for tests that
//! assert on traffic shape. Everything is atomic; the snapshot is a plain
//! copy and carries no ordering guarantees beyond per-counter atomicity.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Counters maintained by the pipeline
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Commands handed to hardware
    pub submitted: AtomicU64,
    /// Completions routed to their blocks
    pub completed: AtomicU64,
    /// Interrupt invocations that found work
    pub interrupts_serviced: AtomicU64,
    /// Raw completion values that matched no live command
    pub stale_tags_dropped: AtomicU64,
    /// Completions drained and discarded during recovery
    pub discarded_in_recovery: AtomicU64,
    /// Abort requests issued to hardware
    pub aborts_issued: AtomicU64,
    /// Aborts that did not take within budget
    pub aborts_failed: AtomicU64,
    /// Commands force-failed by lockup handling
    pub force_failed: AtomicU64,
    /// Driver-side retries (unit attention, unsolicited abort)
    pub retries: AtomicU64,
    /// Highest simultaneously outstanding command count observed
    pub outstanding_high_water: AtomicU32,
}

impl PipelineStats {
    /// Bump a u64 counter
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a new outstanding level into the high-water mark
    pub fn note_outstanding(&self, level: u32) {
        self.outstanding_high_water.fetch_max(level, Ordering::Relaxed);
    }

    /// Copy out the current values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            interrupts_serviced: self.interrupts_serviced.load(Ordering::Relaxed),
            stale_tags_dropped: self.stale_tags_dropped.load(Ordering::Relaxed),
            discarded_in_recovery: self.discarded_in_recovery.load(Ordering::Relaxed),
            aborts_issued: self.aborts_issued.load(Ordering::Relaxed),
            aborts_failed: self.aborts_failed.load(Ordering::Relaxed),
            force_failed: self.force_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            outstanding_high_water: self.outstanding_high_water.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter (administrative statistics reset)
    pub fn reset(&self) {
        self.submitted.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.interrupts_serviced.store(0, Ordering::Relaxed);
        self.stale_tags_dropped.store(0, Ordering::Relaxed);
        self.discarded_in_recovery.store(0, Ordering::Relaxed);
        self.aborts_issued.store(0, Ordering::Relaxed);
        self.aborts_failed.store(0, Ordering::Relaxed);
        self.force_failed.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.outstanding_high_water.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Commands handed to hardware
    pub submitted: u64,
    /// Completions routed to their blocks
    pub completed: u64,
    /// Interrupt invocations that found work
    pub interrupts_serviced: u64,
    /// Raw completion values that matched no live command
    pub stale_tags_dropped: u64,
    /// Completions drained and discarded during recovery
    pub discarded_in_recovery: u64,
    /// Abort requests issued to hardware
    pub aborts_issued: u64,
    /// Aborts that did not take within budget
    pub aborts_failed: u64,
    /// Commands force-failed by lockup handling
    pub force_failed: u64,
    /// Driver-side retries
    pub retries: u64,
    /// Highest outstanding level observed
    pub outstanding_high_water: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let stats = PipelineStats::default();
        PipelineStats::bump(&stats.submitted);
        PipelineStats::bump(&stats.submitted);
        stats.note_outstanding(5);
        stats.note_outstanding(3);
        let snap = stats.snapshot();
        assert_eq!(snap.submitted, 2);
        assert_eq!(snap.outstanding_high_water, 5);
        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
