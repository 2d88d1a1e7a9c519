//! # Submission Engine
//!
//! Owns the per-controller command state: the pool, the ready and in-flight
//! lists, and the outstanding counter. One spin lock (`core`) serializes all
//! of it; the interrupt demultiplexer and the lockup force-fail walk take
//! the same lock, so a command's state transitions are totally ordered.
//!
//! Completion hooks are always fired *after* the lock is released: a SCSI
//! done callback is allowed to immediately resubmit, which re-enters the
//! engine.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

use ciss_command::block::hwstat;
use ciss_command::{
    release_blocking, CommandBlock, CommandKind, CommandPool, CommandState, CompletionHook,
    CompletionStatus, ControllerId, ErrorInfo, PoolConfig, Tag,
};
use ciss_hal::dma::{DmaAllocator, DmaBuffer};
use ciss_hal::{regs, Delay, Nanoseconds, RegisterWindow};

use crate::rings::ReplyRing;
use crate::stats::PipelineStats;
use crate::{PipelineError, PipelineResult};

/// How commands and completions move between driver and hardware.
/// The mode is fixed at pipeline construction; transitions only happen by
/// tearing the pipeline down during (re)initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Polled FIFO registers
    Simple,
    /// DMA reply rings, one per interrupt vector
    Performant,
}

/// Pipeline geometry and retry policy
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Command pool geometry
    pub pool: PoolConfig,
    /// Reply rings to allocate (performant mode)
    pub ring_count: usize,
    /// Entries per reply ring
    pub ring_depth: usize,
    /// Driver-side retry budget for unit-attention class outcomes
    pub retry_limit: u8,
    /// Exponential backoff base for driver-side retries
    pub retry_backoff: Nanoseconds,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            ring_count: 4,
            ring_depth: 16,
            retry_limit: 3,
            retry_backoff: Nanoseconds::from_millis(1),
        }
    }
}

/// Everything the per-controller lock protects
struct Core {
    pool: CommandPool,
    ready: VecDeque<CommandBlock>,
    in_flight: VecDeque<CommandBlock>,
    /// Retry parking lot: completed-with-retryable-status commands waiting
    /// out their backoff; drained by [`Pipeline::service_deferred`]
    deferred: VecDeque<CommandBlock>,
}

/// The per-controller submission/completion engine
pub struct Pipeline {
    core: Mutex<Core>,
    rings: Vec<Mutex<ReplyRing>>,
    mode: TransportMode,
    owner: ControllerId,
    outstanding: AtomicU32,
    max_outstanding: u32,
    accepting: AtomicBool,
    interrupts_enabled: AtomicBool,
    retry_limit: u8,
    retry_backoff: Nanoseconds,
    stats: PipelineStats,
}

impl Pipeline {
    /// Build the pipeline: pool, and reply rings when performant
    pub fn new(
        dma: &dyn DmaAllocator,
        owner: ControllerId,
        mode: TransportMode,
        config: PipelineConfig,
    ) -> PipelineResult<Self> {
        let pool = CommandPool::new(dma, owner, config.pool)?;
        let max_outstanding = pool.total_slots() as u32;

        let mut rings = Vec::new();
        if mode == TransportMode::Performant {
            for _ in 0..config.ring_count.max(1) {
                let ring = ReplyRing::new(dma, config.ring_depth)
                    .map_err(|_| PipelineError::OutOfMemory)?;
                rings.push(Mutex::new(ring));
            }
        }

        Ok(Self {
            core: Mutex::new(Core {
                pool,
                ready: VecDeque::new(),
                in_flight: VecDeque::new(),
                deferred: VecDeque::new(),
            }),
            rings,
            mode,
            owner,
            outstanding: AtomicU32::new(0),
            max_outstanding,
            accepting: AtomicBool::new(true),
            interrupts_enabled: AtomicBool::new(false),
            retry_limit: config.retry_limit,
            retry_backoff: config.retry_backoff,
            stats: PipelineStats::default(),
        })
    }

    /// Transport mode in effect
    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Owning controller
    pub fn owner(&self) -> ControllerId {
        self.owner
    }

    /// Running counters
    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Whether the pipeline still takes new work
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Commands between acceptance and completion
    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Queue depth the controller advertises upward
    pub fn usable_depth(&self) -> usize {
        self.core.lock().pool.usable_depth()
    }

    /// Number of reply rings
    pub fn ring_count(&self) -> usize {
        self.rings.len()
    }

    /// The DMA buffer backing a reply ring; firmware simulations produce
    /// into it
    pub fn ring_buffer(&self, ring: usize) -> Option<DmaBuffer> {
        self.rings.get(ring).map(|r| r.lock().buffer().clone())
    }

    /// Allocate a command block from the fast pool. Interrupt-safe; `None`
    /// means exhaustion and the caller signals busy upward.
    pub fn allocate(&self, kind: CommandKind) -> Option<CommandBlock> {
        self.core.lock().pool.allocate(kind)
    }

    /// Return a block that was never enqueued
    pub fn give_back(&self, block: CommandBlock) {
        if block.is_pool_backed() {
            if let Err(err) = self.core.lock().pool.release(block) {
                log::error!("ctlr {}: pool release failed: {:?}", self.owner.raw(), err);
            }
        } else {
            let _ = release_blocking(block);
        }
    }

    /// Which reply ring a submission from `cpu_hint` targets. Affinity
    /// heuristic only; any ring is correct.
    pub fn select_ring(&self, cpu_hint: u32) -> usize {
        if self.rings.is_empty() {
            0
        } else {
            cpu_hint as usize % self.rings.len()
        }
    }

    /// Append a prepared block to the ready list and drain to hardware.
    ///
    /// The outstanding counter is raised *before* the hardware handoff so
    /// the FIFO-full check and the counter can never disagree mid-submit.
    pub fn enqueue_and_start(
        &self,
        mut block: CommandBlock,
        hw: &dyn RegisterWindow,
    ) -> PipelineResult<()> {
        if !self.is_accepting() {
            block.take_hook().fire(CompletionStatus::HardwareError);
            self.give_back_completed(block);
            return Err(PipelineError::NotAccepting);
        }

        let level = self.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        if level > self.max_outstanding {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            self.give_back(block);
            return Err(PipelineError::Busy);
        }
        self.stats.note_outstanding(level);

        if let Err(err) = block.advance(CommandState::Queued) {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            self.give_back(block);
            return Err(err.into());
        }
        {
            let mut core = self.core.lock();
            core.ready.push_back(block);
            self.drain_locked(&mut core, hw);
        }
        Ok(())
    }

    /// Push ready commands into hardware while it will take them
    pub fn drain(&self, hw: &dyn RegisterWindow) {
        let mut core = self.core.lock();
        self.drain_locked(&mut core, hw);
    }

    fn drain_locked(&self, core: &mut Core, hw: &dyn RegisterWindow) {
        while let Some(mut block) = core.ready.pop_front() {
            if self.mode == TransportMode::Simple {
                let status =
                    regs::IntStatus::from_bits_truncate(hw.read32(regs::INTERRUPT_STATUS));
                if status.contains(regs::IntStatus::FIFO_FULL) {
                    core.ready.push_front(block);
                    break;
                }
            }
            if let Err(err) = block.advance(CommandState::Submitted) {
                // Unreachable for anything that went through enqueue; keep
                // the invariant loud.
                log::error!("ctlr {}: illegal submit: {:?}", self.owner.raw(), err);
            }
            block.stage_to_region();
            let value = self.submit_value(&block);
            core.in_flight.push_back(block);
            hw.write32(regs::INBOUND_POST, value);
            PipelineStats::bump(&self.stats.submitted);
        }
    }

    /// The raw value posted to hardware for this block. Performant mode
    /// decorates direct tags with the scatter/gather entry count and the
    /// chosen reply ring.
    fn submit_value(&self, block: &CommandBlock) -> u32 {
        match self.mode {
            TransportMode::Simple => block.tag().raw(),
            TransportMode::Performant => {
                if block.tag().is_direct() {
                    let ring = self.select_ring(block.cpu_hint());
                    block
                        .tag()
                        .with_sg_count(block.sg().total_segments())
                        .with_ring(ring)
                        .raw()
                } else {
                    block.tag().raw()
                }
            }
        }
    }

    /// Drain the simple-mode completion FIFO, routing each value to its
    /// command. Returns the number of completions handled.
    pub fn process_completions(&self, hw: &dyn RegisterWindow, now: Nanoseconds) -> usize {
        let mut handled = 0;
        loop {
            let raw = hw.read32(regs::OUTBOUND_FETCH);
            if raw == regs::FIFO_EMPTY {
                break;
            }
            self.resolve(raw, now);
            handled += 1;
        }
        if handled > 0 {
            self.drain(hw);
        }
        handled
    }

    /// Drain one reply ring (performant mode) and write the consumed index
    /// back to hardware
    pub fn process_ring(
        &self,
        ring: usize,
        hw: &dyn RegisterWindow,
        now: Nanoseconds,
    ) -> PipelineResult<usize> {
        let slot = self.rings.get(ring).ok_or(PipelineError::BadRing)?;
        let mut handled = 0;
        {
            let mut guard = slot.lock();
            while let Some(raw) = guard.pop() {
                self.resolve(raw, now);
                handled += 1;
            }
            if handled > 0 {
                hw.write32(
                    regs::REPLY_CONSUMED_BASE + ring * regs::REPLY_CONSUMED_STRIDE,
                    guard.consumed_index(),
                );
            }
        }
        if handled > 0 {
            self.drain(hw);
        }
        Ok(handled)
    }

    /// Route one raw completion value to its command block.
    ///
    /// Direct tags resolve by bounds-checked slot index; everything else by
    /// scanning the in-flight list. A value matching no live command is
    /// logged and dropped; stale or malformed tags are never fatal.
    fn resolve(&self, raw: u32, now: Nanoseconds) {
        let tag = Tag::from_raw(raw);
        let fire;
        {
            let mut core = self.core.lock();

            if let Some(index) = tag.slot_index() {
                if index >= core.pool.total_slots() {
                    log::warn!(
                        "ctlr {}: completion for out-of-range slot {} dropped",
                        self.owner.raw(),
                        index
                    );
                    PipelineStats::bump(&self.stats.stale_tags_dropped);
                    return;
                }
            }

            let pos = core.in_flight.iter().position(|b| b.tag().same_command(tag));
            let Some(pos) = pos else {
                log::warn!(
                    "ctlr {}: stale completion {:#010x} dropped",
                    self.owner.raw(),
                    raw
                );
                PipelineStats::bump(&self.stats.stale_tags_dropped);
                return;
            };
            let Some(mut block) = core.in_flight.remove(pos) else {
                return;
            };

            let status = if tag.error_flagged() {
                block.read_error_info().to_status()
            } else {
                CompletionStatus::Success
            };

            if status.is_driver_retryable() && block.retries() < self.retry_limit {
                PipelineStats::bump(&self.stats.retries);
                block.note_retry(now, self.retry_backoff);
                match block.advance(CommandState::Queued) {
                    Ok(()) => {
                        log::debug!(
                            "ctlr {}: {} retry {} after {:?}",
                            self.owner.raw(),
                            block.tag(),
                            block.retries(),
                            status
                        );
                        core.deferred.push_back(block);
                        return;
                    }
                    Err(err) => {
                        log::error!("ctlr {}: retry requeue failed: {:?}", self.owner.raw(), err);
                        fire = self.retire_locked(&mut core, block, status);
                    }
                }
            } else {
                fire = self.retire_locked(&mut core, block, status);
            }
        }
        if let Some((hook, status)) = fire {
            hook.fire(status);
        }
    }

    /// Finalize a command under the lock; the returned hook is fired by the
    /// caller once the lock is gone.
    fn retire_locked(
        &self,
        core: &mut Core,
        mut block: CommandBlock,
        status: CompletionStatus,
    ) -> Option<(CompletionHook, CompletionStatus)> {
        let _ = block.advance(CommandState::Completed);
        let hook = block.take_hook();
        let _ = block.advance(CommandState::Released);
        if block.is_pool_backed() {
            if let Err(err) = core.pool.release(block) {
                log::error!("ctlr {}: slot release failed: {:?}", self.owner.raw(), err);
            }
        } else {
            let _ = release_blocking(block);
        }
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        PipelineStats::bump(&self.stats.completed);
        Some((hook, status))
    }

    /// Release a block whose hook has already been fired outside the
    /// normal completion path
    fn give_back_completed(&self, mut block: CommandBlock) {
        let _ = block.advance(CommandState::Completed);
        let _ = block.advance(CommandState::Released);
        if block.is_pool_backed() {
            if let Err(err) = self.core.lock().pool.release(block) {
                log::error!("ctlr {}: pool release failed: {:?}", self.owner.raw(), err);
            }
        } else {
            let _ = release_blocking(block);
        }
    }

    /// Move parked retries whose backoff has elapsed back onto the ready
    /// list and drain. Runs in deferred-work context, never at interrupt
    /// priority.
    pub fn service_deferred(&self, now: Nanoseconds, hw: &dyn RegisterWindow) -> usize {
        let mut core = self.core.lock();
        let mut moved = 0;
        let mut still_parked = VecDeque::new();
        while let Some(block) = core.deferred.pop_front() {
            if block.retry_at() <= now {
                core.ready.push_back(block);
                moved += 1;
            } else {
                still_parked.push_back(block);
            }
        }
        core.deferred = still_parked;
        if moved > 0 {
            self.drain_locked(&mut core, hw);
        }
        moved
    }

    /// Refuse all new work from this point on
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Take work again after an administrative reset brought the board
    /// back. Never called on the lockup path; lockup is terminal.
    pub fn resume_accepting(&self) {
        self.accepting.store(true, Ordering::Release);
    }

    /// Forcibly complete every command the controller still owes an answer
    /// for (ready, in-flight, and parked retries alike) with a synthetic
    /// hardware-error status. Returns how many were failed.
    ///
    /// After this returns, the lists are empty, the pool is full, and no
    /// caller is left waiting. New submissions are refused.
    pub fn force_fail_all(&self) -> usize {
        self.stop_accepting();
        let mut to_fire: Vec<(CompletionHook, CompletionStatus)> = Vec::new();
        {
            let mut core = self.core.lock();
            let mut blocks: Vec<CommandBlock> = Vec::new();
            blocks.extend(core.ready.drain(..));
            blocks.extend(core.in_flight.drain(..));
            blocks.extend(core.deferred.drain(..));
            for block in blocks {
                let synthetic = ErrorInfo { hw_status: hwstat::HARDWARE, ..Default::default() };
                synthetic.write_to(block.region());
                PipelineStats::bump(&self.stats.force_failed);
                if let Some(pair) = self.retire_locked(&mut core, block, CompletionStatus::HardwareError)
                {
                    to_fire.push(pair);
                }
            }
        }
        self.outstanding.store(0, Ordering::Release);
        let failed = to_fire.len();
        for (hook, status) in to_fire {
            hook.fire(status);
        }
        failed
    }

    // ---- shared-state peeks (lockup detector, abort path, tests) --------

    /// Whether a command with this tag is on the in-flight list
    pub fn in_flight_contains(&self, tag: Tag) -> bool {
        self.core.lock().in_flight.iter().any(|b| b.tag().same_command(tag))
    }

    /// Commands waiting on the ready list
    pub fn ready_len(&self) -> usize {
        self.core.lock().ready.len()
    }

    /// Commands handed to hardware and not yet completed
    pub fn in_flight_len(&self) -> usize {
        self.core.lock().in_flight.len()
    }

    /// Commands parked for retry backoff
    pub fn deferred_len(&self) -> usize {
        self.core.lock().deferred.len()
    }

    pub(crate) fn interrupts_enabled_flag(&self) -> &AtomicBool {
        &self.interrupts_enabled
    }

    pub(crate) fn rings(&self) -> &[Mutex<ReplyRing>] {
        &self.rings
    }

    /// Service every completion source once: the FIFO in simple mode, all
    /// rings in performant mode. Polling-style callers (abort, synchronous
    /// waiters) drive the pipeline with this.
    pub fn pump(&self, hw: &dyn RegisterWindow, now: Nanoseconds) -> usize {
        match self.mode {
            TransportMode::Simple => self.process_completions(hw, now),
            TransportMode::Performant => {
                let mut handled = 0;
                for ring in 0..self.rings.len() {
                    if let Ok(n) = self.process_ring(ring, hw, now) {
                        handled += n;
                    }
                }
                handled
            }
        }
    }

    /// Two-tier cancellation of the command named by `victim`.
    ///
    /// Still on the ready list (or parked for retry): completed locally
    /// with aborted status, hardware never hears about it. Already
    /// submitted: an abort request goes to firmware, in both byte orders
    /// when the board variant wants that, and the caller's budget bounds
    /// how long we poll for the victim to leave the in-flight list.
    pub fn abort(
        &self,
        victim: Tag,
        encoding: crate::abort::AbortEncoding,
        config: crate::abort::AbortConfig,
        hw: &dyn RegisterWindow,
        delay: &dyn Delay,
    ) -> crate::abort::AbortOutcome {
        use crate::abort::{issue_abort_request, AbortOutcome};

        // Tier 1: catch it before hardware ever sees it.
        let fire;
        {
            let mut core = self.core.lock();
            let from_ready =
                core.ready.iter().position(|b| b.tag().same_command(victim)).map(|p| (true, p));
            let from_parked = from_ready.or_else(|| {
                core.deferred
                    .iter()
                    .position(|b| b.tag().same_command(victim))
                    .map(|p| (false, p))
            });
            fire = match from_parked {
                Some((on_ready, pos)) => {
                    let victim_block = if on_ready {
                        core.ready.remove(pos)
                    } else {
                        core.deferred.remove(pos)
                    };
                    match victim_block {
                        Some(b) => self.retire_locked(&mut core, b, CompletionStatus::Aborted),
                        None => None,
                    }
                }
                None => None,
            };
        }
        if let Some((hook, status)) = fire {
            hook.fire(status);
            return AbortOutcome::Success;
        }

        if !self.in_flight_contains(victim) {
            // Completed while we were looking; nothing left to abort.
            return AbortOutcome::Success;
        }

        // Tier 2: firmware's problem now.
        PipelineStats::bump(&self.stats.aborts_issued);
        issue_abort_request(hw, victim, encoding);

        for _ in 0..config.attempts {
            self.pump(hw, Nanoseconds::ZERO);
            if !self.in_flight_contains(victim) {
                return AbortOutcome::Success;
            }
            delay.delay_ms(config.poll_ms);
        }
        log::warn!(
            "ctlr {}: abort of {} did not take within {} polls",
            self.owner.raw(),
            victim,
            config.attempts
        );
        PipelineStats::bump(&self.stats.aborts_failed);
        AbortOutcome::Failed
    }
}
