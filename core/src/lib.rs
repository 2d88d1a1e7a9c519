//! # Controller Core
//!
//! One [`Controller`] per physical adapter: it owns the register window,
//! the DMA-backed command pool and reply rings, the transport mode, and the
//! lockup flag, and it is the object the SCSI collaborator talks to.
//!
//! ## Attach sequence
//!
//! ```text
//! DMA capability ─► board identity ─► quirk table ─► reset to READY
//!   ─► config table ─► transport negotiation ─► pipeline (pool + rings)
//!   ─► interrupts on ─► monitor registration
//! ```
//!
//! Any stage failing releases everything acquired so far in reverse order
//! and surfaces a typed [`AttachError`]; a half-attached controller never
//! escapes. A mid-life lockup is terminal: the monitor disables the
//! controller, fails all outstanding work, and only a fresh attach cycle
//! brings the hardware back.

#![no_std]

extern crate alloc;

pub mod admin;
pub mod scan;


use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

use ciss_command::{
    allocate_blocking, CommandKind, CompletionHook, CompletionStatus, ControllerId,
    DataDirection, DoneFn, LunAddr, RequestInfo, Tag, Waiter,
};
use ciss_hal::dma::DmaAllocator;
use ciss_hal::table::{ConfigTable, TransportSupport};
use ciss_hal::{
    regs, BusAddr, Delay, InterruptMode, Nanoseconds, PowerControl, PowerState, RegisterWindow,
};
use ciss_monitor::{ControllerRegistry, MonitoredController};
use ciss_pipeline::{
    AbortConfig, AbortOutcome, InterruptOutcome, Pipeline, PipelineConfig, PipelineError,
    TransportMode,
};
use ciss_reset::{lookup, BoardProfile, BoardState, ResetConfig, ResetSequencer};
use ciss_topology::{DeviceTable, TopologyChange, TopologyResult};

/// Process-wide controller numbering
static NEXT_CONTROLLER_ID: AtomicU32 = AtomicU32::new(1);

/// Errors that abort an attach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    /// Neither 64-bit nor 32-bit DMA addressing is available
    NoDmaSupport,
    /// The board-id register names a variant the driver does not know
    UnknownBoard {
        /// The identity word that failed lookup
        board_id: u32,
    },
    /// No reset method brought the board to ready
    ResetFailed,
    /// The configuration table is missing or malformed
    InvalidConfigTable,
    /// DMA allocation for the pool or rings failed
    OutOfMemory,
    /// A required hardware resource is held elsewhere
    ResourceConflict,
}

/// Errors from synchronous (management/internal) command execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// Dynamic command allocation failed
    OutOfMemory,
    /// The controller refuses new work (lockup declared)
    NotAccepting,
    /// Outstanding-command budget exhausted
    Busy,
    /// Scatter/gather list did not fit
    SegmentOverflow,
    /// No completion within the wait budget
    Timeout,
    /// The command completed, but not successfully
    Failed(CompletionStatus),
    /// Administrative recovery could not revive the board
    Unrecoverable,
}

/// Hardware handles the PCI collaborator provides at attach
pub struct ControllerResources {
    /// Mapped primary register window
    pub hw: Arc<dyn RegisterWindow>,
    /// Power-state control for the device
    pub power: Arc<dyn PowerControl>,
    /// Delay source
    pub delay: Arc<dyn Delay>,
    /// DMA-consistent memory allocator
    pub dma: Arc<dyn DmaAllocator>,
    /// Interrupt delivery granted by the platform
    pub interrupt_mode: InterruptMode,
}

/// Tunables for one controller instance
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    /// Pipeline geometry and retry policy
    pub pipeline: PipelineConfig,
    /// Reset polling budgets
    pub reset: ResetConfig,
    /// Abort polling budget
    pub abort: AbortConfig,
    /// Poll attempts while waiting on an internal command
    pub internal_wait_attempts: u32,
    /// Delay between those polls
    pub internal_poll_ms: u64,
    /// Detach-time polls for in-flight work to drain
    pub detach_drain_attempts: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            reset: ResetConfig::default(),
            abort: AbortConfig::default(),
            internal_wait_attempts: 50,
            internal_poll_ms: 10,
            detach_drain_attempts: 50,
        }
    }
}

/// One SCSI request as handed down by the midlayer collaborator
#[derive(Debug, Clone)]
pub struct ScsiRequest {
    /// Addressed device
    pub target: LunAddr,
    /// Command descriptor block
    pub cdb: [u8; 16],
    /// Valid prefix of `cdb`
    pub cdb_len: u8,
    /// Transfer direction
    pub direction: DataDirection,
    /// Expected transfer length
    pub transfer_len: u32,
    /// Data segments
    pub segments: Vec<(BusAddr, u32)>,
    /// Submitting CPU, for reply ring affinity
    pub cpu_hint: u32,
}

/// Answer to a submission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Work accepted; exactly one completion callback will fire. The tag
    /// is absent when the command was completed on the spot (disabled
    /// controller) and there is nothing left to abort.
    Accepted(Option<Tag>),
    /// Queue full; retry later. No callback will fire.
    Busy,
}

/// One physical adapter instance
pub struct Controller {
    id: ControllerId,
    name: String,
    profile: &'static BoardProfile,
    res: ControllerResources,
    pipeline: Pipeline,
    devices: Mutex<DeviceTable>,
    lockup: AtomicBool,
    config: ControllerConfig,
}

impl core::fmt::Debug for Controller {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Controller")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("profile", &self.profile.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Bring a controller from raw PCI resources to fully operational,
    /// registered with the lockup monitor.
    pub fn attach(
        res: ControllerResources,
        config: ControllerConfig,
        registry: &ControllerRegistry,
    ) -> Result<Arc<Self>, AttachError> {
        // DMA capability first; nothing is worth acquiring without it.
        if !res.dma.mask_supported(64) && !res.dma.mask_supported(32) {
            return Err(AttachError::NoDmaSupport);
        }

        let board_id = res.hw.read32(regs::BOARD_ID);
        let profile = lookup(board_id).ok_or(AttachError::UnknownBoard { board_id })?;
        log::info!("attach: found {} (id {:#010x})", profile.name, board_id);

        // Reset to a known state. The bootstrap pipeline exists only so a
        // soft-reset fallback has a submission path; it is dropped before
        // the real one is built.
        let sequencer =
            ResetSequencer::new(&*res.hw, &*res.power, &*res.delay, config.reset);
        let state = {
            let bootstrap = Pipeline::new(
                &*res.dma,
                ControllerId::new(0),
                TransportMode::Simple,
                PipelineConfig::default(),
            )
            .ok();
            sequencer.recover(profile, bootstrap.as_ref())
        };
        if state != BoardState::Ready {
            return Err(AttachError::ResetFailed);
        }

        let table = ConfigTable::new(&*res.hw);
        if !table.is_valid() {
            return Err(AttachError::InvalidConfigTable);
        }

        // Transport negotiation: performant whenever firmware offers it.
        let support = table.transport_support();
        let mode = if support.contains(TransportSupport::PERFORMANT) {
            TransportMode::Performant
        } else if support.contains(TransportSupport::SIMPLE) {
            TransportMode::Simple
        } else {
            return Err(AttachError::InvalidConfigTable);
        };
        table.request_transport(match mode {
            TransportMode::Performant => TransportSupport::PERFORMANT,
            TransportMode::Simple => TransportSupport::SIMPLE,
        });
        res.hw
            .write32(regs::HOST_DOORBELL, regs::Doorbell::MODE_CHANGE.bits());

        // Geometry: never promise more than firmware or the platform grant.
        let mut pcfg = config.pipeline;
        let hw_max = table.max_outstanding() as usize;
        if hw_max > 0 {
            pcfg.pool.total_slots = pcfg.pool.total_slots.min(hw_max);
        }
        if pcfg.pool.reserved_slots >= pcfg.pool.total_slots {
            pcfg.pool.reserved_slots = pcfg.pool.total_slots / 4;
        }
        pcfg.ring_count = pcfg
            .ring_count
            .min(table.reply_ring_count().max(1) as usize)
            .min(res.interrupt_mode.ring_count());
        let hw_depth = table.reply_ring_depth() as usize;
        if hw_depth > 0 {
            pcfg.ring_depth = pcfg.ring_depth.min(hw_depth);
        }

        let id = ControllerId::new(NEXT_CONTROLLER_ID.fetch_add(1, Ordering::SeqCst));
        let pipeline = Pipeline::new(&*res.dma, id, mode, pcfg).map_err(|err| match err {
            PipelineError::OutOfMemory | PipelineError::Command(_) => AttachError::OutOfMemory,
            _ => AttachError::ResourceConflict,
        })?;

        pipeline.enable_interrupts(&*res.hw);

        let name = alloc::format!("ciss{}", id.raw());
        log::info!(
            "attach: {} ready, {:?} transport, {} rings, depth {}",
            name,
            mode,
            pipeline.ring_count(),
            pipeline.usable_depth()
        );

        let ctrl = Arc::new(Self {
            id,
            name,
            profile,
            res,
            pipeline,
            devices: Mutex::new(DeviceTable::new()),
            lockup: AtomicBool::new(false),
            config,
        });
        let monitored: Arc<dyn MonitoredController> = ctrl.clone();
        registry.register(monitored);
        Ok(ctrl)
    }

    /// Drain in-flight work, leave the monitor, and quiesce the hardware.
    /// DMA memory is released when the last reference drops.
    pub fn detach(self: &Arc<Self>, registry: &ControllerRegistry) {
        log::info!("{}: detaching", self.name);
        for _ in 0..self.config.detach_drain_attempts {
            if self.pipeline.outstanding() == 0 {
                break;
            }
            self.pipeline.pump(&*self.res.hw, Nanoseconds::ZERO);
            self.res.delay.delay_ms(self.config.internal_poll_ms);
        }

        let as_monitored: Arc<dyn MonitoredController> = self.clone();
        registry.unregister(&as_monitored);
        self.pipeline.disable_interrupts(&*self.res.hw);

        let leftovers = self.pipeline.force_fail_all();
        if leftovers > 0 {
            log::warn!("{}: {} commands failed at detach", self.name, leftovers);
        }
    }

    /// Controller name for logs and the administrative surface
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Numeric id
    pub fn id(&self) -> ControllerId {
        self.id
    }

    /// Board variant description
    pub fn profile(&self) -> &'static BoardProfile {
        self.profile
    }

    /// The underlying pipeline; exposed for the host's interrupt glue
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Whether lockup has been declared
    pub fn is_locked_up(&self) -> bool {
        self.lockup.load(Ordering::Acquire)
    }

    // =========================================================================
    // SCSI collaborator surface
    // =========================================================================

    /// Submit one SCSI command. `Busy` means queue-full backpressure and
    /// no callback; `Accepted` means exactly one completion callback.
    pub fn submit_scsi(&self, request: ScsiRequest, done: DoneFn) -> SubmitOutcome {
        if self.is_locked_up() {
            // Disabled controller: fail immediately rather than queue.
            done(CompletionStatus::HardwareError);
            return SubmitOutcome::Accepted(None);
        }

        let Some(mut block) = self.pipeline.allocate(CommandKind::Scsi) else {
            return SubmitOutcome::Busy;
        };

        let info = RequestInfo {
            target: request.target,
            cdb: request.cdb,
            cdb_len: request.cdb_len,
            direction: request.direction,
            transfer_len: request.transfer_len,
        };
        block.prepare(CommandKind::Scsi, info, CompletionHook::Callback(done));
        block.set_cpu_hint(request.cpu_hint);
        if let Err(err) = block.build_sg(&request.segments) {
            log::error!("{}: unbuildable scatter list: {:?}", self.name, err);
            block.take_hook().fire(CompletionStatus::ProtocolError);
            self.pipeline.give_back(block);
            return SubmitOutcome::Accepted(None);
        }
        let tag = block.tag();

        match self.pipeline.enqueue_and_start(block, &*self.res.hw) {
            Ok(()) => SubmitOutcome::Accepted(Some(tag)),
            Err(PipelineError::Busy) => SubmitOutcome::Busy,
            Err(PipelineError::NotAccepting) => SubmitOutcome::Accepted(None),
            Err(err) => {
                log::error!("{}: submission failed: {:?}", self.name, err);
                SubmitOutcome::Busy
            }
        }
    }

    /// Abort a previously accepted command, honoring the board's abort
    /// tag-encoding quirk
    pub fn abort(&self, tag: Tag) -> AbortOutcome {
        self.pipeline.abort(
            tag,
            self.profile.abort_encoding,
            self.config.abort,
            &*self.res.hw,
            &*self.res.delay,
        )
    }

    // =========================================================================
    // Interrupt collaborator surface
    // =========================================================================

    /// Shared-line interrupt entry point
    pub fn handle_interrupt(&self, now: Nanoseconds) -> InterruptOutcome {
        self.pipeline.handle_interrupt(&*self.res.hw, now)
    }

    /// Per-ring (MSI-X) interrupt entry point
    pub fn handle_ring_interrupt(&self, ring: usize, now: Nanoseconds) -> InterruptOutcome {
        self.pipeline
            .handle_ring_interrupt(ring, &*self.res.hw, now)
            .unwrap_or(InterruptOutcome::NotOurs)
    }

    /// Deferred-work entry point: releases parked retries whose backoff
    /// elapsed
    pub fn service_deferred(&self, now: Nanoseconds) -> usize {
        self.pipeline.service_deferred(now, &*self.res.hw)
    }

    // =========================================================================
    // Topology
    // =========================================================================

    /// Poll hardware for current unit lists and reconcile the device
    /// table; returns the changes for the SCSI collaborator to apply
    pub fn rescan_topology(&self) -> TopologyResult<Vec<TopologyChange>> {
        let mut source = scan::PipelineReportSource::new(self);
        let mut devices = self.devices.lock();
        devices.rescan(&mut source)
    }

    /// Currently known device count
    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }

    // =========================================================================
    // Internal synchronous command execution
    // =========================================================================

    /// Run a management/internal command through the blocking-allocation
    /// path and wait for its completion, pumping the completion sources.
    /// On timeout the command is aborted before returning.
    pub(crate) fn run_internal(
        &self,
        kind: CommandKind,
        request: RequestInfo,
        segments: &[(BusAddr, u32)],
    ) -> Result<CompletionStatus, CoreError> {
        let mut block =
            allocate_blocking(&*self.res.dma, self.id).map_err(|_| CoreError::OutOfMemory)?;
        let waiter = Waiter::new();
        block.prepare(kind, request, CompletionHook::Parked(waiter.clone()));
        if !segments.is_empty() {
            block.build_sg(segments).map_err(|_| CoreError::SegmentOverflow)?;
        }
        let tag = block.tag();

        match self.pipeline.enqueue_and_start(block, &*self.res.hw) {
            Ok(()) => {}
            Err(PipelineError::NotAccepting) => return Err(CoreError::NotAccepting),
            Err(PipelineError::Busy) => return Err(CoreError::Busy),
            Err(err) => {
                log::error!("{}: internal submission failed: {:?}", self.name, err);
                return Err(CoreError::Busy);
            }
        }

        let status = waiter.wait(
            self.config.internal_wait_attempts,
            self.config.internal_poll_ms,
            &*self.res.delay,
            || {
                self.pipeline.pump(&*self.res.hw, Nanoseconds::ZERO);
            },
        );
        match status {
            Some(status) => Ok(status),
            None => {
                log::warn!("{}: internal command {} timed out, aborting", self.name, tag);
                let _ = self.pipeline.abort(
                    tag,
                    self.profile.abort_encoding,
                    self.config.abort,
                    &*self.res.hw,
                    &*self.res.delay,
                );
                Err(CoreError::Timeout)
            }
        }
    }
}

// =============================================================================
// Monitor integration
// =============================================================================

impl MonitoredController for Controller {
    fn name(&self) -> &str {
        &self.name
    }

    fn heartbeat(&self) -> u32 {
        ConfigTable::new(&*self.res.hw).heartbeat()
    }

    fn interrupts_serviced(&self) -> u64 {
        self.pipeline.stats().snapshot().interrupts_serviced
    }

    fn lockup_declared(&self) -> bool {
        self.is_locked_up()
    }

    fn mark_lockup(&self) -> bool {
        !self.lockup.swap(true, Ordering::AcqRel)
    }

    fn disable_interrupt_delivery(&self) {
        self.pipeline.disable_interrupts(&*self.res.hw);
    }

    fn disable_device(&self) {
        if self.res.power.set_power_state(PowerState::D3Hot).is_err() {
            log::error!("{}: could not power the device down", self.name);
        }
    }

    fn force_fail_outstanding(&self) -> usize {
        self.pipeline.force_fail_all()
    }
}
