//! # Command Block
//!
//! One outstanding hardware operation: request parameters, scatter/gather
//! list, error record, completion hook, and the tag hardware knows it by.
//! A block is "in use" from allocation until its completion hook has fired
//! and the slot returns to the pool.
//!
//! ## Lifecycle
//!
//! ```text
//! CREATED ──► QUEUED ──► SUBMITTED ──► COMPLETED ──► RELEASED
//!                │                        ▲
//!                └────────────────────────┘   (abort before submission,
//!                                              lockup force-fail)
//! ```

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;
use static_assertions::const_assert_eq;

use ciss_hal::dma::DmaBuffer;
use ciss_hal::{BusAddr, Delay, Nanoseconds};

use crate::sg::SgList;
use crate::tags::Tag;
use crate::{CommandError, CommandResult, ControllerId, ERROR_INFO_OFFSET, SG_AREA_OFFSET};

// =============================================================================
// Addressing and request description
// =============================================================================

/// 8-byte hardware address of a physical or logical unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct LunAddr(pub [u8; 8]);

impl LunAddr {
    /// The controller itself (all-zero address)
    pub const CONTROLLER: Self = Self([0; 8]);

    /// Construct from raw bytes
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Raw address bytes
    pub const fn bytes(&self) -> [u8; 8] {
        self.0
    }
}

/// Data transfer direction for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataDirection {
    /// No data phase
    #[default]
    None,
    /// Data flows to the device
    ToDevice,
    /// Data flows from the device
    FromDevice,
}

/// What kind of work a command block carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandKind {
    /// A SCSI I/O handed down by the midlayer collaborator
    #[default]
    Scsi,
    /// A management/ioctl request from the administrative surface
    Management,
    /// A driver-internal message (reset, abort, rescan probes)
    Internal,
}

/// Request parameters as handed to hardware
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo {
    /// Addressed unit
    pub target: LunAddr,
    /// Command descriptor block bytes
    pub cdb: [u8; 16],
    /// Valid prefix of `cdb`
    pub cdb_len: u8,
    /// Transfer direction
    pub direction: DataDirection,
    /// Expected transfer length in bytes
    pub transfer_len: u32,
}

impl Default for RequestInfo {
    fn default() -> Self {
        Self {
            target: LunAddr::CONTROLLER,
            cdb: [0; 16],
            cdb_len: 0,
            direction: DataDirection::None,
            transfer_len: 0,
        }
    }
}

// =============================================================================
// Completion status taxonomy
// =============================================================================

/// Sense keys the driver itself inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenseKey {
    /// Device not ready
    NotReady,
    /// Device-initiated attention (e.g. another initiator reset it)
    UnitAttention,
    /// Command aborted by the device
    AbortedCommand,
    /// Any other key, carried raw
    Other(u8),
}

impl SenseKey {
    /// Decode from the key nibble of fixed-format sense data
    pub fn from_raw(key: u8) -> Self {
        match key & 0x0F {
            0x2 => SenseKey::NotReady,
            0x6 => SenseKey::UnitAttention,
            0xB => SenseKey::AbortedCommand,
            k => SenseKey::Other(k),
        }
    }
}

/// Final status of a command, as surfaced to the SCSI collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Command succeeded
    Success,
    /// Device reported a SCSI status; sense key attached when sense data
    /// was returned
    TargetStatus {
        /// Raw SCSI status byte
        status: u8,
        /// Decoded sense key, if any
        sense_key: Option<SenseKey>,
    },
    /// Device transferred less than requested; benign, midlayer handles it
    Underrun {
        /// Bytes not transferred
        residual: u32,
    },
    /// Device transferred more than requested
    Overrun,
    /// Firmware rejected the request; treated as device-absent, not as a
    /// driver bug (known firmware behavior)
    Invalid,
    /// Transport protocol error
    ProtocolError,
    /// Controller-level hardware error
    HardwareError,
    /// Device unreachable
    ConnectionLost,
    /// Command was aborted on request
    Aborted,
    /// An abort was requested and did not take
    AbortFailed,
    /// Device aborted the command on its own; soft, retryable
    UnsolicitedAbort,
    /// Command timed out
    Timeout,
    /// Command cannot be aborted
    Unabortable,
}

impl CompletionStatus {
    /// True only for clean success
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionStatus::Success)
    }

    /// Whether the driver should retry this outcome itself (bounded)
    pub fn is_driver_retryable(&self) -> bool {
        matches!(
            self,
            CompletionStatus::TargetStatus { sense_key: Some(SenseKey::UnitAttention), .. }
                | CompletionStatus::UnsolicitedAbort
        )
    }
}

// =============================================================================
// Error record
// =============================================================================

/// Firmware status codes written into the error record
pub mod hwstat {
    /// Completed without error
    pub const SUCCESS: u32 = 0;
    /// Device returned a SCSI status byte
    pub const TARGET_STATUS: u32 = 1;
    /// Short transfer
    pub const DATA_UNDERRUN: u32 = 2;
    /// Long transfer
    pub const DATA_OVERRUN: u32 = 3;
    /// Request rejected as invalid
    pub const INVALID: u32 = 4;
    /// Transport protocol violation
    pub const PROTOCOL: u32 = 5;
    /// Controller hardware fault
    pub const HARDWARE: u32 = 6;
    /// Device unreachable
    pub const CONNECTION_LOST: u32 = 7;
    /// Aborted on host request
    pub const ABORTED: u32 = 8;
    /// Host abort did not take
    pub const ABORT_FAILED: u32 = 9;
    /// Device-initiated abort
    pub const UNSOLICITED_ABORT: u32 = 10;
    /// Firmware-level timeout
    pub const TIMEOUT: u32 = 11;
    /// Not abortable
    pub const UNABORTABLE: u32 = 12;
}

/// Wire layout of the per-command error record
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ErrorInfoLayout {
    /// Firmware status, [`hwstat`]
    pub hw_status: u32,
    /// SCSI status byte from the device
    pub scsi_status: u8,
    /// Valid bytes in `sense`
    pub sense_len: u8,
    /// Reserved
    pub _pad: u16,
    /// Residual byte count for short transfers
    pub residual: u32,
    /// Raw sense data
    pub sense: [u8; 32],
}

const_assert_eq!(core::mem::size_of::<ErrorInfoLayout>(), 44);

/// Size of the serialized error record
pub const ERROR_INFO_SIZE: usize = 44;

/// Decoded per-command error record
#[derive(Debug, Clone, Copy)]
pub struct ErrorInfo {
    /// Firmware status, [`hwstat`]
    pub hw_status: u32,
    /// SCSI status byte
    pub scsi_status: u8,
    /// Residual byte count
    pub residual: u32,
    /// Sense bytes (valid prefix per `sense_len`)
    pub sense: [u8; 32],
    /// Valid bytes in `sense`
    pub sense_len: u8,
}

impl Default for ErrorInfo {
    fn default() -> Self {
        Self { hw_status: hwstat::SUCCESS, scsi_status: 0, residual: 0, sense: [0; 32], sense_len: 0 }
    }
}

impl ErrorInfo {
    /// Read the record out of a command block's DMA region
    pub fn read_from(region: &DmaBuffer) -> Self {
        let mut info = Self::default();
        if let Ok(hw) = region.read_u32(ERROR_INFO_OFFSET) {
            info.hw_status = hw;
        }
        let mut head = [0u8; 4];
        if region.read_bytes(ERROR_INFO_OFFSET + 4, &mut head).is_ok() {
            info.scsi_status = head[0];
            info.sense_len = head[1];
        }
        if let Ok(residual) = region.read_u32(ERROR_INFO_OFFSET + 8) {
            info.residual = residual;
        }
        let mut sense = [0u8; 32];
        if region.read_bytes(ERROR_INFO_OFFSET + 12, &mut sense).is_ok() {
            info.sense = sense;
        }
        info
    }

    /// Write the record into a command block's DMA region; used by firmware
    /// simulations and the force-fail path
    pub fn write_to(&self, region: &DmaBuffer) {
        let _ = region.write_u32(ERROR_INFO_OFFSET, self.hw_status);
        let head = [self.scsi_status, self.sense_len, 0, 0];
        let _ = region.write_bytes(ERROR_INFO_OFFSET + 4, &head);
        let _ = region.write_u32(ERROR_INFO_OFFSET + 8, self.residual);
        let _ = region.write_bytes(ERROR_INFO_OFFSET + 12, &self.sense);
    }

    /// Sense key from the sense data, when present
    pub fn sense_key(&self) -> Option<SenseKey> {
        if self.sense_len >= 3 {
            Some(SenseKey::from_raw(self.sense[2]))
        } else {
            None
        }
    }

    /// Translate the raw record into the upward-facing taxonomy
    pub fn to_status(&self) -> CompletionStatus {
        match self.hw_status {
            hwstat::SUCCESS => CompletionStatus::Success,
            hwstat::TARGET_STATUS => CompletionStatus::TargetStatus {
                status: self.scsi_status,
                sense_key: self.sense_key(),
            },
            hwstat::DATA_UNDERRUN => CompletionStatus::Underrun { residual: self.residual },
            hwstat::DATA_OVERRUN => CompletionStatus::Overrun,
            hwstat::INVALID => CompletionStatus::Invalid,
            hwstat::PROTOCOL => CompletionStatus::ProtocolError,
            hwstat::HARDWARE => CompletionStatus::HardwareError,
            hwstat::CONNECTION_LOST => CompletionStatus::ConnectionLost,
            hwstat::ABORTED => CompletionStatus::Aborted,
            hwstat::ABORT_FAILED => CompletionStatus::AbortFailed,
            hwstat::UNSOLICITED_ABORT => CompletionStatus::UnsolicitedAbort,
            hwstat::TIMEOUT => CompletionStatus::Timeout,
            hwstat::UNABORTABLE => CompletionStatus::Unabortable,
            other => {
                log::warn!("unrecognized firmware status {:#x}, treating as hardware error", other);
                CompletionStatus::HardwareError
            }
        }
    }
}

// =============================================================================
// Completion hooks
// =============================================================================

/// Completion callback for asynchronous submitters
pub type DoneFn = Box<dyn FnOnce(CompletionStatus) + Send>;

/// Synchronous completion handle; a caller parks on it while pumping the
/// completion path.
#[derive(Clone, Default)]
pub struct Waiter {
    state: Arc<WaitState>,
}

#[derive(Default)]
struct WaitState {
    done: AtomicBool,
    status: Mutex<Option<CompletionStatus>>,
}

impl Waiter {
    /// Fresh, unfired waiter
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome and release any parked caller
    pub fn complete(&self, status: CompletionStatus) {
        *self.state.status.lock() = Some(status);
        self.state.done.store(true, Ordering::Release);
    }

    /// Whether the outcome has been recorded
    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }

    /// The recorded outcome, if any
    pub fn status(&self) -> Option<CompletionStatus> {
        *self.state.status.lock()
    }

    /// Poll until done or the attempt budget runs out, invoking `pump`
    /// before each check so the caller can drive completion processing.
    pub fn wait(
        &self,
        attempts: u32,
        poll_ms: u64,
        delay: &dyn Delay,
        mut pump: impl FnMut(),
    ) -> Option<CompletionStatus> {
        for _ in 0..attempts {
            pump();
            if self.is_done() {
                return self.status();
            }
            delay.delay_ms(poll_ms);
        }
        None
    }
}

impl core::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Waiter").field("done", &self.is_done()).finish()
    }
}

/// How a command reports its completion
#[derive(Default)]
pub enum CompletionHook {
    /// Nobody is listening (fire-and-forget internal messages)
    #[default]
    None,
    /// Asynchronous callback
    Callback(DoneFn),
    /// Synchronous waiter
    Parked(Waiter),
}

impl CompletionHook {
    /// Fire the hook with the final status, consuming it
    pub fn fire(self, status: CompletionStatus) {
        match self {
            CompletionHook::None => {}
            CompletionHook::Callback(done) => done(status),
            CompletionHook::Parked(waiter) => waiter.complete(status),
        }
    }
}

impl core::fmt::Debug for CompletionHook {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            CompletionHook::None => "None",
            CompletionHook::Callback(_) => "Callback",
            CompletionHook::Parked(_) => "Parked",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Command state machine
// =============================================================================

/// Lifecycle state of a command block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Allocated, being prepared
    Created,
    /// On the software ready list
    Queued,
    /// Handed to hardware
    Submitted,
    /// Outcome recorded, hook fired
    Completed,
    /// Back in the pool (or dropped, for dynamic blocks)
    Released,
}

impl CommandState {
    /// Whether the lifecycle permits `from → to`
    pub fn can_advance(from: CommandState, to: CommandState) -> bool {
        use CommandState::*;
        matches!(
            (from, to),
            (Created, Queued)
                | (Queued, Submitted)
                | (Queued, Completed)
                | (Submitted, Completed)
                | (Submitted, Queued)
                | (Completed, Released)
        )
    }
}

/// Where a block's storage came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Fixed pool slot
    Pool(u16),
    /// Standalone blocking-path allocation
    Dynamic,
}

// =============================================================================
// The command block
// =============================================================================

/// One outstanding hardware operation
#[derive(Debug)]
pub struct CommandBlock {
    slot: Slot,
    tag: Tag,
    owner: ControllerId,
    kind: CommandKind,
    request: RequestInfo,
    sg: SgList,
    chain: Option<DmaBuffer>,
    region: DmaBuffer,
    state: CommandState,
    hook: CompletionHook,
    retries: u8,
    retry_at: Nanoseconds,
    cpu_hint: u32,
}

impl CommandBlock {
    /// Assemble a block over its storage. Called by the pool and the
    /// blocking allocator; driver code receives blocks, it does not build
    /// them.
    pub(crate) fn assemble(
        slot: Slot,
        tag: Tag,
        owner: ControllerId,
        region: DmaBuffer,
        chain: Option<DmaBuffer>,
    ) -> Self {
        Self {
            slot,
            tag,
            owner,
            kind: CommandKind::default(),
            request: RequestInfo::default(),
            sg: SgList::empty(),
            chain,
            region,
            state: CommandState::Created,
            hook: CompletionHook::None,
            retries: 0,
            retry_at: Nanoseconds::ZERO,
            cpu_hint: 0,
        }
    }

    /// Fill in the request for this use of the block
    pub fn prepare(&mut self, kind: CommandKind, request: RequestInfo, hook: CompletionHook) {
        debug_assert_eq!(self.state, CommandState::Created);
        self.kind = kind;
        self.request = request;
        self.hook = hook;
    }

    /// Build the scatter/gather list from data segments, spilling into the
    /// block's chain storage as needed
    pub fn build_sg(&mut self, segments: &[(BusAddr, u32)]) -> CommandResult<()> {
        self.sg = SgList::build(segments, self.chain.as_ref())?;
        Ok(())
    }

    /// Advance the lifecycle, rejecting transitions the state machine
    /// forbids. Double submission surfaces here as `InvalidTransition`.
    pub fn advance(&mut self, to: CommandState) -> CommandResult<()> {
        if !CommandState::can_advance(self.state, to) {
            return Err(CommandError::InvalidTransition { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }

    /// Serialize header, request, and scatter/gather entries into the DMA
    /// region, making the block fetchable by hardware
    pub fn stage_to_region(&self) {
        let r = &self.region;
        let _ = r.write_u32(0x00, self.tag.raw());
        let _ = r.write_u32(0x04, self.sg.total_segments() as u32);
        let _ = r.write_bytes(0x08, &[self.request.cdb_len]);
        let _ = r.write_bytes(0x09, &self.request.cdb);
        for (i, entry) in self.sg.inline_entries().iter().enumerate() {
            let _ = r.write_bytes(SG_AREA_OFFSET + i * 16, &entry.to_bytes());
        }
    }

    /// Take the completion hook for firing; the block keeps `None`
    pub fn take_hook(&mut self) -> CompletionHook {
        core::mem::take(&mut self.hook)
    }

    /// Read the firmware-written error record from the DMA region
    pub fn read_error_info(&self) -> ErrorInfo {
        ErrorInfo::read_from(&self.region)
    }

    /// Record a driver-retry: bump the counter and compute the earliest
    /// next attempt using exponential backoff from `base`.
    pub fn note_retry(&mut self, now: Nanoseconds, base: Nanoseconds) {
        let factor = 1u64 << self.retries.min(16);
        self.retry_at = now + Nanoseconds::new(base.raw().saturating_mul(factor));
        self.retries = self.retries.saturating_add(1);
    }

    /// Restore the block for its next use; state returns to `Created`
    pub fn reset_for_reuse(&mut self) {
        self.kind = CommandKind::default();
        self.request = RequestInfo::default();
        self.sg.reset();
        self.hook = CompletionHook::None;
        self.state = CommandState::Created;
        self.retries = 0;
        self.retry_at = Nanoseconds::ZERO;
        self.cpu_hint = 0;
    }

    /// Record which CPU the submitter ran on; steers reply ring choice
    pub fn set_cpu_hint(&mut self, cpu: u32) {
        self.cpu_hint = cpu;
    }

    /// Submitter's CPU hint
    pub fn cpu_hint(&self) -> u32 {
        self.cpu_hint
    }

    /// Slot this block occupies
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Hardware tag naming this block
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Owning controller
    pub fn owner(&self) -> ControllerId {
        self.owner
    }

    /// Kind of work carried
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Current lifecycle state
    pub fn state(&self) -> CommandState {
        self.state
    }

    /// Request parameters
    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    /// Scatter/gather list
    pub fn sg(&self) -> &SgList {
        &self.sg
    }

    /// The block's DMA region
    pub fn region(&self) -> &DmaBuffer {
        &self.region
    }

    /// Retries performed so far
    pub fn retries(&self) -> u8 {
        self.retries
    }

    /// Earliest time the next retry may run
    pub fn retry_at(&self) -> Nanoseconds {
        self.retry_at
    }

    /// True for fixed-pool blocks
    pub fn is_pool_backed(&self) -> bool {
        matches!(self.slot, Slot::Pool(_))
    }
}
