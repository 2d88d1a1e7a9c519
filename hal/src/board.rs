//! # Stub Board
//!
//! An in-memory controller implementing every HAL trait. Register reads and
//! writes land in a plain map, the completion FIFO is scripted, and resets
//! follow the real handshake (sentinel wipe, not-ready window, ready). The
//! whole driver stack runs against this board in tests, and misbehaving
//! firmware is simulated by toggling the knobs below.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::dma::{DmaAllocator, DmaBuffer, HeapDmaAllocator};
use crate::{regs, table, BusAddr, Delay, HalError, HalResult, PowerControl, PowerState, RegisterWindow};

/// Firmware behavior a test installs on the stub board: invoked with the
/// board and the raw posted value every time the driver posts a command
pub type FirmwareHook = Arc<dyn Fn(&StubBoard, u32) + Send + Sync>;

/// Board identity the stub reports by default (full-featured variant)
pub const STUB_BOARD_ID: u32 = 0x1000_0001;

/// How many scratchpad reads report not-ready after a reset before the
/// board turns ready again
const NOT_READY_READS: u32 = 3;

// Offsets into the config table the board itself pokes. Kept in sync with
// the layout in `table`.
const HEARTBEAT_REG: usize = regs::CONFIG_TABLE + 0x0C;
const DRIVER_SUPPORT_REG: usize = regs::CONFIG_TABLE + 0x10;

/// In-memory controller board
pub struct StubBoard {
    registers: Mutex<BTreeMap<usize, u32>>,
    /// Completions waiting in the outbound fetch FIFO (simple mode)
    completions: Mutex<VecDeque<u32>>,
    /// Tags the driver posted to the inbound queue
    posted: Mutex<Vec<u32>>,
    /// Tags the driver asked firmware to abort
    abort_requests: Mutex<Vec<u32>>,
    /// Scratchpad values to serve before falling back to the register
    scratchpad_script: Mutex<VecDeque<u32>>,
    power_transitions: Mutex<Vec<PowerState>>,
    delayed_ms: AtomicU64,
    resets: AtomicU32,
    /// When false, a reset leaves the driver-support sentinel untouched,
    /// simulating firmware that ignored the reset request
    reset_wipes_sentinel: AtomicBool,
    /// One-shot: firmware treats the next posted command as a reset
    /// message and restarts
    reset_on_post: AtomicBool,
    /// When true, every DMA allocation fails
    dma_exhausted: AtomicBool,
    /// Scripted firmware reaction to posted commands
    firmware: Mutex<Option<FirmwareHook>>,
    dma: HeapDmaAllocator,
}

impl StubBoard {
    /// Create a board with full transport and reset support
    pub fn new() -> Self {
        let board = Self {
            registers: Mutex::new(BTreeMap::new()),
            completions: Mutex::new(VecDeque::new()),
            posted: Mutex::new(Vec::new()),
            abort_requests: Mutex::new(Vec::new()),
            scratchpad_script: Mutex::new(VecDeque::new()),
            power_transitions: Mutex::new(Vec::new()),
            delayed_ms: AtomicU64::new(0),
            resets: AtomicU32::new(0),
            reset_wipes_sentinel: AtomicBool::new(true),
            reset_on_post: AtomicBool::new(false),
            dma_exhausted: AtomicBool::new(false),
            firmware: Mutex::new(None),
            dma: HeapDmaAllocator::new(64),
        };
        board.install_defaults();
        board
    }

    fn install_defaults(&self) {
        let mut r = self.registers.lock();
        r.insert(regs::BOARD_ID, STUB_BOARD_ID);
        r.insert(regs::SCRATCHPAD, regs::board_state::READY);
        r.insert(regs::INTERRUPT_MASK, regs::IntMask::ALL.bits());
        r.insert(regs::CONFIG_TABLE, table::TABLE_SIGNATURE);
        r.insert(
            regs::CONFIG_TABLE + 0x04,
            (table::TransportSupport::SIMPLE
                | table::TransportSupport::PERFORMANT
                | table::TransportSupport::DOORBELL_RESET
                | table::TransportSupport::SOFT_RESET)
                .bits(),
        );
        r.insert(HEARTBEAT_REG, 1);
        r.insert(regs::CONFIG_TABLE + 0x14, 32); // max outstanding
        r.insert(regs::CONFIG_TABLE + 0x18, 64); // max sg entries
        r.insert(regs::CONFIG_TABLE + 0x1C, 4); // reply rings
        r.insert(regs::CONFIG_TABLE + 0x20, 16); // ring depth
    }

    fn register(&self, offset: usize) -> u32 {
        self.registers.lock().get(&offset).copied().unwrap_or(0)
    }

    fn set_register(&self, offset: usize, value: u32) {
        self.registers.lock().insert(offset, value);
    }

    fn perform_reset(&self) {
        let nth = self.resets.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("stub board: firmware restart #{}", nth);
        if self.reset_wipes_sentinel.load(Ordering::SeqCst) {
            self.set_register(DRIVER_SUPPORT_REG, 0);
            // Firmware restarts its heartbeat from scratch.
            self.set_register(HEARTBEAT_REG, 1);
        }
        let mut script = self.scratchpad_script.lock();
        script.clear();
        for _ in 0..NOT_READY_READS {
            script.push_back(regs::board_state::NOT_READY);
        }
        self.set_register(regs::SCRATCHPAD, regs::board_state::READY);
    }

    // ---- test scripting hooks -------------------------------------------

    /// Queue a completed tag into the outbound fetch FIFO
    pub fn push_completion(&self, raw_tag: u32) {
        self.completions.lock().push_back(raw_tag);
        let status = self.register(regs::INTERRUPT_STATUS)
            | regs::IntStatus::COMPLETION_PENDING.bits();
        self.set_register(regs::INTERRUPT_STATUS, status);
    }

    /// Tags posted to the inbound queue so far, in order
    pub fn posted(&self) -> Vec<u32> {
        self.posted.lock().clone()
    }

    /// Abort requests the driver issued, in order
    pub fn abort_requests(&self) -> Vec<u32> {
        self.abort_requests.lock().clone()
    }

    /// Number of resets (doorbell or power-cycle) performed
    pub fn reset_count(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    /// Total milliseconds the driver asked to sleep
    pub fn total_delay_ms(&self) -> u64 {
        self.delayed_ms.load(Ordering::SeqCst)
    }

    /// Power transitions requested so far
    pub fn power_transitions(&self) -> Vec<PowerState> {
        self.power_transitions.lock().clone()
    }

    /// Advance the firmware heartbeat by one
    pub fn bump_heartbeat(&self) {
        let hb = self.register(HEARTBEAT_REG).wrapping_add(1);
        self.set_register(HEARTBEAT_REG, hb);
    }

    /// Report a different board identity
    pub fn set_board_id(&self, id: u32) {
        self.set_register(regs::BOARD_ID, id);
    }

    /// Simulate firmware that ignores reset requests
    pub fn ignore_resets(&self) {
        self.reset_wipes_sentinel.store(false, Ordering::SeqCst);
    }

    /// Script firmware to honor the next posted command as a reset
    /// message: it restarts and runs the usual not-ready/ready handshake
    pub fn reset_on_next_post(&self) {
        self.reset_on_post.store(true, Ordering::SeqCst);
    }

    /// Install scripted firmware: runs synchronously on every posted
    /// command, free to read the command's DMA region, write response
    /// data, and push a completion
    pub fn install_firmware(&self, hook: FirmwareHook) {
        *self.firmware.lock() = Some(hook);
    }

    /// Mark the inbound FIFO full (or clear it again)
    pub fn set_fifo_full(&self, full: bool) {
        let mut status = regs::IntStatus::from_bits_truncate(self.register(regs::INTERRUPT_STATUS));
        status.set(regs::IntStatus::FIFO_FULL, full);
        self.set_register(regs::INTERRUPT_STATUS, status.bits());
    }

    /// Make every subsequent DMA allocation fail
    pub fn exhaust_dma(&self) {
        self.dma_exhausted.store(true, Ordering::SeqCst);
    }

    /// Shared storage behind a bus address, for simulating device writes
    pub fn dma_region(&self, bus: BusAddr) -> Option<Arc<Mutex<Vec<u8>>>> {
        self.dma.region_at(bus)
    }

    /// Raise or clear raw interrupt status bits
    pub fn set_int_status(&self, status: regs::IntStatus) {
        self.set_register(regs::INTERRUPT_STATUS, status.bits());
    }
}

impl Default for StubBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterWindow for StubBoard {
    fn read32(&self, offset: usize) -> u32 {
        match offset {
            regs::OUTBOUND_FETCH => {
                let mut fifo = self.completions.lock();
                match fifo.pop_front() {
                    Some(tag) => tag,
                    None => {
                        // FIFO drained; completion interrupt deasserts.
                        let status = self.register(regs::INTERRUPT_STATUS)
                            & !regs::IntStatus::COMPLETION_PENDING.bits();
                        self.set_register(regs::INTERRUPT_STATUS, status);
                        regs::FIFO_EMPTY
                    }
                }
            }
            regs::SCRATCHPAD => {
                if let Some(v) = self.scratchpad_script.lock().pop_front() {
                    v
                } else {
                    self.register(regs::SCRATCHPAD)
                }
            }
            _ => self.register(offset),
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        match offset {
            regs::INBOUND_POST => {
                self.posted.lock().push(value);
                if self.reset_on_post.swap(false, Ordering::SeqCst) {
                    self.perform_reset();
                }
                let hook = self.firmware.lock().clone();
                if let Some(hook) = hook {
                    hook(self, value);
                }
            }
            regs::ABORT_REQUEST => self.abort_requests.lock().push(value),
            regs::HOST_DOORBELL => {
                self.set_register(offset, value);
                if regs::Doorbell::from_bits_truncate(value).contains(regs::Doorbell::RESET) {
                    self.perform_reset();
                }
            }
            _ => self.set_register(offset, value),
        }
    }
}

impl Delay for StubBoard {
    fn delay_ms(&self, ms: u64) {
        self.delayed_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl PowerControl for StubBoard {
    fn set_power_state(&self, state: PowerState) -> HalResult<()> {
        let mut log = self.power_transitions.lock();
        let was_off = matches!(log.last(), Some(PowerState::D3Hot));
        log.push(state);
        drop(log);
        if state == PowerState::D0 && was_off {
            // Coming back from D3hot restarts firmware.
            self.perform_reset();
        }
        Ok(())
    }
}

impl DmaAllocator for StubBoard {
    fn alloc(&self, len: usize) -> HalResult<DmaBuffer> {
        if self.dma_exhausted.load(Ordering::SeqCst) {
            return Err(HalError::OutOfMemory);
        }
        self.dma.alloc(len)
    }

    fn mask_supported(&self, bits: u32) -> bool {
        self.dma.mask_supported(bits)
    }
}
