//! # Administrative Surface
//!
//! Diagnostic operations layered on the same submission/completion
//! contract as everything else: inquiry passthrough, raw register access,
//! forced reset, statistics. Management commands go through the
//! blocking-allocation path, never the fast pool's advertised depth.

use alloc::vec;
use alloc::vec::Vec;

use ciss_command::{CommandKind, CompletionStatus, DataDirection, LunAddr, RequestInfo};
use ciss_pipeline::StatsSnapshot;
use ciss_reset::{BoardState, ResetSequencer};

use crate::scan::INQUIRY;
use crate::{Controller, CoreError};

impl Controller {
    /// Pass a raw inquiry through to a device and return the response
    /// bytes
    pub fn inquiry_passthrough(
        &self,
        target: LunAddr,
        response_len: u8,
    ) -> Result<Vec<u8>, CoreError> {
        let len = (response_len as usize).max(4);
        let buf = self.res.dma.alloc(len).map_err(|_| CoreError::OutOfMemory)?;

        let mut request = RequestInfo {
            target,
            direction: DataDirection::FromDevice,
            transfer_len: len as u32,
            ..Default::default()
        };
        request.cdb[0] = INQUIRY;
        request.cdb[4] = len as u8;
        request.cdb_len = 6;

        let status = self.run_internal(
            CommandKind::Management,
            request,
            &[(buf.bus_addr(), len as u32)],
        )?;
        if status != CompletionStatus::Success {
            return Err(CoreError::Failed(status));
        }
        let mut out = vec![0u8; len];
        buf.read_bytes(0, &mut out).map_err(|_| CoreError::OutOfMemory)?;
        Ok(out)
    }

    /// Raw diagnostic register read
    pub fn read_register(&self, offset: usize) -> u32 {
        let value = self.res.hw.read32(offset);
        log::debug!("{}: reg[{:#x}] -> {:#010x}", self.name(), offset, value);
        value
    }

    /// Raw diagnostic register write. Dangerous by design; logged loudly.
    pub fn write_register(&self, offset: usize, value: u32) {
        log::warn!("{}: raw write reg[{:#x}] = {:#010x}", self.name(), offset, value);
        self.res.hw.write32(offset, value);
    }

    /// Administrative reset: fail everything outstanding, put the board
    /// through recovery, and resume service if it comes back. The one
    /// controller-wide recovery besides the lockup detector's.
    pub fn forced_reset(&self) -> Result<(), CoreError> {
        log::warn!("{}: administrative reset requested", self.name());
        self.pipeline.disable_interrupts(&*self.res.hw);
        let failed = self.pipeline.force_fail_all();
        if failed > 0 {
            log::warn!("{}: {} outstanding commands failed by reset", self.name(), failed);
        }

        let sequencer = ResetSequencer::new(
            &*self.res.hw,
            &*self.res.power,
            &*self.res.delay,
            self.config.reset,
        );
        match sequencer.recover(self.profile, None) {
            BoardState::Ready => {
                // Anything firmware still had queued died with the reset.
                self.pipeline.discard_drain(&*self.res.hw);
                self.pipeline.resume_accepting();
                self.pipeline.enable_interrupts(&*self.res.hw);
                log::info!("{}: back in service after administrative reset", self.name());
                Ok(())
            }
            _ => {
                use ciss_monitor::MonitoredController;
                // Board did not come back; treat it like a lockup.
                let _ = self.mark_lockup();
                log::error!("{}: administrative reset failed, controller disabled", self.name());
                Err(CoreError::Unrecoverable)
            }
        }
    }

    /// Current pipeline counters
    pub fn statistics(&self) -> StatsSnapshot {
        self.pipeline.stats().snapshot()
    }

    /// Zero the pipeline counters
    pub fn reset_statistics(&self) {
        log::info!("{}: statistics reset", self.name());
        self.pipeline.stats().reset();
    }
}
