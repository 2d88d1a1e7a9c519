//! # Hardware-Backed Topology Source
//!
//! Implements the topology crate's [`ReportSource`] over the command
//! pipeline: unit lists via the controller report commands, identities via
//! inquiry, all as internal commands on the blocking-allocation path.
//!
//! Response layouts (little-endian throughout):
//!
//! - report: bytes `0..4` list length in bytes, `4..8` reserved, then
//!   8-byte addresses
//! - inquiry: byte `0` peripheral type, `8..16` vendor, `16..32` model,
//!   `36..52` serial, byte `52` RAID level (logical volumes)

use alloc::vec::Vec;

use ciss_command::{CommandKind, CompletionStatus, DataDirection, LunAddr, RequestInfo};
use ciss_hal::dma::DmaBuffer;
use ciss_topology::{
    trim_fixed, DeviceIdentity, DeviceType, RaidLevel, ReportSource, TopologyError,
    TopologyResult,
};

use crate::Controller;

/// Report-logical-units opcode
pub const CISS_REPORT_LOGICAL: u8 = 0xC2;
/// Report-physical-units opcode
pub const CISS_REPORT_PHYSICAL: u8 = 0xC3;
/// Standard inquiry opcode
pub const INQUIRY: u8 = 0x12;

/// Most addresses one report response carries
pub const REPORT_MAX_ENTRIES: usize = 64;
/// Bytes before the first address in a report response
pub const REPORT_HEADER: usize = 8;
/// Bytes requested by an identify inquiry
pub const INQUIRY_RESPONSE_LEN: usize = 64;

const INQ_VENDOR: core::ops::Range<usize> = 8..16;
const INQ_MODEL: core::ops::Range<usize> = 16..32;
const INQ_SERIAL: core::ops::Range<usize> = 36..52;
const INQ_RAID: usize = 52;

/// Parse a report response out of its DMA buffer
pub(crate) fn parse_report(buf: &DmaBuffer) -> TopologyResult<Vec<LunAddr>> {
    let byte_len = buf.read_u32(0).map_err(|_| TopologyError::ReportFailed)? as usize;
    let count = (byte_len / 8).min(REPORT_MAX_ENTRIES);
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let mut addr = [0u8; 8];
        buf.read_bytes(REPORT_HEADER + i * 8, &mut addr)
            .map_err(|_| TopologyError::ReportFailed)?;
        out.push(LunAddr::new(addr));
    }
    Ok(out)
}

/// Parse an inquiry response into identity attributes
pub(crate) fn parse_identity(buf: &DmaBuffer, logical: bool) -> TopologyResult<DeviceIdentity> {
    let mut raw = [0u8; INQUIRY_RESPONSE_LEN];
    buf.read_bytes(0, &mut raw).map_err(|_| TopologyError::InquiryFailed)?;
    Ok(DeviceIdentity {
        device_type: DeviceType::from_raw(raw[0]),
        vendor: trim_fixed(&raw[INQ_VENDOR]),
        model: trim_fixed(&raw[INQ_MODEL]),
        serial: trim_fixed(&raw[INQ_SERIAL]),
        raid_level: logical.then(|| RaidLevel::from_raw(raw[INQ_RAID])),
    })
}

/// [`ReportSource`] over one controller's pipeline
pub(crate) struct PipelineReportSource<'a> {
    ctrl: &'a Controller,
}

impl<'a> PipelineReportSource<'a> {
    pub(crate) fn new(ctrl: &'a Controller) -> Self {
        Self { ctrl }
    }

    fn run_report(&self, opcode: u8) -> TopologyResult<Vec<LunAddr>> {
        let len = REPORT_HEADER + REPORT_MAX_ENTRIES * 8;
        let buf = self
            .ctrl
            .res
            .dma
            .alloc(len)
            .map_err(|_| TopologyError::ReportFailed)?;

        let mut request = RequestInfo {
            direction: DataDirection::FromDevice,
            transfer_len: len as u32,
            ..Default::default()
        };
        request.cdb[0] = opcode;
        request.cdb[6..10].copy_from_slice(&(len as u32).to_le_bytes());
        request.cdb_len = 12;

        let status = self
            .ctrl
            .run_internal(
                CommandKind::Internal,
                request,
                &[(buf.bus_addr(), len as u32)],
            )
            .map_err(|_| TopologyError::ReportFailed)?;
        if status != CompletionStatus::Success {
            log::warn!("{}: unit report {:#04x} failed: {:?}", self.ctrl.name(), opcode, status);
            return Err(TopologyError::ReportFailed);
        }
        parse_report(&buf)
    }
}

impl ReportSource for PipelineReportSource<'_> {
    fn report_physical(&mut self) -> TopologyResult<Vec<LunAddr>> {
        self.run_report(CISS_REPORT_PHYSICAL)
    }

    fn report_logical(&mut self) -> TopologyResult<Vec<LunAddr>> {
        self.run_report(CISS_REPORT_LOGICAL)
    }

    fn identify(&mut self, addr: LunAddr, logical: bool) -> TopologyResult<DeviceIdentity> {
        let buf = self
            .ctrl
            .res
            .dma
            .alloc(INQUIRY_RESPONSE_LEN)
            .map_err(|_| TopologyError::InquiryFailed)?;

        let mut request = RequestInfo {
            target: addr,
            direction: DataDirection::FromDevice,
            transfer_len: INQUIRY_RESPONSE_LEN as u32,
            ..Default::default()
        };
        request.cdb[0] = INQUIRY;
        request.cdb[4] = INQUIRY_RESPONSE_LEN as u8;
        request.cdb_len = 6;

        let status = self
            .ctrl
            .run_internal(
                CommandKind::Internal,
                request,
                &[(buf.bus_addr(), INQUIRY_RESPONSE_LEN as u32)],
            )
            .map_err(|_| TopologyError::InquiryFailed)?;
        if status != CompletionStatus::Success {
            return Err(TopologyError::InquiryFailed);
        }
        parse_identity(&buf, logical)
    }
}

// Firmware-side builder used by board simulations: the mirror image of
// `parse_report`.
#[cfg(test)]
pub(crate) fn write_report(data: &mut [u8], addrs: &[[u8; 8]]) {
    let bytes = (addrs.len() * 8) as u32;
    data[0..4].copy_from_slice(&bytes.to_le_bytes());
    for (i, addr) in addrs.iter().enumerate() {
        data[REPORT_HEADER + i * 8..REPORT_HEADER + (i + 1) * 8].copy_from_slice(addr);
    }
}
