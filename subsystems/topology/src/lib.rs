//! # Device Table & Topology Builder
//!
//! The controller reports physical and logical unit lists on request; this
//! crate reconciles those reports against the previously known device
//! table and emits an ordered change-set the SCSI collaborator applies
//! upstream (device creation, removal, attribute refresh).
//!
//! Address assignment invariants:
//! - an 8-byte hardware address appears at most once in the table
//! - logical units live on bus 0, one target each, lun 0
//! - physical units live on the physical bus; a multi-lun device shares
//!   its target with its lun-0 sibling, and a device does not get a
//!   target/lun until a free pair is found

#![no_std]

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::HashMap;

use ciss_command::LunAddr;

/// Bus number assigned to logical volumes
pub const LOGICAL_BUS: u8 = 0;
/// Bus number assigned to physical devices
pub const PHYSICAL_BUS: u8 = 2;

/// Result type for topology operations
pub type TopologyResult<T> = Result<T, TopologyError>;

/// Errors from topology scanning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyError {
    /// A unit-list report command failed
    ReportFailed,
    /// An inquiry to a reported device failed
    InquiryFailed,
    /// No free target/lun pair on the requested bus
    AddressSpaceExhausted,
}

/// Peripheral device type from the inquiry response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    /// Direct-access block device
    Disk,
    /// Sequential-access device
    Tape,
    /// Storage enclosure processor
    Enclosure,
    /// The RAID controller itself
    RaidController,
    /// Anything else, carried raw
    Other(u8),
}

impl DeviceType {
    /// Decode the peripheral-type byte
    pub fn from_raw(raw: u8) -> Self {
        match raw & 0x1F {
            0x00 => DeviceType::Disk,
            0x01 => DeviceType::Tape,
            0x0C => DeviceType::RaidController,
            0x0D => DeviceType::Enclosure,
            other => DeviceType::Other(other),
        }
    }
}

/// RAID level of a logical volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidLevel {
    /// Striping, no redundancy
    Raid0,
    /// Mirroring (and 1+0)
    Raid1,
    /// Single parity
    Raid5,
    /// Dual parity
    Raid6,
    /// Advanced data guarding
    Adg,
    /// Firmware reported something this driver does not know
    Unknown,
}

impl RaidLevel {
    /// Decode the firmware RAID-level byte
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => RaidLevel::Raid0,
            1 => RaidLevel::Raid1,
            2 => RaidLevel::Raid5,
            3 => RaidLevel::Raid6,
            4 => RaidLevel::Adg,
            _ => RaidLevel::Unknown,
        }
    }
}

/// Identity attributes read from a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Peripheral type
    pub device_type: DeviceType,
    /// Vendor string, trimmed
    pub vendor: String,
    /// Model string, trimmed
    pub model: String,
    /// Serial number, trimmed
    pub serial: String,
    /// RAID level; logical volumes only
    pub raid_level: Option<RaidLevel>,
}

/// Trim a fixed-width inquiry field: trailing spaces and NULs go
pub fn trim_fixed(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .rposition(|&c| c != b' ' && c != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// One row of the device table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    /// Hardware address the controller knows the device by
    pub addr: LunAddr,
    /// Assigned bus
    pub bus: u8,
    /// Assigned target
    pub target: u8,
    /// Assigned lun
    pub lun: u8,
    /// Whether this is a logical volume
    pub is_logical: bool,
    /// Identity attributes
    pub identity: DeviceIdentity,
}

/// A change the SCSI collaborator must apply upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChange {
    /// New device; create it upstream
    Added(DeviceEntry),
    /// Device no longer reported; remove it upstream
    Removed(LunAddr),
    /// Minor attributes changed in place (e.g. RAID level migration)
    Updated(DeviceEntry),
}

/// What a rescan needs from the hardware side. Implemented over the
/// command pipeline (report-luns and inquiry as internal commands).
pub trait ReportSource {
    /// Addresses of all physical devices the controller sees
    fn report_physical(&mut self) -> TopologyResult<Vec<LunAddr>>;

    /// Addresses of all logical volumes
    fn report_logical(&mut self) -> TopologyResult<Vec<LunAddr>>;

    /// Identity attributes for one reported address
    fn identify(&mut self, addr: LunAddr, logical: bool) -> TopologyResult<DeviceIdentity>;
}

// Physical address convention: bytes 0..6 identify the enclosure/bay,
// byte 6 is the lun on that device, byte 7 is reserved.
fn phys_prefix(addr: LunAddr) -> [u8; 6] {
    let b = addr.bytes();
    [b[0], b[1], b[2], b[3], b[4], b[5]]
}

fn phys_lun(addr: LunAddr) -> u8 {
    addr.bytes()[6]
}

/// The reconciling device table
#[derive(Debug, Default)]
pub struct DeviceTable {
    devices: HashMap<LunAddr, DeviceEntry>,
}

impl DeviceTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True when no devices are known
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Look up a device by hardware address
    pub fn get(&self, addr: LunAddr) -> Option<&DeviceEntry> {
        self.devices.get(&addr)
    }

    /// Iterate over all known devices
    pub fn entries(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.devices.values()
    }

    fn first_free_target(&self, bus: u8) -> TopologyResult<u8> {
        for target in 0..=u8::MAX {
            if !self.devices.values().any(|d| d.bus == bus && d.target == target) {
                return Ok(target);
            }
        }
        Err(TopologyError::AddressSpaceExhausted)
    }

    /// Pick bus/target/lun for a newly observed address, honoring the
    /// multi-lun sibling rule for physical devices
    fn assign(&self, addr: LunAddr, logical: bool) -> TopologyResult<(u8, u8, u8)> {
        if logical {
            return Ok((LOGICAL_BUS, self.first_free_target(LOGICAL_BUS)?, 0));
        }
        let lun = phys_lun(addr);
        if lun != 0 {
            // Share the target with the lun-0 sibling when it exists.
            let prefix = phys_prefix(addr);
            if let Some(sibling) = self
                .devices
                .values()
                .find(|d| !d.is_logical && d.lun == 0 && phys_prefix(d.addr) == prefix)
            {
                return Ok((sibling.bus, sibling.target, lun));
            }
        }
        Ok((PHYSICAL_BUS, self.first_free_target(PHYSICAL_BUS)?, lun))
    }

    /// Poll the hardware for current unit lists and reconcile.
    ///
    /// Change ordering: removals first (their targets become reusable),
    /// then additions, then in-place updates.
    pub fn rescan(&mut self, src: &mut dyn ReportSource) -> TopologyResult<Vec<TopologyChange>> {
        let physical = src.report_physical()?;
        let logical = src.report_logical()?;

        let mut reported: Vec<(LunAddr, bool)> = Vec::new();
        // Lun-0 devices first so multi-lun siblings find their target.
        let mut phys_sorted = physical;
        phys_sorted.sort_by_key(phys_lun_key);
        for addr in phys_sorted {
            reported.push((addr, false));
        }
        for addr in logical {
            reported.push((addr, true));
        }

        let mut changes = Vec::new();

        // Removals.
        let gone: Vec<LunAddr> = self
            .devices
            .keys()
            .filter(|known| !reported.iter().any(|(addr, _)| addr == *known))
            .copied()
            .collect();
        for addr in gone {
            self.devices.remove(&addr);
            log::info!("topology: device {:02x?} no longer reported", addr.bytes());
            changes.push(TopologyChange::Removed(addr));
        }

        // Additions and updates.
        for (addr, logical) in reported {
            if let Some(existing) = self.devices.get(&addr) {
                let identity = src.identify(addr, logical)?;
                if identity != existing.identity {
                    let mut updated = existing.clone();
                    updated.identity = identity;
                    self.devices.insert(addr, updated.clone());
                    log::info!(
                        "topology: device {:02x?} attributes changed",
                        addr.bytes()
                    );
                    changes.push(TopologyChange::Updated(updated));
                }
                continue;
            }

            let identity = src.identify(addr, logical)?;
            let (bus, target, lun) = self.assign(addr, logical)?;
            let entry = DeviceEntry { addr, bus, target, lun, is_logical: logical, identity };
            log::info!(
                "topology: new {} device {:02x?} at {}:{}:{}",
                if logical { "logical" } else { "physical" },
                addr.bytes(),
                bus,
                target,
                lun
            );
            self.devices.insert(addr, entry.clone());
            changes.push(TopologyChange::Added(entry));
        }

        Ok(changes)
    }
}

fn phys_lun_key(addr: &LunAddr) -> u8 {
    phys_lun(*addr)
}
