//! Zoned media interface
//!
//! The translation layer does not talk to NVMe directly. It consumes a narrow
//! contract from the media layer: a zone report per group, a zone reset
//! command and synchronous data transfer. Anything that implements
//! [`ZonedMedia`] can sit underneath; [`MemoryMedia`] simulates a zoned
//! namespace in RAM for tests and the `sim:` devices of the CLI.
//!
//! ```text
//!  ┌────────────────────┐   ┌────────────────────┐
//!  │ ProvisioningEngine │   │    MetadataLog     │
//!  └─────────┬──────────┘   └─────────┬──────────┘
//!            │ report_zones           │ submit_io / reset_zone
//!            ▼                        ▼
//!  ┌─────────────────────────────────────────────┐
//!  │              dyn ZonedMedia                  │
//!  │   MemoryMedia  │  (NVMe ZNS backends)        │
//!  └─────────────────────────────────────────────┘
//! ```

pub mod dma_buf;
pub mod memory;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MediaError;
use crate::zone::ZoneState;

pub use dma_buf::{DmaBuf, DMA_ALIGNMENT};
pub use memory::MemoryMedia;

/// Static device geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Number of zone groups
    pub groups: u16,
    /// Zones per group
    pub zones_per_group: u32,
    /// Nominal zone size in sectors (distance between zone starts)
    pub zone_size: u64,
    /// Bytes per sector
    pub sector_size: u32,
    /// Maximum data transfer size per command in bytes
    pub mdts_bytes: u32,
}

impl Geometry {
    /// First sector of a zone.
    pub fn zone_slba(&self, group: u16, zone: u32) -> u64 {
        (group as u64 * self.zones_per_group as u64 + zone as u64) * self.zone_size
    }

    /// Total zones on the device.
    pub fn total_zones(&self) -> u64 {
        self.groups as u64 * self.zones_per_group as u64
    }

    /// Sectors covering `bytes`, rounded up.
    pub fn sectors_for(&self, bytes: usize) -> u64 {
        (bytes as u64).div_ceil(self.sector_size as u64)
    }

    /// Largest transfer the device accepts, in sectors.
    pub fn max_transfer_sectors(&self) -> u32 {
        (self.mdts_bytes / self.sector_size).max(1)
    }
}

/// Device-reported state of one zone (absolute sectors).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneReport {
    /// First sector of the zone
    pub slba: u64,
    /// Writable sectors
    pub capacity: u64,
    /// Next writable sector
    pub write_pointer: u64,
    /// Zone state
    pub state: ZoneState,
}

/// Data transfer opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    Read,
    Write,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Read => write!(f, "read"),
            Opcode::Write => write!(f, "write"),
        }
    }
}

/// A synchronous data transfer command.
#[derive(Debug)]
pub enum IoCommand<'a> {
    /// Read `nsec` sectors starting at `slba` into `buf`
    Read {
        slba: u64,
        nsec: u32,
        buf: &'a mut [u8],
    },
    /// Write `nsec` sectors from `buf` starting at `slba`
    Write { slba: u64, nsec: u32, buf: &'a [u8] },
}

impl IoCommand<'_> {
    /// Opcode of this command.
    pub fn opcode(&self) -> Opcode {
        match self {
            IoCommand::Read { .. } => Opcode::Read,
            IoCommand::Write { .. } => Opcode::Write,
        }
    }

    /// Starting sector.
    pub fn slba(&self) -> u64 {
        match self {
            IoCommand::Read { slba, .. } | IoCommand::Write { slba, .. } => *slba,
        }
    }

    /// Sector count.
    pub fn nsec(&self) -> u32 {
        match self {
            IoCommand::Read { nsec, .. } | IoCommand::Write { nsec, .. } => *nsec,
        }
    }
}

/// Operations the translation layer needs from a zoned device.
pub trait ZonedMedia: Send + Sync {
    /// Static geometry.
    fn geometry(&self) -> &Geometry;

    /// Report every zone of a group, in zone-index order.
    fn report_zones(&self, group: u16) -> Result<Vec<ZoneReport>, MediaError>;

    /// Reset the zone starting at `zone_slba`.
    fn reset_zone(&self, zone_slba: u64) -> Result<(), MediaError>;

    /// Submit a synchronous transfer and wait for its completion.
    fn submit_io(&self, cmd: IoCommand<'_>) -> Result<(), MediaError>;
}
