//! Zone descriptors
//!
//! A [`ZoneDescriptor`] is the in-memory ground truth for one zone: where it
//! starts, how many sectors it can hold, its device state and its two write
//! pointers. `write_pointer_inflight` moves when sectors are handed out to a
//! provisioning context, `write_pointer` when they are completed. Both are
//! absolute sectors and always satisfy
//!
//! ```text
//! slba <= write_pointer <= write_pointer_inflight <= slba + capacity
//! ```
//!
//! # Zone Lifecycle
//!
//! ```text
//! Empty → Open → Full → (Reset) → Empty
//! ```

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::media::ZoneReport;

// =============================================================================
// Zone Types
// =============================================================================

/// Device-reported state of a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ZoneState {
    /// Zone is empty and ready for writes
    #[default]
    Empty,

    /// Zone is open for writing (has active write pointer)
    Open,

    /// Zone has been closed (no more writes, but data valid)
    Closed,

    /// Zone is full (write pointer at end)
    Full,

    /// Zone is offline or in error state
    Offline,
}

impl fmt::Display for ZoneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneState::Empty => write!(f, "Empty"),
            ZoneState::Open => write!(f, "Open"),
            ZoneState::Closed => write!(f, "Closed"),
            ZoneState::Full => write!(f, "Full"),
            ZoneState::Offline => write!(f, "Offline"),
        }
    }
}

impl ZoneState {
    /// Check if writes are allowed in this state.
    pub fn can_write(&self) -> bool {
        matches!(self, ZoneState::Empty | ZoneState::Open | ZoneState::Closed)
    }
}

/// Physical zone identifier: group, zone index within the group and first
/// sector on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZoneAddress {
    pub group: u16,
    pub zone: u32,
    pub slba: u64,
}

impl ZoneAddress {
    pub fn new(group: u16, zone: u32, slba: u64) -> Self {
        Self { group, zone, slba }
    }

    /// Whether this address names the zone `(group, zone)`.
    pub fn is(&self, group: u16, zone: u32) -> bool {
        self.group == group && self.zone == zone
    }
}

impl fmt::Display for ZoneAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}/z{}@{}", self.group, self.zone, self.slba)
    }
}

/// Persisted availability flags of a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ZoneFlags {
    /// Zone can be used at all
    pub available: bool,
    /// Zone is still held by a previous epoch
    pub reserved: bool,
}

impl ZoneFlags {
    pub const AVAILABLE: ZoneFlags = ZoneFlags {
        available: true,
        reserved: false,
    };
}

/// The group's persisted view of one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneMetadataEntry {
    pub address: ZoneAddress,
    pub flags: ZoneFlags,
}

impl ZoneMetadataEntry {
    /// Derive an entry from a fresh device report: offline zones are
    /// unavailable, nothing is reserved.
    pub fn from_report(group: u16, zone: u32, report: &ZoneReport) -> Self {
        Self {
            address: ZoneAddress::new(group, zone, report.slba),
            flags: ZoneFlags {
                available: report.state != ZoneState::Offline,
                reserved: false,
            },
        }
    }
}

/// A contiguous run of sectors inside one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneRange {
    /// Zone the sectors belong to
    pub zone: ZoneAddress,
    /// First sector of the run (absolute)
    pub slba: u64,
    /// Number of sectors
    pub nsec: u32,
}

impl ZoneRange {
    pub fn new(zone: ZoneAddress, slba: u64, nsec: u32) -> Self {
        Self { zone, slba, nsec }
    }

    /// One past the last sector.
    pub fn end(&self) -> u64 {
        self.slba + self.nsec as u64
    }
}

// =============================================================================
// Descriptor
// =============================================================================

/// Write pointers of a zone, guarded together by the zone lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePointers {
    /// Next sector with completed data
    pub write_pointer: u64,
    /// Next sector not yet handed out
    pub write_pointer_inflight: u64,
}

#[derive(Debug)]
struct ZoneInner {
    pointers: WritePointers,
    state: ZoneState,
}

/// In-memory record of one zone.
#[derive(Debug)]
pub struct ZoneDescriptor {
    address: ZoneAddress,
    capacity: u64,
    flags: ZoneFlags,
    inner: Mutex<ZoneInner>,
}

impl ZoneDescriptor {
    /// Build a descriptor from the device report. Both pointers start at the
    /// reported write pointer.
    pub fn from_report(entry: ZoneMetadataEntry, report: &ZoneReport) -> Self {
        let end = report.slba + report.capacity;
        let wp = report.write_pointer.clamp(report.slba, end);
        Self {
            address: entry.address,
            capacity: report.capacity,
            flags: entry.flags,
            inner: Mutex::new(ZoneInner {
                pointers: WritePointers {
                    write_pointer: wp,
                    write_pointer_inflight: wp,
                },
                state: report.state,
            }),
        }
    }

    pub fn address(&self) -> ZoneAddress {
        self.address
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn flags(&self) -> ZoneFlags {
        self.flags
    }

    /// One past the last writable sector.
    pub fn end(&self) -> u64 {
        self.address.slba + self.capacity
    }

    pub fn state(&self) -> ZoneState {
        self.inner.lock().state
    }

    pub fn pointers(&self) -> WritePointers {
        self.inner.lock().pointers
    }

    /// Sectors not yet handed out.
    pub fn free_sectors(&self) -> u64 {
        let inner = self.inner.lock();
        if inner.state.can_write() {
            self.end() - inner.pointers.write_pointer_inflight
        } else {
            0
        }
    }

    /// Hand out up to `max` sectors from the in-flight pointer.
    ///
    /// Returns the reserved range, or `None` when the zone has no room or is
    /// not writable. The zone turns `Full` once the in-flight pointer reaches
    /// the end.
    pub fn reserve(&self, max: u64) -> Option<ZoneRange> {
        let mut inner = self.inner.lock();
        if !inner.state.can_write() || max == 0 {
            return None;
        }

        let start = inner.pointers.write_pointer_inflight;
        let take = (self.end() - start).min(max).min(u32::MAX as u64);
        if take == 0 {
            return None;
        }

        inner.pointers.write_pointer_inflight += take;
        inner.state = if inner.pointers.write_pointer_inflight == self.end() {
            ZoneState::Full
        } else {
            ZoneState::Open
        };
        debug_assert!(inner.pointers.write_pointer <= inner.pointers.write_pointer_inflight);

        Some(ZoneRange::new(self.address, start, take as u32))
    }

    /// Account `nsec` previously reserved sectors as completed.
    ///
    /// The write pointer never passes the in-flight pointer; the overshoot,
    /// if any, is returned so the caller can report it.
    pub fn complete(&self, nsec: u64) -> u64 {
        let mut inner = self.inner.lock();
        let p = &mut inner.pointers;
        let room = p.write_pointer_inflight - p.write_pointer;
        let done = nsec.min(room);
        p.write_pointer += done;
        nsec - done
    }

    /// Give back a reserved range that was never written.
    ///
    /// If nothing was reserved behind `range`, the in-flight pointer moves
    /// back to its start and the sectors can be handed out again. Otherwise
    /// the device write pointer is stuck below later reservations, so the
    /// zone is retired as `Full`. Returns whether the range was rewound.
    pub fn abandon(&self, range: &ZoneRange) -> bool {
        let mut inner = self.inner.lock();
        let p = &mut inner.pointers;
        if p.write_pointer_inflight == range.end() && p.write_pointer <= range.slba {
            p.write_pointer_inflight = range.slba;
            inner.state = if range.slba == self.address.slba {
                ZoneState::Empty
            } else {
                ZoneState::Open
            };
            true
        } else {
            inner.state = ZoneState::Full;
            false
        }
    }

    /// Move both pointers to `sector` after the device accepted writes up to
    /// it directly (metadata log appends).
    pub fn advance_to(&self, sector: u64) {
        let mut inner = self.inner.lock();
        let sector = sector.clamp(self.address.slba, self.end());
        let p = &mut inner.pointers;
        p.write_pointer = p.write_pointer.max(sector);
        p.write_pointer_inflight = p.write_pointer_inflight.max(sector);
        inner.state = if sector == self.end() {
            ZoneState::Full
        } else {
            ZoneState::Open
        };
    }

    /// Rewind after a device zone reset.
    pub fn rewind(&self) {
        let mut inner = self.inner.lock();
        inner.pointers = WritePointers {
            write_pointer: self.address.slba,
            write_pointer_inflight: self.address.slba,
        };
        inner.state = ZoneState::Empty;
    }
}
