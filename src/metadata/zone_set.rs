//! Metadata zone set bootstrap
//!
//! The first `metadata_zones` zones of a group hold the metadata log. At
//! startup each of them is checked against the group's persisted zone
//! metadata entries, descriptors are seeded from the device report and the
//! log cursor is placed at the first writable sector.
//!
//! The set is addressed as one logical region: sectors between a zone's
//! capacity end and the next zone's start are skipped, so positions always
//! land inside a zone's writable range or at `limit()`.

use tracing::{debug, info};

use crate::config::ZtlConfig;
use crate::error::{Error, Result};
use crate::group::Group;
use crate::media::ZonedMedia;
use crate::zone::{ZoneAddress, ZoneDescriptor};

/// Reserved zones backing the metadata log and the log's position in them.
#[derive(Debug)]
pub struct MetadataZoneSet {
    group: u16,
    zones: Vec<ZoneDescriptor>,
    sector_size: u32,
    max_record_unit: u32,
    read_unit: u32,
    cursor: u64,
    epoch: u64,
}

impl MetadataZoneSet {
    /// Validate the reserved zones of `group` and build the zone set.
    ///
    /// No device command is issued.
    ///
    /// # Errors
    ///
    /// - `AddressMismatch` if a persisted entry names another zone
    /// - `ZoneUnavailable` if a reserved zone is not available
    /// - `ZoneReserved` if a reserved zone is still held by a previous epoch
    pub fn initialize(group: &Group, media: &dyn ZonedMedia, config: &ZtlConfig) -> Result<Self> {
        let geometry = media.geometry();
        let count = group.metadata_zones();
        if count == 0 {
            return Err(Error::Config("metadata log needs at least one zone".into()));
        }

        let mut zones = Vec::with_capacity(count as usize);
        for index in 0..count {
            let expected =
                ZoneAddress::new(group.id(), index, geometry.zone_slba(group.id(), index));
            let (entry, report) = match (group.zone_entry(index), group.zone_report(index)) {
                (Some(entry), Some(report)) => (entry, report),
                _ => return Err(Error::ZoneUnavailable { zone: expected }),
            };

            if entry.address != expected {
                return Err(Error::AddressMismatch {
                    expected,
                    found: entry.address,
                });
            }
            if !entry.flags.available {
                return Err(Error::ZoneUnavailable { zone: expected });
            }
            if entry.flags.reserved {
                return Err(Error::ZoneReserved { zone: expected });
            }

            debug!(
                zone = %expected,
                write_pointer = report.write_pointer,
                state = %report.state,
                "metadata zone validated"
            );
            zones.push(ZoneDescriptor::from_report(*entry, report));
        }

        let mut set = Self {
            group: group.id(),
            zones,
            sector_size: geometry.sector_size,
            max_record_unit: config.write_unit(geometry.sector_size, geometry.mdts_bytes),
            read_unit: config.read_unit(geometry.sector_size, geometry.mdts_bytes),
            cursor: 0,
            epoch: 0,
        };
        set.cursor = set.initial_cursor();

        info!(
            group = set.group,
            zones = count,
            cursor = set.cursor,
            remaining_sectors = set.remaining_sectors(),
            max_record_unit = set.max_record_unit,
            "metadata zone set initialized"
        );
        Ok(set)
    }

    /// First writable sector at or after a zone's write pointer, or `limit()`
    /// when every reserved zone is used up.
    fn initial_cursor(&self) -> u64 {
        self.zones
            .iter()
            .find_map(|zone| {
                let wp = zone.pointers().write_pointer;
                (zone.state().can_write() && wp < zone.end()).then_some(wp)
            })
            .unwrap_or_else(|| self.limit())
    }

    pub fn group(&self) -> u16 {
        self.group
    }

    /// Descriptors of the reserved zones in log order.
    pub fn zones(&self) -> &[ZoneDescriptor] {
        &self.zones
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Largest write command issued by the log, in sectors.
    pub fn max_record_unit(&self) -> u32 {
        self.max_record_unit
    }

    /// Largest read command issued by the log, in sectors.
    pub fn read_unit(&self) -> u32 {
        self.read_unit
    }

    /// Next sector the log appends at.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Number of resets since startup.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// First sector of the log.
    pub fn start(&self) -> u64 {
        self.zones.first().map_or(0, |z| z.address().slba)
    }

    /// End of the last reserved zone's capacity.
    pub fn limit(&self) -> u64 {
        self.zones.last().map_or(0, |z| z.end())
    }

    /// Writable sectors in the whole set.
    pub fn total_sectors(&self) -> u64 {
        self.zones.iter().map(|z| z.capacity()).sum()
    }

    /// Writable sectors in `[from, to)`, skipping gaps between zones.
    pub fn sectors_between(&self, from: u64, to: u64) -> u64 {
        self.zones
            .iter()
            .map(|z| {
                let lo = from.max(z.address().slba);
                let hi = to.min(z.end());
                hi.saturating_sub(lo)
            })
            .sum()
    }

    /// Sectors left before the log wraps.
    pub fn remaining_sectors(&self) -> u64 {
        self.sectors_between(self.cursor, self.limit())
    }

    /// Whether appending `len` bytes at the cursor has to reset the set first.
    pub fn would_wrap(&self, len: usize) -> bool {
        len as u64 >= self.remaining_sectors() * self.sector_size as u64
    }

    /// Move `sector` forward to the nearest writable sector, or `limit()`.
    pub fn normalize(&self, sector: u64) -> u64 {
        self.zones
            .iter()
            .find(|z| sector < z.end())
            .map_or(self.limit(), |z| sector.max(z.address().slba))
    }

    /// Zone whose writable range contains `sector`.
    pub fn zone_at(&self, sector: u64) -> Option<&ZoneDescriptor> {
        self.zones
            .iter()
            .find(|z| z.address().slba <= sector && sector < z.end())
    }

    /// Next transfer of at most `max` sectors starting at `sector`, clipped to
    /// the end of the zone holding it.
    pub fn extent_at(&self, sector: u64, max: u32) -> Option<(u64, u32)> {
        let sector = self.normalize(sector);
        let zone = self.zone_at(sector)?;
        let nsec = (zone.end() - sector).min(max as u64) as u32;
        (nsec > 0).then_some((sector, nsec))
    }

    /// Account `nsec` sectors written at `slba` and move the cursor past them.
    pub fn advance(&mut self, slba: u64, nsec: u32) {
        let end = slba + nsec as u64;
        if let Some(zone) = self.zone_at(slba) {
            zone.advance_to(end);
        }
        self.cursor = self.normalize(end);
    }

    /// Start a new epoch after every reserved zone has been reset.
    pub fn begin_epoch(&mut self) {
        for zone in &self.zones {
            zone.rewind();
        }
        self.cursor = self.start();
        self.epoch += 1;
    }
}
