//! Zone groups
//!
//! A group is a set of zones managed by one allocation policy. At open time
//! it takes the device zone report and the persisted zone-metadata entries
//! and builds the descriptor table for its data zones. The first
//! `metadata_zones` zones are left to the metadata log and are never handed
//! out by the allocator.
//!
//! The group also carries the outstanding-context counter: every provisioning
//! context carved from the group holds one count until it is freed, which is
//! what teardown or GC quiescence logic waits on.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::media::{ZoneReport, ZonedMedia};
use crate::zone::{ZoneAddress, ZoneDescriptor, ZoneMetadataEntry, ZoneRange};

// =============================================================================
// Zone Allocator
// =============================================================================

/// Policy that turns a sector count into zone ranges.
pub trait ZoneAllocator: Send + Sync {
    /// Reserve exactly `nsec` sectors, possibly across several zones, and
    /// append the ranges to `ranges`. On failure nothing is reserved and
    /// `ranges` is left as it was.
    fn allocate(&self, group: &Group, nsec: u32, ranges: &mut Vec<ZoneRange>) -> Result<()>;

    /// Account a previously allocated range as written.
    fn release(&self, group: &Group, range: &ZoneRange);
}

/// First-fit allocator that fills one zone before moving to the next.
#[derive(Debug, Default)]
pub struct SequentialAllocator {
    /// Index (into the data zones) of the zone currently being filled
    cursor: Mutex<usize>,
}

impl SequentialAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ZoneAllocator for SequentialAllocator {
    fn allocate(&self, group: &Group, nsec: u32, ranges: &mut Vec<ZoneRange>) -> Result<()> {
        let mut cursor = self.cursor.lock();
        let zones = group.data_zones();

        let available: u64 = zones
            .iter()
            .filter(|z| Group::is_allocatable(z))
            .map(|z| z.free_sectors())
            .sum();
        if available < nsec as u64 {
            return Err(Error::GroupAllocationFailed {
                group: group.id(),
                requested: nsec as u64,
                available,
            });
        }

        let first = ranges.len();
        let mut remaining = nsec as u64;
        let count = zones.len();
        for step in 0..count {
            if remaining == 0 {
                break;
            }
            let idx = (*cursor + step) % count;
            let zone = &zones[idx];
            if !Group::is_allocatable(zone) {
                continue;
            }
            if let Some(range) = zone.reserve(remaining) {
                remaining -= range.nsec as u64;
                ranges.push(range);
                *cursor = idx;
            }
        }

        if remaining != 0 {
            // The availability check ran under the same lock, so only a
            // zone changing state behind the allocator gets us here.
            for range in ranges.drain(first..).rev() {
                if let Some(zone) = group.zone(range.zone) {
                    zone.abandon(&range);
                }
            }
            return Err(Error::Internal(format!(
                "group {} lost {} sectors during allocation",
                group.id(),
                remaining
            )));
        }
        Ok(())
    }

    fn release(&self, group: &Group, range: &ZoneRange) {
        match group.zone(range.zone) {
            Some(zone) => {
                let overshoot = zone.complete(range.nsec as u64);
                if overshoot != 0 {
                    error!(
                        zone = %range.zone,
                        overshoot,
                        "released more sectors than were in flight"
                    );
                }
            }
            None => error!(zone = %range.zone, "release for a zone outside of the group"),
        }
    }
}

// =============================================================================
// Group
// =============================================================================

/// A zone group and its data-zone descriptor table.
pub struct Group {
    id: u16,
    metadata_zones: u32,
    report: Vec<ZoneReport>,
    entries: Vec<ZoneMetadataEntry>,
    /// Descriptors for zones `metadata_zones..`
    zones: Vec<ZoneDescriptor>,
    outstanding: AtomicU64,
    allocator: Box<dyn ZoneAllocator>,
}

impl Group {
    /// Open a group, deriving zone metadata entries from the device report.
    pub fn open(id: u16, media: &dyn ZonedMedia, metadata_zones: u32) -> Result<Self> {
        let report = Self::report(id, media)?;
        let entries = report
            .iter()
            .enumerate()
            .map(|(i, r)| ZoneMetadataEntry::from_report(id, i as u32, r))
            .collect();
        Self::build(id, report, entries, metadata_zones)
    }

    /// Open a group with persisted zone metadata entries, one per zone in
    /// zone-index order.
    pub fn with_entries(
        id: u16,
        media: &dyn ZonedMedia,
        entries: Vec<ZoneMetadataEntry>,
        metadata_zones: u32,
    ) -> Result<Self> {
        let report = Self::report(id, media)?;
        Self::build(id, report, entries, metadata_zones)
    }

    /// Replace the default sequential allocator.
    pub fn with_allocator(mut self, allocator: Box<dyn ZoneAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    fn report(id: u16, media: &dyn ZonedMedia) -> Result<Vec<ZoneReport>> {
        media
            .report_zones(id)
            .map_err(|source| Error::ReadFailed {
                sector: media.geometry().zone_slba(id, 0),
                source,
            })
    }

    fn build(
        id: u16,
        report: Vec<ZoneReport>,
        entries: Vec<ZoneMetadataEntry>,
        metadata_zones: u32,
    ) -> Result<Self> {
        if entries.len() != report.len() {
            return Err(Error::InvalidArgument(format!(
                "group {} has {} zones but {} metadata entries",
                id,
                report.len(),
                entries.len()
            )));
        }
        if metadata_zones as usize >= report.len() {
            return Err(Error::InvalidArgument(format!(
                "group {} has {} zones, cannot reserve {} for metadata",
                id,
                report.len(),
                metadata_zones
            )));
        }

        let zones: Vec<ZoneDescriptor> = report
            .iter()
            .zip(entries.iter())
            .skip(metadata_zones as usize)
            .map(|(r, e)| ZoneDescriptor::from_report(*e, r))
            .collect();

        let free: u64 = zones
            .iter()
            .filter(|z| Self::is_allocatable(z))
            .map(|z| z.free_sectors())
            .sum();
        info!(
            group = id,
            zones = report.len(),
            metadata_zones,
            free_sectors = free,
            "zone group opened"
        );

        Ok(Self {
            id,
            metadata_zones,
            report,
            entries,
            zones,
            outstanding: AtomicU64::new(0),
            allocator: Box::new(SequentialAllocator::new()),
        })
    }

    fn is_allocatable(zone: &ZoneDescriptor) -> bool {
        let flags = zone.flags();
        flags.available && !flags.reserved
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Number of leading zones reserved for the metadata log.
    pub fn metadata_zones(&self) -> u32 {
        self.metadata_zones
    }

    /// Total zones in the group.
    pub fn zone_count(&self) -> usize {
        self.report.len()
    }

    /// Device report captured when the group was opened.
    pub fn zone_report(&self, zone: u32) -> Option<&ZoneReport> {
        self.report.get(zone as usize)
    }

    /// Persisted zone metadata entry of a zone.
    pub fn zone_entry(&self, zone: u32) -> Option<&ZoneMetadataEntry> {
        self.entries.get(zone as usize)
    }

    /// Descriptors of the data zones, in zone-index order.
    pub fn data_zones(&self) -> &[ZoneDescriptor] {
        &self.zones
    }

    /// Descriptor of a data zone.
    pub fn zone(&self, address: ZoneAddress) -> Option<&ZoneDescriptor> {
        if address.group != self.id || address.zone < self.metadata_zones {
            return None;
        }
        self.zones
            .get((address.zone - self.metadata_zones) as usize)
            .filter(|z| z.address() == address)
    }

    /// Sectors the allocator could still hand out.
    pub fn free_sectors(&self) -> u64 {
        self.zones
            .iter()
            .filter(|z| Self::is_allocatable(z))
            .map(|z| z.free_sectors())
            .sum()
    }

    /// Ask the group's allocator for `nsec` sectors, appending the ranges to
    /// `ranges`.
    pub fn allocate(&self, nsec: u32, ranges: &mut Vec<ZoneRange>) -> Result<()> {
        let first = ranges.len();
        self.allocator.allocate(self, nsec, ranges)?;
        debug!(
            group = self.id,
            nsec,
            ranges = ranges.len() - first,
            "group allocation"
        );
        Ok(())
    }

    /// Hand a range back to the allocator's accounting.
    pub fn release(&self, range: &ZoneRange) {
        self.allocator.release(self, range);
    }

    /// Give back a reserved range that was never written. The zone is
    /// rewound when possible and retired otherwise.
    pub fn abandon(&self, range: &ZoneRange) {
        match self.zone(range.zone) {
            Some(zone) => {
                if zone.abandon(range) {
                    debug!(zone = %range.zone, slba = range.slba, nsec = range.nsec, "range rewound");
                } else {
                    warn!(
                        zone = %range.zone,
                        slba = range.slba,
                        "unwritten range sits below later reservations, retiring zone"
                    );
                }
            }
            None => error!(zone = %range.zone, "abandon for a zone outside of the group"),
        }
    }

    /// Count one more outstanding context.
    pub fn ctx_add(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Count one context less; never goes below zero.
    pub fn ctx_sub(&self) {
        let result = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if result.is_err() {
            error!(group = self.id, "outstanding context counter underflow");
        }
    }

    /// Contexts carved from this group and not yet freed.
    pub fn outstanding_contexts(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Whether no context is outstanding.
    pub fn is_quiescent(&self) -> bool {
        self.outstanding_contexts() == 0
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("zones", &self.report.len())
            .field("metadata_zones", &self.metadata_zones)
            .field("outstanding", &self.outstanding_contexts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Geometry, MemoryMedia};
    use crate::zone::{ZoneFlags, ZoneState};
    use assert_matches::assert_matches;

    fn media(zones: u32, capacity: u64) -> MemoryMedia {
        MemoryMedia::new(
            Geometry {
                groups: 1,
                zones_per_group: zones,
                zone_size: 1024,
                sector_size: 512,
                mdts_bytes: 64 * 1024,
            },
            capacity,
        )
    }

    fn allocate(group: &Group, nsec: u32) -> Result<Vec<ZoneRange>> {
        let mut ranges = Vec::new();
        group.allocate(nsec, &mut ranges)?;
        Ok(ranges)
    }

    #[test]
    fn test_open_skips_metadata_zones() {
        let media = media(4, 1000);
        let group = Group::open(0, &media, 1).unwrap();

        assert_eq!(group.zone_count(), 4);
        assert_eq!(group.data_zones().len(), 3);
        assert_eq!(group.data_zones()[0].address(), ZoneAddress::new(0, 1, 1024));
        assert_eq!(group.free_sectors(), 3000);
        assert!(group.zone(ZoneAddress::new(0, 0, 0)).is_none());
        assert!(group.zone(ZoneAddress::new(0, 2, 2048)).is_some());
    }

    #[test]
    fn test_allocate_within_one_zone() {
        let media = media(2, 1000);
        let group = Group::open(0, &media, 1).unwrap();

        let ranges = allocate(&group, 300).unwrap();
        assert_eq!(ranges, vec![ZoneRange::new(ZoneAddress::new(0, 1, 1024), 1024, 300)]);
        assert_eq!(group.data_zones()[0].pointers().write_pointer_inflight, 1324);
    }

    #[test]
    fn test_allocate_rolls_into_next_zone() {
        let media = media(3, 100);
        let group = Group::open(0, &media, 1).unwrap();

        allocate(&group, 80).unwrap();
        let ranges = allocate(&group, 50).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].nsec, 20);
        assert_eq!(ranges[0].zone.zone, 1);
        assert_eq!(ranges[1].nsec, 30);
        assert_eq!(ranges[1].zone.zone, 2);
        assert_eq!(ranges[1].slba, 2048);
        assert_eq!(group.data_zones()[0].state(), ZoneState::Full);
    }

    #[test]
    fn test_allocate_fails_without_partial_reservation() {
        let media = media(2, 1000);
        let group = Group::open(0, &media, 1).unwrap();
        allocate(&group, 300).unwrap();

        assert_matches!(
            allocate(&group, 800),
            Err(Error::GroupAllocationFailed {
                group: 0,
                requested: 800,
                available: 700
            })
        );
        assert_eq!(group.free_sectors(), 700);
    }

    #[test]
    fn test_unavailable_zones_are_skipped() {
        let media = media(3, 100);
        let mut entries: Vec<_> = media
            .report_zones(0)
            .unwrap()
            .iter()
            .enumerate()
            .map(|(i, r)| ZoneMetadataEntry::from_report(0, i as u32, r))
            .collect();
        entries[1].flags = ZoneFlags {
            available: true,
            reserved: true,
        };

        let group = Group::with_entries(0, &media, entries, 1).unwrap();
        assert_eq!(group.free_sectors(), 100);
        let ranges = allocate(&group, 100).unwrap();
        assert_eq!(ranges[0].zone.zone, 2);
    }

    #[test]
    fn test_entries_must_match_report() {
        let media = media(3, 100);
        let result = Group::with_entries(0, &media, Vec::new(), 1);
        assert_matches!(result, Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_release_completes_sectors() {
        let media = media(2, 1000);
        let group = Group::open(0, &media, 1).unwrap();
        let ranges = allocate(&group, 10).unwrap();

        group.release(&ranges[0]);
        let p = group.data_zones()[0].pointers();
        assert_eq!(p.write_pointer, 1034);
        assert_eq!(p.write_pointer_inflight, 1034);
    }

    #[test]
    fn test_context_counter_never_underflows() {
        let media = media(2, 1000);
        let group = Group::open(0, &media, 1).unwrap();

        group.ctx_add();
        group.ctx_add();
        assert_eq!(group.outstanding_contexts(), 2);
        group.ctx_sub();
        group.ctx_sub();
        assert!(group.is_quiescent());
        group.ctx_sub();
        assert_eq!(group.outstanding_contexts(), 0);
    }

    #[test]
    fn test_allocate_appends_into_caller_vec() {
        let media = media(2, 1000);
        let group = Group::open(0, &media, 1).unwrap();
        let mut ranges = Vec::with_capacity(4);
        let buffer = ranges.as_ptr();

        group.allocate(10, &mut ranges).unwrap();
        assert_matches!(
            group.allocate(5000, &mut ranges),
            Err(Error::GroupAllocationFailed { .. })
        );
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges.as_ptr(), buffer);
    }

    #[test]
    fn test_abandon_makes_sectors_reusable() {
        let media = media(2, 1000);
        let group = Group::open(0, &media, 1).unwrap();
        let ranges = allocate(&group, 100).unwrap();

        group.abandon(&ranges[0]);
        assert_eq!(group.free_sectors(), 1000);
        assert_eq!(allocate(&group, 10).unwrap()[0].slba, 1024);
    }

    /// Hands out every allocation from the last data zone first.
    struct ReverseAllocator;

    impl ZoneAllocator for ReverseAllocator {
        fn allocate(&self, group: &Group, nsec: u32, ranges: &mut Vec<ZoneRange>) -> Result<()> {
            let first = ranges.len();
            let mut remaining = nsec as u64;
            for zone in group.data_zones().iter().rev() {
                if remaining == 0 {
                    break;
                }
                if let Some(range) = zone.reserve(remaining) {
                    remaining -= range.nsec as u64;
                    ranges.push(range);
                }
            }
            if remaining != 0 {
                for range in ranges.drain(first..) {
                    group.abandon(&range);
                }
                return Err(Error::GroupAllocationFailed {
                    group: group.id(),
                    requested: nsec as u64,
                    available: nsec as u64 - remaining,
                });
            }
            Ok(())
        }

        fn release(&self, group: &Group, range: &ZoneRange) {
            if let Some(zone) = group.zone(range.zone) {
                zone.complete(range.nsec as u64);
            }
        }
    }

    #[test]
    fn test_custom_allocator_is_used() {
        let media = media(3, 100);
        let group = Group::open(0, &media, 1)
            .unwrap()
            .with_allocator(Box::new(ReverseAllocator));

        let ranges = allocate(&group, 150).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].zone.zone, 2);
        assert_eq!(ranges[1].zone.zone, 1);
        assert_eq!(ranges[1].nsec, 50);

        group.release(&ranges[0]);
        assert_eq!(group.data_zones()[1].pointers().write_pointer, 2148);
    }
}
