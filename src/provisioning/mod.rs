//! Zone Provisioning Engine
//!
//! Turns "I need `nsec` sectors" into one or more physical zone ranges.
//!
//! ```text
//!   allocate(nsec)
//!        │
//!        ▼
//!  ┌──────────────┐  PoolExhausted   ┌──────────────────────┐
//!  │ context pool │ ───────────────▶ │ caller backs off      │
//!  └──────┬───────┘                  └──────────────────────┘
//!         ▼
//!  ┌──────────────┐  GroupAllocationFailed (slot returned)
//!  │ group alloc  │ ───────────────▶
//!  └──────┬───────┘
//!         ▼
//!  ctx { group, ranges[] }   group.outstanding += 1
//! ```
//!
//! A [`ProvisioningContext`] owns its pool slot and a handle on its group.
//! Freeing it (explicitly through [`ProvisioningEngine::free`] or by dropping
//! it) releases every range to the group's accounting, decrements the
//! outstanding-context counter and returns the slot, exactly once.

#[cfg(test)]
mod proptest;

use std::sync::Arc;

use tracing::{instrument, trace, warn};

use crate::error::{Error, Result};
use crate::group::Group;
use crate::pool::{Pool, PoolKind, Pooled};
use crate::zone::ZoneRange;

/// Ranges a single context is expected to span before its slot reallocates
const RANGES_PER_CONTEXT: usize = 4;

// =============================================================================
// Provisioning Context
// =============================================================================

/// Result of one allocation, owned by exactly one writer.
pub struct ProvisioningContext {
    ranges: Pooled<Vec<ZoneRange>>,
    group: Arc<Group>,
    total_sectors: u64,
}

impl ProvisioningContext {
    /// Ranges in allocation order.
    pub fn ranges(&self) -> &[ZoneRange] {
        &self.ranges
    }

    /// Sum of the range lengths; equals the requested sector count.
    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    /// Group the ranges were carved from.
    pub fn group_id(&self) -> u16 {
        self.group.id()
    }
}

impl ProvisioningContext {
    fn abort(mut self, written_sectors: u64) {
        let mut written = written_sectors;
        for range in self.ranges.iter() {
            let done = written.min(range.nsec as u64);
            written -= done;
            if done > 0 {
                self.group
                    .release(&ZoneRange::new(range.zone, range.slba, done as u32));
            }
            if done < range.nsec as u64 {
                let rest = range.nsec - done as u32;
                self.group
                    .abandon(&ZoneRange::new(range.zone, range.slba + done, rest));
            }
        }
        // Drop only decrements the counter and returns the slot now.
        self.ranges.clear();
    }
}

impl Drop for ProvisioningContext {
    fn drop(&mut self) {
        for range in self.ranges.iter() {
            self.group.release(range);
        }
        self.group.ctx_sub();
        self.ranges.clear();
        // The pooled slot goes back to the free list when `ranges` drops.
    }
}

impl std::fmt::Debug for ProvisioningContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningContext")
            .field("group", &self.group.id())
            .field("ranges", &self.ranges())
            .field("total_sectors", &self.total_sectors)
            .finish()
    }
}

// =============================================================================
// Provisioning Engine
// =============================================================================

/// Allocates sector ranges from the active group.
pub struct ProvisioningEngine {
    groups: Vec<Arc<Group>>,
    active: usize,
    pool: Arc<Pool<Vec<ZoneRange>>>,
}

impl ProvisioningEngine {
    /// Create an engine over `groups` with `pool_size` context slots,
    /// allocating from `active_group`.
    pub fn new(groups: Vec<Arc<Group>>, pool_size: usize, active_group: u16) -> Result<Self> {
        let active = groups
            .iter()
            .position(|g| g.id() == active_group)
            .ok_or(Error::GroupNotFound(active_group))?;

        let pool = Pool::new(PoolKind::ProvisioningContext, pool_size, |_| {
            Ok(Vec::with_capacity(RANGES_PER_CONTEXT))
        })?;

        Ok(Self {
            groups,
            active,
            pool,
        })
    }

    /// Reserve `nsec` sectors.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `nsec` is 0
    /// - `PoolExhausted` if every context slot is in use (retryable)
    /// - `GroupAllocationFailed` if the group lacks writable capacity
    #[instrument(skip(self), level = "debug")]
    pub fn allocate(&self, nsec: u32) -> Result<ProvisioningContext> {
        if nsec == 0 {
            return Err(Error::InvalidArgument(
                "allocation of zero sectors".into(),
            ));
        }

        let mut slot = self.pool.get().inspect_err(|_| {
            warn!(nsec, in_use = self.pool.in_use(), "provisioning context pool is empty");
        })?;
        slot.clear();

        let group = self.active_group();
        // On failure `slot` drops here and returns to the pool.
        group.allocate(nsec, &mut slot)?;

        let total_sectors: u64 = slot.iter().map(|r| r.nsec as u64).sum();
        debug_assert_eq!(total_sectors, nsec as u64);

        group.ctx_add();
        trace!(group = group.id(), nsec, ranges = slot.len(), "context allocated");

        Ok(ProvisioningContext {
            ranges: slot,
            group: Arc::clone(group),
            total_sectors,
        })
    }

    /// Release a context: its sectors are accounted as written, the group's
    /// outstanding count drops by one and the slot returns to the pool.
    pub fn free(&self, ctx: ProvisioningContext) {
        trace!(
            group = ctx.group_id(),
            nsec = ctx.total_sectors(),
            "context freed"
        );
        drop(ctx);
    }

    /// Release a context whose data was only partly written.
    ///
    /// The first `written_sectors` sectors, in range order, are accounted as
    /// written. The rest are given back to their zones, which rewinds the
    /// in-flight pointer or retires the zone when later reservations sit
    /// behind the unwritten sectors.
    pub fn abort(&self, ctx: ProvisioningContext, written_sectors: u64) {
        warn!(
            group = ctx.group_id(),
            nsec = ctx.total_sectors(),
            written_sectors,
            "context aborted"
        );
        ctx.abort(written_sectors);
    }

    /// Group serving allocations.
    pub fn active_group(&self) -> &Arc<Group> {
        &self.groups[self.active]
    }

    /// All groups known to the engine.
    pub fn groups(&self) -> &[Arc<Group>] {
        &self.groups
    }

    /// Look up a group by id.
    pub fn group(&self, id: u16) -> Result<&Arc<Group>> {
        self.groups
            .iter()
            .find(|g| g.id() == id)
            .ok_or(Error::GroupNotFound(id))
    }

    /// Context slots currently handed out.
    pub fn contexts_in_use(&self) -> usize {
        self.pool.in_use()
    }

    /// Capacity of the context pool.
    pub fn context_capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Outstanding contexts summed over every group.
    pub fn outstanding_contexts(&self) -> u64 {
        self.groups.iter().map(|g| g.outstanding_contexts()).sum()
    }
}

impl std::fmt::Debug for ProvisioningEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningEngine")
            .field("groups", &self.groups.len())
            .field("active_group", &self.active_group().id())
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Geometry, MemoryMedia};
    use crate::zone::ZoneAddress;
    use assert_matches::assert_matches;

    /// One metadata zone plus `data_zones` zones of `capacity` sectors.
    fn engine(data_zones: u32, capacity: u64, pool_size: usize) -> ProvisioningEngine {
        let media = MemoryMedia::new(
            Geometry {
                groups: 1,
                zones_per_group: data_zones + 1,
                zone_size: 1024,
                sector_size: 512,
                mdts_bytes: 64 * 1024,
            },
            capacity,
        );
        let group = Arc::new(Group::open(0, &media, 1).unwrap());
        ProvisioningEngine::new(vec![group], pool_size, 0).unwrap()
    }

    #[test]
    fn test_zero_sectors_rejected() {
        let engine = engine(1, 1000, 4);
        assert_matches!(engine.allocate(0), Err(Error::InvalidArgument(_)));
        assert_eq!(engine.contexts_in_use(), 0);
    }

    #[test]
    fn test_unknown_active_group() {
        let media = MemoryMedia::new(
            Geometry {
                groups: 1,
                zones_per_group: 2,
                zone_size: 1024,
                sector_size: 512,
                mdts_bytes: 64 * 1024,
            },
            1000,
        );
        let group = Arc::new(Group::open(0, &media, 1).unwrap());
        assert_matches!(
            ProvisioningEngine::new(vec![group], 4, 1),
            Err(Error::GroupNotFound(1))
        );
    }

    #[test]
    fn test_example_scenario() {
        let engine = engine(1, 1000, 4);
        let zone = ZoneAddress::new(0, 1, 1024);

        let first = engine.allocate(300).unwrap();
        assert_eq!(first.ranges(), &[ZoneRange::new(zone, 1024, 300)]);
        assert_eq!(first.total_sectors(), 300);
        let data_zone = &engine.active_group().data_zones()[0];
        assert_eq!(data_zone.pointers().write_pointer_inflight, 1324);

        assert_matches!(
            engine.allocate(800),
            Err(Error::GroupAllocationFailed { available: 700, .. })
        );
        // Failed allocation returned its slot
        assert_eq!(engine.contexts_in_use(), 1);

        let second = engine.allocate(700).unwrap();
        assert_eq!(data_zone.pointers().write_pointer_inflight, 2024);
        assert_eq!(engine.active_group().outstanding_contexts(), 2);

        engine.free(first);
        assert_eq!(engine.active_group().outstanding_contexts(), 1);
        assert_eq!(data_zone.pointers().write_pointer, 1324);

        engine.free(second);
        assert!(engine.active_group().is_quiescent());
        assert_eq!(data_zone.pointers().write_pointer, 2024);
        assert_eq!(engine.contexts_in_use(), 0);
    }

    #[test]
    fn test_pool_exhaustion_leaves_state_unchanged() {
        let engine = engine(1, 1000, 2);
        let a = engine.allocate(10).unwrap();
        let b = engine.allocate(10).unwrap();

        let before = engine.active_group().data_zones()[0].pointers();
        let err = engine.allocate(10).unwrap_err();
        assert_matches!(
            err,
            Error::PoolExhausted {
                kind: PoolKind::ProvisioningContext
            }
        );
        assert!(err.is_retryable());
        assert_eq!(engine.active_group().data_zones()[0].pointers(), before);
        assert_eq!(engine.outstanding_contexts(), 2);

        engine.free(a);
        let c = engine.allocate(10).unwrap();
        drop(b);
        drop(c);
        assert_eq!(engine.outstanding_contexts(), 0);
        assert_eq!(engine.contexts_in_use(), 0);
    }

    #[test]
    fn test_context_spans_zones() {
        let engine = engine(3, 100, 4);
        let ctx = engine.allocate(250).unwrap();

        assert_eq!(ctx.ranges().len(), 3);
        assert_eq!(ctx.total_sectors(), 250);
        let sum: u64 = ctx.ranges().iter().map(|r| r.nsec as u64).sum();
        assert_eq!(sum, 250);
        assert_eq!(ctx.group_id(), 0);
    }

    #[test]
    fn test_abort_rewinds_unwritten_tail() {
        let engine = engine(3, 100, 4);
        let ctx = engine.allocate(150).unwrap();
        assert_eq!(ctx.ranges().len(), 2);

        // 60 of the 100 sectors in the first zone made it to the device
        engine.abort(ctx, 60);
        let zones = engine.active_group().data_zones();
        assert_eq!(zones[0].pointers().write_pointer, 1084);
        assert_eq!(zones[0].pointers().write_pointer_inflight, 1084);
        assert_eq!(zones[1].pointers().write_pointer_inflight, 2048);
        assert_eq!(engine.active_group().free_sectors(), 240);
        assert!(engine.active_group().is_quiescent());
        assert_eq!(engine.contexts_in_use(), 0);

        // The allocator carries on in the zone it used last
        let next = engine.allocate(10).unwrap();
        assert_eq!(next.ranges()[0].slba, 2048);
    }

    #[test]
    fn test_abort_retires_zone_with_later_reservations() {
        let engine = engine(2, 100, 4);
        let failed = engine.allocate(10).unwrap();
        let later = engine.allocate(10).unwrap();

        engine.abort(failed, 0);
        let zones = engine.active_group().data_zones();
        assert_eq!(zones[0].state(), crate::zone::ZoneState::Full);
        assert_eq!(engine.active_group().free_sectors(), 100);

        let next = engine.allocate(5).unwrap();
        assert_eq!(next.ranges()[0].zone.zone, 2);
        drop(later);
        drop(next);
        assert!(engine.active_group().is_quiescent());
    }

    #[test]
    fn test_concurrent_allocate_free_balances() {
        // 4 data zones x 1000 sectors, consumed exactly by 8 threads
        let engine = Arc::new(engine(4, 1000, 16));
        let threads = 8;
        let per_thread = 4000 / threads;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    let mut left = per_thread;
                    while left > 0 {
                        let nsec = left.min(7);
                        match engine.allocate(nsec as u32) {
                            Ok(ctx) => {
                                left -= ctx.total_sectors() as usize;
                                engine.free(ctx);
                            }
                            Err(e) if e.is_retryable() => std::thread::yield_now(),
                            Err(e) => panic!("unexpected allocation error: {e}"),
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let group = engine.active_group();
        assert!(group.is_quiescent());
        assert_eq!(group.free_sectors(), 0);
        for zone in group.data_zones() {
            let p = zone.pointers();
            assert_eq!(p.write_pointer, zone.end());
            assert_eq!(p.write_pointer_inflight, zone.end());
        }
        assert_eq!(engine.contexts_in_use(), 0);
    }
}
