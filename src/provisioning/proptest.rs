//! Property-Based Tests for the Provisioning Engine
//!
//! # Test Properties
//!
//! 1. **Exact Coverage**: a successful allocation's ranges sum to `nsec`
//! 2. **Counter Balance**: paired allocate/free leaves no outstanding context
//! 3. **Pointer Order**: `write_pointer <= write_pointer_inflight <= end` after
//!    every operation
//! 4. **No Overlap**: live ranges never share a sector

#![cfg(test)]

use std::sync::Arc;

use proptest::prelude::*;

use super::{ProvisioningContext, ProvisioningEngine};
use crate::error::Error;
use crate::group::Group;
use crate::media::{Geometry, MemoryMedia};

// =============================================================================
// Helpers
// =============================================================================

fn engine(data_zones: u32, capacity: u64) -> ProvisioningEngine {
    let media = MemoryMedia::new(
        Geometry {
            groups: 1,
            zones_per_group: data_zones + 1,
            zone_size: 256,
            sector_size: 512,
            mdts_bytes: 64 * 1024,
        },
        capacity,
    );
    let group = Arc::new(Group::open(0, &media, 1).expect("group opens"));
    ProvisioningEngine::new(vec![group], 64, 0).expect("engine builds")
}

fn pointers_ordered(engine: &ProvisioningEngine) -> bool {
    engine.active_group().data_zones().iter().all(|z| {
        let p = z.pointers();
        z.address().slba <= p.write_pointer
            && p.write_pointer <= p.write_pointer_inflight
            && p.write_pointer_inflight <= z.end()
    })
}

/// An operation against the engine: allocate `n` sectors, or free the live
/// context at `index % live.len()`.
#[derive(Debug, Clone)]
enum Op {
    Allocate(u32),
    Free(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u32..=300).prop_map(Op::Allocate),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: every successful allocation covers exactly the request.
    #[test]
    fn prop_ranges_sum_to_request(
        sizes in prop::collection::vec(1u32..=400, 1..20),
    ) {
        let engine = engine(4, 200);
        let mut live = Vec::new();

        for nsec in sizes {
            match engine.allocate(nsec) {
                Ok(ctx) => {
                    let sum: u64 = ctx.ranges().iter().map(|r| r.nsec as u64).sum();
                    prop_assert_eq!(sum, nsec as u64);
                    prop_assert_eq!(ctx.total_sectors(), nsec as u64);
                    live.push(ctx);
                }
                Err(Error::GroupAllocationFailed { available, .. }) => {
                    prop_assert!(available < nsec as u64);
                }
                Err(e) => return Err(TestCaseError::fail(e.to_string())),
            }
        }
    }

    /// Property: interleaved allocate/free keeps pointers ordered, ranges
    /// disjoint, and ends with a quiescent group once everything is freed.
    #[test]
    fn prop_interleaved_ops_keep_invariants(
        ops in prop::collection::vec(op_strategy(), 1..60),
    ) {
        let engine = engine(3, 250);
        let mut live: Vec<ProvisioningContext> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate(nsec) => {
                    if let Ok(ctx) = engine.allocate(nsec) {
                        live.push(ctx);
                    }
                }
                Op::Free(i) => {
                    if !live.is_empty() {
                        let ctx = live.swap_remove(i % live.len());
                        engine.free(ctx);
                    }
                }
            }

            prop_assert!(pointers_ordered(&engine));
            prop_assert_eq!(
                engine.active_group().outstanding_contexts(),
                live.len() as u64
            );

            let mut sectors: Vec<(u64, u64)> = live
                .iter()
                .flat_map(|c| c.ranges().iter().map(|r| (r.slba, r.end())))
                .collect();
            sectors.sort_unstable();
            for pair in sectors.windows(2) {
                prop_assert!(pair[0].1 <= pair[1].0, "overlapping ranges {:?}", pair);
            }
        }

        for ctx in live.drain(..) {
            engine.free(ctx);
        }
        prop_assert!(engine.active_group().is_quiescent());
        prop_assert_eq!(engine.contexts_in_use(), 0);
        prop_assert!(pointers_ordered(&engine));
    }
}
