//! Zone Translation Layer Integration Tests
//!
//! Drives the library through its public surface on the in-memory device:
//! - Provisioning: allocation, pool limits, concurrent writers
//! - Metadata log: append/read, wraparound, torn appends
//! - Restart: object table replay from a reopened device

use std::sync::Arc;
use std::thread;

use assert_matches::assert_matches;

use ztl::{
    Error, Geometry, Group, MemoryMedia, MetadataZoneSet, PoolKind, SimDeviceConfig,
    ZoneAddress, ZonedMedia, Ztl, ZtlConfig,
};

fn config(zones_per_group: u32, zone_size: u64, zone_capacity: u64) -> ZtlConfig {
    ZtlConfig {
        context_pool_size: 16,
        scratch_pool_size: 16,
        max_read_sectors: 4,
        max_write_sectors: 4,
        device: SimDeviceConfig {
            groups: 1,
            zones_per_group,
            zone_size,
            zone_capacity,
            sector_size: 512,
            mdts_bytes: 64 * 1024,
        },
        ..ZtlConfig::default()
    }
}

fn media(config: &ZtlConfig) -> Arc<MemoryMedia> {
    Arc::new(MemoryMedia::from_config(&config.device))
}

fn open(media: &Arc<MemoryMedia>, config: &ZtlConfig) -> Ztl {
    let media: Arc<dyn ZonedMedia> = Arc::clone(media) as Arc<dyn ZonedMedia>;
    Ztl::open(media, config.clone()).unwrap()
}

// =============================================================================
// Provisioning
// =============================================================================

mod provisioning_tests {
    use super::*;

    #[test]
    fn test_single_zone_walkthrough() {
        // Metadata zone plus one data zone of 1000 writable sectors
        let config = config(2, 1024, 1000);
        let media = media(&config);
        let ztl = open(&media, &config);
        let engine = ztl.provisioning();
        let zone = &engine.active_group().data_zones()[0];
        assert_eq!(zone.address(), ZoneAddress::new(0, 1, 1024));

        let first = engine.allocate(300).unwrap();
        assert_eq!(first.ranges().len(), 1);
        assert_eq!(first.ranges()[0].zone, zone.address());
        assert_eq!(first.ranges()[0].nsec, 300);
        assert_eq!(zone.pointers().write_pointer_inflight, 1324);

        assert_matches!(
            engine.allocate(800),
            Err(Error::GroupAllocationFailed {
                group: 0,
                requested: 800,
                available: 700,
            })
        );

        let second = engine.allocate(700).unwrap();
        assert_eq!(second.ranges()[0].slba, 1324);
        assert_eq!(zone.pointers().write_pointer_inflight, 2024);
        assert_eq!(engine.active_group().free_sectors(), 0);

        engine.free(first);
        assert_eq!(zone.pointers().write_pointer, 1324);
        assert_eq!(engine.outstanding_contexts(), 1);

        let record = [0x42u8; 50];
        assert_eq!(ztl.metadata_append(&record).unwrap(), 0);
        let mut buf = [0u8; 50];
        assert_eq!(ztl.metadata_read(0, &mut buf, 50).unwrap(), 50);
        assert_eq!(buf, record);

        engine.free(second);
        assert_eq!(zone.pointers().write_pointer, 2024);
        assert!(engine.active_group().is_quiescent());
    }

    #[test]
    fn test_context_pool_exhaustion_is_retryable() {
        let mut config = config(4, 64, 48);
        config.context_pool_size = 1;
        let media = media(&config);
        let ztl = open(&media, &config);

        let held = ztl.provisioning().allocate(2).unwrap();
        let free_before = ztl.provisioning().active_group().free_sectors();

        let err = ztl.write_object(1, b"payload", 0).unwrap_err();
        assert_matches!(
            err,
            Error::PoolExhausted {
                kind: PoolKind::ProvisioningContext
            }
        );
        assert!(err.is_retryable());
        assert_eq!(
            ztl.provisioning().active_group().free_sectors(),
            free_before
        );
        assert!(ztl.object(1).is_none());

        ztl.provisioning().free(held);
        ztl.write_object(1, b"payload", 0).unwrap();
        assert!(ztl.object(1).is_some());
    }

    #[test]
    fn test_concurrent_object_writers() {
        let config = config(4, 1024, 1000);
        let media = media(&config);
        let ztl = Arc::new(open(&media, &config));

        let handles: Vec<_> = (0..8u64)
            .map(|worker| {
                let ztl = Arc::clone(&ztl);
                thread::spawn(move || {
                    for n in 0..8u64 {
                        let id = worker * 100 + n;
                        let data = vec![id as u8; 1500];
                        ztl.write_object(id, &data, 0).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ztl.object_count(), 64);
        assert!(ztl.provisioning().active_group().is_quiescent());

        // 64 objects of 3 sectors each, no sector handed out twice
        let mut sectors: Vec<u64> = Vec::new();
        for worker in 0..8u64 {
            for n in 0..8u64 {
                let id = worker * 100 + n;
                let entry = ztl.object(id).unwrap();
                for range in &entry.ranges {
                    sectors.extend(range.slba..range.end());
                }

                let mut buf = vec![0u8; 1500];
                assert_eq!(ztl.read_object(id, 0, &mut buf).unwrap(), 1500);
                assert!(buf.iter().all(|&b| b == id as u8));
            }
        }
        let total = sectors.len();
        sectors.sort_unstable();
        sectors.dedup();
        assert_eq!(total, 64 * 3);
        assert_eq!(sectors.len(), total);
    }
}

// =============================================================================
// Metadata log
// =============================================================================

mod metadata_tests {
    use super::*;

    #[test]
    fn test_log_wraps_and_resets_its_zone() {
        let config = config(4, 64, 48);
        let media = media(&config);
        let ztl = open(&media, &config);
        let record = vec![0xeeu8; 5000]; // 10 sectors

        let offsets: Vec<u64> = (0..4)
            .map(|_| ztl.metadata_append(&record).unwrap())
            .collect();
        assert_eq!(offsets, vec![0, 10, 20, 30]);
        assert_eq!(ztl.metadata_log().epoch(), 0);

        // 8 sectors left, the fifth record starts a new epoch
        assert_eq!(ztl.metadata_append(&record).unwrap(), 0);
        assert_eq!(ztl.metadata_log().epoch(), 1);
        assert_eq!(ztl.metadata_log().cursor(), 10);
        assert_eq!(media.reset_count(), 1);
        assert_eq!(ztl.stats().zone_resets, 1);

        let mut buf = vec![0u8; 5000];
        assert_eq!(ztl.metadata_read(0, &mut buf, 5000).unwrap(), 5000);
        assert_eq!(buf, record);

        // Data written before the wrap is gone
        assert_matches!(
            ztl.metadata_read(20, &mut buf, 5000),
            Err(Error::InvalidArgument(_))
        );
    }

    #[test]
    fn test_torn_append_keeps_committed_prefix() {
        let config = config(4, 64, 48);
        let media = media(&config);
        let ztl = open(&media, &config);

        // 3000 bytes go out as a 4-sector and a 2-sector chunk
        media.fail_writes_after(1);
        let err = ztl.metadata_append(&[0x11u8; 3000]).unwrap_err();
        assert_matches!(err, Error::WriteFailed { sector: 4, .. });
        assert_eq!(ztl.metadata_log().cursor(), 4);
        media.clear_write_failures();

        assert_eq!(ztl.metadata_append(b"after the tear").unwrap(), 4);
        let mut buf = [0u8; 14];
        assert_eq!(ztl.metadata_read(4, &mut buf, 14).unwrap(), 14);
        assert_eq!(&buf, b"after the tear");
    }

    #[test]
    fn test_metadata_zone_address_mismatch() {
        let config = config(4, 64, 48);
        let media = MemoryMedia::from_config(&config.device);
        let geometry: Geometry = *media.geometry();
        let mut entries: Vec<_> = media
            .report_zones(0)
            .unwrap()
            .iter()
            .enumerate()
            .map(|(i, r)| ztl::ZoneMetadataEntry::from_report(0, i as u32, r))
            .collect();
        entries.swap(0, 1);

        let group = Group::with_entries(0, &media, entries, 1).unwrap();
        let result = MetadataZoneSet::initialize(&group, &media, &config);
        assert_matches!(
            result,
            Err(Error::AddressMismatch { expected, found })
                if expected == ZoneAddress::new(0, 0, geometry.zone_slba(0, 0))
                    && found == ZoneAddress::new(0, 1, geometry.zone_slba(0, 1))
        );
    }
}

// =============================================================================
// Restart
// =============================================================================

mod restart_tests {
    use super::*;

    #[test]
    fn test_objects_survive_reopen() {
        let config = config(4, 64, 48);
        let media = media(&config);
        let data: Vec<u8> = (0..2000).map(|i| (i % 199) as u8).collect();

        {
            let ztl = open(&media, &config);
            ztl.write_object(7, &data, 2).unwrap();
            ztl.write_object(8, b"short-lived", 0).unwrap();
            ztl.delete_object(8).unwrap();
            ztl.shutdown();
        }

        let ztl = open(&media, &config);
        let stats = ztl.replay_stats();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.objects, 1);
        assert!(ztl.object(8).is_none());

        let entry = ztl.object(7).unwrap();
        assert_eq!(entry.size, 2000);
        assert_eq!(entry.level, 2);
        let mut buf = vec![0u8; 2000];
        assert_eq!(ztl.read_object(7, 0, &mut buf).unwrap(), 2000);
        assert_eq!(buf, data);

        // New writes land after the data already on the device
        let ranges = ztl.write_raw(&[0xabu8; 512], 0).unwrap();
        assert!(entry.ranges.iter().all(|r| r.end() <= ranges[0].slba));
    }

    #[test]
    fn test_checkpoint_after_raw_wrap_survives_reopen() {
        let config = config(4, 64, 48);
        let media = media(&config);
        let data = vec![0x3cu8; 1000];

        {
            let ztl = open(&media, &config);
            ztl.write_object(7, &data, 0).unwrap();
            let record = vec![0xeeu8; 5000];
            for _ in 0..5 {
                ztl.metadata_append(&record).unwrap();
            }
            assert_eq!(ztl.metadata_log().epoch(), 1);
            ztl.shutdown();
        }

        let ztl = open(&media, &config);
        let stats = ztl.replay_stats();
        assert_eq!(stats.skipped_sectors, 10);
        assert_eq!(stats.objects, 1);

        let mut buf = vec![0u8; 1000];
        assert_eq!(ztl.read_object(7, 0, &mut buf).unwrap(), 1000);
        assert_eq!(buf, data);
    }

    #[test]
    fn test_raw_wrap_behind_large_checkpoint_survives_reopen() {
        let config = config(4, 64, 48);
        let media = media(&config);
        let raw = vec![0x77u8; 8 * 512];

        {
            let ztl = open(&media, &config);
            for id in 0..30u64 {
                ztl.write_object(id, &[id as u8; 512], 0).unwrap();
            }
            // Leaves 2 of 48 log sectors free
            ztl.metadata_append(&vec![0xeeu8; 16 * 512]).unwrap();
            assert_eq!(ztl.metadata_log().cursor(), 46);

            let offset = ztl.metadata_append(&raw).unwrap();
            assert!(offset >= 2, "checkpoint of 30 objects spans several sectors");
            assert_eq!(ztl.metadata_log().epoch(), 1);
            assert_eq!(media.reset_count(), 1);

            let mut buf = vec![0u8; raw.len()];
            assert_eq!(ztl.metadata_read(offset, &mut buf, raw.len()).unwrap(), raw.len());
            assert_eq!(buf, raw);
            ztl.shutdown();
        }

        let ztl = open(&media, &config);
        assert_eq!(ztl.replay_stats().objects, 30);
        assert_eq!(ztl.replay_stats().skipped_sectors, 8);
        let mut buf = [0u8; 512];
        assert_eq!(ztl.read_object(29, 0, &mut buf).unwrap(), 512);
        assert!(buf.iter().all(|&b| b == 29));
    }
}
