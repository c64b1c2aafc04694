//! Zone Translation Layer facade
//!
//! Wires the pieces together in dependency order and exposes the surface an
//! object store builds on:
//!
//! ```text
//!  write_object ─┐                        ┌─ metadata_append / read
//!  write_raw ────┼─▶ ProvisioningEngine   │
//!                │      │ ranges          ▼
//!                │      ▼           ObjectTable ──▶ MetadataLog
//!                └─▶ data writes ──────────────────▶ dyn ZonedMedia
//! ```
//!
//! Data writes are serialized from allocation to the last chunk so every
//! zone receives its writes in write-pointer order.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ZtlConfig;
use crate::error::{Error, Result};
use crate::group::Group;
use crate::media::{DmaBuf, Geometry, IoCommand, MemoryMedia, Opcode, ZonedMedia};
use crate::metadata::{MetadataLog, MetadataZoneSet};
use crate::object::{ObjectEntry, ObjectTable, ReplayStats};
use crate::pool::{Pool, PoolKind};
use crate::provisioning::{ProvisioningContext, ProvisioningEngine};
use crate::telemetry::{Telemetry, TelemetrySnapshot};
use crate::zone::ZoneRange;

/// Prefix of in-memory device names
pub const SIM_DEVICE_PREFIX: &str = "sim:";

/// A running translation layer instance.
///
/// Fields are declared in reverse construction order so they drop in
/// reverse as well.
pub struct Ztl {
    objects: ObjectTable,
    log: MetadataLog,
    scratch: Arc<Pool<DmaBuf>>,
    provisioning: ProvisioningEngine,
    telemetry: Arc<Telemetry>,
    media: Arc<dyn ZonedMedia>,
    config: ZtlConfig,
    device: String,
    write_lock: Mutex<()>,
    replay: ReplayStats,
    read_unit: u32,
    write_unit: u32,
}

impl Ztl {
    /// Start an instance on a named device.
    ///
    /// `sim:<name>` creates an in-memory zoned device with the geometry in
    /// `config.device`.
    pub fn init(device: &str, config: ZtlConfig) -> Result<Self> {
        let name = device
            .strip_prefix(SIM_DEVICE_PREFIX)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::UnsupportedDevice(device.to_string()))?;

        config.validate()?;
        let media: Arc<dyn ZonedMedia> = Arc::new(MemoryMedia::from_config(&config.device));
        info!(device, name, "opening simulated zoned device");
        Self::open_named(device, media, config)
    }

    /// Start an instance on any zoned media.
    pub fn open(media: Arc<dyn ZonedMedia>, config: ZtlConfig) -> Result<Self> {
        Self::open_named("media", media, config)
    }

    fn open_named(device: &str, media: Arc<dyn ZonedMedia>, config: ZtlConfig) -> Result<Self> {
        let geometry = *media.geometry();
        Self::check_geometry(&geometry, &config)?;
        let ss = geometry.sector_size;

        let telemetry = Arc::new(Telemetry::new(ss)?);

        let groups = (0..geometry.groups)
            .map(|id| Group::open(id, media.as_ref(), config.metadata_zones).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let provisioning =
            ProvisioningEngine::new(groups, config.context_pool_size, config.active_group)?;

        let scratch_len = config.scratch_buffer_len(ss, geometry.mdts_bytes);
        let scratch = Pool::new(PoolKind::IoScratch, config.scratch_pool_size, |_| {
            DmaBuf::new(scratch_len)
        })?;

        let zone_set =
            MetadataZoneSet::initialize(provisioning.active_group(), media.as_ref(), &config)?;
        let log = MetadataLog::new(
            zone_set,
            Arc::clone(&media),
            Arc::clone(&scratch),
            Arc::clone(&telemetry),
        );

        let objects = ObjectTable::new();
        let replay = objects.replay(&log)?;

        info!(
            device,
            groups = geometry.groups,
            active_group = config.active_group,
            metadata_cursor = log.cursor(),
            objects = replay.objects,
            "zone translation layer initialized"
        );

        Ok(Self {
            objects,
            log,
            scratch,
            provisioning,
            telemetry,
            read_unit: config.read_unit(ss, geometry.mdts_bytes),
            write_unit: config.write_unit(ss, geometry.mdts_bytes),
            media,
            config,
            device: device.to_string(),
            write_lock: Mutex::new(()),
            replay,
        })
    }

    fn check_geometry(geometry: &Geometry, config: &ZtlConfig) -> Result<()> {
        if geometry.sector_size == 0 || !geometry.sector_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "device sector size {} is not a power of 2",
                geometry.sector_size
            )));
        }
        if config.active_group >= geometry.groups {
            return Err(Error::Config(format!(
                "active_group {} is outside of {} groups",
                config.active_group, geometry.groups
            )));
        }
        if config.metadata_zones == 0 || config.metadata_zones >= geometry.zones_per_group {
            return Err(Error::Config(format!(
                "metadata_zones {} must be in 1..{}",
                config.metadata_zones, geometry.zones_per_group
            )));
        }
        if config.context_pool_size == 0 || config.scratch_pool_size == 0 {
            return Err(Error::Config("pool sizes must be > 0".into()));
        }
        Ok(())
    }

    /// Stop the instance, releasing everything in reverse order.
    pub fn shutdown(self) {
        let outstanding = self.provisioning.outstanding_contexts();
        if outstanding > 0 {
            warn!(outstanding, "shutting down with outstanding provisioning contexts");
        }
        info!(
            device = %self.device,
            objects = self.objects.len(),
            metadata_cursor = self.log.cursor(),
            epoch = self.log.epoch(),
            "zone translation layer shut down"
        );
    }

    // =========================================================================
    // Buffers
    // =========================================================================

    /// Allocate a sector-aligned buffer of at least `size` bytes.
    pub fn alloc_dma_buffer(&self, size: usize) -> Result<DmaBuf> {
        DmaBuf::new_aligned(size, self.sector_size())
    }

    /// Release a buffer from [`Ztl::alloc_dma_buffer`].
    pub fn free_dma_buffer(&self, buf: DmaBuf) {
        drop(buf);
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Store `data` as object `id`, replacing any previous version.
    #[instrument(skip(self, data), fields(size = data.len()), level = "debug")]
    pub fn write_object(&self, id: u64, data: &[u8], level: u8) -> Result<()> {
        let started = Instant::now();
        let ctx = self.write_data(data)?;
        let entry = ObjectEntry {
            size: data.len() as u64,
            level,
            ranges: ctx.ranges().to_vec(),
        };
        self.objects.put(&self.log, id, entry)?;
        self.provisioning.free(ctx);
        self.telemetry.record_latency("write_object", started.elapsed());
        Ok(())
    }

    /// Read up to `buf.len()` bytes of object `id` starting at byte `offset`.
    /// Returns the number of bytes copied, which is short at the object end.
    #[instrument(skip(self, buf), fields(len = buf.len()), level = "debug")]
    pub fn read_object(&self, id: u64, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let started = Instant::now();
        let entry = self.objects.get(id).ok_or(Error::ObjectNotFound(id))?;
        if offset > entry.size {
            return Err(Error::InvalidArgument(format!(
                "offset {} past the end of object {} ({} bytes)",
                offset, id, entry.size
            )));
        }

        let len = ((entry.size - offset) as usize).min(buf.len());
        let ss = self.sector_size() as u64;
        let mut skip = offset;
        let mut copied = 0usize;
        for range in &entry.ranges {
            if copied == len {
                break;
            }
            let range_bytes = range.nsec as u64 * ss;
            if skip >= range_bytes {
                skip -= range_bytes;
                continue;
            }
            let first = range.slba + skip / ss;
            copied += self.read_sectors(
                first,
                range.end(),
                (skip % ss) as usize,
                &mut buf[copied..len],
            )?;
            skip = 0;
        }

        self.telemetry.record_latency("read_object", started.elapsed());
        Ok(copied)
    }

    /// Remove object `id`. Its sectors are not reclaimed.
    pub fn delete_object(&self, id: u64) -> Result<()> {
        self.objects.delete(&self.log, id)?;
        Ok(())
    }

    /// Current table entry for object `id`.
    pub fn object(&self, id: u64) -> Option<ObjectEntry> {
        self.objects.get(id)
    }

    /// Number of objects in the table.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// What the object table rebuilt from the log at startup.
    pub fn replay_stats(&self) -> ReplayStats {
        self.replay
    }

    // =========================================================================
    // Raw I/O
    // =========================================================================

    /// Write `data` to freshly provisioned sectors and return where it went.
    /// The caller owns recovery of the returned ranges.
    pub fn write_raw(&self, data: &[u8], level: u8) -> Result<Vec<ZoneRange>> {
        let ctx = self.write_data(data)?;
        let ranges = ctx.ranges().to_vec();
        debug!(size = data.len(), level, ranges = ranges.len(), "raw write");
        self.provisioning.free(ctx);
        Ok(ranges)
    }

    /// Read `buf.len()` bytes starting at device byte `offset`.
    ///
    /// A read may span zones but not the unwritable tail of a zone whose
    /// capacity is below its size.
    pub fn read_raw(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let geometry = self.media.geometry();
        let ss = geometry.sector_size as u64;
        let mut sector = offset / ss;
        let mut skip = (offset % ss) as usize;
        let mut copied = 0usize;

        while copied < buf.len() {
            let zone_end = (sector / geometry.zone_size + 1) * geometry.zone_size;
            let n = self.read_sectors(sector, zone_end, skip, &mut buf[copied..])?;
            if n == 0 {
                break;
            }
            copied += n;
            sector = zone_end;
            skip = 0;
        }
        Ok(copied)
    }

    /// Allocate sectors for `data` and write it through the scratch pool.
    ///
    /// If a chunk fails, the sectors already written are completed and the
    /// rest are given back to their zones before the lock is released, so
    /// the next write starts at the device write pointer.
    fn write_data(&self, data: &[u8]) -> Result<ProvisioningContext> {
        let ss = self.sector_size();
        let nsec = u32::try_from(data.len().div_ceil(ss)).map_err(|_| {
            Error::InvalidArgument(format!("write of {} bytes is too large", data.len()))
        })?;

        let _serial = self.write_lock.lock();
        let ctx = self.provisioning.allocate(nsec)?;

        let mut written = 0u64;
        match self.write_ranges(ctx.ranges(), data, &mut written) {
            Ok(()) => {
                self.telemetry.record_user_write(data.len() as u64);
                Ok(ctx)
            }
            Err(e) => {
                self.provisioning.abort(ctx, written);
                Err(e)
            }
        }
    }

    /// Write `data` over `ranges` in transfer-sized chunks, counting the
    /// sectors the device accepted in `written`.
    fn write_ranges(&self, ranges: &[ZoneRange], data: &[u8], written: &mut u64) -> Result<()> {
        let ss = self.sector_size();
        let mut offset = 0usize;
        for range in ranges {
            let mut sector = range.slba;
            while sector < range.end() {
                let nsec = (range.end() - sector).min(self.write_unit as u64) as u32;
                let padded = nsec as usize * ss;
                let take = padded.min(data.len() - offset);

                let mut scratch = self.scratch.get()?;
                scratch.load_padded(&data[offset..offset + take], padded)?;

                self.media
                    .submit_io(IoCommand::Write {
                        slba: sector,
                        nsec,
                        buf: &scratch[..padded],
                    })
                    .map_err(|source| {
                        error!(zone = %range.zone, slba = sector, nsec, error = %source, "data write failed");
                        Error::WriteFailed { sector, source }
                    })?;
                self.telemetry.record_io(Opcode::Write, nsec);

                *written += nsec as u64;
                offset += take;
                sector += nsec as u64;
            }
        }
        Ok(())
    }

    /// Read sectors `[slba, end)`, dropping the first `skip` bytes, until
    /// `out` is full or `end` is reached. Returns the bytes copied.
    fn read_sectors(&self, slba: u64, end: u64, mut skip: usize, out: &mut [u8]) -> Result<usize> {
        let ss = self.sector_size();
        let mut sector = slba;
        let mut copied = 0usize;

        while copied < out.len() && sector < end {
            let wanted = (skip + out.len() - copied).div_ceil(ss) as u64;
            let nsec = wanted.min(end - sector).min(self.read_unit as u64) as u32;
            let bytes = nsec as usize * ss;

            let mut scratch = self.scratch.get()?;
            if scratch.len() < bytes {
                return Err(Error::Internal(format!(
                    "scratch buffer of {} bytes cannot carry {} bytes",
                    scratch.len(),
                    bytes
                )));
            }
            self.media
                .submit_io(IoCommand::Read {
                    slba: sector,
                    nsec,
                    buf: &mut scratch[..bytes],
                })
                .map_err(|source| {
                    error!(slba = sector, nsec, error = %source, "data read failed");
                    Error::ReadFailed { sector, source }
                })?;
            self.telemetry.record_io(Opcode::Read, nsec);

            let take = (bytes - skip).min(out.len() - copied);
            out[copied..copied + take].copy_from_slice(&scratch[skip..skip + take]);
            copied += take;
            skip = 0;
            sector += nsec as u64;
        }
        Ok(copied)
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Append caller-owned bytes to the metadata log, returning their sector.
    pub fn metadata_append(&self, data: &[u8]) -> Result<u64> {
        self.objects.append_raw(&self.log, data)
    }

    /// Read back metadata log bytes; see [`MetadataLog::read`].
    pub fn metadata_read(&self, offset: u64, buf: &mut [u8], length: usize) -> Result<usize> {
        self.log.read(offset, buf, length)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn provisioning(&self) -> &ProvisioningEngine {
        &self.provisioning
    }

    pub fn metadata_log(&self) -> &MetadataLog {
        &self.log
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn media(&self) -> &Arc<dyn ZonedMedia> {
        &self.media
    }

    pub fn config(&self) -> &ZtlConfig {
        &self.config
    }

    pub fn sector_size(&self) -> usize {
        self.media.geometry().sector_size as usize
    }

    /// Current I/O counters.
    pub fn stats(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }
}

impl std::fmt::Debug for Ztl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ztl")
            .field("device", &self.device)
            .field("provisioning", &self.provisioning)
            .field("log", &self.log)
            .field("objects", &self.objects.len())
            .finish()
    }
}
