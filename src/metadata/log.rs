//! Metadata log
//!
//! A single-writer journal over the metadata zone set. Appends are totally
//! ordered by the log lock, which is held across the device I/O so the
//! cursor and the zone write pointers move together.
//!
//! # Wraparound
//!
//! ```text
//!  start                          cursor            limit
//!    │ rec │ rec │ rec │ rec │ rec │░░░░░░░░░░░░░░░░░│
//!                                  ▲
//!            append(len) where cursor*ss + len >= limit*ss
//!                                  │
//!                                  ▼
//!    reset every reserved zone, cursor = start, epoch += 1
//! ```
//!
//! A failed chunk write aborts the append; the cursor keeps the committed
//! prefix and nothing is rolled back.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace};

use super::zone_set::MetadataZoneSet;
use crate::error::{Error, Result};
use crate::media::{DmaBuf, IoCommand, Opcode, ZonedMedia};
use crate::pool::{Pool, Pooled};
use crate::telemetry::Telemetry;

/// Append-only byte journal with automatic wraparound.
pub struct MetadataLog {
    set: Mutex<MetadataZoneSet>,
    media: Arc<dyn ZonedMedia>,
    scratch: Arc<Pool<DmaBuf>>,
    telemetry: Arc<Telemetry>,
}

impl MetadataLog {
    pub fn new(
        set: MetadataZoneSet,
        media: Arc<dyn ZonedMedia>,
        scratch: Arc<Pool<DmaBuf>>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            set: Mutex::new(set),
            media,
            scratch,
            telemetry,
        }
    }

    /// Append `data` and return the sector the record starts at.
    ///
    /// The record is padded with zeroes to whole sectors.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `data` is empty or cannot fit in the zone set
    /// - `PoolExhausted` if no scratch buffer is free
    /// - `WriteFailed` if a zone reset or a chunk write fails
    #[instrument(skip(self, data), fields(len = data.len()), level = "debug")]
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        let offsets = self.append_all(&[data])?;
        offsets
            .first()
            .copied()
            .ok_or_else(|| Error::Internal("append produced no record".into()))
    }

    /// Append several records back to back, each starting on a sector
    /// boundary, and return their start sectors.
    ///
    /// The wrap decision covers the whole batch: the log is reset at most
    /// once, before the first record, so no record of the batch can erase
    /// another. A batch that cannot fit in an empty log is rejected before
    /// any I/O.
    pub fn append_all(&self, records: &[&[u8]]) -> Result<Vec<u64>> {
        if records.is_empty() || records.iter().any(|r| r.is_empty()) {
            return Err(Error::InvalidArgument("empty metadata record".into()));
        }

        let started = Instant::now();
        let mut set = self.set.lock();
        let ss = set.sector_size() as usize;

        let span = Self::batch_span(records, ss);
        if span as u64 >= set.total_sectors() * ss as u64 {
            return Err(Error::InvalidArgument(format!(
                "metadata batch of {} bytes exceeds the {}-sector log",
                span,
                set.total_sectors()
            )));
        }

        let mut scratch = self.scratch_buffer()?;

        if set.would_wrap(span) {
            self.reset(&mut set)?;
        }

        let mut offsets = Vec::with_capacity(records.len());
        for data in records {
            offsets.push(self.write_record(&mut set, &mut scratch, data)?);
        }

        self.telemetry.record_latency("append", started.elapsed());
        debug!(
            records = records.len(),
            start = offsets.first().copied(),
            cursor = set.cursor(),
            epoch = set.epoch(),
            "metadata appended"
        );
        Ok(offsets)
    }

    /// Bytes from the first record's start to the last record's end.
    fn batch_span(records: &[&[u8]], ss: usize) -> usize {
        let (last, head) = match records.split_last() {
            Some(split) => split,
            None => return 0,
        };
        head.iter().map(|r| r.len().div_ceil(ss) * ss).sum::<usize>() + last.len()
    }

    fn write_record(
        &self,
        set: &mut MetadataZoneSet,
        scratch: &mut DmaBuf,
        data: &[u8],
    ) -> Result<u64> {
        let ss = set.sector_size() as usize;
        let start = set.cursor();
        let mut offset = 0usize;
        while offset < data.len() {
            let left = (data.len() - offset).div_ceil(ss) as u32;
            let (slba, nsec) = set
                .extent_at(set.cursor(), left.min(set.max_record_unit()))
                .ok_or_else(|| {
                    Error::Internal(format!("metadata log has no room at sector {}", set.cursor()))
                })?;

            let padded = nsec as usize * ss;
            let take = padded.min(data.len() - offset);
            scratch.load_padded(&data[offset..offset + take], padded)?;

            self.media
                .submit_io(IoCommand::Write {
                    slba,
                    nsec,
                    buf: &scratch[..padded],
                })
                .map_err(|source| {
                    error!(
                        slba,
                        nsec,
                        committed = set.cursor() - start,
                        error = %source,
                        "metadata chunk write failed"
                    );
                    Error::WriteFailed {
                        sector: slba,
                        source,
                    }
                })?;

            self.telemetry.record_io(Opcode::Write, nsec);
            set.advance(slba, nsec);
            offset += take;
            trace!(slba, nsec, cursor = set.cursor(), "metadata chunk written");
        }
        Ok(start)
    }

    /// Copy up to `length` bytes of the log starting at sector `offset` into
    /// `buf`, returning the number of bytes copied.
    ///
    /// The length is clamped to the bytes written between `offset` and the
    /// cursor, so a read never crosses into unwritten sectors.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `offset` lies outside `start..=cursor`, or
    ///   `buf` is shorter than the clamped length
    /// - `PoolExhausted` if no scratch buffer is free
    /// - `ReadFailed` if a chunk read fails
    #[instrument(skip(self, buf), level = "debug")]
    pub fn read(&self, offset: u64, buf: &mut [u8], length: usize) -> Result<usize> {
        let started = Instant::now();
        let set = self.set.lock();
        let ss = set.sector_size() as usize;

        if offset < set.start() || offset > set.cursor() {
            return Err(Error::InvalidArgument(format!(
                "offset {} outside of the written log {}..={}",
                offset,
                set.start(),
                set.cursor()
            )));
        }

        if offset != set.cursor() && set.zone_at(offset).is_none() {
            return Err(Error::InvalidArgument(format!(
                "offset {} lies between metadata zones",
                offset
            )));
        }

        let readable = set.sectors_between(offset, set.cursor()) as usize * ss;
        let length = length.min(readable);
        if buf.len() < length {
            return Err(Error::InvalidArgument(format!(
                "buffer of {} bytes cannot hold {} bytes",
                buf.len(),
                length
            )));
        }

        let mut position = offset;
        let mut copied = 0usize;
        while copied < length {
            let left = (length - copied).div_ceil(ss) as u32;
            let (slba, nsec) = set
                .extent_at(position, left.min(set.read_unit()))
                .ok_or_else(|| {
                    Error::Internal(format!("metadata log has no data at sector {}", position))
                })?;

            let bytes = nsec as usize * ss;
            let mut scratch = self.scratch_buffer()?;
            self.check_scratch(&scratch, bytes)?;

            self.media
                .submit_io(IoCommand::Read {
                    slba,
                    nsec,
                    buf: &mut scratch[..bytes],
                })
                .map_err(|source| {
                    error!(slba, nsec, error = %source, "metadata chunk read failed");
                    Error::ReadFailed {
                        sector: slba,
                        source,
                    }
                })?;
            self.telemetry.record_io(Opcode::Read, nsec);

            let take = bytes.min(length - copied);
            buf[copied..copied + take].copy_from_slice(&scratch[..take]);
            copied += take;
            position = slba + nsec as u64;
        }

        self.telemetry.record_latency("metadata_read", started.elapsed());
        Ok(copied)
    }

    /// Reset every reserved zone and start a new epoch.
    ///
    /// On failure the cursor is left where it was.
    fn reset(&self, set: &mut MetadataZoneSet) -> Result<()> {
        for zone in set.zones() {
            let slba = zone.address().slba;
            self.media.reset_zone(slba).map_err(|source| {
                error!(zone = %zone.address(), error = %source, "metadata zone reset failed");
                Error::WriteFailed {
                    sector: slba,
                    source,
                }
            })?;
            self.telemetry.record_reset();
        }

        set.begin_epoch();
        info!(
            group = set.group(),
            epoch = set.epoch(),
            zones = set.zones().len(),
            "metadata log wrapped"
        );
        Ok(())
    }

    fn scratch_buffer(&self) -> Result<Pooled<DmaBuf>> {
        self.scratch.get().inspect_err(|_| {
            debug!(in_use = self.scratch.in_use(), "scratch pool exhausted");
        })
    }

    fn check_scratch(&self, scratch: &DmaBuf, bytes: usize) -> Result<()> {
        if scratch.len() < bytes {
            return Err(Error::Internal(format!(
                "scratch buffer of {} bytes cannot carry {} bytes",
                scratch.len(),
                bytes
            )));
        }
        Ok(())
    }

    /// Next sector an append starts at (before any wrap it triggers).
    pub fn cursor(&self) -> u64 {
        self.set.lock().cursor()
    }

    /// First sector of the log.
    pub fn start(&self) -> u64 {
        self.set.lock().start()
    }

    /// Resets performed since startup.
    pub fn epoch(&self) -> u64 {
        self.set.lock().epoch()
    }

    pub fn sector_size(&self) -> u32 {
        self.set.lock().sector_size()
    }

    /// Bytes that can be appended before the log wraps.
    pub fn remaining_bytes(&self) -> u64 {
        let set = self.set.lock();
        set.remaining_sectors() * set.sector_size() as u64
    }

    /// Bytes written in the current epoch.
    pub fn used_bytes(&self) -> u64 {
        let set = self.set.lock();
        set.sectors_between(set.start(), set.cursor()) * set.sector_size() as u64
    }

    /// Whether appending `len` bytes now would reset the log first.
    pub fn would_wrap(&self, len: usize) -> bool {
        self.set.lock().would_wrap(len)
    }
}

impl std::fmt::Debug for MetadataLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = self.set.lock();
        f.debug_struct("MetadataLog")
            .field("group", &set.group())
            .field("cursor", &set.cursor())
            .field("epoch", &set.epoch())
            .finish()
    }
}
