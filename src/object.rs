//! Object table
//!
//! Maps object ids to the zone ranges holding their data and keeps that map
//! durable through the metadata log. Every mutation is one framed record:
//!
//! ```text
//! ┌───────────┬───────────┬──────────────────────────────┬─────────┐
//! │ magic u32 │ len u32   │ JSON body (len bytes)        │ padding │
//! │   "ZTLO"  │ LE        │ put / delete / checkpoint    │ to ss   │
//! └───────────┴───────────┴──────────────────────────────┴─────────┘
//! ```
//!
//! Records start on sector boundaries of the log. When a record would make
//! the log wrap, a checkpoint of the whole table is appended in its place so
//! the new epoch does not depend on the records the reset erased.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metadata::MetadataLog;
use crate::zone::ZoneRange;

/// Record magic, `"ZTLO"` little-endian
pub const RECORD_MAGIC: u32 = u32::from_le_bytes(*b"ZTLO");

/// Magic plus body length
pub const RECORD_HEADER_LEN: usize = 8;

// =============================================================================
// Records
// =============================================================================

/// Where an object's bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    /// Object size in bytes
    pub size: u64,
    /// Level hint supplied by the writer
    pub level: u8,
    /// Sector ranges in object order
    pub ranges: Vec<ZoneRange>,
}

/// One object-table mutation as persisted in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ObjectRecord {
    Put {
        id: u64,
        size: u64,
        level: u8,
        ranges: Vec<ZoneRange>,
    },
    Delete {
        id: u64,
    },
    /// Whole table, sorted by id
    Checkpoint { objects: Vec<(u64, ObjectEntry)> },
}

impl ObjectRecord {
    fn put(id: u64, entry: &ObjectEntry) -> Self {
        ObjectRecord::Put {
            id,
            size: entry.size,
            level: entry.level,
            ranges: entry.ranges.clone(),
        }
    }

    /// Frame the record for the log.
    pub fn encode(&self) -> Result<Bytes> {
        let body = serde_json::to_vec(self)?;
        let len = u32::try_from(body.len()).map_err(|_| {
            Error::InvalidArgument(format!("object record of {} bytes", body.len()))
        })?;

        let mut buf = BytesMut::with_capacity(RECORD_HEADER_LEN + body.len());
        buf.put_u32_le(RECORD_MAGIC);
        buf.put_u32_le(len);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Decode a record at the start of `data`, returning it with its framed
    /// length. `None` if no complete, well-formed record starts there.
    pub fn decode(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < RECORD_HEADER_LEN {
            return None;
        }
        let mut header = &data[..RECORD_HEADER_LEN];
        if header.get_u32_le() != RECORD_MAGIC {
            return None;
        }
        let len = header.get_u32_le() as usize;
        let end = RECORD_HEADER_LEN.checked_add(len)?;
        let body = data.get(RECORD_HEADER_LEN..end)?;
        let record = serde_json::from_slice(body).ok()?;
        Some((record, end))
    }
}

/// Outcome of rebuilding the table from the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStats {
    /// Records applied
    pub records: u64,
    /// Sectors that did not start a valid record
    pub skipped_sectors: u64,
    /// Objects in the table afterwards
    pub objects: u64,
}

// =============================================================================
// Object Table
// =============================================================================

/// In-memory object index persisted through the metadata log.
#[derive(Debug, Default)]
pub struct ObjectTable {
    entries: DashMap<u64, ObjectEntry>,
    /// Serializes journal writes so the wrap check and the append stay together
    writer: Mutex<()>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u64) -> Option<ObjectEntry> {
        self.entries.get(&id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Object ids in ascending order.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    fn snapshot(&self) -> BTreeMap<u64, ObjectEntry> {
        self.entries
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Persist `entry` under `id`, then publish it.
    pub fn put(&self, log: &MetadataLog, id: u64, entry: ObjectEntry) -> Result<()> {
        let _writer = self.writer.lock();
        let record = ObjectRecord::put(id, &entry).encode()?;

        if log.would_wrap(record.len()) {
            let mut objects = self.snapshot();
            objects.insert(id, entry.clone());
            self.checkpoint(log, objects)?;
        } else {
            log.append(&record)?;
        }

        debug!(id, size = entry.size, ranges = entry.ranges.len(), "object stored");
        self.entries.insert(id, entry);
        Ok(())
    }

    /// Persist the removal of `id`, then drop it from the table.
    pub fn delete(&self, log: &MetadataLog, id: u64) -> Result<ObjectEntry> {
        let _writer = self.writer.lock();
        if !self.entries.contains_key(&id) {
            return Err(Error::ObjectNotFound(id));
        }
        let record = ObjectRecord::Delete { id }.encode()?;

        if log.would_wrap(record.len()) {
            let mut objects = self.snapshot();
            objects.remove(&id);
            self.checkpoint(log, objects)?;
        } else {
            log.append(&record)?;
        }

        debug!(id, "object deleted");
        self.entries
            .remove(&id)
            .map(|(_, entry)| entry)
            .ok_or(Error::ObjectNotFound(id))
    }

    /// Append caller-owned bytes to the log and return their sector.
    ///
    /// If the append wraps the log, a checkpoint of the table goes out in the
    /// same batch, ahead of the caller's bytes, so the new epoch still
    /// describes every object and the log is reset only once. A wrapping
    /// append whose bytes cannot share an empty log with the checkpoint is
    /// rejected with `InvalidArgument` before anything is written.
    pub fn append_raw(&self, log: &MetadataLog, data: &[u8]) -> Result<u64> {
        let _writer = self.writer.lock();
        if self.entries.is_empty() || !log.would_wrap(data.len()) {
            return log.append(data);
        }

        let objects = self.snapshot();
        let count = objects.len();
        let checkpoint = Self::checkpoint_record(objects)?;
        let offsets = log.append_all(&[&checkpoint[..], data])?;
        info!(
            objects = count,
            offsets = ?offsets,
            bytes = checkpoint.len(),
            epoch = log.epoch(),
            "object table checkpointed ahead of raw metadata"
        );
        offsets
            .get(1)
            .copied()
            .ok_or_else(|| Error::Internal("raw metadata append produced no offset".into()))
    }

    fn checkpoint_record(objects: BTreeMap<u64, ObjectEntry>) -> Result<Bytes> {
        ObjectRecord::Checkpoint {
            objects: objects.into_iter().collect(),
        }
        .encode()
    }

    fn checkpoint(&self, log: &MetadataLog, objects: BTreeMap<u64, ObjectEntry>) -> Result<()> {
        let count = objects.len();
        let record = Self::checkpoint_record(objects)?;
        let offset = log.append(&record)?;
        info!(
            objects = count,
            offset,
            bytes = record.len(),
            epoch = log.epoch(),
            "object table checkpointed"
        );
        Ok(())
    }

    fn apply(&self, record: ObjectRecord) {
        match record {
            ObjectRecord::Put {
                id,
                size,
                level,
                ranges,
            } => {
                self.entries.insert(id, ObjectEntry { size, level, ranges });
            }
            ObjectRecord::Delete { id } => {
                self.entries.remove(&id);
            }
            ObjectRecord::Checkpoint { objects } => {
                self.entries.clear();
                for (id, entry) in objects {
                    self.entries.insert(id, entry);
                }
            }
        }
    }

    /// Rebuild the table from everything written to the log this epoch.
    pub fn replay(&self, log: &MetadataLog) -> Result<ReplayStats> {
        let used = usize::try_from(log.used_bytes())
            .map_err(|_| Error::Internal("metadata log larger than memory".into()))?;
        let mut stats = ReplayStats::default();
        if used == 0 {
            return Ok(stats);
        }

        let mut stream = vec![0u8; used];
        let read = log.read(log.start(), &mut stream, used)?;
        stream.truncate(read);

        let ss = log.sector_size() as usize;
        let mut pos = 0usize;
        while pos + RECORD_HEADER_LEN <= stream.len() {
            match ObjectRecord::decode(&stream[pos..]) {
                Some((record, len)) => {
                    self.apply(record);
                    stats.records += 1;
                    pos += len.div_ceil(ss) * ss;
                }
                None => {
                    stats.skipped_sectors += 1;
                    pos += ss;
                }
            }
        }

        stats.objects = self.entries.len() as u64;
        if stats.skipped_sectors > 0 {
            warn!(
                skipped_sectors = stats.skipped_sectors,
                "metadata log holds sectors that are not object records"
            );
        }
        info!(
            records = stats.records,
            objects = stats.objects,
            epoch = log.epoch(),
            "object table replayed"
        );
        Ok(stats)
    }
}
