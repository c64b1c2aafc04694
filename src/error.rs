//! Error types for the Zone Translation Layer

use thiserror::Error;

use crate::pool::PoolKind;
use crate::zone::ZoneAddress;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the zoned media.
///
/// The status is carried verbatim so callers can tell device faults apart
/// from zone protocol violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Address outside of the namespace or of the zone capacity
    #[error("sector {sector} is out of bounds")]
    OutOfBounds { sector: u64 },

    /// Write not issued at the zone's write pointer
    #[error("write at sector {sector} does not match write pointer {write_pointer}")]
    WritePointerMismatch { sector: u64, write_pointer: u64 },

    /// Write issued to a full zone
    #[error("zone starting at sector {zone_slba} is full")]
    ZoneFull { zone_slba: u64 },

    /// Zone is offline and rejects all commands
    #[error("zone starting at sector {zone_slba} is offline")]
    ZoneOffline { zone_slba: u64 },

    /// Buffer too small for the requested transfer
    #[error("buffer of {len} bytes cannot carry {nsec} sectors")]
    BufferTooSmall { len: usize, nsec: u32 },

    /// Transfer larger than the device allows
    #[error("transfer of {nsec} sectors exceeds the device limit of {max}")]
    TransferTooLarge { nsec: u32, max: u32 },

    /// Generic completion status from the device
    #[error("device completed with status {status:#x}")]
    Status { status: u16 },
}

/// Errors that can occur in the Zone Translation Layer
#[derive(Error, Debug)]
pub enum Error {
    /// Fixed-capacity pool has no free slot (retryable)
    #[error("{kind} pool exhausted")]
    PoolExhausted { kind: PoolKind },

    /// Group cannot satisfy the allocation
    #[error("group {group} cannot allocate {requested} sectors ({available} available)")]
    GroupAllocationFailed {
        group: u16,
        requested: u64,
        available: u64,
    },

    /// Persisted zone metadata entry does not match its expected index
    #[error("zone metadata entry address mismatch: expected {expected}, found {found}")]
    AddressMismatch {
        expected: ZoneAddress,
        found: ZoneAddress,
    },

    /// Zone is not marked available
    #[error("zone {zone} is not available")]
    ZoneUnavailable { zone: ZoneAddress },

    /// Zone is still reserved by a previous epoch
    #[error("zone {zone} is reserved")]
    ZoneReserved { zone: ZoneAddress },

    /// Device write (or zone reset) failed
    #[error("write failed at sector {sector}: {source}")]
    WriteFailed {
        sector: u64,
        #[source]
        source: MediaError,
    },

    /// Device read failed
    #[error("read failed at sector {sector}: {source}")]
    ReadFailed {
        sector: u64,
        #[source]
        source: MediaError,
    },

    /// Invalid argument (zero-length request, offset beyond the log cursor, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Group id not managed by this instance
    #[error("group {0} not found")]
    GroupNotFound(u16),

    /// Object id unknown to the object table
    #[error("object {0} not found")]
    ObjectNotFound(u64),

    /// Device name not understood by `init`
    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    /// DMA buffer allocation failed
    #[error("DMA allocation failed for size {size}: {reason}")]
    DmaAllocationFailed { size: usize, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML decoding error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Metric registration or encoding error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::PoolExhausted { .. })
    }
}
