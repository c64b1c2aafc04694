//! Metadata zone set and journal
//!
//! ```text
//! ┌────────────────────────── group ──────────────────────────┐
//! │ zone 0 .. metadata_zones-1 │ data zones ...                │
//! │   MetadataZoneSet          │   ProvisioningEngine          │
//! │   └─ MetadataLog           │                               │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`MetadataZoneSet::initialize`] validates the reserved zones and finds
//! the log cursor. [`MetadataLog`] appends and reads opaque byte records
//! over them, wrapping around when the set is full.

mod log;
mod zone_set;

pub use log::MetadataLog;
pub use zone_set::MetadataZoneSet;
