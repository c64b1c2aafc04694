//! ZTL - Zone Translation Layer
//!
//! A user-space storage engine that maps variable-length writes onto zoned,
//! append-only media. It decides which zones receive each write, tracks
//! every zone's write pointers, and keeps its bookkeeping durable in a
//! wrap-around journal stored in reserved zones.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                               Ztl                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ Provisioning │    │  Metadata    │◀───│   Object     │       │
//! │  │   Engine     │    │    Log       │    │   Table      │       │
//! │  └──────┬───────┘    └──────┬───────┘    └──────────────┘       │
//! │         ▼                   ▼                                   │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    Group     │    │ Metadata     │    │    Pools     │       │
//! │  │  (allocator) │    │  Zone Set    │    │ ctx/scratch  │       │
//! │  └──────┬───────┘    └──────┬───────┘    └──────────────┘       │
//! │         └─────────┬─────────┘                                   │
//! │                   ▼                                             │
//! │            dyn ZonedMedia                                       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`] - Pool sizes, transfer caps and simulated device geometry
//! - [`error`] - Error types
//! - [`group`] - Zone groups and the zone allocator
//! - [`media`] - Zoned media interface, DMA buffers, in-memory device
//! - [`metadata`] - Metadata zone set bootstrap and journal
//! - [`object`] - Object table persisted through the journal
//! - [`pool`] - Fixed-capacity object pools
//! - [`provisioning`] - Sector allocation into provisioning contexts
//! - [`telemetry`] - I/O counters and Prometheus exposition
//! - [`zone`] - Zone descriptors and addresses
//! - [`ztl`] - Library facade

pub mod config;
pub mod error;
pub mod group;
pub mod media;
pub mod metadata;
pub mod object;
pub mod pool;
pub mod provisioning;
pub mod telemetry;
pub mod zone;
pub mod ztl;

// Re-export commonly used types
pub use config::{SimDeviceConfig, ZtlConfig};
pub use error::{Error, MediaError, Result};
pub use group::{Group, SequentialAllocator, ZoneAllocator};
pub use media::{DmaBuf, Geometry, IoCommand, MemoryMedia, Opcode, ZoneReport, ZonedMedia};
pub use metadata::{MetadataLog, MetadataZoneSet};
pub use object::{ObjectEntry, ObjectRecord, ObjectTable, ReplayStats};
pub use pool::{Pool, PoolKind, Pooled};
pub use provisioning::{ProvisioningContext, ProvisioningEngine};
pub use telemetry::{Telemetry, TelemetrySnapshot};
pub use zone::{ZoneAddress, ZoneDescriptor, ZoneFlags, ZoneMetadataEntry, ZoneRange, ZoneState};
pub use ztl::Ztl;
