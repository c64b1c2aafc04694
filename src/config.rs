//! Configuration for the Zone Translation Layer
//!
//! Pool sizes and transfer limits for the provisioning path and the metadata
//! log, plus the geometry of the in-memory simulated device used by `sim:`
//! device names. Loaded from YAML or built in code; every field has a default.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Default provisioning-context pool capacity
pub const DEFAULT_CONTEXT_POOL_SIZE: usize = 1024;

/// Default I/O scratch-buffer pool capacity
pub const DEFAULT_SCRATCH_POOL_SIZE: usize = 64;

/// Default number of zones reserved for the metadata log
pub const DEFAULT_METADATA_ZONES: u32 = 1;

/// Default per-command read cap (sectors)
pub const DEFAULT_MAX_READ_SECTORS: u32 = 64;

/// Default per-command write cap (sectors)
pub const DEFAULT_MAX_WRITE_SECTORS: u32 = 64;

/// Sector size of ZNS namespaces formatted for this layer
pub const DEFAULT_SECTOR_SIZE: u32 = 4096;

// =============================================================================
// Simulated device geometry
// =============================================================================

/// Geometry of the in-memory zoned device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimDeviceConfig {
    /// Number of zone groups
    pub groups: u16,
    /// Zones in each group
    pub zones_per_group: u32,
    /// Nominal zone size in sectors
    pub zone_size: u64,
    /// Writable sectors per zone (<= zone_size)
    pub zone_capacity: u64,
    /// Bytes per sector
    pub sector_size: u32,
    /// Maximum data transfer size in bytes
    pub mdts_bytes: u32,
}

impl Default for SimDeviceConfig {
    fn default() -> Self {
        Self {
            groups: 1,
            zones_per_group: 32,
            zone_size: 4096,
            zone_capacity: 4000,
            sector_size: DEFAULT_SECTOR_SIZE,
            mdts_bytes: 512 * 1024,
        }
    }
}

impl SimDeviceConfig {
    fn validate(&self) -> Result<()> {
        if self.groups == 0 || self.zones_per_group == 0 {
            return Err(Error::Config(
                "device must have at least one group and one zone".into(),
            ));
        }
        if self.zone_capacity == 0 || self.zone_capacity > self.zone_size {
            return Err(Error::Config(format!(
                "zone_capacity {} must be in 1..={}",
                self.zone_capacity, self.zone_size
            )));
        }
        if !self.sector_size.is_power_of_two() {
            return Err(Error::Config("sector_size must be a power of 2".into()));
        }
        if self.mdts_bytes < self.sector_size {
            return Err(Error::Config(format!(
                "mdts_bytes {} is smaller than one sector",
                self.mdts_bytes
            )));
        }
        Ok(())
    }
}

// =============================================================================
// ZTL configuration
// =============================================================================

/// Configuration for a ZTL instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZtlConfig {
    /// Capacity of the provisioning-context pool
    pub context_pool_size: usize,

    /// Capacity of the I/O scratch-buffer pool
    pub scratch_pool_size: usize,

    /// Zones reserved for the metadata log (taken from the start of the group)
    pub metadata_zones: u32,

    /// Per-command read cap in sectors
    pub max_read_sectors: u32,

    /// Per-command write cap in sectors
    pub max_write_sectors: u32,

    /// Group served by the provisioning path
    pub active_group: u16,

    /// Simulated device geometry (only used for `sim:` devices)
    pub device: SimDeviceConfig,
}

impl Default for ZtlConfig {
    fn default() -> Self {
        Self {
            context_pool_size: DEFAULT_CONTEXT_POOL_SIZE,
            scratch_pool_size: DEFAULT_SCRATCH_POOL_SIZE,
            metadata_zones: DEFAULT_METADATA_ZONES,
            max_read_sectors: DEFAULT_MAX_READ_SECTORS,
            max_write_sectors: DEFAULT_MAX_WRITE_SECTORS,
            active_group: 0,
            device: SimDeviceConfig::default(),
        }
    }
}

impl ZtlConfig {
    /// Parse a YAML document. Missing fields take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: ZtlConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.context_pool_size == 0 {
            return Err(Error::Config("context_pool_size must be > 0".into()));
        }
        if self.scratch_pool_size == 0 {
            return Err(Error::Config("scratch_pool_size must be > 0".into()));
        }
        if self.metadata_zones == 0 {
            return Err(Error::Config("metadata_zones must be > 0".into()));
        }
        if self.max_read_sectors == 0 || self.max_write_sectors == 0 {
            return Err(Error::Config("transfer caps must be > 0".into()));
        }
        self.device.validate()?;
        if self.metadata_zones >= self.device.zones_per_group {
            return Err(Error::Config(format!(
                "metadata_zones {} leaves no data zones in a {}-zone group",
                self.metadata_zones, self.device.zones_per_group
            )));
        }
        if self.active_group >= self.device.groups {
            return Err(Error::Config(format!(
                "active_group {} is outside of {} groups",
                self.active_group, self.device.groups
            )));
        }
        Ok(())
    }

    /// Effective read cap for a device with the given limits.
    pub fn read_unit(&self, sector_size: u32, mdts_bytes: u32) -> u32 {
        self.max_read_sectors.min(mdts_bytes / sector_size).max(1)
    }

    /// Effective write cap for a device with the given limits.
    pub fn write_unit(&self, sector_size: u32, mdts_bytes: u32) -> u32 {
        self.max_write_sectors.min(mdts_bytes / sector_size).max(1)
    }

    /// Size of one I/O scratch buffer: large enough for either transfer cap.
    pub fn scratch_buffer_len(&self, sector_size: u32, mdts_bytes: u32) -> usize {
        let unit = self
            .read_unit(sector_size, mdts_bytes)
            .max(self.write_unit(sector_size, mdts_bytes));
        unit as usize * sector_size as usize
    }
}
