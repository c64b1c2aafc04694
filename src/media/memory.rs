//! In-memory zoned namespace
//!
//! Behaves like a ZNS namespace as far as the translation layer can tell:
//! writes must land exactly at the zone write pointer and stay within the
//! zone capacity, a zone turns `Full` when its capacity is consumed, a reset
//! rewinds it to `Empty`, and reads past the write pointer return zeroes.
//! `Offline` zones reject every command.
//!
//! Fault injection hooks let tests exercise torn writes and failed resets.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{Geometry, IoCommand, ZoneReport, ZonedMedia};
use crate::config::SimDeviceConfig;
use crate::error::MediaError;
use crate::zone::ZoneState;

/// Completion status used for injected write/reset failures
pub const INJECTED_FAILURE_STATUS: u16 = 0x06;

struct SimZone {
    slba: u64,
    capacity: u64,
    write_pointer: u64,
    state: ZoneState,
    /// Bytes written so far, `(write_pointer - slba) * sector_size` long
    data: Vec<u8>,
}

impl SimZone {
    fn end(&self) -> u64 {
        self.slba + self.capacity
    }

    fn report(&self) -> ZoneReport {
        ZoneReport {
            slba: self.slba,
            capacity: self.capacity,
            write_pointer: self.write_pointer,
            state: self.state,
        }
    }
}

/// A zoned device kept entirely in RAM.
pub struct MemoryMedia {
    geometry: Geometry,
    zones: Vec<Mutex<SimZone>>,
    /// Writes still allowed to succeed before injected failures start
    write_budget: Mutex<Option<u64>>,
    fail_next_reset: AtomicBool,
    resets: AtomicU64,
}

impl MemoryMedia {
    /// Create a device where every zone has `zone_capacity` writable sectors.
    ///
    /// `zone_capacity` is clamped to the zone size.
    pub fn new(geometry: Geometry, zone_capacity: u64) -> Self {
        let capacity = zone_capacity.min(geometry.zone_size);
        let zones = (0..geometry.total_zones())
            .map(|i| {
                let slba = i * geometry.zone_size;
                Mutex::new(SimZone {
                    slba,
                    capacity,
                    write_pointer: slba,
                    state: ZoneState::Empty,
                    data: Vec::new(),
                })
            })
            .collect();

        debug!(
            groups = geometry.groups,
            zones_per_group = geometry.zones_per_group,
            zone_size = geometry.zone_size,
            zone_capacity = capacity,
            "created in-memory zoned device"
        );

        Self {
            geometry,
            zones,
            write_budget: Mutex::new(None),
            fail_next_reset: AtomicBool::new(false),
            resets: AtomicU64::new(0),
        }
    }

    /// Create a device from the simulated geometry of a config.
    pub fn from_config(config: &SimDeviceConfig) -> Self {
        Self::new(
            Geometry {
                groups: config.groups,
                zones_per_group: config.zones_per_group,
                zone_size: config.zone_size,
                sector_size: config.sector_size,
                mdts_bytes: config.mdts_bytes,
            },
            config.zone_capacity,
        )
    }

    /// Force a zone into a state, with its write pointer `written` sectors
    /// past the zone start. Used to stage bootstrap scenarios.
    pub fn set_zone(&self, group: u16, zone: u32, state: ZoneState, written: u64) {
        let idx = group as usize * self.geometry.zones_per_group as usize + zone as usize;
        if let Some(slot) = self.zones.get(idx) {
            let mut z = slot.lock();
            let written = written.min(z.capacity);
            z.write_pointer = z.slba + written;
            z.state = state;
            z.data
                .resize(written as usize * self.geometry.sector_size as usize, 0);
        }
    }

    /// Let the next `writes` writes succeed, then fail every write after them.
    pub fn fail_writes_after(&self, writes: u64) {
        *self.write_budget.lock() = Some(writes);
    }

    /// Stop injecting write failures.
    pub fn clear_write_failures(&self) {
        *self.write_budget.lock() = None;
    }

    /// Fail the next zone reset.
    pub fn fail_next_reset(&self) {
        self.fail_next_reset.store(true, Ordering::Release);
    }

    /// Zone resets executed so far.
    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    /// Current report for a single zone.
    pub fn zone_report(&self, group: u16, zone: u32) -> Option<ZoneReport> {
        let idx = group as usize * self.geometry.zones_per_group as usize + zone as usize;
        self.zones.get(idx).map(|z| z.lock().report())
    }

    fn zone_for(&self, sector: u64) -> Result<&Mutex<SimZone>, MediaError> {
        let idx = sector / self.geometry.zone_size;
        self.zones
            .get(idx as usize)
            .ok_or(MediaError::OutOfBounds { sector })
    }

    fn take_write_budget(&self) -> Result<(), MediaError> {
        let mut budget = self.write_budget.lock();
        match budget.as_mut() {
            Some(0) => Err(MediaError::Status {
                status: INJECTED_FAILURE_STATUS,
            }),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn check_transfer(&self, nsec: u32, len: usize) -> Result<usize, MediaError> {
        let max = self.geometry.max_transfer_sectors();
        if nsec == 0 || nsec > max {
            return Err(MediaError::TransferTooLarge { nsec, max });
        }
        let bytes = nsec as usize * self.geometry.sector_size as usize;
        if len < bytes {
            return Err(MediaError::BufferTooSmall { len, nsec });
        }
        Ok(bytes)
    }
}

impl ZonedMedia for MemoryMedia {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn report_zones(&self, group: u16) -> Result<Vec<ZoneReport>, MediaError> {
        if group >= self.geometry.groups {
            return Err(MediaError::OutOfBounds {
                sector: self.geometry.zone_slba(group, 0),
            });
        }
        let per_group = self.geometry.zones_per_group as usize;
        let start = group as usize * per_group;
        Ok(self.zones[start..start + per_group]
            .iter()
            .map(|z| z.lock().report())
            .collect())
    }

    fn reset_zone(&self, zone_slba: u64) -> Result<(), MediaError> {
        if zone_slba % self.geometry.zone_size != 0 {
            return Err(MediaError::OutOfBounds { sector: zone_slba });
        }
        let mut zone = self.zone_for(zone_slba)?.lock();
        if zone.state == ZoneState::Offline {
            return Err(MediaError::ZoneOffline { zone_slba });
        }
        if self.fail_next_reset.swap(false, Ordering::AcqRel) {
            return Err(MediaError::Status {
                status: INJECTED_FAILURE_STATUS,
            });
        }

        zone.write_pointer = zone.slba;
        zone.state = ZoneState::Empty;
        zone.data.clear();
        self.resets.fetch_add(1, Ordering::Relaxed);
        trace!(zone_slba, "zone reset");
        Ok(())
    }

    fn submit_io(&self, cmd: IoCommand<'_>) -> Result<(), MediaError> {
        let sector_size = self.geometry.sector_size as usize;

        match cmd {
            IoCommand::Write { slba, nsec, buf } => {
                let bytes = self.check_transfer(nsec, buf.len())?;
                let mut zone = self.zone_for(slba)?.lock();
                let zone_slba = zone.slba;

                match zone.state {
                    ZoneState::Offline => return Err(MediaError::ZoneOffline { zone_slba }),
                    ZoneState::Full => return Err(MediaError::ZoneFull { zone_slba }),
                    _ => {}
                }
                if slba != zone.write_pointer {
                    return Err(MediaError::WritePointerMismatch {
                        sector: slba,
                        write_pointer: zone.write_pointer,
                    });
                }
                if slba + nsec as u64 > zone.end() {
                    return Err(MediaError::OutOfBounds {
                        sector: slba + nsec as u64 - 1,
                    });
                }
                self.take_write_budget()?;

                zone.data.extend_from_slice(&buf[..bytes]);
                zone.write_pointer += nsec as u64;
                zone.state = if zone.write_pointer == zone.end() {
                    ZoneState::Full
                } else {
                    ZoneState::Open
                };
                Ok(())
            }
            IoCommand::Read { slba, nsec, buf } => {
                let bytes = self.check_transfer(nsec, buf.len())?;
                let zone = self.zone_for(slba)?.lock();

                if zone.state == ZoneState::Offline {
                    return Err(MediaError::ZoneOffline {
                        zone_slba: zone.slba,
                    });
                }
                if slba + nsec as u64 > zone.end() {
                    return Err(MediaError::OutOfBounds {
                        sector: slba + nsec as u64 - 1,
                    });
                }

                let start = (slba - zone.slba) as usize * sector_size;
                let out = &mut buf[..bytes];
                let written = zone.data.len().saturating_sub(start).min(bytes);
                if written > 0 {
                    out[..written].copy_from_slice(&zone.data[start..start + written]);
                }
                out[written..].fill(0);
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for MemoryMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMedia")
            .field("geometry", &self.geometry)
            .field("resets", &self.reset_count())
            .finish()
    }
}
