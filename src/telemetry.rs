//! I/O telemetry
//!
//! Fire-and-forget counters for every device command the layer issues, the
//! bytes the upper layer asked to store (for write amplification) and
//! per-operation latency. Each instance owns its own Prometheus registry so
//! several instances can live in one process.

use std::time::Duration;

use chrono::{DateTime, Utc};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::media::Opcode;

const NAMESPACE: &str = "ztl";

/// Latency buckets in seconds, 10us to ~1s
const LATENCY_BUCKETS: &[f64] = &[
    0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0,
];

/// Point-in-time view of the counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: i64,
    pub io_count: u64,
    pub read_bytes: u64,
    pub written_bytes: u64,
    pub user_write_bytes: u64,
    pub zone_resets: u64,
    pub write_amplification: f64,
}

/// Per-instance I/O statistics.
pub struct Telemetry {
    registry: Registry,
    sector_size: u64,
    started: DateTime<Utc>,
    io_count: IntCounterVec,
    bytes: IntCounterVec,
    user_write_bytes: IntCounter,
    zone_resets: IntCounter,
    latency: HistogramVec,
}

impl Telemetry {
    /// Create the collectors and register them in a fresh registry.
    pub fn new(sector_size: u32) -> Result<Self> {
        let registry = Registry::new();

        let io_count = IntCounterVec::new(
            Opts::new("io_total", "Device commands issued").namespace(NAMESPACE),
            &["opcode"],
        )?;
        let bytes = IntCounterVec::new(
            Opts::new("io_bytes_total", "Bytes transferred to or from the device")
                .namespace(NAMESPACE),
            &["opcode"],
        )?;
        let user_write_bytes = IntCounter::with_opts(
            Opts::new("user_write_bytes_total", "Bytes submitted by the upper layer")
                .namespace(NAMESPACE),
        )?;
        let zone_resets = IntCounter::with_opts(
            Opts::new("zone_resets_total", "Zone reset commands issued").namespace(NAMESPACE),
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new("op_duration_seconds", "Latency of layer operations")
                .namespace(NAMESPACE)
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["op"],
        )?;

        registry.register(Box::new(io_count.clone()))?;
        registry.register(Box::new(bytes.clone()))?;
        registry.register(Box::new(user_write_bytes.clone()))?;
        registry.register(Box::new(zone_resets.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            registry,
            sector_size: sector_size as u64,
            started: Utc::now(),
            io_count,
            bytes,
            user_write_bytes,
            zone_resets,
            latency,
        })
    }

    /// Account one completed device command of `nsec` sectors.
    pub fn record_io(&self, opcode: Opcode, nsec: u32) {
        let label = opcode.to_string();
        self.io_count.with_label_values(&[label.as_str()]).inc();
        self.bytes
            .with_label_values(&[label.as_str()])
            .inc_by(nsec as u64 * self.sector_size);
    }

    /// Account bytes the upper layer asked to persist.
    pub fn record_user_write(&self, bytes: u64) {
        self.user_write_bytes.inc_by(bytes);
    }

    /// Account one zone reset.
    pub fn record_reset(&self) {
        self.zone_resets.inc();
    }

    /// Observe the latency of an operation such as `"append"` or `"read"`.
    pub fn record_latency(&self, op: &str, elapsed: Duration) {
        self.latency
            .with_label_values(&[op])
            .observe(elapsed.as_secs_f64());
    }

    fn opcode_counter(&self, counter: &IntCounterVec, opcode: Opcode) -> u64 {
        counter.with_label_values(&[opcode.to_string().as_str()]).get()
    }

    /// Device bytes written per user byte; 1.0 until the upper layer writes.
    pub fn write_amplification(&self) -> f64 {
        let user = self.user_write_bytes.get();
        if user == 0 {
            1.0
        } else {
            self.opcode_counter(&self.bytes, Opcode::Write) as f64 / user as f64
        }
    }

    /// Current counter values.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let now = Utc::now();
        TelemetrySnapshot {
            timestamp: now,
            uptime_secs: (now - self.started).num_seconds(),
            io_count: self.opcode_counter(&self.io_count, Opcode::Read)
                + self.opcode_counter(&self.io_count, Opcode::Write),
            read_bytes: self.opcode_counter(&self.bytes, Opcode::Read),
            written_bytes: self.opcode_counter(&self.bytes, Opcode::Write),
            user_write_bytes: self.user_write_bytes.get(),
            zone_resets: self.zone_resets.get(),
            write_amplification: self.write_amplification(),
        }
    }

    /// Registry holding this instance's collectors.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("metrics text is not UTF-8: {}", e)))
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("sector_size", &self.sector_size)
            .field("started", &self.started)
            .finish()
    }
}
