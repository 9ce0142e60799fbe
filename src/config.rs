//! Typed configuration, loaded from TOML with research-grade defaults.
//!
//! Mirrors the nested-`Default` pattern used across this codebase's
//! services: one top-level `Config` composed of per-concern sub-configs,
//! each independently constructible and independently defaulted.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Root backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub network: NetworkConfig,
    pub session: SessionConfig,
    pub ring: RingConfig,
    pub cache: CacheConfig,
    pub event_loop: EventLoopConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            session: SessionConfig::default(),
            ring: RingConfig::default(),
            cache: CacheConfig::default(),
            event_loop: EventLoopConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl BackendConfig {
    /// Load configuration from a TOML file, falling back to field
    /// defaults for anything the file omits.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::Config(e.to_string()))?;
        toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))
    }
}

/// RDMA CM listen address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub server_ip: String,
    pub server_port: u16,
    /// Send/recv queue depth for every queue pair this backend creates.
    pub qp_depth: u32,
    /// Completion queue depth.
    pub cq_depth: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_ip: "0.0.0.0".to_string(),
            server_port: 18515,
            qp_depth: 256,
            cq_depth: 1024,
        }
    }
}

/// Session slot array sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub max_clients: usize,
    pub ctrl_msg_size: usize,
    pub max_outstanding_io: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_clients: 256,
            ctrl_msg_size: 256,
            max_outstanding_io: 64,
        }
    }
}

/// Ring buffer capacities. Both must be powers of two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    pub request_ring_bytes: usize,
    pub response_ring_bytes: usize,
    /// Prefix every parse batch with a total-size word so the completion
    /// scanner can detect a batch is entirely ready in one comparison.
    pub response_batching: bool,
    /// Use RDMA-Write-With-Immediate for the final metadata update of a
    /// response transmit instead of a plain signalled write.
    pub use_immediate_write: bool,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            request_ring_bytes: 1 << 20, // 1 MiB, power of two, >= 4 KiB floor
            response_ring_bytes: 1 << 20,
            response_batching: true,
            use_immediate_write: cfg!(feature = "imm-write"),
        }
    }
}

/// Metadata cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Bucket count; must be a power of two.
    pub bucket_count: usize,
    pub bucket_size: usize,
    pub occupancy_mode: OccupancyMode,
    /// Optional preload file of packed `{Key, Value}` chunks.
    pub preload_path: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            bucket_count: 1 << 14,
            bucket_size: 4,
            occupancy_mode: OccupancyMode::PerItem,
            preload_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OccupancyMode {
    PerBucket,
    PerItem,
}

/// Weighted round-robin tuning for the backend event loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLoopConfig {
    /// Control-plane progress is sampled `1/DATA_PLANE_WEIGHT` as often
    /// as data-plane progress.
    pub data_plane_weight: u32,
    /// Pin the polling thread to this core, if set.
    pub pinned_core: Option<usize>,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            data_plane_weight: 8,
            pinned_core: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub structured_logging: bool,
    #[serde(with = "duration_millis")]
    pub latency_histogram_window: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            structured_logging: false,
            latency_histogram_window: Duration::from_secs(60),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Host-side configuration: the counterpart `Config` for `HostClient`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub server_ip: String,
    pub server_port: u16,
    pub ctrl_msg_size: usize,
    pub request_ring_bytes: usize,
    pub response_ring_bytes: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            server_ip: "127.0.0.1".to_string(),
            server_port: 18515,
            ctrl_msg_size: 256,
            request_ring_bytes: 1 << 20,
            response_ring_bytes: 1 << 20,
        }
    }
}
