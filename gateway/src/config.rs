use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Result;

pub const DEFAULT_PORT: u16 = 5678;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub multiplexer: MultiplexerConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub analytics: AnalyticsConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub pacing: PacingConfig,

    #[serde(default)]
    pub event_log: EventLogConfig,
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    /// A device silent for longer than this is disconnected.
    pub timeout_ms: u64,
    pub max_connections: usize,
    /// Consecutive empty polls without any device before the gateway stops
    /// itself. Zero keeps it running forever.
    pub idle_poll_limit: u32,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        MultiplexerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            timeout_ms: 10_000,
            max_connections: 64,
            idle_poll_limit: 4,
        }
    }
}

impl MultiplexerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// An idle device is caught within about three polls of going silent.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis((self.timeout_ms / 3).max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Upper bound for a blocking buffer read.
    pub wait_timeout_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            wait_timeout_ms: 10_000,
        }
    }
}

impl BufferConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub sensor_map: PathBuf,
    pub run_avg_length: usize,
    pub min_temp: f64,
    pub max_temp: f64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        AnalyticsConfig {
            sensor_map: PathBuf::from("room_sensor.map"),
            run_avg_length: 5,
            min_temp: 10.0,
            max_temp: 25.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub table: String,
    /// Drop and recreate the table when connecting.
    pub clear_on_start: bool,
    pub connect_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            db_path: PathBuf::from("Sensor.db"),
            table: "SensorData".to_string(),
            clear_on_start: true,
            connect_attempts: 3,
            retry_backoff_ms: 2_000,
        }
    }
}

impl StorageConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub initial_batch: usize,
    pub min_batch: usize,
    pub max_batch: usize,
    pub initial_sleep_ms: u64,
    pub min_sleep_ms: u64,
    pub max_sleep_ms: u64,
    pub sleep_step_ms: u64,
    /// A drained cycle slows the loop down only if it read at least this many
    /// fewer values than the batch ceiling allowed.
    pub slowdown_margin: usize,
}

impl Default for PacingConfig {
    fn default() -> Self {
        PacingConfig {
            initial_batch: 8,
            min_batch: 5,
            max_batch: 50,
            initial_sleep_ms: 7_000,
            min_sleep_ms: 1_000,
            max_sleep_ms: 20_000,
            sleep_step_ms: 1_000,
            slowdown_margin: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    pub path: PathBuf,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        EventLogConfig {
            path: PathBuf::from("gateway.log"),
        }
    }
}
