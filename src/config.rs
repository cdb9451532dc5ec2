// src/config.rs

//! Client configuration: transport selection, pooling limits, and token
//! renewal cadence. Defaults mirror the service-side limits the fabric has
//! to respect.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// Hard service-side cap on the number of multiplexed connections per
/// credential family.
pub const MAX_POOLS_HARD_CAP: usize = u16::MAX as usize;

/// The service rejects more than this many concurrently authorized device
/// tokens on one connection.
pub const MAX_DEVICES_PER_CONNECTION: usize = 995;

/// Which transport the session factory should negotiate.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    #[default]
    TcpTls,
    WebSocket,
}

/// Transport settings handed through to the session factory.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    #[serde(default = "default_amqp_port")]
    pub port: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            port: default_amqp_port(),
        }
    }
}

/// Connection sharing and multiplexing limits.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PoolingConfig {
    /// How long a connection may sit at zero references before eviction.
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
    /// Maximum multiplexed connections per credential family. Clamped to
    /// `MAX_POOLS_HARD_CAP` by `validate`.
    #[serde(default = "default_max_pools")]
    pub max_pools: usize,
    /// Maximum device identities hosted on one connection. Clamped to
    /// `MAX_DEVICES_PER_CONNECTION` by `validate`.
    #[serde(default = "default_max_devices")]
    pub max_devices_per_connection: usize,
    /// Device count below which a connection counts as lightly loaded.
    #[serde(default = "default_lightly_loaded_ceiling")]
    pub lightly_loaded_ceiling: usize,
    /// Device count below which a connection counts as semi loaded.
    #[serde(default = "default_semi_loaded_ceiling")]
    pub semi_loaded_ceiling: usize,
}

impl Default for PoolingConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            max_pools: default_max_pools(),
            max_devices_per_connection: default_max_devices(),
            lightly_loaded_ceiling: default_lightly_loaded_ceiling(),
            semi_loaded_ceiling: default_semi_loaded_ceiling(),
        }
    }
}

/// Token renewal cadence.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TokenConfig {
    /// Renewals are sent this long before the token's expiry.
    #[serde(with = "humantime_serde", default = "default_refresh_buffer")]
    pub refresh_buffer: Duration,
    /// Fixed wait between renewal retries after a non-fatal failure.
    #[serde(with = "humantime_serde", default = "default_retry_interval")]
    pub retry_interval: Duration,
    /// Budget for each renewal send.
    #[serde(with = "humantime_serde", default = "default_operation_timeout")]
    pub operation_timeout: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_buffer: default_refresh_buffer(),
            retry_interval: default_retry_interval(),
            operation_timeout: default_operation_timeout(),
        }
    }
}

/// Top-level configuration for one connection cache.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ClientConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub pooling: PoolingConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
}

impl ClientConfig {
    /// Loads and validates a TOML configuration file.
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{path}'"))?;
        let mut config: ClientConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Clamps out-of-range limits and rejects inconsistent tier thresholds.
    pub fn validate(&mut self) -> Result<()> {
        let pooling = &mut self.pooling;
        if pooling.max_pools == 0 {
            bail!("pooling.max_pools must be at least 1");
        }
        if pooling.max_pools > MAX_POOLS_HARD_CAP {
            warn!(
                configured = pooling.max_pools,
                cap = MAX_POOLS_HARD_CAP,
                "pooling.max_pools exceeds the service cap; clamping"
            );
            pooling.max_pools = MAX_POOLS_HARD_CAP;
        }
        if pooling.max_devices_per_connection == 0 {
            bail!("pooling.max_devices_per_connection must be at least 1");
        }
        if pooling.max_devices_per_connection > MAX_DEVICES_PER_CONNECTION {
            warn!(
                configured = pooling.max_devices_per_connection,
                cap = MAX_DEVICES_PER_CONNECTION,
                "pooling.max_devices_per_connection exceeds the service cap; clamping"
            );
            pooling.max_devices_per_connection = MAX_DEVICES_PER_CONNECTION;
        }
        if pooling.lightly_loaded_ceiling == 0
            || pooling.lightly_loaded_ceiling > pooling.semi_loaded_ceiling
            || pooling.semi_loaded_ceiling > pooling.max_devices_per_connection
        {
            bail!(
                "pooling tier thresholds must satisfy \
                 1 <= lightly_loaded_ceiling <= semi_loaded_ceiling <= max_devices_per_connection"
            );
        }
        if self.tokens.retry_interval.is_zero() {
            bail!("tokens.retry_interval must be non-zero");
        }
        Ok(())
    }
}

fn default_amqp_port() -> u16 {
    5671
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(2 * 60)
}
fn default_max_pools() -> usize {
    100
}
fn default_max_devices() -> usize {
    MAX_DEVICES_PER_CONNECTION
}
fn default_lightly_loaded_ceiling() -> usize {
    100
}
fn default_semi_loaded_ceiling() -> usize {
    500
}
fn default_refresh_buffer() -> Duration {
    Duration::from_secs(2 * 60)
}
fn default_retry_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_operation_timeout() -> Duration {
    Duration::from_secs(60)
}
