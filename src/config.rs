//! Configuration loader for the `codemetal-tagwatch` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). Everything else receives a typed [`Config`] and
//! never reads the environment itself.
//!
use std::env;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::engine::EngineConfig;
use crate::ordering::SortOrder;

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional boolean environment variable with a default value.
///
/// Accepts the same spellings as `FORCE_COLOR`: `1|true|yes` and `0|false|no`.
macro_rules! parse_env_bool {
    ($var_name:expr, $default:expr) => {
        match env::var($var_name).ok().as_deref() {
            None => $default,
            Some("1") | Some("true") | Some("yes") => true,
            Some("0") | Some("false") | Some("no") => false,
            Some(other) => bail!("Invalid {}: expected true/false, got {:?}", $var_name, other),
        }
    };
}

/// Strongly typed application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// Port the HTTP bridge listens on.
    pub http_port: u16,

    /// Seconds between mute window sweeps.
    pub mute_sweep_secs: u32,

    /// Skip radio subscriptions for cloud sensors.
    pub cloud_mode: bool,

    /// Display order used until one is persisted.
    pub sort_order: SortOrder,
}

/// Load configuration from environment variables with defaults.
///
/// Optional:
/// - `TAGWATCH_HTTP_PORT` – HTTP bridge port (default: 8080)
/// - `TAGWATCH_MUTE_SWEEP_SECS` – mute sweep period, at least 1 (default: 5)
/// - `TAGWATCH_CLOUD_MODE` – cloud mode on start (default: false)
/// - `TAGWATCH_SORT_MODE` – `alphabetical` or `manual` (default: alphabetical)
///
/// Returns an error if any variable is present but invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let http_port = parse_env_u32!("TAGWATCH_HTTP_PORT", 8080);
    let http_port = u16::try_from(http_port)
        .map_err(|_| anyhow!("Invalid TAGWATCH_HTTP_PORT: {} is out of range", http_port))?;

    let mute_sweep_secs = parse_env_u32!("TAGWATCH_MUTE_SWEEP_SECS", 5);
    if mute_sweep_secs == 0 {
        bail!("Invalid TAGWATCH_MUTE_SWEEP_SECS: must be at least 1");
    }

    let cloud_mode = parse_env_bool!("TAGWATCH_CLOUD_MODE", false);

    let sort_order = match env::var("TAGWATCH_SORT_MODE").ok().as_deref() {
        None | Some("alphabetical") => SortOrder::Alphabetical,
        Some("manual") => SortOrder::Manual(Vec::new()),
        Some(other) => bail!(
            "Invalid TAGWATCH_SORT_MODE: expected alphabetical or manual, got {:?}",
            other
        ),
    };

    Ok(Config {
        http_port,
        mute_sweep_secs,
        cloud_mode,
        sort_order,
    })
}

impl Config {
    /// Log the loaded configuration for debugging purposes.
    pub fn log_config(&self) {
        // ---
        let sort_mode = if self.sort_order.is_manual() {
            "manual"
        } else {
            "alphabetical"
        };

        tracing::info!("Configuration loaded:");
        tracing::info!("  TAGWATCH_HTTP_PORT       : {}", self.http_port);
        tracing::info!("  TAGWATCH_MUTE_SWEEP_SECS : {}", self.mute_sweep_secs);
        tracing::info!("  TAGWATCH_CLOUD_MODE      : {}", self.cloud_mode);
        tracing::info!("  TAGWATCH_SORT_MODE       : {}", sort_mode);
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            mute_sweep_interval: Duration::from_secs(u64::from(self.mute_sweep_secs)),
            cloud_mode: self.cloud_mode,
        }
    }
}
