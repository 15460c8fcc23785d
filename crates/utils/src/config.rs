use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{var} must be <= {other} but got {value} > {other_value}")]
    RangeOrder {
        var: &'static str,
        value: u16,
        other: &'static str,
        other_value: u16,
    },
}

/// Process-wide configuration, loaded once at startup and never mutated.
///
/// Populated from environment variables (`.env` honored in development via
/// `dotenvy`); every field has a documented default so the control plane
/// runs out of the box with no configuration at all.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: std::net::SocketAddr,
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub instances_dir: PathBuf,
    pub database_path: PathBuf,
    pub port_range: (u16, u16),
    pub max_instances: usize,
    pub startup_timeout_secs: u64,
    pub on_demand_start_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub default_auto_restart: bool,
    pub default_max_restarts: u32,
    pub default_restart_delay_secs: u64,
    pub log_tail_capacity: usize,
    pub api_key: Option<String>,
}

impl Config {
    /// Load configuration from the environment, applying defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let bind_addr = env_or("IMX_BIND_ADDR", "127.0.0.1:8090")
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                var: "IMX_BIND_ADDR",
                value: env_or("IMX_BIND_ADDR", "127.0.0.1:8090"),
                reason: format!("{e}"),
            })?;

        let port_lo = env_parse::<u16>("IMX_PORT_RANGE_LO", 20000)?;
        let port_hi = env_parse::<u16>("IMX_PORT_RANGE_HI", 20999)?;
        if port_lo > port_hi {
            return Err(ConfigError::RangeOrder {
                var: "IMX_PORT_RANGE_LO",
                value: port_lo,
                other: "IMX_PORT_RANGE_HI",
                other_value: port_hi,
            });
        }

        Ok(Self {
            bind_addr,
            data_dir: crate::assets::data_dir(),
            logs_dir: crate::assets::logs_dir(),
            instances_dir: crate::assets::instances_dir(),
            database_path: crate::assets::database_path(),
            port_range: (port_lo, port_hi),
            max_instances: env_parse("IMX_MAX_INSTANCES", 64usize)?,
            startup_timeout_secs: env_parse("IMX_STARTUP_TIMEOUT_SECS", 120u64)?,
            on_demand_start_timeout_secs: env_parse("IMX_ON_DEMAND_START_TIMEOUT_SECS", 30u64)?,
            stop_timeout_secs: env_parse("IMX_STOP_TIMEOUT_SECS", 30u64)?,
            shutdown_timeout_secs: env_parse("IMX_SHUTDOWN_TIMEOUT_SECS", 30u64)?,
            default_auto_restart: env_parse("IMX_DEFAULT_AUTO_RESTART", true)?,
            default_max_restarts: env_parse("IMX_DEFAULT_MAX_RESTARTS", 5u32)?,
            default_restart_delay_secs: env_parse("IMX_DEFAULT_RESTART_DELAY_SECS", 2u64)?,
            log_tail_capacity: env_parse("IMX_LOG_TAIL_CAPACITY", 1000usize)?,
            api_key: std::env::var("IMX_API_KEY").ok().filter(|s| !s.is_empty()),
        })
    }
}

fn env_or(var: &'static str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            var,
            value: raw,
            reason: format!("{e}"),
        }),
        Err(_) => Ok(default),
    }
}
