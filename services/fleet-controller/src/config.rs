//! Configuration for the fleet daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use fleet_reconcile::{ProvisioningStrategy, RetentionPolicy};
use thiserror::Error;

use crate::controller::ControllerConfig;
use crate::launch::LaunchConfig;

/// Configuration errors. Malformed values are never silently defaulted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Which provisioning backend to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayKind {
    Mock,
    Http { url: String, token: Option<String> },
}

/// Fleet daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP API listen address.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Data directory for the checkpoint database.
    pub data_dir: PathBuf,

    pub gateway: GatewayKind,

    pub tick_interval_secs: u64,
    pub provision_cap: u32,
    pub idle_timeout_secs: u64,
    pub stop_on_reclaim: bool,
    pub node_image: String,
    pub node_size: String,
    pub provision_timeout_secs: u64,
    pub reclaim_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub handshake_timeout_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = parse_or(&lookup, "FLEET_LISTEN_ADDR", || {
            SocketAddr::from(([127, 0, 0, 1], 8090))
        })?;

        let log_level = lookup("FLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let data_dir = lookup("FLEET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/fleetd"));

        let gateway = match lookup("FLEET_GATEWAY").as_deref() {
            None | Some("mock") => GatewayKind::Mock,
            Some("http") => GatewayKind::Http {
                url: lookup("FLEET_GATEWAY_URL").ok_or(ConfigError::Missing("FLEET_GATEWAY_URL"))?,
                token: lookup("FLEET_GATEWAY_TOKEN"),
            },
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "FLEET_GATEWAY",
                    value: other.to_string(),
                    reason: "expected 'mock' or 'http'".to_string(),
                })
            }
        };

        let stop_on_reclaim = match lookup("FLEET_STOP_ON_RECLAIM") {
            None => false,
            Some(v) => match v.to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "FLEET_STOP_ON_RECLAIM",
                        value: v,
                        reason: "expected a boolean".to_string(),
                    })
                }
            },
        };

        Ok(Self {
            listen_addr,
            log_level,
            data_dir,
            gateway,
            tick_interval_secs: parse_or(&lookup, "FLEET_TICK_INTERVAL_SECS", || 10)?,
            provision_cap: parse_or(&lookup, "FLEET_PROVISION_CAP", || 4)?,
            idle_timeout_secs: parse_or(&lookup, "FLEET_IDLE_TIMEOUT_SECS", || 600)?,
            stop_on_reclaim,
            node_image: lookup("FLEET_NODE_IMAGE").unwrap_or_else(|| "default".to_string()),
            node_size: lookup("FLEET_NODE_SIZE").unwrap_or_else(|| "default".to_string()),
            provision_timeout_secs: parse_or(&lookup, "FLEET_PROVISION_TIMEOUT_SECS", || 120)?,
            reclaim_timeout_secs: parse_or(&lookup, "FLEET_RECLAIM_TIMEOUT_SECS", || 30)?,
            shutdown_grace_secs: parse_or(&lookup, "FLEET_SHUTDOWN_GRACE_SECS", || 60)?,
            handshake_timeout_secs: parse_or(&lookup, "FLEET_HANDSHAKE_TIMEOUT_SECS", || 10)?,
        })
    }

    /// Path of the checkpoint database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("fleet.db")
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        let reclaim_timeout = Duration::from_secs(self.reclaim_timeout_secs);

        ControllerConfig {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            strategy: ProvisioningStrategy {
                max_concurrent: self.provision_cap,
            },
            retention: RetentionPolicy {
                idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            },
            stop_on_reclaim: self.stop_on_reclaim,
            node_image: self.node_image.clone(),
            node_size: self.node_size.clone(),
            provision_timeout: Duration::from_secs(self.provision_timeout_secs),
            reclaim_timeout,
            launch: LaunchConfig {
                status_timeout: reclaim_timeout,
                ..LaunchConfig::default()
            },
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            ..ControllerConfig::default()
        }
    }
}

fn parse_or<F, T>(lookup: &F, var: &'static str, default: impl FnOnce() -> T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default()),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}
