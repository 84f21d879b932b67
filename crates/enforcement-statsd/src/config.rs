//! Configuration file support for enforcement-statsd
//!
//! Loads and validates the daemon configuration from TOML files.
//! Default location: /etc/enforcement-statsd/enforcement_statsd.toml

use crate::error::{EnforcementStatsError, Result};
use crate::tables::DEFAULT_DROP_FLOW_NAME;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/enforcement-statsd/enforcement_statsd.toml";

/// Metering behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementSection {
    /// Seconds between stats polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// When false the scheduler stops after bootstrap
    #[serde(default = "default_true")]
    pub periodic_stats_reporting: bool,

    /// Rule id reported for per-subscriber default-drop flows
    #[serde(default = "default_drop_flow_name")]
    pub default_drop_flow_name: String,

    /// Flow table owned by this controller
    #[serde(default = "default_table_number")]
    pub table_number: u8,
}

/// Redis store holding restart markers and rule versions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    #[serde(default)]
    pub db_number: u32,
}

/// Switch control channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatapathConfig {
    /// host:port of the switch control channel
    #[serde(default = "default_datapath_address")]
    pub address: String,

    /// First reconnect delay after losing the switch
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    /// Reconnect delays double up to this cap
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
}

/// Upstream session manager RPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessiondConfig {
    #[serde(default = "default_sessiond_url")]
    pub url: String,
}

/// Control API for the policy application layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_api_listen")]
    pub listen: String,
}

/// Complete enforcement-statsd configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementConfig {
    /// Bridge whose table is metered
    #[serde(default = "default_bridge_name")]
    pub bridge_name: String,

    /// Flush the table on connect and disconnect
    #[serde(default = "default_true")]
    pub clean_restart: bool,

    /// Send per-tunnel session state after each poll
    #[serde(default)]
    pub enable5g_features: bool,

    /// Log outgoing reports at info level
    #[serde(default)]
    pub print_grpc_payload: bool,

    #[serde(default)]
    pub enforcement: EnforcementSection,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub datapath: DatapathConfig,

    #[serde(default)]
    pub sessiond: SessiondConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

// Default functions
fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    10
}

fn default_drop_flow_name() -> String {
    DEFAULT_DROP_FLOW_NAME.to_string()
}

fn default_table_number() -> u8 {
    12
}

fn default_bridge_name() -> String {
    "gtp_br0".to_string()
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6380
}

fn default_datapath_address() -> String {
    "127.0.0.1:6653".to_string()
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_max_secs() -> u64 {
    30
}

fn default_api_listen() -> String {
    "127.0.0.1:50071".to_string()
}

fn default_sessiond_url() -> String {
    "http://127.0.0.1:50065".to_string()
}

impl Default for EnforcementSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            periodic_stats_reporting: true,
            default_drop_flow_name: default_drop_flow_name(),
            table_number: default_table_number(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            db_number: 0,
        }
    }
}

impl Default for DatapathConfig {
    fn default() -> Self {
        Self {
            address: default_datapath_address(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_secs: default_reconnect_max_secs(),
        }
    }
}

impl Default for SessiondConfig {
    fn default() -> Self {
        Self {
            url: default_sessiond_url(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_api_listen(),
        }
    }
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            bridge_name: default_bridge_name(),
            clean_restart: true,
            enable5g_features: false,
            print_grpc_payload: false,
            enforcement: EnforcementSection::default(),
            database: DatabaseConfig::default(),
            datapath: DatapathConfig::default(),
            sessiond: SessiondConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl EnforcementConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                EnforcementStatsError::config(
                    path.display().to_string(),
                    format!("failed to parse: {}", e),
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(EnforcementStatsError::Io(e)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.enforcement.poll_interval_secs)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.datapath.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.datapath.reconnect_max_secs)
    }

    pub fn api_listen_addr(&self) -> Result<SocketAddr> {
        self.api.listen.parse().map_err(|e| {
            EnforcementStatsError::config("listen", format!("'{}': {}", self.api.listen, e))
        })
    }

    pub fn redis_url(&self) -> String {
        format!(
            "redis://{}:{}/{}",
            self.database.redis_host, self.database.redis_port, self.database.db_number
        )
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.enforcement.poll_interval_secs == 0 {
            return Err(EnforcementStatsError::config(
                "poll_interval_secs",
                "must be > 0",
            ));
        }

        if self.enforcement.default_drop_flow_name.is_empty() {
            return Err(EnforcementStatsError::config(
                "default_drop_flow_name",
                "must not be empty",
            ));
        }

        if self.database.redis_port == 0 {
            return Err(EnforcementStatsError::config("redis_port", "must be > 0"));
        }

        if self.datapath.address.is_empty() {
            return Err(EnforcementStatsError::config("address", "must not be empty"));
        }

        if self.datapath.reconnect_initial_ms == 0 {
            return Err(EnforcementStatsError::config(
                "reconnect_initial_ms",
                "must be > 0",
            ));
        }

        if self.api.enabled {
            self.api_listen_addr()?;
        }

        if !(self.sessiond.url.starts_with("http://") || self.sessiond.url.starts_with("https://"))
        {
            return Err(EnforcementStatsError::config(
                "url",
                format!("'{}' is not an http(s) URL", self.sessiond.url),
            ));
        }

        Ok(())
    }
}
