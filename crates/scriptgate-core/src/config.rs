//! Configuration resolution for the Scriptgate server.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. JSON settings file (`--config` or `SCRIPTGATE_CONFIG`)
//! 3. Environment variables (`SCRIPTGATE_*`)
//! 4. CLI arguments (applied by the binary, highest priority)
//!
//! The resolved config is validated once before the server starts.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable naming the JSON settings file.
pub const CONFIG_PATH_ENV: &str = "SCRIPTGATE_CONFIG";

/// Smallest RSA modulus accepted for new application keys.
pub const MIN_RSA_KEY_BITS: usize = 1024;

/// Complete server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// `None` resolves to `~/.scriptgate/server.db`.
    pub database_path: Option<PathBuf>,
    /// Lifetime of a prepared script delivery.
    pub delivery_ttl_secs: u64,
    /// Lifetime of a real-time instruction.
    pub instruction_ttl_secs: u64,
    /// Time a new connection has to send its `auth` message.
    pub auth_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// A session with no inbound traffic for this long is closed.
    pub pong_timeout_secs: u64,
    /// Per-session outbound queue capacity.
    pub outbound_buffer: usize,
    /// Largest accepted inbound WebSocket message.
    pub max_message_bytes: usize,
    pub rsa_key_bits: usize,
    pub expiry_sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_path: None,
            delivery_ttl_secs: 300,
            instruction_ttl_secs: 300,
            auth_timeout_secs: 10,
            write_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            pong_timeout_secs: 90,
            outbound_buffer: 256,
            max_message_bytes: 64 * 1024,
            rsa_key_bits: 2048,
            expiry_sweep_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("delivery_ttl_secs", self.delivery_ttl_secs),
            ("instruction_ttl_secs", self.instruction_ttl_secs),
            ("auth_timeout_secs", self.auth_timeout_secs),
            ("write_timeout_secs", self.write_timeout_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("pong_timeout_secs", self.pong_timeout_secs),
            ("expiry_sweep_interval_secs", self.expiry_sweep_interval_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.outbound_buffer == 0 {
            return Err(Error::Config("outbound_buffer must be greater than zero".into()));
        }
        if self.max_message_bytes == 0 {
            return Err(Error::Config(
                "max_message_bytes must be greater than zero".into(),
            ));
        }
        if self.rsa_key_bits < MIN_RSA_KEY_BITS {
            return Err(Error::Config(format!(
                "rsa_key_bits must be at least {MIN_RSA_KEY_BITS}, got {}",
                self.rsa_key_bits
            )));
        }
        if self.pong_timeout_secs <= self.heartbeat_interval_secs {
            return Err(Error::Config(format!(
                "pong_timeout_secs ({}) must exceed heartbeat_interval_secs ({})",
                self.pong_timeout_secs, self.heartbeat_interval_secs
            )));
        }
        Ok(())
    }

    /// Configured database path, or the per-user default.
    pub fn resolved_database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => default_database_path()
                .ok_or_else(|| Error::Config("Cannot determine home directory".into())),
        }
    }

    pub const fn delivery_ttl(&self) -> Duration {
        Duration::from_secs(self.delivery_ttl_secs)
    }

    pub const fn instruction_ttl(&self) -> Duration {
        Duration::from_secs(self.instruction_ttl_secs)
    }

    pub const fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub const fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub const fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub const fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs)
    }
}

/// Load configuration from defaults, an optional settings file and the
/// process environment. CLI overrides are applied by the caller.
pub fn load_config(config_file: Option<&Path>) -> Result<ServerConfig> {
    let env_file = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
    let file = config_file.map(Path::to_path_buf).or(env_file);

    let mut config = match file {
        Some(path) => load_config_file(&path)?,
        None => ServerConfig::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

/// Default database location: `~/.scriptgate/server.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".scriptgate").join("server.db"))
}

fn load_config_file(path: &Path) -> Result<ServerConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("Invalid value for {key}: {e}")))
}

/// Overlay `SCRIPTGATE_*` variables read through `lookup`.
pub fn apply_env_overrides<F>(config: &mut ServerConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    macro_rules! overlay {
        ($key:literal, $field:ident) => {
            if let Some(raw) = lookup($key) {
                config.$field = parse_env($key, &raw)?;
            }
        };
    }

    overlay!("SCRIPTGATE_LISTEN_ADDR", listen_addr);
    if let Some(raw) = lookup("SCRIPTGATE_DATABASE_PATH") {
        config.database_path = Some(PathBuf::from(raw));
    }
    overlay!("SCRIPTGATE_DELIVERY_TTL_SECS", delivery_ttl_secs);
    overlay!("SCRIPTGATE_INSTRUCTION_TTL_SECS", instruction_ttl_secs);
    overlay!("SCRIPTGATE_AUTH_TIMEOUT_SECS", auth_timeout_secs);
    overlay!("SCRIPTGATE_WRITE_TIMEOUT_SECS", write_timeout_secs);
    overlay!("SCRIPTGATE_HEARTBEAT_INTERVAL_SECS", heartbeat_interval_secs);
    overlay!("SCRIPTGATE_PONG_TIMEOUT_SECS", pong_timeout_secs);
    overlay!("SCRIPTGATE_OUTBOUND_BUFFER", outbound_buffer);
    overlay!("SCRIPTGATE_MAX_MESSAGE_BYTES", max_message_bytes);
    overlay!("SCRIPTGATE_RSA_KEY_BITS", rsa_key_bits);
    overlay!("SCRIPTGATE_EXPIRY_SWEEP_INTERVAL_SECS", expiry_sweep_interval_secs);
    Ok(())
}
