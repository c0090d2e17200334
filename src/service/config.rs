extern crate config as _;

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::network::Encoding;

/// Environment variables with this prefix override file values,
/// e.g. `SOCKMUX_NETWORK__PORT=7000`.
pub const ENV_PREFIX: &str = "SOCKMUX";

/// How bytes on a connection are grouped before they reach a hook.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    #[default]
    Lines,
    Units,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    /// 0 binds an ephemeral port
    pub port: u16,
    pub max_connections: usize,
    /// flush attempts that would block return instead of stalling the loop
    pub non_blocking_writes: bool,
    /// initial capacity of each connection's read buffer
    pub read_buffer_size: usize,
    /// step by which a full read buffer grows
    pub grow_increment: usize,
    /// bytes kept in front of the read cursor for cheap putback
    pub putback_depth: usize,
    /// lines longer than this many characters are cut and dispatched
    pub max_line_length: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 0,
            max_connections: 64,
            non_blocking_writes: true,
            read_buffer_size: 4 * 1024,
            grow_increment: 4 * 1024,
            putback_depth: 16,
            max_line_length: 4 * 1024,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub encoding: Encoding,
    pub byte_swap: bool,
    pub canonicalize: bool,
    pub framing: Framing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// wait used while continuations are pending, so they yield to the poller
    pub tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { tick_ms: 1 }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub protocol: ProtocolConfig,
    pub scheduler: SchedulerConfig,
}

impl ServerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;
        Ok(server_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.network.max_connections == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connections must be at least 1".to_string(),
            ));
        }
        if self.network.grow_increment == 0 {
            return Err(AppError::InvalidValue(
                "network.grow_increment must be at least 1".to_string(),
            ));
        }
        if self.network.max_line_length == 0 {
            return Err(AppError::InvalidValue(
                "network.max_line_length must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> AppResult<SocketAddr> {
        format!("{}:{}", self.network.ip, self.network.port)
            .parse()
            .map_err(|e| {
                AppError::InvalidValue(format!(
                    "listen address {}:{}: {}",
                    self.network.ip, self.network.port, e
                ))
            })
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.scheduler.tick_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::Builder;

    use super::*;

    #[test]
    fn test_load_config_file() -> AppResult<()> {
        let mut file = Builder::new().suffix(".toml").tempfile()?;
        writeln!(
            file,
            r#"
[network]
ip = "0.0.0.0"
port = 7070
max_connections = 2

[protocol]
encoding = "wide"
byte_swap = true
framing = "units"
"#
        )?;

        let config = ServerConfig::set_up_config(file.path())?;
        assert_eq!(config.network.port, 7070);
        assert_eq!(config.network.max_connections, 2);
        assert_eq!(config.protocol.encoding, Encoding::Wide);
        assert!(config.protocol.byte_swap);
        assert_eq!(config.protocol.framing, Framing::Units);
        // untouched sections keep their defaults
        assert_eq!(config.network.grow_increment, 4 * 1024);
        assert_eq!(config.scheduler.tick_ms, 1);
        Ok(())
    }

    #[test]
    fn test_zero_connections_rejected() -> AppResult<()> {
        let mut file = Builder::new().suffix(".toml").tempfile()?;
        writeln!(file, "[network]\nmax_connections = 0")?;

        let result = ServerConfig::set_up_config(file.path());
        assert!(matches!(result, Err(AppError::InvalidValue(_))));
        Ok(())
    }

    #[test]
    fn test_listen_addr() {
        let mut config = ServerConfig::default();
        config.network.port = 9000;
        let addr = config.listen_addr().unwrap();
        assert_eq!(addr.port(), 9000);

        config.network.ip = "not an ip".to_string();
        assert!(config.listen_addr().is_err());
    }
}
