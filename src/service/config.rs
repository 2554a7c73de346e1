// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Prefix of environment variables overriding file settings,
/// e.g. `WIREPOOL__NETWORK__PORT=9000`.
pub const ENV_PREFIX: &str = "WIREPOOL";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    /// Upper bound of concurrently open inbound connections.
    pub max_connection: usize,
    /// Interval of the empty keep-alive frame sent to every token, 0 disables it.
    pub keepalive_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 9092,
            max_connection: 2048,
            keepalive_interval_secs: 600,
        }
    }
}

/// Per-connection buffer and queue sizing, shared by both connection sides.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Size of the fixed buffer used for each socket read.
    pub read_buffer_size: usize,
    /// Capacity of the raw-chunk queue between the receive and assemble tasks.
    pub inbound_queue_capacity: usize,
    /// Capacity of the outbound message queue drained by the send task.
    pub outbound_queue_capacity: usize,
    /// Largest payload accepted in either direction.
    pub max_frame_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            read_buffer_size: 2048,
            inbound_queue_capacity: 128,
            outbound_queue_capacity: 128,
            max_frame_size: crate::network::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Rejects sizes a connection cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        if self.read_buffer_size == 0
            || self.inbound_queue_capacity == 0
            || self.outbound_queue_capacity == 0
        {
            return Err(AppError::InvalidValue(
                "connection buffer and queue sizes must be greater than 0".to_string(),
            ));
        }
        if self.max_frame_size > u32::MAX as usize {
            return Err(AppError::InvalidValue(format!(
                "connection.max_frame_size {} does not fit the 4-byte length prefix",
                self.max_frame_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub backend_address: String,
    pub initial_connections: usize,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads of the tokio runtime, 0 means one per cpu.
    pub worker_threads: usize,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    pub network: NetworkConfig,
    pub connection: ConnectionConfig,
    pub proxy: ProxyConfig,
    pub runtime: RuntimeConfig,
}

impl GatewayConfig {
    /// Loads the configuration from `path`, layering `WIREPOOL__*` environment
    /// variables on top. The file must exist.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<GatewayConfig> {
        Self::load(path, true)
    }

    /// Same as [`GatewayConfig::set_up_config`] but falls back to defaults
    /// when the file is absent.
    pub fn set_up_optional_config<P: AsRef<Path>>(path: P) -> AppResult<GatewayConfig> {
        Self::load(path, false)
    }

    fn load<P: AsRef<Path>>(path: P, required: bool) -> AppResult<GatewayConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str).required(required))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let gateway_config: GatewayConfig = config.try_deserialize()?;
        gateway_config.validate()?;
        Ok(gateway_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.network.max_connection == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connection must be greater than 0".to_string(),
            ));
        }
        self.connection.validate()?;
        if self.proxy.enabled && self.proxy.backend_address.is_empty() {
            return Err(AppError::InvalidValue(
                "proxy.backend_address is required when the proxy is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.ip, self.network.port)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        match self.network.keepalive_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn worker_threads(&self) -> usize {
        match self.runtime.worker_threads {
            0 => num_cpus::get(),
            n => n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_listener_cap_and_keepalive() {
        let config = GatewayConfig::default();
        assert_eq!(config.network.max_connection, 2048);
        assert_eq!(config.keepalive_interval(), Some(Duration::from_secs(600)));
        assert_eq!(config.connection.read_buffer_size, 2048);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_keepalive_disables_it() {
        let mut config = GatewayConfig::default();
        config.network.keepalive_interval_secs = 0;
        assert_eq!(config.keepalive_interval(), None);
    }

    #[test]
    fn enabled_proxy_requires_backend() {
        let mut config = GatewayConfig::default();
        config.proxy.enabled = true;
        assert!(matches!(
            config.validate(),
            Err(AppError::InvalidValue(_))
        ));
        config.proxy.backend_address = "127.0.0.1:7000".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_queue_capacity_is_rejected() {
        let connection = ConnectionConfig {
            outbound_queue_capacity: 0,
            ..ConnectionConfig::default()
        };
        assert!(matches!(
            connection.validate(),
            Err(AppError::InvalidValue(_))
        ));
        let config = GatewayConfig {
            connection,
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn worker_threads_defaults_to_cpu_count() {
        let mut config = GatewayConfig::default();
        assert_eq!(config.worker_threads(), num_cpus::get());
        config.runtime.worker_threads = 3;
        assert_eq!(config.worker_threads(), 3);
    }
}
