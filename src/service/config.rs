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

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    /// tokio worker threads, 0 means one per cpu
    pub worker_threads: usize,
    /// distance between two consecutively generated user ids
    pub id_step: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            worker_threads: 0,
            id_step: 100_000,
        }
    }
}

impl GeneralConfig {
    pub fn worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    pub max_frame_size: usize,
    /// liveness deadline for a single socket read; expiry only means idle
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub dial_timeout_ms: u64,
    pub outbound_queue_capacity: usize,
    /// consecutive bad frames tolerated before the connection is closed
    pub max_frame_errors: u32,
    pub accept_backoff_max_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: 4567,
            max_connection: 1024,
            max_frame_size: 1024 * 1024,
            read_timeout_ms: 3000,
            write_timeout_ms: 1000,
            dial_timeout_ms: 3000,
            outbound_queue_capacity: 1000,
            max_frame_errors: 3,
            accept_backoff_max_ms: 64_000,
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RouterConfig {
    /// capacity of the fan-in queue every connection feeds
    pub ingest_capacity: usize,
    /// capacity of the handoff queue between the router and the request processor
    pub metadata_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            ingest_capacity: 1000,
            metadata_capacity: 1000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TracingConfig {
    pub level: String,
    pub log_dir: String,
    pub log_file: String,
    pub otlp_enabled: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        TracingConfig {
            level: "info".to_string(),
            log_dir: "logs".to_string(),
            log_file: "chatrelay.log".to_string(),
            otlp_enabled: false,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RelayConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub router: RouterConfig,
    pub tracing: TracingConfig,
}

impl RelayConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<RelayConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("CHATRELAY").separator("__"))
            .build()?;

        let relay_config: RelayConfig = config.try_deserialize()?;
        relay_config.validate()?;
        Ok(relay_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let network = &self.network;
        if network.max_frame_size == 0 || network.max_frame_size > u32::MAX as usize {
            return Err(AppError::InvalidValue(format!(
                "network.max_frame_size: {}",
                network.max_frame_size
            )));
        }
        if network.outbound_queue_capacity == 0
            || self.router.ingest_capacity == 0
            || self.router.metadata_capacity == 0
        {
            return Err(AppError::InvalidValue(
                "queue capacities must be greater than 0".to_string(),
            ));
        }
        if network.max_frame_errors == 0 {
            return Err(AppError::InvalidValue(
                "network.max_frame_errors must be greater than 0".to_string(),
            ));
        }
        if network.max_connection == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connection must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.listen_address(), "0.0.0.0:4567");
        assert_eq!(config.network.read_timeout(), Duration::from_secs(3));
        assert!(config.general.worker_threads() > 0);
    }

    #[test]
    fn test_zero_frame_size_rejected() {
        let mut config = RelayConfig::default();
        config.network.max_frame_size = 0;
        assert!(matches!(config.validate(), Err(AppError::InvalidValue(_))));
    }

    #[test]
    fn test_zero_frame_errors_rejected() {
        let mut config = RelayConfig::default();
        config.network.max_frame_errors = 0;
        assert!(matches!(config.validate(), Err(AppError::InvalidValue(_))));
        config.network.max_frame_errors = 1;
        assert!(config.validate().is_ok());
    }
}
