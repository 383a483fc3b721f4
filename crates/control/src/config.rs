//! Control-service configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use hypervisor_registry::KvSettings;
use hypervisor_types::{config, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ControlConfig {
    /// Listen address of the gRPC surface.
    pub grpc_addr: String,
    /// Listen address of the HTTP health sidecar.
    pub http_addr: String,
    pub kv: KvSettings,
    pub heartbeat: HeartbeatSettings,
    pub agent: AgentSettings,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            grpc_addr: "0.0.0.0:9400".to_string(),
            http_addr: "0.0.0.0:9401".to_string(),
            kv: KvSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            agent: AgentSettings::default(),
        }
    }
}

impl ControlConfig {
    pub fn load(path: &Path) -> Result<Self> {
        config::load(path)
    }
}

/// Liveness-monitor tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct HeartbeatSettings {
    /// Seconds between monitor polls.
    pub interval: u64,
    /// Seconds without a heartbeat before a node is considered dead.
    pub timeout: u64,
    /// Seconds between agent re-registration attempts (shared default with
    /// the agents).
    pub retry_interval: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        HeartbeatSettings {
            interval: 10,
            timeout: 30,
            retry_interval: 2,
        }
    }
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Outbound-call deadlines towards agents.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct AgentSettings {
    /// Seconds to establish a connection.
    pub dial_timeout: u64,
    /// Seconds for an individual RPC.
    pub rpc_timeout: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        AgentSettings {
            dial_timeout: 5,
            rpc_timeout: 30,
        }
    }
}

impl AgentSettings {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hypervisor_types::config::from_yaml_str;

    #[test]
    fn defaults_match_the_documented_timeouts() {
        let config = ControlConfig::default();
        assert_eq!(config.heartbeat.interval, 10);
        assert_eq!(config.heartbeat.timeout, 30);
        assert_eq!(config.agent.dial_timeout, 5);
        assert_eq!(config.agent.rpc_timeout, 30);
    }

    #[test]
    fn env_overrides_heartbeat_settings() {
        let vars = vec![
            ("HYPERVISOR_HEARTBEAT_TIMEOUT".to_string(), "45".to_string()),
            ("HYPERVISOR_GRPCADDR".to_string(), "0.0.0.0:7000".to_string()),
        ];
        let config: ControlConfig = from_yaml_str("", vars.into_iter()).unwrap();
        assert_eq!(config.heartbeat.timeout, 45);
        assert_eq!(config.grpc_addr, "0.0.0.0:7000");
    }
}
