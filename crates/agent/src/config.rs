//! Agent configuration. Loaded from YAML with `HYPERVISOR_*` environment
//! overrides; unrecognised options abort startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use hypervisor_registry::KvSettings;
use hypervisor_types::{config, InstanceType, NodeRole, Resources, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct AgentConfig {
    pub node: NodeConfig,
    pub server: ServerConfig,
    pub kv: KvSettings,
    pub heartbeat: HeartbeatConfig,
    pub drivers: DriversConfig,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        config::load(path)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct NodeConfig {
    /// Stable node identity; generated and persisted by the registry when
    /// absent.
    pub id: Option<String>,
    /// Defaults to the machine hostname.
    pub hostname: Option<String>,
    pub ip: String,
    pub port: u16,
    pub role: NodeRole,
    pub region: String,
    pub zone: String,
    pub labels: HashMap<String, String>,
    /// Overrides the measured capacity when set.
    pub capacity: Option<Resources>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            id: None,
            hostname: None,
            ip: "127.0.0.1".to_string(),
            port: 9411,
            role: NodeRole::Worker,
            region: String::new(),
            zone: String::new(),
            labels: HashMap::new(),
            capacity: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ServerConfig {
    /// Address of the control service, for operator tooling pointed at this
    /// config file.
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: "127.0.0.1:9400".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct HeartbeatConfig {
    /// Seconds between heartbeat ticks.
    pub interval: u64,
    /// Seconds between re-registration attempts after losing the lease.
    pub retry_interval: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            interval: 10,
            retry_interval: 2,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct DriversConfig {
    /// Instance types this agent hosts; one driver is built per entry.
    pub enabled: Vec<InstanceType>,
    pub vm: VmConfig,
    pub container: ContainerConfig,
    pub microvm: MicroVmConfig,
}

impl Default for DriversConfig {
    fn default() -> Self {
        DriversConfig {
            enabled: vec![InstanceType::Container],
            vm: VmConfig::default(),
            container: ContainerConfig::default(),
            microvm: MicroVmConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct VmConfig {
    pub qemu_binary: PathBuf,
    pub qemu_img_binary: PathBuf,
    pub state_dir: PathBuf,
    /// Seconds granted to a graceful powerdown.
    pub graceful_timeout: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        let d = hypervisor_driver::VmDriverConfig::default();
        VmConfig {
            qemu_binary: d.qemu_binary,
            qemu_img_binary: d.qemu_img_binary,
            state_dir: d.state_dir,
            graceful_timeout: d.graceful_timeout.as_secs(),
        }
    }
}

impl VmConfig {
    pub fn to_driver_config(&self) -> hypervisor_driver::VmDriverConfig {
        hypervisor_driver::VmDriverConfig {
            qemu_binary: self.qemu_binary.clone(),
            qemu_img_binary: self.qemu_img_binary.clone(),
            state_dir: self.state_dir.clone(),
            graceful_timeout: Duration::from_secs(self.graceful_timeout),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ContainerConfig {
    pub state_dir: PathBuf,
    /// Seconds granted to a graceful engine stop.
    pub stop_timeout: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        let d = hypervisor_driver::ContainerDriverConfig::default();
        ContainerConfig {
            state_dir: d.state_dir,
            stop_timeout: d.stop_timeout.as_secs(),
        }
    }
}

impl ContainerConfig {
    pub fn to_driver_config(&self) -> hypervisor_driver::ContainerDriverConfig {
        hypervisor_driver::ContainerDriverConfig {
            state_dir: self.state_dir.clone(),
            stop_timeout: Duration::from_secs(self.stop_timeout),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct MicroVmConfig {
    pub firecracker_binary: PathBuf,
    pub state_dir: PathBuf,
    pub default_kernel: Option<PathBuf>,
    pub default_kernel_args: String,
    /// Seconds granted to a graceful SIGTERM stop.
    pub graceful_timeout: u64,
}

impl Default for MicroVmConfig {
    fn default() -> Self {
        let d = hypervisor_driver::MicroVmDriverConfig::default();
        MicroVmConfig {
            firecracker_binary: d.firecracker_binary,
            state_dir: d.state_dir,
            default_kernel: d.default_kernel,
            default_kernel_args: d.default_kernel_args,
            graceful_timeout: d.graceful_timeout.as_secs(),
        }
    }
}

impl MicroVmConfig {
    pub fn to_driver_config(&self) -> hypervisor_driver::MicroVmDriverConfig {
        hypervisor_driver::MicroVmDriverConfig {
            firecracker_binary: self.firecracker_binary.clone(),
            state_dir: self.state_dir.clone(),
            default_kernel: self.default_kernel.clone(),
            default_kernel_args: self.default_kernel_args.clone(),
            graceful_timeout: Duration::from_secs(self.graceful_timeout),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hypervisor_types::config::from_yaml_str;

    const YAML: &str = "\
node:
  ip: 10.0.0.5
  port: 9411
  role: worker
  region: eu-west
  zone: eu-west-1a
server:
  address: control.internal:9400
kv:
  endpoints:
    - etcd.internal:2379
drivers:
  enabled: [vm, container]
  vm:
    stateDir: /srv/hypervisor/vm
";

    #[test]
    fn full_config_decodes() {
        let config: AgentConfig = from_yaml_str(YAML, std::iter::empty()).unwrap();
        assert_eq!(config.node.ip, "10.0.0.5");
        assert_eq!(config.node.role, NodeRole::Worker);
        assert_eq!(
            config.drivers.enabled,
            vec![InstanceType::Vm, InstanceType::Container]
        );
        assert_eq!(
            config.drivers.vm.state_dir,
            PathBuf::from("/srv/hypervisor/vm")
        );
        // Untouched sections keep their defaults.
        assert_eq!(config.heartbeat.interval, 10);
        assert_eq!(config.drivers.vm.qemu_binary, PathBuf::from("qemu-system-x86_64"));
    }

    #[test]
    fn unknown_driver_option_is_rejected() {
        let yaml = "drivers:\n  vm:\n    qemuBinaryy: /usr/bin/qemu\n";
        assert!(from_yaml_str::<AgentConfig>(yaml, std::iter::empty()).is_err());
    }

    #[test]
    fn env_overrides_reach_nested_driver_settings() {
        let vars = vec![(
            "HYPERVISOR_NODE_PORT".to_string(),
            "9999".to_string(),
        )];
        let config: AgentConfig = from_yaml_str(YAML, vars.into_iter()).unwrap();
        assert_eq!(config.node.port, 9999);
    }
}
