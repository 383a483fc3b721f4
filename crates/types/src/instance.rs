//! Instance records: a compute workload (VM, container or microVM) bound to
//! a node, together with its lifecycle state machine.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resources::{Resources, GIB, MIB};
use crate::{Error, Result};

/// The runtime family an instance belongs to. Routes agent requests to the
/// matching driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceType {
    Vm,
    Container,
    MicroVm,
}

impl Default for InstanceType {
    fn default() -> Self {
        InstanceType::Vm
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceType::Vm => "vm",
            InstanceType::Container => "container",
            InstanceType::MicroVm => "microvm",
        };
        f.write_str(s)
    }
}

impl FromStr for InstanceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vm" => Ok(InstanceType::Vm),
            "container" => Ok(InstanceType::Container),
            "microvm" => Ok(InstanceType::MicroVm),
            other => Err(Error::invalid_spec(format!(
                "unknown instance type {:?} (expected vm, container or microvm)",
                other
            ))),
        }
    }
}

/// Lifecycle state of an instance. `Pending` and `Creating` are transient
/// control-plane states while a create is in flight; everything else is
/// reported by the owning driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Unknown,
    Pending,
    Creating,
    Running,
    Stopped,
    Paused,
    Failed,
}

impl Default for InstanceState {
    fn default() -> Self {
        InstanceState::Unknown
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Unknown => "unknown",
            InstanceState::Pending => "pending",
            InstanceState::Creating => "creating",
            InstanceState::Running => "running",
            InstanceState::Stopped => "stopped",
            InstanceState::Paused => "paused",
            InstanceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for InstanceState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unknown" => Ok(InstanceState::Unknown),
            "pending" => Ok(InstanceState::Pending),
            "creating" => Ok(InstanceState::Creating),
            "running" => Ok(InstanceState::Running),
            "stopped" => Ok(InstanceState::Stopped),
            "paused" => Ok(InstanceState::Paused),
            "failed" => Ok(InstanceState::Failed),
            other => Err(Error::invalid_spec(format!(
                "unknown instance state {:?}",
                other
            ))),
        }
    }
}

/// Whether the lifecycle state machine permits moving from `from` to `to`.
///
/// Transitions out of `Unknown`, and self-transitions, are always allowed so
/// that drivers recovering their view after a restart can converge.
pub fn valid_transition(from: InstanceState, to: InstanceState) -> bool {
    use InstanceState::*;
    if from == to || from == Unknown {
        return true;
    }
    match (from, to) {
        (Pending, Creating) | (Pending, Failed) => true,
        (Creating, Stopped) | (Creating, Running) | (Creating, Failed) => true,
        (Stopped, Running) | (Stopped, Failed) => true,
        (Running, Stopped) | (Running, Paused) | (Running, Failed) => true,
        (Paused, Running) | (Paused, Stopped) | (Paused, Failed) => true,
        // A failed instance can only be reaped, which removes the record.
        (Failed, _) => false,
        _ => false,
    }
}

/// A virtual disk attached to an instance. Disks are ordered; the `boot`
/// flag marks the boot device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpec {
    pub name: String,
    #[serde(rename = "sizeGB")]
    pub size_gb: u32,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub disk_type: String,
    #[serde(default)]
    pub boot: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Attachment mode understood by the driver, e.g. `bridge` or `none`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bridge: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

/// Cgroup-style throttles applied on top of the sizing in the spec. Zero
/// means unlimited for every field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimits {
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub memory_limit: i64,
    #[serde(rename = "ioReadBPS")]
    pub io_read_bps: i64,
    #[serde(rename = "ioWriteBPS")]
    pub io_write_bps: i64,
}

/// What the user asked for. The same spec shape serves all three runtime
/// families; drivers ignore the fields that do not apply to them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    pub image: String,
    pub cpu_cores: u32,
    #[serde(rename = "memoryMB")]
    pub memory_mb: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSpec>,
    // VM-style boot configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_args: Option<String>,
    // Container-style entrypoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimits>,
}

impl InstanceSpec {
    /// The resources this spec claims from its node. Memory-MB and disk-GB
    /// are converted to bytes for accounting.
    pub fn request(&self) -> Resources {
        let disk_bytes = self.disks.iter().map(|d| d.size_gb as u64 * GIB).sum();
        Resources {
            cpu_cores: self.cpu_cores,
            memory_bytes: self.memory_mb * MIB,
            disk_bytes,
            gpu_count: 0,
        }
    }

    /// Preconditions every driver shares. Runtime-specific constraints (a
    /// kernel image for microVMs, for example) are checked by the driver.
    pub fn validate(&self) -> Result<()> {
        if self.image.is_empty() && self.kernel.is_none() {
            return Err(Error::invalid_spec("image or kernel is required"));
        }
        if self.cpu_cores == 0 {
            return Err(Error::invalid_spec("cpuCores must be at least 1"));
        }
        if self.memory_mb == 0 {
            return Err(Error::invalid_spec("memoryMB must be at least 1"));
        }
        let mut seen = std::collections::HashSet::new();
        for disk in &self.disks {
            if disk.name.is_empty() {
                return Err(Error::invalid_spec("disk name must not be empty"));
            }
            if !seen.insert(disk.name.as_str()) {
                return Err(Error::invalid_spec(format!(
                    "duplicate disk name {:?}",
                    disk.name
                )));
            }
        }
        Ok(())
    }
}

/// An instance record as persisted in the registry. The `node_id` binding is
/// a value, not a reference; the registry keeps the reverse direction as a
/// secondary index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub instance_type: InstanceType,
    pub state: InstanceState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state_reason: String,
    pub spec: InstanceSpec,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// Set on the first transition to `running`, never cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        instance_type: InstanceType,
        spec: InstanceSpec,
    ) -> Self {
        let now = Utc::now();
        Instance {
            id: id.into(),
            name: name.into(),
            instance_type,
            state: InstanceState::Pending,
            state_reason: String::new(),
            spec,
            node_id: String::new(),
            ip_address: None,
            labels: HashMap::new(),
            annotations: HashMap::new(),
            created_at: now,
            started_at: None,
            updated_at: now,
        }
    }

    /// Conjunctive equality match against a label selector.
    pub fn matches_labels(&self, selector: &HashMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).map(|have| have == v).unwrap_or(false))
    }
}

/// Point-in-time usage sample for one instance. Best effort: fields the
/// driver cannot compute are zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStats {
    pub cpu_usage_percent: f64,
    pub cpu_time_ns: u64,
    pub memory_used_bytes: u64,
    pub memory_cache_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collected_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_instance() -> Instance {
        let mut inst = Instance::new(
            "i-1234",
            "web",
            InstanceType::Container,
            InstanceSpec {
                image: "nginx:alpine".into(),
                cpu_cores: 1,
                memory_mb: 512,
                disks: vec![DiskSpec {
                    name: "root".into(),
                    size_gb: 10,
                    disk_type: "qcow2".into(),
                    boot: true,
                }],
                ..Default::default()
            },
        );
        inst.node_id = "node-a".into();
        inst.labels.insert("app".into(), "web".into());
        inst
    }

    #[test]
    fn json_round_trip_is_identity() {
        let inst = sample_instance();
        let json = serde_json::to_string(&inst).unwrap();
        let back: Instance = serde_json::from_str(&json).unwrap();
        assert_eq!(inst, back);
    }

    #[test]
    fn json_uses_spec_tokens() {
        let inst = sample_instance();
        let json = serde_json::to_value(&inst).unwrap();
        assert_eq!(json["type"], "container");
        assert_eq!(json["state"], "pending");
        assert_eq!(json["spec"]["memoryMB"], 512);
        assert_eq!(json["spec"]["disks"][0]["sizeGB"], 10);
    }

    #[test]
    fn state_tokens_parse() {
        for token in [
            "unknown", "pending", "creating", "running", "stopped", "paused", "failed",
        ] {
            let state: InstanceState = token.parse().unwrap();
            assert_eq!(state.to_string(), token);
        }
        assert!("restarting".parse::<InstanceState>().is_err());
    }

    #[test]
    fn transition_rules_follow_lifecycle() {
        use InstanceState::*;
        assert!(valid_transition(Stopped, Running));
        assert!(valid_transition(Running, Stopped));
        assert!(valid_transition(Running, Paused));
        assert!(valid_transition(Paused, Running));
        assert!(valid_transition(Running, Failed));
        assert!(valid_transition(Unknown, Running));
        assert!(valid_transition(Running, Running));
        assert!(!valid_transition(Stopped, Paused));
        assert!(!valid_transition(Failed, Running));
        assert!(!valid_transition(Pending, Running));
    }

    #[test]
    fn request_converts_units_to_bytes() {
        let spec = sample_instance().spec;
        let req = spec.request();
        assert_eq!(req.cpu_cores, 1);
        assert_eq!(req.memory_bytes, 512 * MIB);
        assert_eq!(req.disk_bytes, 10 * GIB);
    }

    #[test]
    fn validate_rejects_impossible_specs() {
        let mut spec = sample_instance().spec;
        spec.cpu_cores = 0;
        assert!(spec.validate().is_err());

        let mut spec = sample_instance().spec;
        spec.disks.push(spec.disks[0].clone());
        assert!(spec.validate().is_err());

        let spec = InstanceSpec::default();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn label_selection_is_conjunctive_equality() {
        let inst = sample_instance();
        let mut selector = HashMap::new();
        assert!(inst.matches_labels(&selector));
        selector.insert("app".to_string(), "web".to_string());
        assert!(inst.matches_labels(&selector));
        selector.insert("tier".to_string(), "front".to_string());
        assert!(!inst.matches_labels(&selector));
    }
}
