//! Node records: the workers of the cluster, their placement, health
//! conditions and resource accounting.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instance::InstanceType;
use crate::resources::Resources;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Worker,
}

impl Default for NodeRole {
    fn default() -> Self {
        NodeRole::Worker
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => f.write_str("master"),
            NodeRole::Worker => f.write_str("worker"),
        }
    }
}

impl FromStr for NodeRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "master" => Ok(NodeRole::Master),
            "worker" => Ok(NodeRole::Worker),
            other => Err(Error::invalid_spec(format!("unknown node role {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Ready,
    NotReady,
    Maintenance,
    Draining,
}

impl Default for NodeStatus {
    fn default() -> Self {
        NodeStatus::NotReady
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Ready => "ready",
            NodeStatus::NotReady => "not_ready",
            NodeStatus::Maintenance => "maintenance",
            NodeStatus::Draining => "draining",
        };
        f.write_str(s)
    }
}

/// Typed condition families a node reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Ready,
    DiskPressure,
    MemoryPressure,
    NetworkUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// A worker host in the cluster, as persisted in the registry under
/// `/hypervisor/nodes/{id}` with the registration lease attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub role: NodeRole,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<NodeCondition>,
    pub capacity: Resources,
    pub allocatable: Resources,
    pub allocated: Resources,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<InstanceType>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Node {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// A node can host new instances only while it is ready and its `Ready`
    /// condition is `True`. Lease liveness is implied by the record still
    /// being present in the registry; the monitor covers the gap for records
    /// whose lease has not yet expired.
    pub fn is_schedulable(&self) -> bool {
        self.status == NodeStatus::Ready
            && self
                .condition(ConditionType::Ready)
                .map(|c| c.status == ConditionStatus::True)
                .unwrap_or(false)
    }

    pub fn condition(&self, condition_type: ConditionType) -> Option<&NodeCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Record a condition, keeping the transition timestamp stable when the
    /// status is unchanged.
    pub fn set_condition(
        &mut self,
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            if existing.status != status {
                existing.last_transition_time = Utc::now();
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message.to_string();
        } else {
            self.conditions.push(NodeCondition {
                condition_type,
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now(),
            });
        }
    }

    /// Headroom for the scheduler: capacity minus what is already allocated.
    pub fn available(&self) -> Resources {
        self.capacity.saturating_sub(&self.allocated)
    }

    pub fn supports(&self, instance_type: InstanceType) -> bool {
        self.capabilities.contains(&instance_type)
    }

    pub fn matches_labels(&self, selector: &HashMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).map(|have| have == v).unwrap_or(false))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Builder used by the agent to assemble its registration record from
/// collected node facts.
#[derive(Debug)]
pub struct Builder {
    id: String,
    hostname: String,
    ip: String,
    port: u16,
    role: NodeRole,
    region: String,
    zone: String,
    capacity: Resources,
    capabilities: Vec<InstanceType>,
    labels: HashMap<String, String>,
    annotations: HashMap<String, String>,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            id: String::new(),
            hostname: String::new(),
            ip: "127.0.0.1".to_string(),
            port: 0,
            role: NodeRole::Worker,
            region: String::new(),
            zone: String::new(),
            capacity: Resources::default(),
            capabilities: Vec::new(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
        }
    }
}

impl Builder {
    pub fn set_id(&mut self, id: &str) -> &mut Self {
        self.id = id.to_string();
        self
    }

    pub fn set_hostname(&mut self, hostname: &str) -> &mut Self {
        self.hostname = hostname.to_string();
        self
    }

    pub fn set_address(&mut self, ip: &str, port: u16) -> &mut Self {
        self.ip = ip.to_string();
        self.port = port;
        self
    }

    pub fn set_role(&mut self, role: NodeRole) -> &mut Self {
        self.role = role;
        self
    }

    pub fn set_placement(&mut self, region: &str, zone: &str) -> &mut Self {
        self.region = region.to_string();
        self.zone = zone.to_string();
        self
    }

    pub fn set_capacity(&mut self, capacity: Resources) -> &mut Self {
        self.capacity = capacity;
        self
    }

    pub fn add_capability(&mut self, instance_type: InstanceType) -> &mut Self {
        if !self.capabilities.contains(&instance_type) {
            self.capabilities.push(instance_type);
        }
        self
    }

    pub fn add_label(&mut self, key: &str, value: &str) -> &mut Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn add_annotation(&mut self, key: &str, value: &str) -> &mut Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    /// Build the registration record. The node comes up `ready` with a
    /// `Ready=True` condition; allocatable defaults to capacity until
    /// something reserves headroom.
    pub fn build(self) -> Node {
        let now = Utc::now();
        let mut node = Node {
            id: self.id,
            hostname: self.hostname,
            ip: self.ip,
            port: self.port,
            role: self.role,
            region: self.region,
            zone: self.zone,
            status: NodeStatus::Ready,
            conditions: Vec::new(),
            capacity: self.capacity,
            allocatable: self.capacity,
            allocated: Resources::default(),
            capabilities: self.capabilities,
            labels: self.labels,
            annotations: self.annotations,
            created_at: now,
            last_seen: now,
        };
        node.set_condition(
            ConditionType::Ready,
            ConditionStatus::True,
            "AgentReady",
            "agent registered and heartbeating",
        );
        node
    }
}
