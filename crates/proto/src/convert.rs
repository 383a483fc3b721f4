//! Conversions between the wire messages and the domain model.
//!
//! Outbound conversions (`From<types::T>`) are total. Inbound conversions
//! (`TryFrom<v1::T>`) reject unspecified or out-of-range enum values with
//! `invalid-spec` so malformed requests never reach a registry or driver.

use chrono::{DateTime, TimeZone, Utc};
use hypervisor_types as types;
use hypervisor_types::{Error, Result};

use crate::v1;

/// Millisecond unix timestamp for the wire; zero stands for unset.
pub fn ts_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn opt_ts_ms(dt: Option<DateTime<Utc>>) -> i64 {
    dt.map(ts_ms).unwrap_or(0)
}

pub fn dt_from_ms(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        None
    } else {
        Utc.timestamp_millis_opt(ms).single()
    }
}

// ---------------------------------------------------------------------------
// Enums

impl From<types::InstanceType> for v1::InstanceType {
    fn from(t: types::InstanceType) -> Self {
        match t {
            types::InstanceType::Vm => v1::InstanceType::Vm,
            types::InstanceType::Container => v1::InstanceType::Container,
            types::InstanceType::MicroVm => v1::InstanceType::Microvm,
        }
    }
}

impl TryFrom<v1::InstanceType> for types::InstanceType {
    type Error = Error;

    fn try_from(t: v1::InstanceType) -> Result<Self> {
        match t {
            v1::InstanceType::Vm => Ok(types::InstanceType::Vm),
            v1::InstanceType::Container => Ok(types::InstanceType::Container),
            v1::InstanceType::Microvm => Ok(types::InstanceType::MicroVm),
            v1::InstanceType::Unspecified => {
                Err(Error::invalid_spec("instance type is unspecified"))
            }
        }
    }
}

/// Decode a raw enum tag from the wire, defaulting unspecified to `vm` per
/// the compute-service contract.
pub fn instance_type_or_default(raw: i32) -> Result<types::InstanceType> {
    let t = v1::InstanceType::try_from(raw)
        .map_err(|_| Error::invalid_spec(format!("unknown instance type tag {}", raw)))?;
    if t == v1::InstanceType::Unspecified {
        return Ok(types::InstanceType::Vm);
    }
    types::InstanceType::try_from(t)
}

pub fn instance_type_from_i32(raw: i32) -> Result<types::InstanceType> {
    let t = v1::InstanceType::try_from(raw)
        .map_err(|_| Error::invalid_spec(format!("unknown instance type tag {}", raw)))?;
    types::InstanceType::try_from(t)
}

impl From<types::InstanceState> for v1::InstanceState {
    fn from(s: types::InstanceState) -> Self {
        match s {
            types::InstanceState::Unknown => v1::InstanceState::Unknown,
            types::InstanceState::Pending => v1::InstanceState::Pending,
            types::InstanceState::Creating => v1::InstanceState::Creating,
            types::InstanceState::Running => v1::InstanceState::Running,
            types::InstanceState::Stopped => v1::InstanceState::Stopped,
            types::InstanceState::Paused => v1::InstanceState::Paused,
            types::InstanceState::Failed => v1::InstanceState::Failed,
        }
    }
}

impl From<v1::InstanceState> for types::InstanceState {
    fn from(s: v1::InstanceState) -> Self {
        match s {
            v1::InstanceState::Unknown => types::InstanceState::Unknown,
            v1::InstanceState::Pending => types::InstanceState::Pending,
            v1::InstanceState::Creating => types::InstanceState::Creating,
            v1::InstanceState::Running => types::InstanceState::Running,
            v1::InstanceState::Stopped => types::InstanceState::Stopped,
            v1::InstanceState::Paused => types::InstanceState::Paused,
            v1::InstanceState::Failed => types::InstanceState::Failed,
        }
    }
}

pub fn instance_state_from_i32(raw: i32) -> Result<types::InstanceState> {
    let s = v1::InstanceState::try_from(raw)
        .map_err(|_| Error::invalid_spec(format!("unknown instance state tag {}", raw)))?;
    Ok(s.into())
}

impl From<types::NodeRole> for v1::NodeRole {
    fn from(r: types::NodeRole) -> Self {
        match r {
            types::NodeRole::Master => v1::NodeRole::Master,
            types::NodeRole::Worker => v1::NodeRole::Worker,
        }
    }
}

impl TryFrom<v1::NodeRole> for types::NodeRole {
    type Error = Error;

    fn try_from(r: v1::NodeRole) -> Result<Self> {
        match r {
            v1::NodeRole::Master => Ok(types::NodeRole::Master),
            v1::NodeRole::Worker => Ok(types::NodeRole::Worker),
            v1::NodeRole::Unspecified => Err(Error::invalid_spec("node role is unspecified")),
        }
    }
}

pub fn node_role_from_i32(raw: i32) -> Result<types::NodeRole> {
    let r = v1::NodeRole::try_from(raw)
        .map_err(|_| Error::invalid_spec(format!("unknown node role tag {}", raw)))?;
    types::NodeRole::try_from(r)
}

impl From<types::NodeStatus> for v1::NodeStatus {
    fn from(s: types::NodeStatus) -> Self {
        match s {
            types::NodeStatus::Ready => v1::NodeStatus::Ready,
            types::NodeStatus::NotReady => v1::NodeStatus::NotReady,
            types::NodeStatus::Maintenance => v1::NodeStatus::Maintenance,
            types::NodeStatus::Draining => v1::NodeStatus::Draining,
        }
    }
}

impl TryFrom<v1::NodeStatus> for types::NodeStatus {
    type Error = Error;

    fn try_from(s: v1::NodeStatus) -> Result<Self> {
        match s {
            v1::NodeStatus::Ready => Ok(types::NodeStatus::Ready),
            v1::NodeStatus::NotReady => Ok(types::NodeStatus::NotReady),
            v1::NodeStatus::Maintenance => Ok(types::NodeStatus::Maintenance),
            v1::NodeStatus::Draining => Ok(types::NodeStatus::Draining),
            v1::NodeStatus::Unspecified => Err(Error::invalid_spec("node status is unspecified")),
        }
    }
}

pub fn node_status_from_i32(raw: i32) -> Result<types::NodeStatus> {
    let s = v1::NodeStatus::try_from(raw)
        .map_err(|_| Error::invalid_spec(format!("unknown node status tag {}", raw)))?;
    types::NodeStatus::try_from(s)
}

fn condition_type_token(t: types::ConditionType) -> &'static str {
    match t {
        types::ConditionType::Ready => "Ready",
        types::ConditionType::DiskPressure => "DiskPressure",
        types::ConditionType::MemoryPressure => "MemoryPressure",
        types::ConditionType::NetworkUnavailable => "NetworkUnavailable",
    }
}

fn condition_type_from_token(s: &str) -> Result<types::ConditionType> {
    match s {
        "Ready" => Ok(types::ConditionType::Ready),
        "DiskPressure" => Ok(types::ConditionType::DiskPressure),
        "MemoryPressure" => Ok(types::ConditionType::MemoryPressure),
        "NetworkUnavailable" => Ok(types::ConditionType::NetworkUnavailable),
        other => Err(Error::invalid_spec(format!(
            "unknown condition type {:?}",
            other
        ))),
    }
}

fn condition_status_token(s: types::ConditionStatus) -> &'static str {
    match s {
        types::ConditionStatus::True => "True",
        types::ConditionStatus::False => "False",
        types::ConditionStatus::Unknown => "Unknown",
    }
}

fn condition_status_from_token(s: &str) -> Result<types::ConditionStatus> {
    match s {
        "True" => Ok(types::ConditionStatus::True),
        "False" => Ok(types::ConditionStatus::False),
        "Unknown" => Ok(types::ConditionStatus::Unknown),
        other => Err(Error::invalid_spec(format!(
            "unknown condition status {:?}",
            other
        ))),
    }
}

// ---------------------------------------------------------------------------
// Messages

impl From<types::Resources> for v1::Resources {
    fn from(r: types::Resources) -> Self {
        v1::Resources {
            cpu_cores: r.cpu_cores,
            memory_bytes: r.memory_bytes,
            disk_bytes: r.disk_bytes,
            gpu_count: r.gpu_count,
        }
    }
}

impl From<v1::Resources> for types::Resources {
    fn from(r: v1::Resources) -> Self {
        types::Resources {
            cpu_cores: r.cpu_cores,
            memory_bytes: r.memory_bytes,
            disk_bytes: r.disk_bytes,
            gpu_count: r.gpu_count,
        }
    }
}

impl From<types::DiskSpec> for v1::DiskSpec {
    fn from(d: types::DiskSpec) -> Self {
        v1::DiskSpec {
            name: d.name,
            size_gb: d.size_gb,
            r#type: d.disk_type,
            boot: d.boot,
        }
    }
}

impl From<v1::DiskSpec> for types::DiskSpec {
    fn from(d: v1::DiskSpec) -> Self {
        types::DiskSpec {
            name: d.name,
            size_gb: d.size_gb,
            disk_type: d.r#type,
            boot: d.boot,
        }
    }
}

impl From<types::NetworkSpec> for v1::NetworkSpec {
    fn from(n: types::NetworkSpec) -> Self {
        v1::NetworkSpec {
            mode: n.mode,
            bridge: n.bridge,
            mac_address: n.mac_address.unwrap_or_default(),
            ip_address: n.ip_address.unwrap_or_default(),
        }
    }
}

impl From<v1::NetworkSpec> for types::NetworkSpec {
    fn from(n: v1::NetworkSpec) -> Self {
        types::NetworkSpec {
            mode: n.mode,
            bridge: n.bridge,
            mac_address: (!n.mac_address.is_empty()).then_some(n.mac_address),
            ip_address: (!n.ip_address.is_empty()).then_some(n.ip_address),
        }
    }
}

impl From<types::ResourceLimits> for v1::ResourceLimits {
    fn from(l: types::ResourceLimits) -> Self {
        v1::ResourceLimits {
            cpu_quota: l.cpu_quota,
            cpu_period: l.cpu_period,
            memory_limit: l.memory_limit,
            io_read_bps: l.io_read_bps,
            io_write_bps: l.io_write_bps,
        }
    }
}

impl From<v1::ResourceLimits> for types::ResourceLimits {
    fn from(l: v1::ResourceLimits) -> Self {
        types::ResourceLimits {
            cpu_quota: l.cpu_quota,
            cpu_period: l.cpu_period,
            memory_limit: l.memory_limit,
            io_read_bps: l.io_read_bps,
            io_write_bps: l.io_write_bps,
        }
    }
}

impl From<types::InstanceSpec> for v1::InstanceSpec {
    fn from(s: types::InstanceSpec) -> Self {
        v1::InstanceSpec {
            image: s.image,
            cpu_cores: s.cpu_cores,
            memory_mb: s.memory_mb,
            disks: s.disks.into_iter().map(Into::into).collect(),
            network: s.network.map(Into::into),
            kernel: s.kernel.unwrap_or_default(),
            initrd: s.initrd.unwrap_or_default(),
            kernel_args: s.kernel_args.unwrap_or_default(),
            command: s.command.unwrap_or_default(),
            args: s.args,
            env: s.env,
            resource_limits: s.resource_limits.map(Into::into),
        }
    }
}

impl From<v1::InstanceSpec> for types::InstanceSpec {
    fn from(s: v1::InstanceSpec) -> Self {
        types::InstanceSpec {
            image: s.image,
            cpu_cores: s.cpu_cores,
            memory_mb: s.memory_mb,
            disks: s.disks.into_iter().map(Into::into).collect(),
            network: s.network.map(Into::into),
            kernel: (!s.kernel.is_empty()).then_some(s.kernel),
            initrd: (!s.initrd.is_empty()).then_some(s.initrd),
            kernel_args: (!s.kernel_args.is_empty()).then_some(s.kernel_args),
            command: (!s.command.is_empty()).then_some(s.command),
            args: s.args,
            env: s.env,
            resource_limits: s.resource_limits.map(Into::into),
        }
    }
}

impl From<types::Instance> for v1::Instance {
    fn from(i: types::Instance) -> Self {
        v1::Instance {
            id: i.id,
            name: i.name,
            r#type: v1::InstanceType::from(i.instance_type) as i32,
            state: v1::InstanceState::from(i.state) as i32,
            state_reason: i.state_reason,
            spec: Some(i.spec.into()),
            node_id: i.node_id,
            ip_address: i.ip_address.unwrap_or_default(),
            labels: i.labels,
            annotations: i.annotations,
            created_at_ms: ts_ms(i.created_at),
            started_at_ms: opt_ts_ms(i.started_at),
            updated_at_ms: ts_ms(i.updated_at),
        }
    }
}

impl TryFrom<v1::Instance> for types::Instance {
    type Error = Error;

    fn try_from(i: v1::Instance) -> Result<Self> {
        let spec = i
            .spec
            .ok_or_else(|| Error::invalid_spec("instance spec is required"))?;
        Ok(types::Instance {
            id: i.id,
            name: i.name,
            instance_type: instance_type_from_i32(i.r#type)?,
            state: instance_state_from_i32(i.state)?,
            state_reason: i.state_reason,
            spec: spec.into(),
            node_id: i.node_id,
            ip_address: (!i.ip_address.is_empty()).then_some(i.ip_address),
            labels: i.labels,
            annotations: i.annotations,
            created_at: dt_from_ms(i.created_at_ms).unwrap_or_else(Utc::now),
            started_at: dt_from_ms(i.started_at_ms),
            updated_at: dt_from_ms(i.updated_at_ms).unwrap_or_else(Utc::now),
        })
    }
}

impl From<types::NodeCondition> for v1::NodeCondition {
    fn from(c: types::NodeCondition) -> Self {
        v1::NodeCondition {
            r#type: condition_type_token(c.condition_type).to_string(),
            status: condition_status_token(c.status).to_string(),
            reason: c.reason,
            message: c.message,
            last_transition_time_ms: ts_ms(c.last_transition_time),
        }
    }
}

impl TryFrom<v1::NodeCondition> for types::NodeCondition {
    type Error = Error;

    fn try_from(c: v1::NodeCondition) -> Result<Self> {
        Ok(types::NodeCondition {
            condition_type: condition_type_from_token(&c.r#type)?,
            status: condition_status_from_token(&c.status)?,
            reason: c.reason,
            message: c.message,
            last_transition_time: dt_from_ms(c.last_transition_time_ms)
                .unwrap_or_else(Utc::now),
        })
    }
}

impl From<types::Node> for v1::Node {
    fn from(n: types::Node) -> Self {
        v1::Node {
            id: n.id,
            hostname: n.hostname,
            ip: n.ip,
            port: n.port as u32,
            role: v1::NodeRole::from(n.role) as i32,
            region: n.region,
            zone: n.zone,
            status: v1::NodeStatus::from(n.status) as i32,
            conditions: n.conditions.into_iter().map(Into::into).collect(),
            capacity: Some(n.capacity.into()),
            allocatable: Some(n.allocatable.into()),
            allocated: Some(n.allocated.into()),
            capabilities: n
                .capabilities
                .into_iter()
                .map(|c| v1::InstanceType::from(c) as i32)
                .collect(),
            labels: n.labels,
            annotations: n.annotations,
            created_at_ms: ts_ms(n.created_at),
            last_seen_ms: ts_ms(n.last_seen),
        }
    }
}

impl TryFrom<v1::Node> for types::Node {
    type Error = Error;

    fn try_from(n: v1::Node) -> Result<Self> {
        let conditions = n
            .conditions
            .into_iter()
            .map(types::NodeCondition::try_from)
            .collect::<Result<Vec<_>>>()?;
        let capabilities = n
            .capabilities
            .into_iter()
            .map(instance_type_from_i32)
            .collect::<Result<Vec<_>>>()?;
        Ok(types::Node {
            id: n.id,
            hostname: n.hostname,
            ip: n.ip,
            port: u16::try_from(n.port)
                .map_err(|_| Error::invalid_spec(format!("port {} out of range", n.port)))?,
            role: node_role_from_i32(n.role)?,
            region: n.region,
            zone: n.zone,
            status: node_status_from_i32(n.status)?,
            conditions,
            capacity: n.capacity.map(Into::into).unwrap_or_default(),
            allocatable: n.allocatable.map(Into::into).unwrap_or_default(),
            allocated: n.allocated.map(Into::into).unwrap_or_default(),
            capabilities,
            labels: n.labels,
            annotations: n.annotations,
            created_at: dt_from_ms(n.created_at_ms).unwrap_or_else(Utc::now),
            last_seen: dt_from_ms(n.last_seen_ms).unwrap_or_else(Utc::now),
        })
    }
}

impl From<types::InstanceStats> for v1::InstanceStats {
    fn from(s: types::InstanceStats) -> Self {
        v1::InstanceStats {
            cpu_usage_percent: s.cpu_usage_percent,
            cpu_time_ns: s.cpu_time_ns,
            memory_used_bytes: s.memory_used_bytes,
            memory_cache_bytes: s.memory_cache_bytes,
            disk_read_bytes: s.disk_read_bytes,
            disk_write_bytes: s.disk_write_bytes,
            network_rx_bytes: s.network_rx_bytes,
            network_tx_bytes: s.network_tx_bytes,
            collected_at_ms: opt_ts_ms(s.collected_at),
        }
    }
}

impl From<v1::InstanceStats> for types::InstanceStats {
    fn from(s: v1::InstanceStats) -> Self {
        types::InstanceStats {
            cpu_usage_percent: s.cpu_usage_percent,
            cpu_time_ns: s.cpu_time_ns,
            memory_used_bytes: s.memory_used_bytes,
            memory_cache_bytes: s.memory_cache_bytes,
            disk_read_bytes: s.disk_read_bytes,
            disk_write_bytes: s.disk_write_bytes,
            network_rx_bytes: s.network_rx_bytes,
            network_tx_bytes: s.network_tx_bytes,
            collected_at: dt_from_ms(s.collected_at_ms),
        }
    }
}
