//! Core data model shared by every component of the hypervisor control plane.
//!
//! Nodes and instances are persisted as camelCase JSON in the KV store, so
//! the serde representations in this crate are the wire format. Everything
//! else (gRPC messages, driver views) converts to and from these types.

pub mod config;
mod error;
pub mod instance;
pub mod node;
pub mod resources;

pub use error::{Error, Result};
pub use instance::{
    DiskSpec, Instance, InstanceSpec, InstanceState, InstanceStats, InstanceType, NetworkSpec,
    ResourceLimits,
};
pub use node::{ConditionStatus, ConditionType, Node, NodeCondition, NodeRole, NodeStatus};
pub use resources::Resources;
