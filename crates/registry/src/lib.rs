//! The registry layer: typed node and instance registries over a
//! consensus-backed KV store.
//!
//! Records live as camelCase JSON under conventional prefixes:
//!
//! ```text
//! /hypervisor/nodes/{id}                           (leased)
//! /hypervisor/instances/{id}                       (not leased)
//! /hypervisor/instances-by-node/{nodeID}/{id}      (value = instance id)
//! ```
//!
//! A node record's lease is its liveness signal: when the owning agent stops
//! renewing, the store expires the key and the node vanishes from every
//! read path. Instances are not leased; the control service is authoritative
//! for their records.

pub mod instances;
pub mod kv;
pub mod nodes;
pub mod retry;

pub use instances::{InstanceEvent, InstanceRegistry, InstanceWatcher};
pub use kv::{
    EtcdConfig, EtcdKv, KeepAlive, Kv, KvCredentials, KvEvent, KvEventType, KvPair, KvSettings,
    KvWatch, MemKv,
};
pub use nodes::{NodeEvent, NodeRegistry, NodeWatcher};

/// Prefix for node records.
pub const NODE_PREFIX: &str = "/hypervisor/nodes/";
/// Prefix for instance records.
pub const INSTANCE_PREFIX: &str = "/hypervisor/instances/";
/// Prefix for the node -> instance secondary index.
pub const INSTANCE_NODE_INDEX_PREFIX: &str = "/hypervisor/instances-by-node/";

pub(crate) fn node_key(id: &str) -> String {
    format!("{}{}", NODE_PREFIX, id)
}

pub(crate) fn instance_key(id: &str) -> String {
    format!("{}{}", INSTANCE_PREFIX, id)
}

pub(crate) fn instance_index_key(node_id: &str, instance_id: &str) -> String {
    format!("{}{}/{}", INSTANCE_NODE_INDEX_PREFIX, node_id, instance_id)
}
