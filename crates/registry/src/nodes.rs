//! The node registry: membership records with lease-based liveness.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use hypervisor_types::{
    Error, Node, NodeCondition, NodeRole, NodeStatus, Resources, Result,
};

use crate::kv::{Kv, KvEvent, KvEventType, KvWatch};
use crate::{node_key, NODE_PREFIX};

/// Default TTL for registration leases; an agent renewing slower than this
/// loses its record.
pub const DEFAULT_LEASE_TTL_SECONDS: i64 = 30;

/// Typed access to `/hypervisor/nodes/`. Cheap to clone; clones share the
/// lease map.
#[derive(Clone)]
pub struct NodeRegistry {
    kv: Arc<dyn Kv>,
    lease_ttl: i64,
    // Lease IDs for the nodes this process registered, shared by
    // register/deregister/update paths.
    leases: Arc<RwLock<HashMap<String, i64>>>,
}

impl NodeRegistry {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self::with_lease_ttl(kv, DEFAULT_LEASE_TTL_SECONDS)
    }

    pub fn with_lease_ttl(kv: Arc<dyn Kv>, lease_ttl: i64) -> Self {
        NodeRegistry {
            kv,
            lease_ttl,
            leases: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a node: assign an ID when absent, grant a lease and write
    /// the record under it. Returns the stored node.
    #[instrument(level = "debug", skip(self, node), fields(hostname = %node.hostname))]
    pub async fn register(&self, mut node: Node) -> Result<Node> {
        if node.id.is_empty() {
            node.id = Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        node.created_at = now;
        node.last_seen = now;

        let lease_id = self.kv.grant_lease(self.lease_ttl).await?;
        let value = serde_json::to_vec(&node)?;
        self.kv
            .put_with_lease(&node_key(&node.id), value, lease_id)
            .await?;
        self.leases.write().await.insert(node.id.clone(), lease_id);
        debug!(node_id = %node.id, lease_id, "registered node");
        Ok(node)
    }

    /// Remove a node record. Revokes the registration lease when this
    /// process holds it; expiry through the store would remove the key too,
    /// this is just prompt.
    #[instrument(level = "debug", skip(self))]
    pub async fn deregister(&self, id: &str) -> Result<()> {
        let lease = self.leases.write().await.remove(id);
        if let Some(lease_id) = lease {
            if let Err(err) = self.kv.revoke_lease(lease_id).await {
                warn!(node_id = %id, error = %err, "failed to revoke node lease");
            }
        }
        self.kv.delete(&node_key(id)).await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Node> {
        let key = node_key(id);
        let pair = crate::retry::idempotent("node get", || self.kv.get(&key))
            .await
            .map_err(|err| match err {
                Error::NotFound(_) => Error::not_found(format!("node {}", id)),
                other => other,
            })?;
        Ok(serde_json::from_slice(&pair.value)?)
    }

    pub async fn list(&self) -> Result<Vec<Node>> {
        let pairs =
            crate::retry::idempotent("node list", || self.kv.get_prefix(NODE_PREFIX)).await?;
        let mut nodes = Vec::with_capacity(pairs.len());
        for pair in pairs {
            match serde_json::from_slice::<Node>(&pair.value) {
                Ok(node) => nodes.push(node),
                Err(err) => warn!(key = %pair.key, error = %err, "skipping unreadable node record"),
            }
        }
        Ok(nodes)
    }

    pub async fn list_by_role(&self, role: NodeRole) -> Result<Vec<Node>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|n| n.role == role)
            .collect())
    }

    pub async fn list_by_region(&self, region: &str) -> Result<Vec<Node>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|n| n.region == region)
            .collect())
    }

    /// Re-serialise the record, keeping it attached to the registration
    /// lease when this process holds one.
    pub async fn update(&self, node: &Node) -> Result<()> {
        let value = serde_json::to_vec(node)?;
        let lease = self.leases.read().await.get(&node.id).copied();
        match lease {
            Some(lease_id) => {
                self.kv
                    .put_with_lease(&node_key(&node.id), value, lease_id)
                    .await
            }
            None => self.kv.put(&node_key(&node.id), value).await,
        }
    }

    /// Read-modify-write convenience for status flips.
    #[instrument(level = "debug", skip(self, conditions))]
    pub async fn update_status(
        &self,
        id: &str,
        status: NodeStatus,
        conditions: Vec<NodeCondition>,
    ) -> Result<Node> {
        let mut node = self.get(id).await?;
        node.status = status;
        for condition in conditions {
            node.set_condition(
                condition.condition_type,
                condition.status,
                &condition.reason,
                &condition.message,
            );
        }
        self.update(&node).await?;
        Ok(node)
    }

    /// Stamp `lastSeen`. Called from the agent heartbeat tick.
    pub async fn update_heartbeat(&self, id: &str) -> Result<Node> {
        let mut node = self.get(id).await?;
        node.last_seen = Utc::now();
        self.update(&node).await?;
        Ok(node)
    }

    /// Reserve resources on a node for a newly placed instance. Fails with
    /// `resource-exhausted` when the headroom the scheduler saw has been
    /// consumed in the meantime.
    pub async fn reserve(&self, id: &str, request: &Resources) -> Result<Node> {
        let mut node = self.get(id).await?;
        if !node.available().satisfies(request) {
            return Err(Error::ResourceExhausted(format!(
                "node {} no longer has room for the request",
                id
            )));
        }
        node.allocated = node.allocated.saturating_add(request);
        self.update(&node).await?;
        Ok(node)
    }

    /// Return resources to a node after an instance is destroyed.
    pub async fn release(&self, id: &str, request: &Resources) -> Result<Node> {
        let mut node = self.get(id).await?;
        node.allocated = node.allocated.saturating_sub(request);
        self.update(&node).await?;
        Ok(node)
    }

    /// The registration lease held for `id`, if this process registered it.
    pub async fn lease_id(&self, id: &str) -> Option<i64> {
        self.leases.read().await.get(id).copied()
    }

    pub async fn watch(&self) -> Result<NodeWatcher> {
        let inner = self.kv.watch_prefix(NODE_PREFIX).await?;
        Ok(NodeWatcher { inner })
    }
}

/// A typed change event for node records.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Added(Node),
    Modified(Node),
    /// Carries the node ID; the record itself is gone from the store.
    Deleted(String),
}

pub struct NodeWatcher {
    inner: KvWatch,
}

impl NodeWatcher {
    /// The next node event, skipping records that fail to decode.
    pub async fn next(&mut self) -> Option<NodeEvent> {
        loop {
            let event = self.inner.next().await?;
            match map_event(event) {
                Some(mapped) => return Some(mapped),
                None => continue,
            }
        }
    }

    pub fn cancel(&mut self) {
        self.inner.cancel();
    }
}

fn map_event(event: KvEvent) -> Option<NodeEvent> {
    match event.event_type {
        KvEventType::Put => match serde_json::from_slice::<Node>(&event.pair.value) {
            Ok(node) => {
                if event.pair.is_create() {
                    Some(NodeEvent::Added(node))
                } else {
                    Some(NodeEvent::Modified(node))
                }
            }
            Err(err) => {
                warn!(key = %event.pair.key, error = %err, "dropping undecodable node event");
                None
            }
        },
        KvEventType::Delete => {
            let id = event.pair.key.strip_prefix(NODE_PREFIX)?.to_string();
            Some(NodeEvent::Deleted(id))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kv::MemKv;
    use hypervisor_types::resources::GIB;
    use hypervisor_types::InstanceType;

    fn worker(hostname: &str) -> Node {
        let mut builder = Node::builder();
        builder
            .set_hostname(hostname)
            .set_address("10.0.0.5", 9400)
            .set_role(NodeRole::Worker)
            .set_capacity(Resources::new(4, 8 * GIB, 100 * GIB, 0));
        builder.add_capability(InstanceType::Vm);
        builder.build()
    }

    fn registry() -> (NodeRegistry, MemKv) {
        let kv = MemKv::new();
        (NodeRegistry::new(Arc::new(kv.clone())), kv)
    }

    #[tokio::test]
    async fn register_assigns_id_and_round_trips() {
        let (nodes, _kv) = registry();
        let registered = nodes.register(worker("w1")).await.unwrap();
        assert!(!registered.id.is_empty());
        let fetched = nodes.get(&registered.id).await.unwrap();
        assert_eq!(fetched.hostname, "w1");
        assert!(nodes.lease_id(&registered.id).await.is_some());
    }

    #[tokio::test]
    async fn deregister_removes_record_and_lease() {
        let (nodes, _kv) = registry();
        let node = nodes.register(worker("w1")).await.unwrap();
        nodes.deregister(&node.id).await.unwrap();
        assert!(nodes.get(&node.id).await.unwrap_err().is_not_found());
        assert!(nodes.lease_id(&node.id).await.is_none());
    }

    #[tokio::test]
    async fn lease_expiry_removes_the_record() {
        let (nodes, kv) = registry();
        let node = nodes.register(worker("w1")).await.unwrap();
        let lease = nodes.lease_id(&node.id).await.unwrap();
        kv.expire_lease(lease);
        assert!(nodes.get(&node.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn reserve_accumulates_and_checks_headroom() {
        let (nodes, _kv) = registry();
        let node = nodes.register(worker("w1")).await.unwrap();
        let req = Resources::new(3, GIB, 0, 0);
        nodes.reserve(&node.id, &req).await.unwrap();
        let err = nodes.reserve(&node.id, &req).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        nodes.release(&node.id, &req).await.unwrap();
        nodes.reserve(&node.id, &req).await.unwrap();
    }

    #[tokio::test]
    async fn update_status_merges_conditions() {
        let (nodes, _kv) = registry();
        let node = nodes.register(worker("w1")).await.unwrap();
        let updated = nodes
            .update_status(&node.id, NodeStatus::Draining, Vec::new())
            .await
            .unwrap();
        assert_eq!(updated.status, NodeStatus::Draining);
        assert!(!updated.is_schedulable());
    }

    #[tokio::test]
    async fn watch_distinguishes_added_modified_deleted() {
        let (nodes, _kv) = registry();
        let mut watch = nodes.watch().await.unwrap();
        let node = nodes.register(worker("w1")).await.unwrap();
        match watch.next().await.unwrap() {
            NodeEvent::Added(n) => assert_eq!(n.id, node.id),
            other => panic!("expected Added, got {:?}", other),
        }
        nodes.update_heartbeat(&node.id).await.unwrap();
        match watch.next().await.unwrap() {
            NodeEvent::Modified(n) => assert_eq!(n.id, node.id),
            other => panic!("expected Modified, got {:?}", other),
        }
        nodes.deregister(&node.id).await.unwrap();
        match watch.next().await.unwrap() {
            NodeEvent::Deleted(id) => assert_eq!(id, node.id),
            other => panic!("expected Deleted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn list_filters_by_role_and_region() {
        let (nodes, _kv) = registry();
        let mut master = worker("m1");
        master.role = NodeRole::Master;
        nodes.register(master).await.unwrap();
        let mut w = worker("w1");
        w.region = "eu-west".into();
        nodes.register(w).await.unwrap();

        assert_eq!(nodes.list().await.unwrap().len(), 2);
        assert_eq!(nodes.list_by_role(NodeRole::Worker).await.unwrap().len(), 1);
        assert_eq!(nodes.list_by_region("eu-west").await.unwrap().len(), 1);
        assert_eq!(nodes.list_by_region("us-east").await.unwrap().len(), 0);
    }
}
