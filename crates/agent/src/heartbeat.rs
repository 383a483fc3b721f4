//! The agent heartbeat loop.
//!
//! Liveness has two halves: the lease keep-alive session (authoritative;
//! expiry deletes the node record) and the `lastSeen` stamp written every
//! tick (the monitor's redundant defence). When the keep-alive stream
//! closes, the loop re-reads its record, re-registers for a fresh lease and
//! resumes; after three consecutive failures it surfaces the error and
//! exits, leaving restart policy to process supervision.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use hypervisor_registry::{KeepAlive, Kv, NodeRegistry};
use hypervisor_types::{Error, Node, Result};

const MAX_RECOVERY_ATTEMPTS: u32 = 3;

pub struct HeartbeatLoop {
    kv: Arc<dyn Kv>,
    nodes: NodeRegistry,
    /// The record as last registered; the fallback for re-registration when
    /// the store-side copy expired together with the lease.
    node: Node,
    interval: Duration,
    retry_interval: Duration,
}

impl HeartbeatLoop {
    pub fn new(
        kv: Arc<dyn Kv>,
        nodes: NodeRegistry,
        node: Node,
        interval: Duration,
        retry_interval: Duration,
    ) -> Self {
        HeartbeatLoop {
            kv,
            nodes,
            node,
            interval,
            retry_interval,
        }
    }

    async fn open_keep_alive(&self) -> Result<KeepAlive> {
        let lease_id = self
            .nodes
            .lease_id(&self.node.id)
            .await
            .ok_or_else(|| Error::not_found(format!("lease for node {}", self.node.id)))?;
        self.kv.keep_alive(lease_id).await
    }

    /// Re-read the node record (falling back to the copy this process
    /// holds) and register it again for a fresh lease.
    async fn recover(&mut self) -> Result<KeepAlive> {
        if let Ok(current) = self.nodes.get(&self.node.id).await {
            self.node = current;
        }
        self.node = self.nodes.register(self.node.clone()).await?;
        self.open_keep_alive().await
    }

    async fn recover_with_retries(&mut self) -> Result<KeepAlive> {
        let mut last_err = Error::unavailable("keep-alive recovery never attempted");
        for attempt in 1..=MAX_RECOVERY_ATTEMPTS {
            tokio::time::sleep(self.retry_interval).await;
            match self.recover().await {
                Ok(keep_alive) => return Ok(keep_alive),
                Err(err) => {
                    warn!(
                        node_id = %self.node.id,
                        attempt,
                        error = %err,
                        "re-registration attempt failed"
                    );
                    last_err = err;
                }
            }
        }
        error!(node_id = %self.node.id, "heartbeat recovery exhausted; giving up");
        Err(last_err)
    }

    /// Run until the process is stopped or recovery is exhausted.
    pub async fn run(mut self) -> Result<()> {
        let mut keep_alive = self.open_keep_alive().await?;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.nodes.update_heartbeat(&self.node.id).await {
                        warn!(node_id = %self.node.id, error = %err, "failed to stamp lastSeen");
                    }
                }
                ack = keep_alive.ack() => {
                    match ack {
                        Some(ttl) => {
                            debug!(node_id = %self.node.id, ttl, "lease renewed");
                        }
                        None => {
                            warn!(node_id = %self.node.id, "keep-alive stream closed; re-registering");
                            keep_alive = self.recover_with_retries().await?;
                            info!(node_id = %self.node.id, "re-registered with a fresh lease");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hypervisor_registry::MemKv;
    use hypervisor_types::{NodeRole, Resources};

    fn node() -> Node {
        let mut builder = Node::builder();
        builder
            .set_hostname("w1")
            .set_address("127.0.0.1", 9411)
            .set_role(NodeRole::Worker)
            .set_capacity(Resources::new(2, 1 << 30, 0, 0));
        builder.build()
    }

    #[tokio::test]
    async fn heartbeat_stamps_last_seen() {
        let kv = Arc::new(MemKv::new());
        let nodes = NodeRegistry::new(kv.clone());
        let registered = nodes.register(node()).await.unwrap();
        let before = nodes.get(&registered.id).await.unwrap().last_seen;

        let hb = HeartbeatLoop::new(
            kv,
            nodes.clone(),
            registered.clone(),
            Duration::from_millis(30),
            Duration::from_millis(10),
        );
        let handle = tokio::spawn(hb.run());
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.abort();

        let after = nodes.get(&registered.id).await.unwrap().last_seen;
        assert!(after > before);
    }

    #[tokio::test]
    async fn lost_lease_triggers_re_registration() {
        let kv = Arc::new(MemKv::new());
        let nodes = NodeRegistry::new(kv.clone());
        let registered = nodes.register(node()).await.unwrap();
        let first_lease = nodes.lease_id(&registered.id).await.unwrap();

        let hb = HeartbeatLoop::new(
            kv.clone(),
            nodes.clone(),
            registered.clone(),
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        let handle = tokio::spawn(hb.run());

        // Kill the lease out from under the loop; the keep-alive stream
        // closes and the loop must come back with a fresh registration.
        tokio::time::sleep(Duration::from_millis(30)).await;
        kv.revoke_lease(first_lease).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let recovered = nodes.get(&registered.id).await.unwrap();
        assert_eq!(recovered.id, registered.id);
        let second_lease = nodes.lease_id(&registered.id).await.unwrap();
        assert_ne!(first_lease, second_lease);
        handle.abort();
    }
}
