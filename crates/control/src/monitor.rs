//! Agent liveness monitor.
//!
//! Leases are the authoritative death signal (an expired lease deletes the
//! node record outright); this monitor is the redundant defence for records
//! whose lease has not yet expired. It polls, compares `lastSeen` against
//! the timeout and flips freshly dead nodes to `not_ready`, invoking the
//! notification callback once per death.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use hypervisor_registry::NodeRegistry;
use hypervisor_types::{ConditionStatus, ConditionType, Node, NodeCondition, NodeStatus};

pub type DeadNodeCallback = Arc<dyn Fn(&Node) + Send + Sync>;

pub struct Monitor {
    nodes: NodeRegistry,
    interval: Duration,
    timeout: chrono::Duration,
    on_dead: Option<DeadNodeCallback>,
}

impl Monitor {
    pub fn new(nodes: NodeRegistry, interval: Duration, timeout: Duration) -> Self {
        Monitor {
            nodes,
            interval,
            timeout: chrono::Duration::from_std(timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            on_dead: None,
        }
    }

    /// Invoked once per node on its first dead-transition.
    pub fn with_callback(mut self, callback: DeadNodeCallback) -> Self {
        self.on_dead = Some(callback);
        self
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.scan_once().await;
        }
    }

    /// One poll over every node record.
    pub async fn scan_once(&self) {
        let nodes = match self.nodes.list().await {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!(error = %err, "monitor cannot list nodes");
                return;
            }
        };
        let now = Utc::now();
        for node in nodes {
            if node.status == NodeStatus::NotReady {
                continue;
            }
            let silent_for = now - node.last_seen;
            if silent_for <= self.timeout {
                continue;
            }
            info!(
                node_id = %node.id,
                silent_secs = silent_for.num_seconds(),
                "node missed its heartbeat window; marking not_ready"
            );
            let condition = NodeCondition {
                condition_type: ConditionType::Ready,
                status: ConditionStatus::False,
                reason: "HeartbeatTimeout".to_string(),
                message: format!("no heartbeat for {}s", silent_for.num_seconds()),
                last_transition_time: now,
            };
            match self
                .nodes
                .update_status(&node.id, NodeStatus::NotReady, vec![condition])
                .await
            {
                Ok(updated) => {
                    if let Some(callback) = &self.on_dead {
                        callback(&updated);
                    }
                }
                Err(err) => {
                    // The record may have expired with its lease between the
                    // list and the write; that is death handled elsewhere.
                    debug!(node_id = %node.id, error = %err, "dead-node status flip failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hypervisor_registry::MemKv;
    use hypervisor_types::{InstanceType, NodeRole, Resources};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn worker() -> Node {
        let mut builder = Node::builder();
        builder
            .set_hostname("w1")
            .set_address("10.0.0.1", 9411)
            .set_role(NodeRole::Worker)
            .set_capacity(Resources::new(4, 8 << 30, 0, 0));
        builder.add_capability(InstanceType::Container);
        builder.build()
    }

    #[tokio::test]
    async fn silent_node_converges_to_not_ready_and_fires_callback_once() {
        let kv = Arc::new(MemKv::new());
        let nodes = NodeRegistry::new(kv);
        let node = nodes.register(worker()).await.unwrap();

        let deaths = Arc::new(AtomicUsize::new(0));
        let counter = deaths.clone();
        let monitor = Monitor::new(
            nodes.clone(),
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
        .with_callback(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // Fresh heartbeat: nothing happens.
        monitor.scan_once().await;
        assert_eq!(
            nodes.get(&node.id).await.unwrap().status,
            NodeStatus::Ready
        );

        // Let the heartbeat go stale past the timeout.
        tokio::time::sleep(Duration::from_millis(80)).await;
        monitor.scan_once().await;
        let dead = nodes.get(&node.id).await.unwrap();
        assert_eq!(dead.status, NodeStatus::NotReady);
        assert!(!dead.is_schedulable());
        assert_eq!(deaths.load(Ordering::SeqCst), 1);

        // Further scans do not re-fire the callback.
        monitor.scan_once().await;
        assert_eq!(deaths.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn heartbeat_revives_monitoring_without_callback_noise() {
        let kv = Arc::new(MemKv::new());
        let nodes = NodeRegistry::new(kv);
        let node = nodes.register(worker()).await.unwrap();
        let monitor = Monitor::new(
            nodes.clone(),
            Duration::from_millis(10),
            Duration::from_millis(40),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        monitor.scan_once().await;
        assert_eq!(
            nodes.get(&node.id).await.unwrap().status,
            NodeStatus::NotReady
        );

        // A fresh heartbeat plus an explicit status reset brings it back.
        nodes.update_heartbeat(&node.id).await.unwrap();
        nodes
            .update_status(&node.id, NodeStatus::Ready, vec![])
            .await
            .unwrap();
        monitor.scan_once().await;
        assert_eq!(nodes.get(&node.id).await.unwrap().status, NodeStatus::Ready);
    }
}
