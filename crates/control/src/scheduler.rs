//! Bin-packing placement with a deterministic tie-break.

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, instrument};

use hypervisor_registry::NodeRegistry;
use hypervisor_types::{Error, InstanceType, Node, NodeRole, Resources, Result};

/// What the compute service asks the scheduler to place.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub instance_type: InstanceType,
    pub request: Resources,
    pub preferred_node_id: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
}

#[derive(Clone)]
pub struct Scheduler {
    nodes: NodeRegistry,
    /// A node whose lastSeen is older than this is treated as dead even
    /// before the monitor flips its status.
    liveness_timeout: std::time::Duration,
}

impl Scheduler {
    pub fn new(nodes: NodeRegistry, liveness_timeout: std::time::Duration) -> Self {
        Scheduler {
            nodes,
            liveness_timeout,
        }
    }

    fn eligible(&self, node: &Node, req: &ScheduleRequest) -> bool {
        if node.role != NodeRole::Worker || !node.is_schedulable() {
            return false;
        }
        let stale = ChronoDuration::from_std(self.liveness_timeout)
            .map(|timeout| Utc::now() - node.last_seen > timeout)
            .unwrap_or(false);
        if stale {
            return false;
        }
        if !node.supports(req.instance_type) {
            return false;
        }
        if let Some(region) = &req.region {
            if !region.is_empty() && node.region != *region {
                return false;
            }
        }
        if let Some(zone) = &req.zone {
            if !zone.is_empty() && node.zone != *zone {
                return false;
            }
        }
        node.available().satisfies(&req.request)
    }

    /// The mean of the CPU and memory availability fractions. The `+1`
    /// avoids a divide by zero and breaks ties toward smaller nodes.
    fn score(node: &Node) -> f64 {
        let available = node.available();
        let cpu = available.cpu_cores as f64 / (node.capacity.cpu_cores as f64 + 1.0);
        let mem = available.memory_bytes as f64 / (node.capacity.memory_bytes as f64 + 1.0);
        (cpu + mem) / 2.0
    }

    /// Select a node for the request, or `resource-exhausted` when no node
    /// qualifies. Ties go to the earlier node in registry iteration order.
    #[instrument(level = "debug", skip(self, req), fields(instance_type = %req.instance_type))]
    pub async fn select(&self, req: &ScheduleRequest) -> Result<Node> {
        if let Some(preferred) = req.preferred_node_id.as_deref().filter(|id| !id.is_empty()) {
            if let Ok(node) = self.nodes.get(preferred).await {
                if self.eligible(&node, req) {
                    debug!(node_id = %node.id, "placed on preferred node");
                    return Ok(node);
                }
            }
            debug!(node_id = %preferred, "preferred node not eligible; falling back");
        }

        let mut best: Option<(f64, Node)> = None;
        for node in self.nodes.list_by_role(NodeRole::Worker).await? {
            if !self.eligible(&node, req) {
                continue;
            }
            let score = Self::score(&node);
            match &best {
                Some((best_score, _)) if score <= *best_score => {}
                _ => best = Some((score, node)),
            }
        }

        match best {
            Some((score, node)) => {
                debug!(node_id = %node.id, score, "node selected");
                Ok(node)
            }
            None => Err(Error::ResourceExhausted(
                "no node can host the requested instance".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hypervisor_registry::MemKv;
    use hypervisor_types::resources::{GIB, MIB};
    use std::sync::Arc;
    use std::time::Duration;

    fn request(cpu: u32, memory_mb: u64) -> ScheduleRequest {
        ScheduleRequest {
            instance_type: InstanceType::Container,
            request: Resources::new(cpu, memory_mb * MIB, 0, 0),
            preferred_node_id: None,
            region: None,
            zone: None,
        }
    }

    fn worker(hostname: &str) -> Node {
        let mut builder = Node::builder();
        builder
            .set_hostname(hostname)
            .set_address("10.0.0.1", 9411)
            .set_role(NodeRole::Worker)
            .set_capacity(Resources::new(4, 8 * GIB, 100 * GIB, 0));
        builder.add_capability(InstanceType::Vm);
        builder.add_capability(InstanceType::Container);
        builder.build()
    }

    async fn cluster() -> (Scheduler, NodeRegistry) {
        let kv = Arc::new(MemKv::new());
        let nodes = NodeRegistry::new(kv);
        (
            Scheduler::new(nodes.clone(), Duration::from_secs(30)),
            nodes,
        )
    }

    #[tokio::test]
    async fn zero_eligible_nodes_is_resource_exhausted() {
        let (scheduler, _nodes) = cluster().await;
        let err = scheduler.select(&request(1, 512)).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn single_eligible_node_wins_regardless_of_score() {
        let (scheduler, nodes) = cluster().await;
        let node = nodes.register(worker("w1")).await.unwrap();
        // Nearly full, terrible score, still the only option.
        nodes
            .reserve(&node.id, &Resources::new(3, 7 * GIB, 0, 0))
            .await
            .unwrap();
        let placed = scheduler.select(&request(1, 512)).await.unwrap();
        assert_eq!(placed.id, node.id);
    }

    #[tokio::test]
    async fn filters_respect_capability_region_and_status() {
        let (scheduler, nodes) = cluster().await;

        let mut vm_only = worker("vm-only");
        vm_only.capabilities = vec![InstanceType::Vm];
        nodes.register(vm_only).await.unwrap();

        let mut wrong_region = worker("wrong-region");
        wrong_region.region = "us-east".to_string();
        nodes.register(wrong_region).await.unwrap();

        let mut draining = worker("draining");
        draining.status = hypervisor_types::NodeStatus::Draining;
        let draining = nodes.register(draining).await.unwrap();
        nodes
            .update_status(&draining.id, hypervisor_types::NodeStatus::Draining, vec![])
            .await
            .unwrap();

        let mut good = worker("good");
        good.region = "eu-west".to_string();
        let good = nodes.register(good).await.unwrap();

        let mut req = request(1, 512);
        req.region = Some("eu-west".to_string());
        let placed = scheduler.select(&req).await.unwrap();
        assert_eq!(placed.id, good.id);
    }

    #[tokio::test]
    async fn preferred_node_wins_when_eligible_only() {
        let (scheduler, nodes) = cluster().await;
        let a = nodes.register(worker("a")).await.unwrap();
        let b = nodes.register(worker("b")).await.unwrap();

        let mut req = request(1, 512);
        req.preferred_node_id = Some(b.id.clone());
        assert_eq!(scheduler.select(&req).await.unwrap().id, b.id);

        // Fill the preferred node; placement falls back to the other.
        nodes
            .reserve(&b.id, &Resources::new(4, 8 * GIB, 0, 0))
            .await
            .unwrap();
        assert_eq!(scheduler.select(&req).await.unwrap().id, a.id);
    }

    #[tokio::test]
    async fn requests_larger_than_headroom_are_rejected() {
        let (scheduler, nodes) = cluster().await;
        nodes.register(worker("w1")).await.unwrap();
        let err = scheduler.select(&request(5, 512)).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn bin_packing_balances_two_identical_nodes() {
        let (scheduler, nodes) = cluster().await;
        let a = nodes.register(worker("a")).await.unwrap();
        let b = nodes.register(worker("b")).await.unwrap();

        let mut placed_a = 0u32;
        let mut placed_b = 0u32;
        for round in 0..8 {
            let req = request(1, 256);
            let node = scheduler.select(&req).await.unwrap();
            nodes.reserve(&node.id, &req.request).await.unwrap();
            if node.id == a.id {
                placed_a += 1;
            } else if node.id == b.id {
                placed_b += 1;
            }
            // Each placement lowers the chosen node's score below the
            // other's, so counts never drift apart.
            assert!(placed_a.abs_diff(placed_b) <= 1, "round {round}");
        }
        assert_eq!(placed_a + placed_b, 8);

        // Both nodes are now full; the next request is unsatisfiable.
        let err = scheduler.select(&request(1, 256)).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }
}
