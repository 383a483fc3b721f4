//! Periodic comparison of the agent's driver view against the registry's
//! view of this node. Mismatches are reported, not corrected: the operator
//! tool reconciles via `ListLocalInstances` when it has to.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use hypervisor_driver::DriverManager;
use hypervisor_registry::InstanceRegistry;

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

pub struct Reconciler {
    node_id: String,
    manager: Arc<DriverManager>,
    instances: InstanceRegistry,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        node_id: String,
        manager: Arc<DriverManager>,
        instances: InstanceRegistry,
        interval: Duration,
    ) -> Self {
        Reconciler {
            node_id,
            manager,
            instances,
            interval,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.reconcile_once().await;
        }
    }

    pub async fn reconcile_once(&self) {
        let local = match self.manager.list_all().await {
            Ok(instances) => instances,
            Err(err) => {
                warn!(error = %err, "reconcile: cannot list local instances");
                return;
            }
        };
        let recorded = match self.instances.list_by_node(&self.node_id).await {
            Ok(instances) => instances,
            Err(err) => {
                warn!(error = %err, "reconcile: cannot list registry instances");
                return;
            }
        };

        let local_ids: HashSet<&str> = local.iter().map(|i| i.id.as_str()).collect();
        let recorded_ids: HashSet<&str> = recorded.iter().map(|i| i.id.as_str()).collect();

        for id in recorded_ids.difference(&local_ids) {
            warn!(
                instance_id = %id,
                node_id = %self.node_id,
                "registry records an instance no local driver knows"
            );
        }
        for id in local_ids.difference(&recorded_ids) {
            warn!(
                instance_id = %id,
                node_id = %self.node_id,
                "local driver holds an instance the registry does not record"
            );
        }
        debug!(
            local = local_ids.len(),
            recorded = recorded_ids.len(),
            "reconcile pass complete"
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hypervisor_driver::testing::FakeDriver;
    use hypervisor_driver::Driver;
    use hypervisor_registry::{InstanceRegistry, MemKv};
    use hypervisor_types::{Instance, InstanceSpec, InstanceType};

    #[tokio::test]
    async fn reconcile_tolerates_views_drifting_apart() {
        let kv = Arc::new(MemKv::new());
        let instances = InstanceRegistry::new(kv);
        let driver = Arc::new(FakeDriver::new(InstanceType::Container));
        let mut manager = DriverManager::new();
        manager.register(driver.clone());

        // One instance only the registry knows, one only the driver knows.
        let mut recorded = Instance::new(
            "i-registry",
            "ghost",
            InstanceType::Container,
            InstanceSpec {
                image: "img".into(),
                cpu_cores: 1,
                memory_mb: 64,
                ..Default::default()
            },
        );
        recorded.node_id = "n-1".to_string();
        instances.create(recorded).await.unwrap();
        driver
            .create(
                "i-local",
                "stray",
                &InstanceSpec {
                    image: "img".into(),
                    cpu_cores: 1,
                    memory_mb: 64,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let reconciler = Reconciler::new(
            "n-1".to_string(),
            Arc::new(manager),
            instances,
            Duration::from_secs(60),
        );
        // Warnings only; the pass itself must not fail or correct anything.
        reconciler.reconcile_once().await;
        assert!(driver.get("i-local").await.is_ok());
    }
}
