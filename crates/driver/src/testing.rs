//! A backend-free driver used by the test suites: the runtime layer is a
//! plain in-memory map, so lifecycle semantics (idempotence, state
//! transitions, replay safety) can be exercised without QEMU, Docker or
//! Firecracker on the machine.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use hypervisor_types::{
    Error, Instance, InstanceSpec, InstanceState, InstanceStats, InstanceType, Result,
};

use crate::Driver;

/// An in-memory [`Driver`] for one instance type.
pub struct FakeDriver {
    instance_type: InstanceType,
    instances: RwLock<HashMap<String, Instance>>,
    /// When set, every lifecycle call fails with `unavailable`; models a
    /// driver that lost its backend.
    pub disconnected: std::sync::atomic::AtomicBool,
}

impl FakeDriver {
    pub fn new(instance_type: InstanceType) -> Self {
        FakeDriver {
            instance_type,
            instances: RwLock::new(HashMap::new()),
            disconnected: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn check_connected(&self) -> Result<()> {
        if self.disconnected.load(std::sync::atomic::Ordering::Relaxed) {
            Err(Error::unavailable("driver backend is not connected"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    fn instance_type(&self) -> InstanceType {
        self.instance_type
    }

    async fn create(&self, id: &str, name: &str, spec: &InstanceSpec) -> Result<Instance> {
        self.check_connected()?;
        spec.validate()?;
        let mut instances = self.instances.write().await;
        if let Some(existing) = instances.get(id) {
            return Ok(existing.clone());
        }
        let mut instance = Instance::new(id, name, self.instance_type, spec.clone());
        instance.state = InstanceState::Stopped;
        if let Some(net) = &spec.network {
            instance.ip_address = net.ip_address.clone();
        }
        instances.insert(id.to_string(), instance.clone());
        Ok(instance)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.check_connected()?;
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("instance {}", id)))?;
        instance.state = InstanceState::Running;
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn stop(&self, id: &str, _force: bool) -> Result<()> {
        self.check_connected()?;
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("instance {}", id)))?;
        instance.state = InstanceState::Stopped;
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.check_connected()?;
        self.instances.write().await.remove(id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Instance> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("instance {}", id)))
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        Ok(self.instances.read().await.values().cloned().collect())
    }

    async fn stats(&self, id: &str) -> Result<InstanceStats> {
        self.check_connected()?;
        self.get(id).await?;
        Ok(InstanceStats {
            cpu_usage_percent: 1.5,
            memory_used_bytes: 64 * 1024 * 1024,
            collected_at: Some(Utc::now()),
            ..Default::default()
        })
    }
}
