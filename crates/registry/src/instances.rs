//! The instance registry: authoritative workload records plus the
//! node -> instance secondary index.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use hypervisor_types::{instance::valid_transition, Error, Instance, InstanceState, InstanceType, Result};

use crate::kv::{Kv, KvEvent, KvEventType, KvWatch};
use crate::{instance_index_key, instance_key, INSTANCE_NODE_INDEX_PREFIX, INSTANCE_PREFIX};

/// Typed access to `/hypervisor/instances/`.
#[derive(Clone)]
pub struct InstanceRegistry {
    kv: Arc<dyn Kv>,
}

impl InstanceRegistry {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        InstanceRegistry { kv }
    }

    /// Create a new record. Fails with `already-exists` when the ID is
    /// taken. The main record is authoritative; a failed index write is
    /// logged and tolerated.
    #[instrument(level = "debug", skip(self, instance), fields(instance_id = %instance.id))]
    pub async fn create(&self, mut instance: Instance) -> Result<Instance> {
        if instance.id.is_empty() {
            return Err(Error::invalid_spec("instance id must not be empty"));
        }
        let now = Utc::now();
        if instance.created_at.timestamp_millis() == 0 {
            instance.created_at = now;
        }
        instance.updated_at = now;

        let value = serde_json::to_vec(&instance)?;
        let created = self
            .kv
            .create_if_absent(&instance_key(&instance.id), value)
            .await?;
        if !created {
            return Err(Error::already_exists(format!("instance {}", instance.id)));
        }

        if !instance.node_id.is_empty() {
            let index = instance_index_key(&instance.node_id, &instance.id);
            if let Err(err) = self.kv.put(&index, instance.id.clone().into_bytes()).await {
                warn!(
                    instance_id = %instance.id,
                    node_id = %instance.node_id,
                    error = %err,
                    "failed to write node index entry; main record is authoritative"
                );
            }
        }
        Ok(instance)
    }

    pub async fn get(&self, id: &str) -> Result<Instance> {
        let key = instance_key(id);
        let pair = crate::retry::idempotent("instance get", || self.kv.get(&key))
            .await
            .map_err(|err| match err {
                Error::NotFound(_) => Error::not_found(format!("instance {}", id)),
                other => other,
            })?;
        Ok(serde_json::from_slice(&pair.value)?)
    }

    pub async fn list(&self) -> Result<Vec<Instance>> {
        let pairs =
            crate::retry::idempotent("instance list", || self.kv.get_prefix(INSTANCE_PREFIX))
                .await?;
        let mut instances = Vec::with_capacity(pairs.len());
        for pair in pairs {
            match serde_json::from_slice::<Instance>(&pair.value) {
                Ok(instance) => instances.push(instance),
                Err(err) => {
                    warn!(key = %pair.key, error = %err, "skipping unreadable instance record")
                }
            }
        }
        Ok(instances)
    }

    /// Resolve the node index. Stale entries whose main record has vanished
    /// are dropped silently.
    pub async fn list_by_node(&self, node_id: &str) -> Result<Vec<Instance>> {
        let prefix = format!("{}{}/", INSTANCE_NODE_INDEX_PREFIX, node_id);
        let pairs = self.kv.get_prefix(&prefix).await?;
        let mut instances = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let id = String::from_utf8_lossy(&pair.value);
            match self.get(&id).await {
                Ok(instance) => instances.push(instance),
                Err(err) if err.is_not_found() => {
                    debug!(instance_id = %id, node_id, "dropping stale index entry");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(instances)
    }

    pub async fn list_by_type(&self, instance_type: InstanceType) -> Result<Vec<Instance>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|i| i.instance_type == instance_type)
            .collect())
    }

    pub async fn list_by_state(&self, state: InstanceState) -> Result<Vec<Instance>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|i| i.state == state)
            .collect())
    }

    /// Overwrite a record, moving the node index entry when the binding
    /// changed.
    #[instrument(level = "debug", skip(self, instance), fields(instance_id = %instance.id))]
    pub async fn update(&self, mut instance: Instance) -> Result<Instance> {
        let previous = self.get(&instance.id).await?;
        instance.updated_at = Utc::now();
        let value = serde_json::to_vec(&instance)?;
        self.kv.put(&instance_key(&instance.id), value).await?;

        if previous.node_id != instance.node_id {
            if !previous.node_id.is_empty() {
                let old = instance_index_key(&previous.node_id, &instance.id);
                if let Err(err) = self.kv.delete(&old).await {
                    warn!(instance_id = %instance.id, error = %err, "failed to remove old index entry");
                }
            }
            if !instance.node_id.is_empty() {
                let index = instance_index_key(&instance.node_id, &instance.id);
                if let Err(err) = self.kv.put(&index, instance.id.clone().into_bytes()).await {
                    warn!(instance_id = %instance.id, error = %err, "failed to write node index entry");
                }
            }
        }
        Ok(instance)
    }

    /// Read-modify-write state convenience. Stamps `startedAt` on the first
    /// transition to `running` and never again.
    #[instrument(level = "debug", skip(self, reason))]
    pub async fn update_state(
        &self,
        id: &str,
        state: InstanceState,
        reason: &str,
    ) -> Result<Instance> {
        let mut instance = self.get(id).await?;
        if !valid_transition(instance.state, state) {
            debug!(
                instance_id = %id,
                from = %instance.state,
                to = %state,
                "recording out-of-band state transition reported by the agent"
            );
        }
        instance.state = state;
        instance.state_reason = reason.to_string();
        if state == InstanceState::Running && instance.started_at.is_none() {
            instance.started_at = Some(Utc::now());
        }
        self.update(instance).await
    }

    /// Remove the record and its index entry. Idempotent: deleting a
    /// missing instance is success.
    #[instrument(level = "debug", skip(self))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        let node_id = match self.get(id).await {
            Ok(instance) => instance.node_id,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        self.kv.delete(&instance_key(id)).await?;
        if !node_id.is_empty() {
            let index = instance_index_key(&node_id, id);
            if let Err(err) = self.kv.delete(&index).await {
                warn!(instance_id = %id, error = %err, "failed to remove node index entry");
            }
        }
        Ok(())
    }

    pub async fn watch(&self) -> Result<InstanceWatcher> {
        let inner = self.kv.watch_prefix(INSTANCE_PREFIX).await?;
        Ok(InstanceWatcher { inner })
    }
}

/// A typed change event for instance records.
#[derive(Debug, Clone)]
pub enum InstanceEvent {
    Added(Instance),
    Modified(Instance),
    /// Carries the instance ID; the record itself is gone from the store.
    Deleted(String),
}

pub struct InstanceWatcher {
    inner: KvWatch,
}

impl InstanceWatcher {
    pub async fn next(&mut self) -> Option<InstanceEvent> {
        loop {
            let event = self.inner.next().await?;
            // Defensive: index writes never land under the record prefix,
            // but filter them out in case the two prefixes are ever nested.
            if event.pair.key.starts_with(INSTANCE_NODE_INDEX_PREFIX) {
                continue;
            }
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

fn map_event(event: KvEvent) -> Option<InstanceEvent> {
    match event.event_type {
        KvEventType::Put => match serde_json::from_slice::<Instance>(&event.pair.value) {
            Ok(instance) => {
                if event.pair.is_create() {
                    Some(InstanceEvent::Added(instance))
                } else {
                    Some(InstanceEvent::Modified(instance))
                }
            }
            Err(err) => {
                warn!(key = %event.pair.key, error = %err, "dropping undecodable instance event");
                None
            }
        },
        KvEventType::Delete => {
            let id = event.pair.key.strip_prefix(INSTANCE_PREFIX)?.to_string();
            Some(InstanceEvent::Deleted(id))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kv::MemKv;
    use hypervisor_types::InstanceSpec;

    fn registry() -> (InstanceRegistry, Arc<MemKv>) {
        let kv = Arc::new(MemKv::new());
        (InstanceRegistry::new(kv.clone()), kv)
    }

    fn instance(id: &str, node: &str) -> Instance {
        let mut inst = Instance::new(
            id,
            "web",
            InstanceType::Container,
            InstanceSpec {
                image: "nginx:alpine".into(),
                cpu_cores: 1,
                memory_mb: 512,
                ..Default::default()
            },
        );
        inst.node_id = node.to_string();
        inst
    }

    #[tokio::test]
    async fn duplicate_create_is_already_exists() {
        let (reg, _kv) = registry();
        reg.create(instance("i-1", "n-1")).await.unwrap();
        let err = reg.create(instance("i-1", "n-1")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_create_can_follow() {
        let (reg, _kv) = registry();
        reg.create(instance("i-1", "n-1")).await.unwrap();
        reg.delete("i-1").await.unwrap();
        assert!(reg.get("i-1").await.unwrap_err().is_not_found());
        // Second delete of a missing record is success.
        reg.delete("i-1").await.unwrap();
        // And the ID is reusable.
        reg.create(instance("i-1", "n-1")).await.unwrap();
    }

    #[tokio::test]
    async fn list_by_node_resolves_index_and_drops_stale_entries() {
        let (reg, kv) = registry();
        reg.create(instance("i-1", "n-1")).await.unwrap();
        reg.create(instance("i-2", "n-1")).await.unwrap();
        reg.create(instance("i-3", "n-2")).await.unwrap();

        let on_n1 = reg.list_by_node("n-1").await.unwrap();
        assert_eq!(on_n1.len(), 2);

        // Remove a main record behind the registry's back; the index entry
        // goes stale and must be dropped silently.
        kv.delete(&instance_key("i-2")).await.unwrap();
        let on_n1 = reg.list_by_node("n-1").await.unwrap();
        assert_eq!(on_n1.len(), 1);
        assert_eq!(on_n1[0].id, "i-1");
    }

    #[tokio::test]
    async fn update_moves_index_when_binding_changes() {
        let (reg, _kv) = registry();
        let mut inst = reg.create(instance("i-1", "n-1")).await.unwrap();
        inst.node_id = "n-2".to_string();
        reg.update(inst).await.unwrap();
        assert!(reg.list_by_node("n-1").await.unwrap().is_empty());
        assert_eq!(reg.list_by_node("n-2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn started_at_is_stamped_exactly_once() {
        let (reg, _kv) = registry();
        let created = reg.create(instance("i-1", "n-1")).await.unwrap();
        assert!(created.started_at.is_none());

        let first = reg
            .update_state("i-1", InstanceState::Running, "")
            .await
            .unwrap();
        let stamped = first.started_at.expect("startedAt set on first running");

        reg.update_state("i-1", InstanceState::Stopped, "")
            .await
            .unwrap();
        let second = reg
            .update_state("i-1", InstanceState::Running, "")
            .await
            .unwrap();
        assert_eq!(second.started_at, Some(stamped));
        assert!(second.created_at <= stamped);
        assert!(stamped <= second.updated_at);
    }

    #[tokio::test]
    async fn filters_by_type_and_state() {
        let (reg, _kv) = registry();
        reg.create(instance("i-1", "n-1")).await.unwrap();
        let mut vm = instance("i-2", "n-1");
        vm.instance_type = InstanceType::Vm;
        reg.create(vm).await.unwrap();

        reg.update_state("i-1", InstanceState::Running, "")
            .await
            .unwrap();

        assert_eq!(reg.list_by_type(InstanceType::Vm).await.unwrap().len(), 1);
        let running = reg.list_by_state(InstanceState::Running).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "i-1");
    }

    #[tokio::test]
    async fn watch_reports_record_changes_only() {
        let (reg, _kv) = registry();
        let mut watch = reg.watch().await.unwrap();
        reg.create(instance("i-1", "n-1")).await.unwrap();
        match watch.next().await.unwrap() {
            InstanceEvent::Added(i) => assert_eq!(i.id, "i-1"),
            other => panic!("expected Added, got {:?}", other),
        }
        reg.update_state("i-1", InstanceState::Running, "")
            .await
            .unwrap();
        match watch.next().await.unwrap() {
            InstanceEvent::Modified(i) => assert_eq!(i.state, InstanceState::Running),
            other => panic!("expected Modified, got {:?}", other),
        }
        reg.delete("i-1").await.unwrap();
        match watch.next().await.unwrap() {
            InstanceEvent::Deleted(id) => assert_eq!(id, "i-1"),
            other => panic!("expected Deleted, got {:?}", other),
        }
    }
}
