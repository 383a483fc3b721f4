//! The per-node agent: collects node facts, registers against the KV-backed
//! node registry, keeps its lease alive, exposes the agent RPC surface and
//! reconciles its drivers against the registry.

pub mod config;
pub mod facts;
pub mod heartbeat;
pub mod reconcile;
pub mod service;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use uuid::Uuid;

use hypervisor_driver::{ContainerDriver, DriverManager, MicroVmDriver, VmDriver};
use hypervisor_proto::AgentServiceServer;
use hypervisor_registry::{EtcdKv, InstanceRegistry, Kv, NodeRegistry};
use hypervisor_types::{InstanceType, Node, Resources, Result};

use config::AgentConfig;
use heartbeat::HeartbeatLoop;
use reconcile::{Reconciler, DEFAULT_RECONCILE_INTERVAL};
use service::AgentHandler;

/// Build one driver per enabled instance type.
pub async fn build_drivers(config: &config::DriversConfig) -> Result<DriverManager> {
    let mut manager = DriverManager::new();
    for instance_type in &config.enabled {
        match instance_type {
            InstanceType::Vm => {
                manager.register(Arc::new(VmDriver::new(config.vm.to_driver_config()).await?));
            }
            InstanceType::Container => {
                manager.register(Arc::new(
                    ContainerDriver::new(config.container.to_driver_config()).await?,
                ));
            }
            InstanceType::MicroVm => {
                manager.register(Arc::new(
                    MicroVmDriver::new(config.microvm.to_driver_config()).await?,
                ));
            }
        }
    }
    Ok(manager)
}

pub struct Agent {
    config: AgentConfig,
    kv: Arc<dyn Kv>,
    nodes: NodeRegistry,
    instances: InstanceRegistry,
    manager: Arc<DriverManager>,
}

impl Agent {
    /// Connect to the KV store and assemble the agent from its config.
    pub async fn new(config: AgentConfig) -> Result<Self> {
        let kv: Arc<dyn Kv> = Arc::new(EtcdKv::connect(&config.kv.to_config()).await?);
        let manager = Arc::new(build_drivers(&config.drivers).await?);
        Ok(Self::with_parts(config, kv, manager))
    }

    /// Assemble from pre-built parts; the seam the tests use.
    pub fn with_parts(config: AgentConfig, kv: Arc<dyn Kv>, manager: Arc<DriverManager>) -> Self {
        let nodes = NodeRegistry::new(kv.clone());
        let instances = InstanceRegistry::new(kv.clone());
        Agent {
            config,
            kv,
            nodes,
            instances,
            manager,
        }
    }

    /// Assemble this node's registration record from config, measured facts
    /// and the drivers actually enabled.
    pub fn node_record(&self) -> Node {
        let node_config = &self.config.node;
        let hostname = node_config
            .hostname
            .clone()
            .unwrap_or_else(facts::hostname);
        let capacity = node_config
            .capacity
            .unwrap_or_else(|| self.measured_capacity());

        let mut builder = Node::builder();
        builder
            .set_id(node_config.id.as_deref().unwrap_or(""))
            .set_hostname(&hostname)
            .set_address(&node_config.ip, node_config.port)
            .set_role(node_config.role)
            .set_placement(&node_config.region, &node_config.zone)
            .set_capacity(capacity);
        for (key, value) in &node_config.labels {
            builder.add_label(key, value);
        }
        for instance_type in self.manager.capabilities() {
            builder.add_capability(instance_type);
        }
        builder.build()
    }

    fn measured_capacity(&self) -> Resources {
        // Any driver state dir serves as the disk-capacity probe point.
        facts::capacity(&self.config.drivers.vm.state_dir)
    }

    /// Register, heartbeat, serve. Runs until the RPC server stops or the
    /// heartbeat loop exhausts its recovery attempts.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut record = self.node_record();
        if record.id.is_empty() {
            record.id = Uuid::new_v4().to_string();
        }
        let node = self.nodes.register(record).await?;
        info!(node_id = %node.id, hostname = %node.hostname, "node registered");

        let heartbeat = HeartbeatLoop::new(
            self.kv.clone(),
            self.nodes.clone(),
            node.clone(),
            self.config.heartbeat.interval(),
            self.config.heartbeat.retry_interval(),
        );
        let mut heartbeat_task = tokio::spawn(heartbeat.run());

        let reconciler = Reconciler::new(
            node.id.clone(),
            self.manager.clone(),
            self.instances.clone(),
            DEFAULT_RECONCILE_INTERVAL,
        );
        let reconcile_task = tokio::spawn(reconciler.run());

        let addr = format!("{}:{}", self.config.node.ip, self.config.node.port)
            .parse()
            .context("invalid agent listen address")?;
        let handler = AgentHandler::new(node.id.clone(), self.nodes.clone(), self.manager.clone());
        info!(%addr, "agent RPC surface listening");

        let server = tonic::transport::Server::builder()
            .add_service(AgentServiceServer::new(handler))
            .serve(addr);

        let result: anyhow::Result<()> = tokio::select! {
            res = server => res.context("agent server failed"),
            res = &mut heartbeat_task => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(anyhow::anyhow!(err).context("heartbeat loop failed")),
                Err(join) => Err(anyhow::anyhow!(join).context("heartbeat task panicked")),
            },
        };

        reconcile_task.abort();
        heartbeat_task.abort();
        self.manager.close_all().await;
        if let Err(err) = self.nodes.deregister(&node.id).await {
            warn!(node_id = %node.id, error = %err, "deregistration on shutdown failed");
        }
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hypervisor_driver::testing::FakeDriver;
    use hypervisor_registry::MemKv;

    #[tokio::test]
    async fn node_record_reflects_config_and_driver_capabilities() {
        let mut config = AgentConfig::default();
        config.node.hostname = Some("worker-9".to_string());
        config.node.ip = "10.1.2.3".to_string();
        config.node.port = 9500;
        config.node.region = "eu-west".to_string();
        config.node.zone = "eu-west-1c".to_string();
        config.node.capacity = Some(Resources::new(8, 32 << 30, 500 << 30, 1));
        config
            .node
            .labels
            .insert("pool".to_string(), "general".to_string());

        let mut manager = DriverManager::new();
        manager.register(Arc::new(FakeDriver::new(InstanceType::Vm)));
        manager.register(Arc::new(FakeDriver::new(InstanceType::Container)));

        let agent = Agent::with_parts(config, Arc::new(MemKv::new()), Arc::new(manager));
        let record = agent.node_record();

        assert_eq!(record.hostname, "worker-9");
        assert_eq!(record.address(), "10.1.2.3:9500");
        assert_eq!(record.region, "eu-west");
        assert_eq!(record.capacity.cpu_cores, 8);
        assert_eq!(record.allocatable, record.capacity);
        assert_eq!(
            record.capabilities,
            vec![InstanceType::Vm, InstanceType::Container]
        );
        assert_eq!(record.labels.get("pool").map(String::as_str), Some("general"));
        assert!(record.is_schedulable());
    }
}
