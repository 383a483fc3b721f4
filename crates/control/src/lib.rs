//! The stateless control plane. State lives in the KV store; any number of
//! these can run behind a load balancer.

pub mod cluster;
pub mod compute;
pub mod config;
pub mod http;
pub mod monitor;
pub mod pool;
pub mod scheduler;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use hypervisor_proto::{ClusterServiceServer, ComputeServiceServer};
use hypervisor_registry::{EtcdKv, InstanceRegistry, Kv, NodeRegistry};
use hypervisor_types::Result;

use cluster::ClusterHandler;
use compute::ComputeHandler;
use config::ControlConfig;
use monitor::Monitor;
use pool::AgentPool;
use scheduler::Scheduler;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct ControlPlane {
    config: ControlConfig,
    nodes: NodeRegistry,
    instances: InstanceRegistry,
}

impl ControlPlane {
    /// Connect to the KV store and assemble the service graph.
    pub async fn new(config: ControlConfig) -> Result<Self> {
        let kv: Arc<dyn Kv> = Arc::new(EtcdKv::connect(&config.kv.to_config()).await?);
        Ok(Self::with_kv(config, kv))
    }

    /// Assemble over an existing store; the seam the tests use.
    pub fn with_kv(config: ControlConfig, kv: Arc<dyn Kv>) -> Self {
        ControlPlane {
            config,
            nodes: NodeRegistry::new(kv.clone()),
            instances: InstanceRegistry::new(kv),
        }
    }

    pub fn handlers(&self) -> (ClusterHandler, ComputeHandler) {
        let pool = Arc::new(AgentPool::new(
            self.nodes.clone(),
            self.config.agent.dial_timeout(),
            self.config.agent.rpc_timeout(),
        ));
        let scheduler = Scheduler::new(self.nodes.clone(), self.config.heartbeat.timeout());
        (
            ClusterHandler::new(self.nodes.clone(), self.instances.clone()),
            ComputeHandler::new(
                self.nodes.clone(),
                self.instances.clone(),
                scheduler,
                pool,
            ),
        )
    }

    /// Serve the gRPC surfaces, the health sidecar and the liveness
    /// monitor until the server exits.
    pub async fn run(self) -> anyhow::Result<()> {
        let grpc_addr = self
            .config
            .grpc_addr
            .parse()
            .context("invalid grpcAddr")?;
        let http_addr = self
            .config
            .http_addr
            .parse()
            .context("invalid httpAddr")?;

        let monitor = Monitor::new(
            self.nodes.clone(),
            self.config.heartbeat.interval(),
            self.config.heartbeat.timeout(),
        )
        .with_callback(Arc::new(|node| {
            warn!(node_id = %node.id, hostname = %node.hostname, "node declared dead");
        }));
        let monitor_task = tokio::spawn(monitor.run());

        let http_task = tokio::spawn(http::serve(http_addr, VERSION));
        info!(%http_addr, "health endpoint listening");

        let (cluster, compute) = self.handlers();
        info!(%grpc_addr, "control service listening");
        let result = tonic::transport::Server::builder()
            .add_service(ClusterServiceServer::new(cluster))
            .add_service(ComputeServiceServer::new(compute))
            .serve(grpc_addr)
            .await
            .context("control server failed");

        monitor_task.abort();
        http_task.abort();
        result
    }
}
