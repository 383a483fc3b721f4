//! The agent connection pool: long-lived client stubs keyed by node ID.
//! Addresses come from the node registry on a miss; entries are invalidated
//! when an RPC fails at the transport layer so the next call re-dials.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, instrument};

use hypervisor_proto::AgentServiceClient;
use hypervisor_registry::NodeRegistry;
use hypervisor_types::{Error, Result};

pub struct AgentPool {
    nodes: NodeRegistry,
    clients: RwLock<HashMap<String, AgentServiceClient<Channel>>>,
    dial_timeout: Duration,
    rpc_timeout: Duration,
}

impl AgentPool {
    pub fn new(nodes: NodeRegistry, dial_timeout: Duration, rpc_timeout: Duration) -> Self {
        AgentPool {
            nodes,
            clients: RwLock::new(HashMap::new()),
            dial_timeout,
            rpc_timeout,
        }
    }

    /// A client stub for the node's agent, reusing the cached connection
    /// when one exists.
    #[instrument(level = "debug", skip(self))]
    pub async fn get(&self, node_id: &str) -> Result<AgentServiceClient<Channel>> {
        if let Some(client) = self.clients.read().await.get(node_id) {
            return Ok(client.clone());
        }

        let node = self.nodes.get(node_id).await?;
        let uri = format!("http://{}", node.address());
        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| Error::internal(format!("agent address {}: {}", uri, e)))?
            .connect_timeout(self.dial_timeout)
            .timeout(self.rpc_timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| Error::unavailable(format!("dialing agent on {}: {}", node_id, e)))?;
        debug!(node_id, %uri, "agent connection established");

        let client = AgentServiceClient::new(channel);
        self.clients
            .write()
            .await
            .insert(node_id.to_string(), client.clone());
        Ok(client)
    }

    /// Drop the cached connection for a node; the next `get` re-dials.
    pub async fn invalidate(&self, node_id: &str) {
        if self.clients.write().await.remove(node_id).is_some() {
            debug!(node_id, "agent connection invalidated");
        }
    }
}
