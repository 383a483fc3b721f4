//! The cluster service: thin RPC wrappers around the node registry plus
//! aggregated cluster introspection.

use tonic::{Request, Response, Status};
use tracing::{info, instrument};

use hypervisor_proto::convert;
use hypervisor_proto::v1::{
    self as v1, DeregisterNodeRequest, DeregisterNodeResponse, GetClusterInfoRequest,
    GetClusterInfoResponse, GetNodeRequest, GetNodeResponse, HeartbeatRequest, HeartbeatResponse,
    ListNodesRequest, ListNodesResponse, RegisterNodeRequest, RegisterNodeResponse,
    UpdateNodeStatusRequest, UpdateNodeStatusResponse,
};
use hypervisor_proto::ClusterService;
use hypervisor_registry::{InstanceRegistry, NodeRegistry};
use hypervisor_types::{Node, NodeCondition, NodeStatus, Resources};

pub struct ClusterHandler {
    nodes: NodeRegistry,
    instances: InstanceRegistry,
}

impl ClusterHandler {
    pub fn new(nodes: NodeRegistry, instances: InstanceRegistry) -> Self {
        ClusterHandler { nodes, instances }
    }
}

#[tonic::async_trait]
impl ClusterService for ClusterHandler {
    #[instrument(skip(self, request))]
    async fn register_node(
        &self,
        request: Request<RegisterNodeRequest>,
    ) -> Result<Response<RegisterNodeResponse>, Status> {
        let node = request
            .into_inner()
            .node
            .ok_or_else(|| Status::invalid_argument("node is required"))?;
        let node = Node::try_from(node)?;
        let registered = self.nodes.register(node).await?;
        info!(node_id = %registered.id, hostname = %registered.hostname, "node registered over RPC");
        Ok(Response::new(RegisterNodeResponse {
            node_id: registered.id,
        }))
    }

    #[instrument(skip(self, request), fields(node_id = %request.get_ref().node_id))]
    async fn deregister_node(
        &self,
        request: Request<DeregisterNodeRequest>,
    ) -> Result<Response<DeregisterNodeResponse>, Status> {
        let req = request.into_inner();
        self.nodes.deregister(&req.node_id).await?;
        info!(node_id = %req.node_id, "node deregistered");
        Ok(Response::new(DeregisterNodeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn list_nodes(
        &self,
        request: Request<ListNodesRequest>,
    ) -> Result<Response<ListNodesResponse>, Status> {
        let req = request.into_inner();
        let role = match req.role {
            Some(raw) => Some(convert::node_role_from_i32(raw)?),
            None => None,
        };

        let mut nodes = self.nodes.list().await?;
        nodes.retain(|node| {
            role.map(|r| node.role == r).unwrap_or(true)
                && (req.region.is_empty() || node.region == req.region)
                && (req.zone.is_empty() || node.zone == req.zone)
                && node.matches_labels(&req.labels)
        });

        Ok(Response::new(ListNodesResponse {
            nodes: nodes.into_iter().map(Into::into).collect(),
        }))
    }

    #[instrument(skip(self, request), fields(node_id = %request.get_ref().node_id))]
    async fn get_node(
        &self,
        request: Request<GetNodeRequest>,
    ) -> Result<Response<GetNodeResponse>, Status> {
        let req = request.into_inner();
        let node = self.nodes.get(&req.node_id).await?;
        Ok(Response::new(GetNodeResponse {
            node: Some(node.into()),
        }))
    }

    #[instrument(skip(self, request), fields(node_id = %request.get_ref().node_id))]
    async fn update_node_status(
        &self,
        request: Request<UpdateNodeStatusRequest>,
    ) -> Result<Response<UpdateNodeStatusResponse>, Status> {
        let req = request.into_inner();
        let status: NodeStatus = convert::node_status_from_i32(req.status)?;
        let conditions = req
            .conditions
            .into_iter()
            .map(NodeCondition::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let updated = self.nodes.update_status(&req.node_id, status, conditions).await?;
        Ok(Response::new(UpdateNodeStatusResponse {
            node: Some(updated.into()),
        }))
    }

    /// Explicit liveness touch. Not required when leases are in use, but
    /// cheap to serve for agents that cannot hold one.
    #[instrument(skip(self, request), fields(node_id = %request.get_ref().node_id))]
    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        let node = self.nodes.update_heartbeat(&req.node_id).await?;
        Ok(Response::new(HeartbeatResponse {
            observed_at_ms: node.last_seen.timestamp_millis(),
        }))
    }

    #[instrument(skip(self, _request))]
    async fn get_cluster_info(
        &self,
        _request: Request<GetClusterInfoRequest>,
    ) -> Result<Response<GetClusterInfoResponse>, Status> {
        let nodes = self.nodes.list().await?;
        let instances = self.instances.list().await?;

        let mut total_capacity = Resources::default();
        let mut total_allocated = Resources::default();
        let mut ready = 0u32;
        for node in &nodes {
            total_capacity = total_capacity.saturating_add(&node.capacity);
            total_allocated = total_allocated.saturating_add(&node.allocated);
            if node.status == NodeStatus::Ready {
                ready += 1;
            }
        }

        Ok(Response::new(GetClusterInfoResponse {
            total_nodes: nodes.len() as u32,
            ready_nodes: ready,
            total_instances: instances.len() as u32,
            total_capacity: Some(total_capacity.into()),
            total_allocated: Some(total_allocated.into()),
        }))
    }
}
