//! The compute service: scheduling, instance lifecycle fan-out to agents,
//! stats and console proxying. The registry is authoritative for instance
//! records; agents are authoritative for runtime state.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use hypervisor_proto::convert;
use hypervisor_proto::v1::{
    self as v1, AgentCreateInstanceRequest, ConsoleData, CreateInstanceRequest,
    DeleteInstanceRequest, DeleteInstanceResponse, GetInstanceRequest, GetInstanceStatsRequest,
    GetInstanceStatsResponse, InstanceResponse, ListInstancesRequest, ListInstancesResponse,
    RestartInstanceRequest, StartInstanceRequest, StopInstanceRequest,
};
use hypervisor_proto::ComputeService;
use hypervisor_registry::{InstanceRegistry, NodeRegistry};
use hypervisor_types::{Error, Instance, InstanceSpec, InstanceState};

use crate::pool::AgentPool;
use crate::scheduler::{ScheduleRequest, Scheduler};

pub struct ComputeHandler {
    nodes: NodeRegistry,
    instances: InstanceRegistry,
    scheduler: Scheduler,
    pool: Arc<AgentPool>,
}

impl ComputeHandler {
    pub fn new(
        nodes: NodeRegistry,
        instances: InstanceRegistry,
        scheduler: Scheduler,
        pool: Arc<AgentPool>,
    ) -> Self {
        ComputeHandler {
            nodes,
            instances,
            scheduler,
            pool,
        }
    }

    /// Fetch the record and an agent client for its node.
    async fn instance_and_agent(
        &self,
        instance_id: &str,
    ) -> Result<
        (
            Instance,
            hypervisor_proto::AgentServiceClient<tonic::transport::Channel>,
        ),
        Status,
    > {
        let instance = self.instances.get(instance_id).await?;
        let client = self.pool.get(&instance.node_id).await?;
        Ok((instance, client))
    }

    /// Record the state an agent reported after a lifecycle operation.
    async fn record_reported_state(
        &self,
        instance_id: &str,
        response: &v1::InstanceStatusResponse,
    ) -> Result<Instance, Status> {
        let state = convert::instance_state_from_i32(response.state)?;
        let mut updated = self
            .instances
            .update_state(instance_id, state, &response.state_reason)
            .await?;
        if !response.ip_address.is_empty()
            && updated.ip_address.as_deref() != Some(response.ip_address.as_str())
        {
            updated.ip_address = Some(response.ip_address.clone());
            updated = self.instances.update(updated).await?;
        }
        Ok(updated)
    }

    /// On an RPC-layer failure, drop the cached agent connection so the next
    /// call re-dials, and hand back the mapped error.
    async fn agent_failure(&self, node_id: &str, status: Status) -> Status {
        if status.code() == tonic::Code::Unavailable {
            self.pool.invalidate(node_id).await;
        }
        status
    }
}

#[tonic::async_trait]
impl ComputeService for ComputeHandler {
    #[instrument(skip(self, request), fields(name = %request.get_ref().name))]
    async fn create_instance(
        &self,
        request: Request<CreateInstanceRequest>,
    ) -> Result<Response<InstanceResponse>, Status> {
        let req = request.into_inner();
        // An unset type defaults to a full VM.
        let instance_type = convert::instance_type_or_default(req.r#type)?;
        let spec: InstanceSpec = req
            .spec
            .ok_or_else(|| Status::invalid_argument("spec is required"))?
            .into();
        spec.validate()?;
        let resources = spec.request();

        let instance_id = Uuid::new_v4().to_string();
        let node = self
            .scheduler
            .select(&ScheduleRequest {
                instance_type,
                request: resources,
                preferred_node_id: (!req.preferred_node_id.is_empty())
                    .then(|| req.preferred_node_id.clone()),
                region: (!req.region.is_empty()).then(|| req.region.clone()),
                zone: (!req.zone.is_empty()).then(|| req.zone.clone()),
            })
            .await?;
        info!(instance_id = %instance_id, node_id = %node.id, "instance scheduled");

        // Reserve the headroom the scheduler just saw; released again on any
        // failure below.
        self.nodes.reserve(&node.id, &resources).await?;

        let agent_response = match self.pool.get(&node.id).await {
            Ok(mut client) => {
                let agent_request = AgentCreateInstanceRequest {
                    instance_id: instance_id.clone(),
                    name: req.name.clone(),
                    r#type: v1::InstanceType::from(instance_type) as i32,
                    spec: Some(spec.clone().into()),
                    labels: req.labels.clone(),
                };
                client.create_instance(Request::new(agent_request)).await
            }
            Err(err) => {
                let _ = self.nodes.release(&node.id, &resources).await;
                return Err(err.into());
            }
        };
        let agent_response = match agent_response {
            Ok(response) => response.into_inner(),
            Err(status) => {
                let _ = self.nodes.release(&node.id, &resources).await;
                return Err(self.agent_failure(&node.id, status).await);
            }
        };

        let mut record = Instance::new(instance_id.clone(), req.name, instance_type, spec);
        record.state = convert::instance_state_from_i32(agent_response.state)
            .unwrap_or(InstanceState::Unknown);
        record.state_reason = agent_response.state_reason;
        record.node_id = node.id.clone();
        record.ip_address = (!agent_response.ip_address.is_empty())
            .then_some(agent_response.ip_address);
        record.started_at = convert::dt_from_ms(agent_response.started_at_ms);
        record.labels = req.labels;
        record.annotations = req.annotations;

        match self.instances.create(record).await {
            Ok(stored) => Ok(Response::new(InstanceResponse {
                instance: Some(stored.into()),
            })),
            Err(err) => {
                // The agent materialised an instance the registry will never
                // know; compensate, then report the write failure.
                warn!(
                    instance_id = %instance_id,
                    node_id = %node.id,
                    error = %err,
                    "registry write failed after agent create; compensating"
                );
                if let Ok(mut client) = self.pool.get(&node.id).await {
                    let delete = DeleteInstanceRequest {
                        instance_id: instance_id.clone(),
                        force: true,
                    };
                    if let Err(status) = client.delete_instance(Request::new(delete)).await {
                        warn!(
                            instance_id = %instance_id,
                            node_id = %node.id,
                            error = %status,
                            "compensating delete failed; instance is orphaned on the agent"
                        );
                    }
                }
                let _ = self.nodes.release(&node.id, &resources).await;
                Err(Error::internal(format!("persisting instance record: {}", err)).into())
            }
        }
    }

    #[instrument(skip(self, request), fields(instance_id = %request.get_ref().instance_id))]
    async fn get_instance(
        &self,
        request: Request<GetInstanceRequest>,
    ) -> Result<Response<InstanceResponse>, Status> {
        let req = request.into_inner();
        let instance = self.instances.get(&req.instance_id).await?;
        Ok(Response::new(InstanceResponse {
            instance: Some(instance.into()),
        }))
    }

    #[instrument(skip(self, request))]
    async fn list_instances(
        &self,
        request: Request<ListInstancesRequest>,
    ) -> Result<Response<ListInstancesResponse>, Status> {
        let req = request.into_inner();
        let type_filter = match req.r#type {
            Some(raw) => Some(convert::instance_type_from_i32(raw)?),
            None => None,
        };
        let state_filter = match req.state {
            Some(raw) => Some(convert::instance_state_from_i32(raw)?),
            None => None,
        };

        // Narrowest index first: by node, then by type, then by state.
        let mut instances = if !req.node_id.is_empty() {
            self.instances.list_by_node(&req.node_id).await?
        } else if let Some(instance_type) = type_filter {
            self.instances.list_by_type(instance_type).await?
        } else if let Some(state) = state_filter {
            self.instances.list_by_state(state).await?
        } else {
            self.instances.list().await?
        };

        instances.retain(|instance| {
            type_filter
                .map(|t| instance.instance_type == t)
                .unwrap_or(true)
                && state_filter.map(|s| instance.state == s).unwrap_or(true)
                && (req.node_id.is_empty() || instance.node_id == req.node_id)
                && instance.matches_labels(&req.label_selector)
        });
        instances.sort_by(|a, b| a.id.cmp(&b.id));

        // Offset-token pagination over the stable ordering.
        let offset: usize = if req.page_token.is_empty() {
            0
        } else {
            req.page_token
                .parse()
                .map_err(|_| Status::invalid_argument("malformed pageToken"))?
        };
        let total = instances.len();
        let page: Vec<Instance> = if req.page_size > 0 {
            instances
                .into_iter()
                .skip(offset)
                .take(req.page_size as usize)
                .collect()
        } else {
            instances.into_iter().skip(offset).collect()
        };
        let consumed = offset + page.len();
        let next_page_token = if consumed < total {
            consumed.to_string()
        } else {
            String::new()
        };

        Ok(Response::new(ListInstancesResponse {
            instances: page.into_iter().map(Into::into).collect(),
            next_page_token,
        }))
    }

    #[instrument(skip(self, request), fields(instance_id = %request.get_ref().instance_id))]
    async fn start_instance(
        &self,
        request: Request<StartInstanceRequest>,
    ) -> Result<Response<InstanceResponse>, Status> {
        let req = request.into_inner();
        let (instance, mut client) = self.instance_and_agent(&req.instance_id).await?;
        let result = client
            .start_instance(Request::new(StartInstanceRequest {
                instance_id: req.instance_id.clone(),
            }))
            .await;
        let response = match result {
            Ok(response) => response.into_inner(),
            Err(status) => return Err(self.agent_failure(&instance.node_id, status).await),
        };
        let updated = self.record_reported_state(&req.instance_id, &response).await?;
        Ok(Response::new(InstanceResponse {
            instance: Some(updated.into()),
        }))
    }

    #[instrument(skip(self, request), fields(instance_id = %request.get_ref().instance_id))]
    async fn stop_instance(
        &self,
        request: Request<StopInstanceRequest>,
    ) -> Result<Response<InstanceResponse>, Status> {
        let req = request.into_inner();
        let (instance, mut client) = self.instance_and_agent(&req.instance_id).await?;
        let result = client.stop_instance(Request::new(req.clone())).await;
        let response = match result {
            Ok(response) => response.into_inner(),
            Err(status) => return Err(self.agent_failure(&instance.node_id, status).await),
        };
        let updated = self.record_reported_state(&req.instance_id, &response).await?;
        Ok(Response::new(InstanceResponse {
            instance: Some(updated.into()),
        }))
    }

    #[instrument(skip(self, request), fields(instance_id = %request.get_ref().instance_id))]
    async fn restart_instance(
        &self,
        request: Request<RestartInstanceRequest>,
    ) -> Result<Response<InstanceResponse>, Status> {
        let req = request.into_inner();
        let (instance, mut client) = self.instance_and_agent(&req.instance_id).await?;
        let result = client.restart_instance(Request::new(req.clone())).await;
        let response = match result {
            Ok(response) => response.into_inner(),
            Err(status) => return Err(self.agent_failure(&instance.node_id, status).await),
        };
        let updated = self.record_reported_state(&req.instance_id, &response).await?;
        Ok(Response::new(InstanceResponse {
            instance: Some(updated.into()),
        }))
    }

    /// Delete removes the registry record even when the owning agent is
    /// unreachable: an unreachable agent cannot enumerate its instances, so
    /// keeping the record would orphan it forever.
    #[instrument(skip(self, request), fields(instance_id = %request.get_ref().instance_id))]
    async fn delete_instance(
        &self,
        request: Request<DeleteInstanceRequest>,
    ) -> Result<Response<DeleteInstanceResponse>, Status> {
        let req = request.into_inner();
        let instance = self.instances.get(&req.instance_id).await?;

        match self.pool.get(&instance.node_id).await {
            Ok(mut client) => {
                if let Err(status) = client.delete_instance(Request::new(req.clone())).await {
                    self.agent_failure(&instance.node_id, status.clone()).await;
                    warn!(
                        instance_id = %req.instance_id,
                        node_id = %instance.node_id,
                        error = %status,
                        "agent delete failed; removing registry record anyway"
                    );
                }
            }
            Err(err) => {
                warn!(
                    instance_id = %req.instance_id,
                    node_id = %instance.node_id,
                    error = %err,
                    "agent unreachable; removing registry record anyway"
                );
            }
        }

        self.instances.delete(&req.instance_id).await?;
        if let Err(err) = self
            .nodes
            .release(&instance.node_id, &instance.spec.request())
            .await
        {
            warn!(
                node_id = %instance.node_id,
                error = %err,
                "failed to release resources for deleted instance"
            );
        }
        info!(instance_id = %req.instance_id, "instance deleted");
        Ok(Response::new(DeleteInstanceResponse {}))
    }

    #[instrument(skip(self, request), fields(instance_id = %request.get_ref().instance_id))]
    async fn get_instance_stats(
        &self,
        request: Request<GetInstanceStatsRequest>,
    ) -> Result<Response<GetInstanceStatsResponse>, Status> {
        let req = request.into_inner();
        let (instance, mut client) = self.instance_and_agent(&req.instance_id).await?;
        let result = client.get_instance_stats(Request::new(req)).await;
        match result {
            Ok(response) => Ok(response),
            Err(status) => Err(self.agent_failure(&instance.node_id, status).await),
        }
    }

    type AttachConsoleStream =
        Pin<Box<dyn Stream<Item = Result<ConsoleData, Status>> + Send + 'static>>;

    /// Proxy the console stream through the owning agent.
    async fn attach_console(
        &self,
        request: Request<Streaming<ConsoleData>>,
    ) -> Result<Response<Self::AttachConsoleStream>, Status> {
        let mut inbound = request.into_inner();
        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("console stream opened without a frame"))?;
        if first.instance_id.is_empty() {
            return Err(Status::invalid_argument(
                "first console frame must carry instanceID",
            ));
        }

        let instance = self.instances.get(&first.instance_id).await?;
        let mut client = self.pool.get(&instance.node_id).await?;

        let upstream = async_stream::stream! {
            yield first;
            while let Ok(Some(frame)) = inbound.message().await {
                yield frame;
            }
        };
        let response = match client.attach_console(Request::new(upstream)).await {
            Ok(response) => response,
            Err(status) => return Err(self.agent_failure(&instance.node_id, status).await),
        };
        let mut agent_stream = response.into_inner();

        let downstream = async_stream::try_stream! {
            while let Some(frame) = agent_stream
                .message()
                .await
                .map_err(|status| Status::new(status.code(), status.message().to_string()))?
            {
                yield frame;
            }
        };
        Ok(Response::new(Box::pin(downstream)))
    }
}
