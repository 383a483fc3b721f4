//! The agent's gRPC surface. Called only by the control plane; every
//! lifecycle RPC routes through the driver manager, re-reads the resulting
//! state from the driver and reports it back. The agent never writes
//! instance records — the control service is authoritative for the
//! registry.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, instrument};

use hypervisor_driver::{AttachOptions, Driver, DriverManager};
use hypervisor_proto::convert;
use hypervisor_proto::v1::{
    self as v1, AgentCreateInstanceRequest, ConsoleData, DeleteInstanceRequest,
    GetInstanceStatsRequest, GetInstanceStatsResponse, GetNodeResourcesRequest,
    GetNodeResourcesResponse, InstanceStatusResponse, ListLocalInstancesRequest,
    ListLocalInstancesResponse, RestartInstanceRequest, StartInstanceRequest,
    StopInstanceRequest,
};
use hypervisor_proto::AgentService;
use hypervisor_registry::NodeRegistry;
use hypervisor_types::{Instance, InstanceSpec};

pub struct AgentHandler {
    node_id: String,
    nodes: NodeRegistry,
    manager: Arc<DriverManager>,
}

impl AgentHandler {
    pub fn new(node_id: String, nodes: NodeRegistry, manager: Arc<DriverManager>) -> Self {
        AgentHandler {
            node_id,
            nodes,
            manager,
        }
    }
}

fn status_response(instance: &Instance) -> InstanceStatusResponse {
    InstanceStatusResponse {
        state: v1::InstanceState::from(instance.state) as i32,
        state_reason: instance.state_reason.clone(),
        ip_address: instance.ip_address.clone().unwrap_or_default(),
        started_at_ms: convert::opt_ts_ms(instance.started_at),
    }
}

#[tonic::async_trait]
impl AgentService for AgentHandler {
    #[instrument(skip(self, request), fields(instance_id = %request.get_ref().instance_id))]
    async fn create_instance(
        &self,
        request: Request<AgentCreateInstanceRequest>,
    ) -> Result<Response<InstanceStatusResponse>, Status> {
        let req = request.into_inner();
        if req.instance_id.is_empty() {
            return Err(Status::invalid_argument("instanceID is required"));
        }
        let instance_type = convert::instance_type_from_i32(req.r#type)?;
        let spec: InstanceSpec = req
            .spec
            .ok_or_else(|| Status::invalid_argument("spec is required"))?
            .into();

        let driver = self.manager.get(instance_type)?;
        let created = driver.create(&req.instance_id, &req.name, &spec).await?;
        info!(state = %created.state, "instance created");
        Ok(Response::new(status_response(&created)))
    }

    #[instrument(skip(self, request), fields(instance_id = %request.get_ref().instance_id))]
    async fn start_instance(
        &self,
        request: Request<StartInstanceRequest>,
    ) -> Result<Response<InstanceStatusResponse>, Status> {
        let req = request.into_inner();
        let driver = self.manager.driver_for(&req.instance_id).await?;
        driver.start(&req.instance_id).await?;
        let instance = driver.get(&req.instance_id).await?;
        Ok(Response::new(status_response(&instance)))
    }

    #[instrument(skip(self, request), fields(instance_id = %request.get_ref().instance_id))]
    async fn stop_instance(
        &self,
        request: Request<StopInstanceRequest>,
    ) -> Result<Response<InstanceStatusResponse>, Status> {
        let req = request.into_inner();
        let driver = self.manager.driver_for(&req.instance_id).await?;
        let stop = driver.stop(&req.instance_id, req.force);
        if req.timeout_seconds > 0 {
            tokio::time::timeout(Duration::from_secs(req.timeout_seconds as u64), stop)
                .await
                .map_err(|_| Status::deadline_exceeded("stop did not finish in time"))??;
        } else {
            stop.await?;
        }
        let instance = driver.get(&req.instance_id).await?;
        Ok(Response::new(status_response(&instance)))
    }

    #[instrument(skip(self, request), fields(instance_id = %request.get_ref().instance_id))]
    async fn restart_instance(
        &self,
        request: Request<RestartInstanceRequest>,
    ) -> Result<Response<InstanceStatusResponse>, Status> {
        let req = request.into_inner();
        let driver = self.manager.driver_for(&req.instance_id).await?;
        driver.restart(&req.instance_id, req.force).await?;
        let instance = driver.get(&req.instance_id).await?;
        Ok(Response::new(status_response(&instance)))
    }

    #[instrument(skip(self, request), fields(instance_id = %request.get_ref().instance_id))]
    async fn delete_instance(
        &self,
        request: Request<DeleteInstanceRequest>,
    ) -> Result<Response<InstanceStatusResponse>, Status> {
        let req = request.into_inner();
        match self.manager.driver_for(&req.instance_id).await {
            Ok(driver) => {
                driver.delete(&req.instance_id).await?;
                info!("instance deleted");
            }
            Err(err) if err.is_not_found() => {
                // Replayed delete; nothing left to destroy.
                debug!("delete for an instance no driver knows");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(Response::new(InstanceStatusResponse {
            state: v1::InstanceState::Unknown as i32,
            state_reason: "deleted".to_string(),
            ip_address: String::new(),
            started_at_ms: 0,
        }))
    }

    #[instrument(skip(self, request), fields(instance_id = %request.get_ref().instance_id))]
    async fn get_instance_stats(
        &self,
        request: Request<GetInstanceStatsRequest>,
    ) -> Result<Response<GetInstanceStatsResponse>, Status> {
        let req = request.into_inner();
        let driver = self.manager.driver_for(&req.instance_id).await?;
        let stats = driver.stats(&req.instance_id).await?;
        Ok(Response::new(GetInstanceStatsResponse {
            stats: Some(stats.into()),
        }))
    }

    #[instrument(skip(self, _request))]
    async fn get_node_resources(
        &self,
        _request: Request<GetNodeResourcesRequest>,
    ) -> Result<Response<GetNodeResourcesResponse>, Status> {
        let node = self.nodes.get(&self.node_id).await?;
        Ok(Response::new(GetNodeResourcesResponse {
            capacity: Some(node.capacity.into()),
            allocatable: Some(node.allocatable.into()),
            allocated: Some(node.allocated.into()),
        }))
    }

    #[instrument(skip(self, _request))]
    async fn list_local_instances(
        &self,
        _request: Request<ListLocalInstancesRequest>,
    ) -> Result<Response<ListLocalInstancesResponse>, Status> {
        let mut instances = self.manager.list_all().await?;
        for instance in &mut instances {
            instance.node_id = self.node_id.clone();
        }
        Ok(Response::new(ListLocalInstancesResponse {
            instances: instances.into_iter().map(Into::into).collect(),
        }))
    }

    type AttachConsoleStream =
        Pin<Box<dyn Stream<Item = Result<ConsoleData, Status>> + Send + 'static>>;

    /// Proxy a console: the first client frame names the instance, then
    /// bytes flow both ways until either side hangs up.
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

        let driver = self.manager.driver_for(&first.instance_id).await?;
        let console = driver
            .attach(&first.instance_id, AttachOptions::default())
            .await?;
        let (mut console_read, mut console_write) = tokio::io::split(console);
        info!(instance_id = %first.instance_id, "console attached");

        // Client -> console.
        tokio::spawn(async move {
            if !first.data.is_empty() && console_write.write_all(&first.data).await.is_err() {
                return;
            }
            while let Ok(Some(frame)) = inbound.message().await {
                if console_write.write_all(&frame.data).await.is_err() {
                    break;
                }
            }
        });

        // Console -> client.
        let outbound = async_stream::try_stream! {
            let mut buf = vec![0u8; 4096];
            loop {
                let n = console_read
                    .read(&mut buf)
                    .await
                    .map_err(|e| Status::unavailable(format!("console read: {}", e)))?;
                if n == 0 {
                    break;
                }
                yield ConsoleData {
                    instance_id: String::new(),
                    data: buf[..n].to_vec(),
                };
            }
        };
        Ok(Response::new(Box::pin(outbound)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hypervisor_driver::testing::FakeDriver;
    use hypervisor_registry::{MemKv, NodeRegistry};
    use hypervisor_types::{InstanceType, Node, NodeRole, Resources};

    async fn handler() -> AgentHandler {
        let kv = Arc::new(MemKv::new());
        let nodes = NodeRegistry::new(kv);
        let mut builder = Node::builder();
        builder
            .set_hostname("w1")
            .set_address("127.0.0.1", 9411)
            .set_role(NodeRole::Worker)
            .set_capacity(Resources::new(4, 8 << 30, 0, 0));
        builder.add_capability(InstanceType::Container);
        let node = nodes.register(builder.build()).await.unwrap();

        let mut manager = DriverManager::new();
        manager.register(Arc::new(FakeDriver::new(InstanceType::Container)));
        AgentHandler::new(node.id, nodes, Arc::new(manager))
    }

    fn create_request(id: &str) -> AgentCreateInstanceRequest {
        AgentCreateInstanceRequest {
            instance_id: id.to_string(),
            name: "web".to_string(),
            r#type: v1::InstanceType::Container as i32,
            spec: Some(v1::InstanceSpec {
                image: "nginx:alpine".to_string(),
                cpu_cores: 1,
                memory_mb: 512,
                ..Default::default()
            }),
            labels: Default::default(),
        }
    }

    #[tokio::test]
    async fn create_then_start_reports_driver_state() {
        let handler = handler().await;
        let created = handler
            .create_instance(Request::new(create_request("i-1")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(created.state, v1::InstanceState::Stopped as i32);

        let started = handler
            .start_instance(Request::new(StartInstanceRequest {
                instance_id: "i-1".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(started.state, v1::InstanceState::Running as i32);
    }

    #[tokio::test]
    async fn create_without_type_is_invalid() {
        let handler = handler().await;
        let mut req = create_request("i-1");
        req.r#type = v1::InstanceType::Unspecified as i32;
        let status = handler
            .create_instance(Request::new(req))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn create_for_unregistered_type_is_not_found() {
        let handler = handler().await;
        let mut req = create_request("i-1");
        req.r#type = v1::InstanceType::Microvm as i32;
        let status = handler
            .create_instance(Request::new(req))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn lifecycle_on_unknown_instance_is_not_found_except_delete() {
        let handler = handler().await;
        let status = handler
            .start_instance(Request::new(StartInstanceRequest {
                instance_id: "i-missing".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);

        // Delete replays are success.
        handler
            .delete_instance(Request::new(DeleteInstanceRequest {
                instance_id: "i-missing".to_string(),
                force: true,
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn node_resources_come_from_the_registry_record() {
        let handler = handler().await;
        let resources = handler
            .get_node_resources(Request::new(GetNodeResourcesRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resources.capacity.unwrap().cpu_cores, 4);
        assert_eq!(resources.allocated.unwrap().cpu_cores, 0);
    }

    #[tokio::test]
    async fn local_instances_carry_the_node_binding() {
        let handler = handler().await;
        handler
            .create_instance(Request::new(create_request("i-1")))
            .await
            .unwrap();
        let listed = handler
            .list_local_instances(Request::new(ListLocalInstancesRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(listed.instances.len(), 1);
        assert!(!listed.instances[0].node_id.is_empty());
    }
}
