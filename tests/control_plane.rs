//! End-to-end scenarios: an in-memory KV store, the real control-plane
//! handlers and real agents served over loopback gRPC. Only the runtime
//! backends are substituted (the agents drive in-memory drivers).

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::Request;

use hypervisor_agent::service::AgentHandler;
use hypervisor_control::cluster::ClusterHandler;
use hypervisor_control::compute::ComputeHandler;
use hypervisor_control::config::ControlConfig;
use hypervisor_control::monitor::Monitor;
use hypervisor_control::ControlPlane;
use hypervisor_driver::testing::FakeDriver;
use hypervisor_driver::DriverManager;
use hypervisor_proto::v1::{self as v1};
use hypervisor_proto::{AgentServiceServer, ClusterService, ComputeService};
use hypervisor_registry::{MemKv, NodeRegistry};
use hypervisor_types::resources::GIB;
use hypervisor_types::{InstanceType, Node, NodeRole, NodeStatus, Resources};

struct TestAgent {
    node_id: String,
    server: JoinHandle<()>,
}

impl TestAgent {
    /// Kill the agent's RPC server, leaving its node record behind.
    fn stop(&self) {
        self.server.abort();
    }
}

/// Register a node and serve a real AgentService for it on a loopback port.
async fn spawn_agent(kv: Arc<MemKv>, hostname: &str) -> TestAgent {
    let nodes = NodeRegistry::new(kv.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut builder = Node::builder();
    builder
        .set_hostname(hostname)
        .set_address("127.0.0.1", port)
        .set_role(NodeRole::Worker)
        .set_capacity(Resources::new(4, 8 * GIB, 100 * GIB, 0));
    builder.add_capability(InstanceType::Vm);
    builder.add_capability(InstanceType::Container);
    let node = nodes.register(builder.build()).await.unwrap();

    let mut manager = DriverManager::new();
    manager.register(Arc::new(FakeDriver::new(InstanceType::Vm)));
    manager.register(Arc::new(FakeDriver::new(InstanceType::Container)));
    let handler = AgentHandler::new(node.id.clone(), nodes, Arc::new(manager));

    let server = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(AgentServiceServer::new(handler))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    TestAgent {
        node_id: node.id,
        server,
    }
}

struct Cluster {
    kv: Arc<MemKv>,
    cluster: ClusterHandler,
    compute: ComputeHandler,
    nodes: NodeRegistry,
    agents: Vec<TestAgent>,
}

async fn cluster_with_agents(agent_count: usize) -> Cluster {
    let kv = Arc::new(MemKv::new());
    let mut agents = Vec::new();
    for i in 0..agent_count {
        agents.push(spawn_agent(kv.clone(), &format!("a{}", i + 1)).await);
    }
    let plane = ControlPlane::with_kv(ControlConfig::default(), kv.clone());
    let (cluster, compute) = plane.handlers();
    Cluster {
        nodes: NodeRegistry::new(kv.clone()),
        kv,
        cluster,
        compute,
        agents,
    }
}

fn container_request(name: &str) -> v1::CreateInstanceRequest {
    v1::CreateInstanceRequest {
        name: name.to_string(),
        r#type: v1::InstanceType::Container as i32,
        spec: Some(v1::InstanceSpec {
            image: "nginx:alpine".to_string(),
            cpu_cores: 1,
            memory_mb: 512,
            ..Default::default()
        }),
        labels: Default::default(),
        annotations: Default::default(),
        preferred_node_id: String::new(),
        region: String::new(),
        zone: String::new(),
    }
}

#[tokio::test]
async fn register_two_workers_and_report_cluster_info() {
    let cluster = cluster_with_agents(2).await;

    let nodes = cluster
        .cluster
        .list_nodes(Request::new(v1::ListNodesRequest::default()))
        .await
        .unwrap()
        .into_inner()
        .nodes;
    assert_eq!(nodes.len(), 2);

    let info = cluster
        .cluster
        .get_cluster_info(Request::new(v1::GetClusterInfoRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.total_nodes, 2);
    assert_eq!(info.ready_nodes, 2);
    let capacity = info.total_capacity.unwrap();
    assert_eq!(capacity.cpu_cores, 8);
    assert_eq!(capacity.memory_bytes, 16 * GIB);
}

#[tokio::test]
async fn scheduling_binds_and_accounts_resources() {
    let cluster = cluster_with_agents(2).await;

    let created = cluster
        .compute
        .create_instance(Request::new(container_request("web")))
        .await
        .unwrap()
        .into_inner()
        .instance
        .unwrap();
    assert!(!created.node_id.is_empty());
    assert_eq!(created.state, v1::InstanceState::Stopped as i32);

    let bound_node = cluster.nodes.get(&created.node_id).await.unwrap();
    assert_eq!(bound_node.allocated.cpu_cores, 1);

    let on_node = cluster
        .compute
        .list_instances(Request::new(v1::ListInstancesRequest {
            node_id: created.node_id.clone(),
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner()
        .instances;
    assert_eq!(on_node.len(), 1);
    assert_eq!(on_node[0].id, created.id);
}

#[tokio::test]
async fn capacity_exhaustion_is_reported() {
    let cluster = cluster_with_agents(2).await;

    let mut request = container_request("big");
    request.r#type = v1::InstanceType::Vm as i32;
    request.spec.as_mut().unwrap().cpu_cores = 3;

    // One 3-core instance fits on each of the two 4-core nodes.
    for name in ["big-1", "big-2"] {
        let mut req = request.clone();
        req.name = name.to_string();
        cluster
            .compute
            .create_instance(Request::new(req))
            .await
            .unwrap();
    }

    let mut req = request.clone();
    req.name = "big-3".to_string();
    let status = cluster
        .compute
        .create_instance(Request::new(req))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::ResourceExhausted);
}

#[tokio::test]
async fn full_lifecycle_round_trip() {
    let cluster = cluster_with_agents(1).await;

    let created = cluster
        .compute
        .create_instance(Request::new(container_request("web")))
        .await
        .unwrap()
        .into_inner()
        .instance
        .unwrap();
    assert_eq!(created.state, v1::InstanceState::Stopped as i32);
    assert_eq!(created.started_at_ms, 0);

    let started = cluster
        .compute
        .start_instance(Request::new(v1::StartInstanceRequest {
            instance_id: created.id.clone(),
        }))
        .await
        .unwrap()
        .into_inner()
        .instance
        .unwrap();
    assert_eq!(started.state, v1::InstanceState::Running as i32);
    assert!(started.started_at_ms > 0);

    // Idempotence: starting a running instance is a no-op success and the
    // startedAt stamp survives.
    let started_again = cluster
        .compute
        .start_instance(Request::new(v1::StartInstanceRequest {
            instance_id: created.id.clone(),
        }))
        .await
        .unwrap()
        .into_inner()
        .instance
        .unwrap();
    assert_eq!(started_again.started_at_ms, started.started_at_ms);

    let stopped = cluster
        .compute
        .stop_instance(Request::new(v1::StopInstanceRequest {
            instance_id: created.id.clone(),
            force: false,
            timeout_seconds: 5,
        }))
        .await
        .unwrap()
        .into_inner()
        .instance
        .unwrap();
    assert_eq!(stopped.state, v1::InstanceState::Stopped as i32);

    let stats = cluster
        .compute
        .get_instance_stats(Request::new(v1::GetInstanceStatsRequest {
            instance_id: created.id.clone(),
        }))
        .await
        .unwrap()
        .into_inner()
        .stats
        .unwrap();
    assert!(stats.memory_used_bytes > 0);

    cluster
        .compute
        .delete_instance(Request::new(v1::DeleteInstanceRequest {
            instance_id: created.id.clone(),
            force: false,
        }))
        .await
        .unwrap();

    let status = cluster
        .compute
        .get_instance(Request::new(v1::GetInstanceRequest {
            instance_id: created.id.clone(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);

    // Resources returned to the node.
    let node = cluster
        .nodes
        .get(&cluster.agents[0].node_id)
        .await
        .unwrap();
    assert_eq!(node.allocated.cpu_cores, 0);
}

#[tokio::test]
async fn duplicate_name_is_fine_but_duplicate_id_is_not() {
    // Instance IDs are generated per create; two creates with the same name
    // must both succeed and get distinct IDs.
    let cluster = cluster_with_agents(1).await;
    let first = cluster
        .compute
        .create_instance(Request::new(container_request("web")))
        .await
        .unwrap()
        .into_inner()
        .instance
        .unwrap();
    let second = cluster
        .compute
        .create_instance(Request::new(container_request("web")))
        .await
        .unwrap()
        .into_inner()
        .instance
        .unwrap();
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn dead_agent_is_detected_and_deletes_degrade_gracefully() {
    let cluster = cluster_with_agents(2).await;

    let created = cluster
        .compute
        .create_instance(Request::new(container_request("web")))
        .await
        .unwrap()
        .into_inner()
        .instance
        .unwrap();

    // Kill the owning agent and age its heartbeat past the timeout.
    let victim = cluster
        .agents
        .iter()
        .find(|a| a.node_id == created.node_id)
        .unwrap();
    victim.stop();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let monitor = Monitor::new(
        NodeRegistry::new(cluster.kv.clone()),
        Duration::from_millis(10),
        Duration::from_millis(50),
    );
    monitor.scan_once().await;

    let node = cluster.nodes.get(&created.node_id).await.unwrap();
    assert_eq!(node.status, NodeStatus::NotReady);

    // The registry remains authoritative for the dead node's instances.
    let listed = cluster
        .compute
        .list_instances(Request::new(v1::ListInstancesRequest {
            node_id: created.node_id.clone(),
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner()
        .instances;
    assert_eq!(listed.len(), 1);

    // Delete succeeds at the registry level even though the agent is gone.
    cluster
        .compute
        .delete_instance(Request::new(v1::DeleteInstanceRequest {
            instance_id: created.id.clone(),
            force: true,
        }))
        .await
        .unwrap();
    let status = cluster
        .compute
        .get_instance(Request::new(v1::GetInstanceRequest {
            instance_id: created.id,
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
}

#[tokio::test]
async fn sequential_placements_balance_across_identical_nodes() {
    let cluster = cluster_with_agents(2).await;

    let mut counts = std::collections::HashMap::new();
    for i in 0..8 {
        let mut req = container_request(&format!("w{}", i));
        req.spec.as_mut().unwrap().memory_mb = 256;
        let instance = cluster
            .compute
            .create_instance(Request::new(req))
            .await
            .unwrap()
            .into_inner()
            .instance
            .unwrap();
        *counts.entry(instance.node_id).or_insert(0u32) += 1;
    }

    assert_eq!(counts.len(), 2, "both nodes should receive instances");
    let spread: Vec<u32> = counts.values().copied().collect();
    assert!(spread[0].abs_diff(spread[1]) <= 1, "{:?}", spread);
}
