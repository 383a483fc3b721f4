//! `hvctl` — the operator tool. Exit codes: 0 on success, 1 on failure,
//! 2 on usage errors.

use structopt::clap;
use structopt::StructOpt;
use tonic::transport::Channel;
use tonic::Request;

use hypervisor_proto::v1::{self as v1};
use hypervisor_proto::{ClusterServiceClient, ComputeServiceClient};
use hypervisor_types::{Instance, InstanceState, InstanceType, Node, NodeStatus};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(StructOpt, Debug)]
#[structopt(name = "hvctl", about = "Operator tool for the hypervisor control plane")]
struct Opts {
    #[structopt(
        short = "s",
        long = "server",
        env = "HYPERVISOR_SERVER",
        default_value = "http://127.0.0.1:9400",
        help = "Address of the control service"
    )]
    server: String,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
    /// Inspect and manage nodes
    Node(NodeCommand),
    /// Inspect and manage instances
    Instance(InstanceCommand),
    /// Cluster-wide information
    Cluster(ClusterCommand),
    /// Print the client version
    Version,
}

#[derive(StructOpt, Debug)]
enum NodeCommand {
    /// List nodes
    List {
        #[structopt(long = "role", help = "Filter by role (master|worker)")]
        role: Option<String>,
        #[structopt(long = "region")]
        region: Option<String>,
        #[structopt(long = "zone")]
        zone: Option<String>,
    },
    /// Show one node
    Get { id: String },
    /// Mark a node draining so nothing new is scheduled onto it
    Drain { id: String },
    /// Take a node out of scheduling for maintenance
    Cordon { id: String },
    /// Return a node to service
    Uncordon { id: String },
}

#[derive(StructOpt, Debug)]
enum InstanceCommand {
    /// List instances
    List {
        #[structopt(long = "node", help = "Filter by owning node ID")]
        node: Option<String>,
        #[structopt(long = "type", help = "Filter by type (vm|container|microvm)")]
        instance_type: Option<String>,
        #[structopt(long = "state", help = "Filter by state")]
        state: Option<String>,
    },
    /// Show one instance
    Get { id: String },
    /// Create and schedule an instance
    Create {
        #[structopt(long = "name")]
        name: String,
        #[structopt(long = "type", default_value = "vm", help = "vm, container or microvm")]
        instance_type: String,
        #[structopt(long = "image")]
        image: String,
        #[structopt(long = "cpus", default_value = "1")]
        cpus: u32,
        #[structopt(long = "memory", default_value = "512", help = "Memory in MB")]
        memory: u64,
        #[structopt(long = "node", help = "Preferred node ID")]
        node: Option<String>,
    },
    /// Start an instance
    Start { id: String },
    /// Stop an instance
    Stop {
        id: String,
        #[structopt(long = "force", help = "Terminate immediately instead of gracefully")]
        force: bool,
    },
    /// Restart an instance
    Restart {
        id: String,
        #[structopt(long = "force")]
        force: bool,
    },
    /// Delete an instance
    Delete {
        id: String,
        #[structopt(long = "force")]
        force: bool,
    },
}

#[derive(StructOpt, Debug)]
enum ClusterCommand {
    /// Aggregated cluster counters
    Info,
}

#[tokio::main]
async fn main() {
    let opts = match Opts::from_iter_safe(std::env::args()) {
        Ok(opts) => opts,
        Err(err) => match err.kind {
            clap::ErrorKind::HelpDisplayed | clap::ErrorKind::VersionDisplayed => {
                println!("{}", err.message);
                std::process::exit(0);
            }
            _ => {
                eprintln!("{}", err.message);
                std::process::exit(2);
            }
        },
    };

    if let Err(err) = run(opts).await {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}

async fn connect(server: &str) -> anyhow::Result<Channel> {
    Ok(Channel::from_shared(server.to_string())?
        .connect()
        .await?)
}

async fn run(opts: Opts) -> anyhow::Result<()> {
    match opts.command {
        Command::Version => {
            println!("hvctl {}", VERSION);
            Ok(())
        }
        Command::Node(cmd) => {
            let client = ClusterServiceClient::new(connect(&opts.server).await?);
            node_command(client, cmd).await
        }
        Command::Instance(cmd) => {
            let client = ComputeServiceClient::new(connect(&opts.server).await?);
            instance_command(client, cmd).await
        }
        Command::Cluster(ClusterCommand::Info) => {
            let mut client = ClusterServiceClient::new(connect(&opts.server).await?);
            let info = client
                .get_cluster_info(Request::new(v1::GetClusterInfoRequest {}))
                .await?
                .into_inner();
            println!("nodes:     {} total, {} ready", info.total_nodes, info.ready_nodes);
            println!("instances: {}", info.total_instances);
            if let Some(capacity) = info.total_capacity {
                println!(
                    "capacity:  {} cores, {} memory, {} disk",
                    capacity.cpu_cores,
                    format_bytes(capacity.memory_bytes),
                    format_bytes(capacity.disk_bytes)
                );
            }
            if let Some(allocated) = info.total_allocated {
                println!(
                    "allocated: {} cores, {} memory, {} disk",
                    allocated.cpu_cores,
                    format_bytes(allocated.memory_bytes),
                    format_bytes(allocated.disk_bytes)
                );
            }
            Ok(())
        }
    }
}

async fn node_command(
    mut client: ClusterServiceClient<Channel>,
    cmd: NodeCommand,
) -> anyhow::Result<()> {
    match cmd {
        NodeCommand::List { role, region, zone } => {
            let role = match role.as_deref() {
                Some(raw) => {
                    let parsed: hypervisor_types::NodeRole = raw.parse()?;
                    Some(v1::NodeRole::from(parsed) as i32)
                }
                None => None,
            };
            let nodes = client
                .list_nodes(Request::new(v1::ListNodesRequest {
                    role,
                    region: region.unwrap_or_default(),
                    zone: zone.unwrap_or_default(),
                    labels: Default::default(),
                }))
                .await?
                .into_inner()
                .nodes;
            println!(
                "{:<38} {:<16} {:<8} {:<12} {:<6} {:<8}",
                "ID", "HOSTNAME", "ROLE", "STATUS", "CPUS", "MEMORY"
            );
            for node in nodes {
                let node = Node::try_from(node)?;
                println!(
                    "{:<38} {:<16} {:<8} {:<12} {:<6} {:<8}",
                    node.id,
                    node.hostname,
                    node.role.to_string(),
                    node.status.to_string(),
                    node.capacity.cpu_cores,
                    format_bytes(node.capacity.memory_bytes)
                );
            }
            Ok(())
        }
        NodeCommand::Get { id } => {
            let node = client
                .get_node(Request::new(v1::GetNodeRequest { node_id: id }))
                .await?
                .into_inner()
                .node
                .ok_or_else(|| anyhow::anyhow!("empty response"))?;
            let node = Node::try_from(node)?;
            print_node(&node);
            Ok(())
        }
        NodeCommand::Drain { id } => set_node_status(client, id, NodeStatus::Draining).await,
        NodeCommand::Cordon { id } => set_node_status(client, id, NodeStatus::Maintenance).await,
        NodeCommand::Uncordon { id } => set_node_status(client, id, NodeStatus::Ready).await,
    }
}

async fn set_node_status(
    mut client: ClusterServiceClient<Channel>,
    id: String,
    status: NodeStatus,
) -> anyhow::Result<()> {
    client
        .update_node_status(Request::new(v1::UpdateNodeStatusRequest {
            node_id: id.clone(),
            status: v1::NodeStatus::from(status) as i32,
            conditions: vec![],
        }))
        .await?;
    println!("node {} is now {}", id, status);
    Ok(())
}

fn print_node(node: &Node) {
    println!("id:        {}", node.id);
    println!("hostname:  {}", node.hostname);
    println!("address:   {}", node.address());
    println!("role:      {}", node.role);
    println!("status:    {}", node.status);
    if !node.region.is_empty() || !node.zone.is_empty() {
        println!("placement: {}/{}", node.region, node.zone);
    }
    println!(
        "capacity:  {} cores, {} memory, {} disk",
        node.capacity.cpu_cores,
        format_bytes(node.capacity.memory_bytes),
        format_bytes(node.capacity.disk_bytes)
    );
    println!(
        "allocated: {} cores, {} memory, {} disk",
        node.allocated.cpu_cores,
        format_bytes(node.allocated.memory_bytes),
        format_bytes(node.allocated.disk_bytes)
    );
    let capabilities: Vec<String> = node.capabilities.iter().map(|c| c.to_string()).collect();
    println!("supports:  {}", capabilities.join(", "));
    println!("last seen: {}", node.last_seen.to_rfc3339());
}

async fn instance_command(
    mut client: ComputeServiceClient<Channel>,
    cmd: InstanceCommand,
) -> anyhow::Result<()> {
    match cmd {
        InstanceCommand::List {
            node,
            instance_type,
            state,
        } => {
            let r#type = match instance_type.as_deref() {
                Some(raw) => {
                    let parsed: InstanceType = raw.parse()?;
                    Some(v1::InstanceType::from(parsed) as i32)
                }
                None => None,
            };
            let state = match state.as_deref() {
                Some(raw) => {
                    let parsed: InstanceState = raw.parse()?;
                    Some(v1::InstanceState::from(parsed) as i32)
                }
                None => None,
            };
            let instances = client
                .list_instances(Request::new(v1::ListInstancesRequest {
                    r#type,
                    state,
                    node_id: node.unwrap_or_default(),
                    label_selector: Default::default(),
                    page_size: 0,
                    page_token: String::new(),
                }))
                .await?
                .into_inner()
                .instances;
            println!(
                "{:<38} {:<16} {:<10} {:<10} {:<38}",
                "ID", "NAME", "TYPE", "STATE", "NODE"
            );
            for instance in instances {
                let instance = Instance::try_from(instance)?;
                println!(
                    "{:<38} {:<16} {:<10} {:<10} {:<38}",
                    instance.id,
                    instance.name,
                    instance.instance_type.to_string(),
                    instance.state.to_string(),
                    instance.node_id
                );
            }
            Ok(())
        }
        InstanceCommand::Get { id } => {
            let instance = client
                .get_instance(Request::new(v1::GetInstanceRequest { instance_id: id }))
                .await?
                .into_inner()
                .instance
                .ok_or_else(|| anyhow::anyhow!("empty response"))?;
            print_instance(&Instance::try_from(instance)?);
            Ok(())
        }
        InstanceCommand::Create {
            name,
            instance_type,
            image,
            cpus,
            memory,
            node,
        } => {
            let parsed: InstanceType = instance_type.parse()?;
            let response = client
                .create_instance(Request::new(v1::CreateInstanceRequest {
                    name,
                    r#type: v1::InstanceType::from(parsed) as i32,
                    spec: Some(v1::InstanceSpec {
                        image,
                        cpu_cores: cpus,
                        memory_mb: memory,
                        ..Default::default()
                    }),
                    labels: Default::default(),
                    annotations: Default::default(),
                    preferred_node_id: node.unwrap_or_default(),
                    region: String::new(),
                    zone: String::new(),
                }))
                .await?
                .into_inner()
                .instance
                .ok_or_else(|| anyhow::anyhow!("empty response"))?;
            let instance = Instance::try_from(response)?;
            println!(
                "instance {} created on node {} ({})",
                instance.id, instance.node_id, instance.state
            );
            Ok(())
        }
        InstanceCommand::Start { id } => {
            let response = client
                .start_instance(Request::new(v1::StartInstanceRequest {
                    instance_id: id.clone(),
                }))
                .await?
                .into_inner();
            report_state(&id, response.instance)?;
            Ok(())
        }
        InstanceCommand::Stop { id, force } => {
            let response = client
                .stop_instance(Request::new(v1::StopInstanceRequest {
                    instance_id: id.clone(),
                    force,
                    timeout_seconds: 0,
                }))
                .await?
                .into_inner();
            report_state(&id, response.instance)?;
            Ok(())
        }
        InstanceCommand::Restart { id, force } => {
            let response = client
                .restart_instance(Request::new(v1::RestartInstanceRequest {
                    instance_id: id.clone(),
                    force,
                }))
                .await?
                .into_inner();
            report_state(&id, response.instance)?;
            Ok(())
        }
        InstanceCommand::Delete { id, force } => {
            client
                .delete_instance(Request::new(v1::DeleteInstanceRequest {
                    instance_id: id.clone(),
                    force,
                }))
                .await?;
            println!("instance {} deleted", id);
            Ok(())
        }
    }
}

fn report_state(id: &str, instance: Option<v1::Instance>) -> anyhow::Result<()> {
    let instance =
        Instance::try_from(instance.ok_or_else(|| anyhow::anyhow!("empty response"))?)?;
    println!("instance {} is {}", id, instance.state);
    Ok(())
}

fn print_instance(instance: &Instance) {
    println!("id:       {}", instance.id);
    println!("name:     {}", instance.name);
    println!("type:     {}", instance.instance_type);
    print!("state:    {}", instance.state);
    if instance.state_reason.is_empty() {
        println!();
    } else {
        println!(" ({})", instance.state_reason);
    }
    println!("node:     {}", instance.node_id);
    if let Some(ip) = &instance.ip_address {
        println!("address:  {}", ip);
    }
    println!("image:    {}", instance.spec.image);
    println!(
        "sizing:   {} cores, {} MB memory",
        instance.spec.cpu_cores, instance.spec.memory_mb
    );
    println!("created:  {}", instance.created_at.to_rfc3339());
    if let Some(started) = instance.started_at {
        println!("started:  {}", started.to_rfc3339());
    }
}

fn format_bytes(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    if bytes == 0 {
        "0".to_string()
    } else if bytes % GIB == 0 {
        format!("{}Gi", bytes / GIB)
    } else if bytes >= MIB {
        format!("{}Mi", bytes / MIB)
    } else {
        format!("{}B", bytes)
    }
}
