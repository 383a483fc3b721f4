use std::path::PathBuf;

use structopt::StructOpt;
use tracing::info;

use hypervisor_agent::config::AgentConfig;
use hypervisor_agent::Agent;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "hvagent",
    about = "The per-node hypervisor agent: drives local runtimes and reports liveness"
)]
struct Opts {
    #[structopt(
        short = "c",
        long = "config",
        env = "HYPERVISOR_AGENT_CONFIG",
        help = "Path to the agent config file (YAML); defaults apply when omitted"
    )]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let opts = Opts::from_args();
    let config = match &opts.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };

    let agent = Agent::new(config).await?;
    tokio::select! {
        result = agent.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received; shutting down");
            Ok(())
        }
    }
}
