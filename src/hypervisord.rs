use std::path::PathBuf;

use structopt::StructOpt;
use tracing::info;

use hypervisor_control::config::ControlConfig;
use hypervisor_control::ControlPlane;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "hypervisord",
    about = "The hypervisor control service: scheduling, instance lifecycle and node liveness"
)]
struct Opts {
    #[structopt(
        short = "c",
        long = "config",
        env = "HYPERVISOR_CONFIG",
        help = "Path to the control-service config file (YAML); defaults apply when omitted"
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
        Some(path) => ControlConfig::load(path)?,
        None => ControlConfig::default(),
    };

    let plane = ControlPlane::new(config).await?;
    tokio::select! {
        result = plane.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received; shutting down");
            Ok(())
        }
    }
}
