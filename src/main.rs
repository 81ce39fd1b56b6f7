use std::path::PathBuf;

use clap::Parser;
use env_logger::Env;
use log::info;

use conclave::cluster::Cluster;
use conclave::config::{Config, SpeedProfile};
use conclave::network::MulticastTransport;

#[derive(Parser)]
#[command(name = "conclave")]
#[command(about = "Bully leader election and periodic majority consensus over IP multicast")]
struct Cli {
    /// Unique nonnegative peer id within the multicast group
    #[arg(long)]
    id: u64,

    /// Expected cluster size; informational only, membership is discovered
    /// dynamically
    #[arg(long)]
    nodes: Option<usize>,

    /// Path to a JSON tunables file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Named timing profile (slow, normal, fast) overriding the defaults
    #[arg(long)]
    speed: Option<SpeedProfile>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let config = match (&cli.config, cli.speed) {
        (Some(path), _) => Config::load(path)?,
        (None, Some(profile)) => Config::for_profile(profile),
        (None, None) => Config::default(),
    };

    info!(
        "starting peer {} on {}:{}",
        cli.id, config.multicast_group, config.multicast_port
    );
    if let Some(nodes) = cli.nodes {
        info!("expecting around {} peers", nodes);
    }

    let transport = MulticastTransport::bind(config.multicast_group, config.multicast_port)?;
    let cluster = Cluster::new(cli.id, config);
    let mut fatal = cluster.start(transport).await;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            cluster.shutdown();
            Ok(())
        }
        Some(err) = fatal.recv() => {
            cluster.shutdown();
            Err(err.into())
        }
    }
}
