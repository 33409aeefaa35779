use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use saorsa_sync_discovery::{
    DiscoveryConfig, NodeReport, NodeRunner, TopologyPolicy,
    memory::{MemoryNetwork, MemorySyncService},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "sync-discovery-sim")]
#[command(about = "Run sync-service peer discovery for N in-process nodes")]
#[command(version)]
struct Cli {
    /// Number of nodes to start
    #[arg(long, default_value = "10")]
    nodes: usize,

    /// Topology strategy (overrides the config file)
    #[arg(long, value_enum)]
    topology: Option<TopologyKind>,

    /// Peers per node for the random strategies
    #[arg(long, default_value = "2")]
    count: usize,

    /// Restrict random-honest selection to publishers
    #[arg(long)]
    publishers_only: bool,

    /// Fixed topology specifiers, "<seq>-<type>-<index>"
    #[arg(long = "connection")]
    connections: Vec<String>,

    /// Probability that any dial fails
    #[arg(long, default_value = "0.0")]
    fail_rate: f64,

    /// Upper bound of the per-attempt dial jitter in milliseconds
    #[arg(long, default_value = "200")]
    max_jitter_ms: u64,

    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print node reports as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TopologyKind {
    Random,
    RandomHonest,
    SinglePublisher,
    Fixed,
}

impl Cli {
    fn discovery_config(&self) -> Result<DiscoveryConfig> {
        let mut config = match &self.config {
            Some(path) => DiscoveryConfig::from_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => DiscoveryConfig::default(),
        };

        config.expected_nodes = self.nodes;
        config.retry.max_jitter = Duration::from_millis(self.max_jitter_ms);
        if let Some(kind) = self.topology {
            config.topology = match kind {
                TopologyKind::Random => TopologyPolicy::Random { count: self.count },
                TopologyKind::RandomHonest => TopologyPolicy::RandomHonest {
                    count: self.count,
                    publishers_only: self.publishers_only,
                },
                TopologyKind::SinglePublisher => TopologyPolicy::SinglePublisher,
                TopologyKind::Fixed => TopologyPolicy::Fixed {
                    connections: self.connections.clone(),
                },
            };
        }
        config.validate().context("invalid discovery configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&cli.log_level)
        .init();

    if !(0.0..=1.0).contains(&cli.fail_rate) {
        bail!("--fail-rate must be between 0 and 1, got {}", cli.fail_rate);
    }
    let config = cli.discovery_config()?;

    let run_id = Uuid::new_v4();
    info!(
        "starting run {} with {} nodes, topology {:?}",
        run_id, config.expected_nodes, config.topology
    );

    let sync = Arc::new(MemorySyncService::new());
    let network = MemoryNetwork::new();
    network.set_fail_rate(cli.fail_rate);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling run");
                cancel.cancel();
            }
        });
    }

    let started = Instant::now();
    let mut nodes = JoinSet::new();
    for _ in 0..config.expected_nodes {
        let runner = NodeRunner::new(config.clone(), sync.clone(), Arc::new(network.transport()));
        let cancel = cancel.clone();
        nodes.spawn(async move { runner.run(&cancel).await });
    }

    let mut reports: Vec<NodeReport> = Vec::with_capacity(config.expected_nodes);
    let mut failures = 0usize;
    while let Some(joined) = nodes.join_next().await {
        match joined.context("node task panicked")? {
            Ok(report) => reports.push(report),
            Err(e) => {
                if !e.is_cancellation() {
                    // One failed node leaves the others stuck at the barrier.
                    cancel.cancel();
                }
                error!("node failed: {}", e);
                failures += 1;
            }
        }
    }
    reports.sort_by_key(|r| r.seq);

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        println!("Run {} finished in {:?}", run_id, started.elapsed());
        println!("{:>5}  {:<10}  {:<9}  {:>10}  {:>9}", "SEQ", "PEER", "ROLE", "DISCOVERED", "CONNECTED");
        for report in &reports {
            println!(
                "{:>5}  {:<10}  {:<9}  {:>10}  {:>9}",
                report.seq,
                report.peer_id.short(),
                report.role.to_string(),
                report.discovered,
                report.connected.len()
            );
        }
        println!(
            "{} of {} nodes reached state {:?}",
            reports.len(),
            config.expected_nodes,
            config.ready_state
        );
    }

    if failures > 0 {
        bail!("{} of {} nodes failed", failures, config.expected_nodes);
    }
    Ok(())
}
