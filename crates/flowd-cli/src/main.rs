//! flowd
//!
//! Flow lifecycle tracking daemon: watches outbound connections and reports
//! their START / ONGOING / END transitions as firefly datagrams.

use clap::{Parser, Subcommand};
use flowd_cli::config::{Config, DEFAULT_CONFIG_PATH};
use flowd_core::{Classifier, ConnectionPoller, FamilyIdentity, ProcNetPoller};
use flowd_discovery::AddressResolver;
use flowd_node::{Node, NodeConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// flowd - flow lifecycle tracking and firefly signaling
#[derive(Parser)]
#[command(name = "flowd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground until Ctrl-C or SIGTERM
    Run,

    /// Load and validate the configuration, then print a summary
    CheckConfig {
        /// Print the effective configuration as TOML
        #[arg(long)]
        dump: bool,
    },

    /// Resolve the local and public source identity once
    Resolve,

    /// Poll the connection tables once and print matching flows
    Snapshot,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load_or_default(&cli.config)?;

    // RUST_LOG wins over the configured level; --verbose wins over both
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let node_config = config.to_node_config()?;

    match cli.command {
        Commands::Run => run_daemon(node_config).await?,
        Commands::CheckConfig { dump } => check_config(&cli.config, &config, &node_config, dump)?,
        Commands::Resolve => resolve(node_config).await,
        Commands::Snapshot => snapshot(node_config).await?,
    }

    Ok(())
}

/// Run the node until a shutdown signal arrives
async fn run_daemon(config: NodeConfig) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting flowd");

    let node = Node::new(config)?;
    let stats = node
        .run_until(async {
            if let Err(e) = shutdown_signal().await {
                tracing::error!(error = %e, "failed to wait for shutdown signal");
            }
        })
        .await?;

    tracing::info!(
        cycles = stats.cycles,
        started = stats.started,
        continued = stats.continued,
        ended = stats.ended,
        gaps_absorbed = stats.gaps_absorbed,
        "flowd stopped"
    );
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

/// Print a summary of the validated configuration
fn check_config(
    path: &std::path::Path,
    config: &Config,
    node: &NodeConfig,
    dump: bool,
) -> anyhow::Result<()> {
    node.validate_backends(&flowd_transport::BackendRegistry::with_builtins())?;

    println!("flowd configuration OK");
    println!("Source: {}", path.display());
    println!();

    println!("Polling:");
    println!("  Interval: {}", humantime::format_duration(node.poll.interval));
    println!("  Timeout: {}", humantime::format_duration(node.poll.timeout));
    println!("  Protocols: {}", config.poll.protocols.join(", "));
    println!("  States: {}", config.poll.states.join(", "));
    println!();

    println!("Tracking:");
    println!("  Cadence: {:?}", node.tracker.cadence);
    println!("  Grace cycles: {}", node.tracker.grace_cycles);
    println!("  Rules: {}", node.classifier.rules.len());
    println!(
        "  Unclassified flows: {}",
        match node.classifier.default_activity {
            Some(label) => format!("tracked as {label}"),
            None => "ignored".to_string(),
        }
    );
    println!();

    println!("Delivery:");
    println!("  Backends: {}", node.transport.backends.join(", "));
    match &node.transport.firefly.collector {
        Some(collector) => println!("  Collector: {collector}"),
        None => println!(
            "  Collector: flow remote address, port {}",
            node.transport.firefly.port
        ),
    }
    println!();

    println!("Discovery:");
    println!("  IPv4 target: {}", display_opt(node.resolver.v4_target));
    println!("  IPv6 target: {}", display_opt(node.resolver.v6_target));
    if node.resolver.stun_enabled {
        println!("  STUN: {}", node.resolver.stun_servers.join(", "));
    } else {
        println!("  STUN: disabled");
    }

    if dump {
        println!();
        println!("{}", config.to_toml()?);
    }
    Ok(())
}

/// Resolve the source identity once and print it
async fn resolve(config: NodeConfig) {
    let resolver = AddressResolver::new(config.resolver);
    let identity = resolver.refresh().await;

    println!("IPv4:");
    print_family(&identity.v4);
    println!("IPv6:");
    print_family(&identity.v6);
}

fn print_family(family: &FamilyIdentity) {
    println!("  Local: {}", display_opt(family.local));
    println!("  Public: {}", display_opt(family.public));
}

/// Poll once and print every matching connection with its label
async fn snapshot(config: NodeConfig) -> anyhow::Result<()> {
    let poller = ProcNetPoller::with_root(&config.poll.proc_root, config.poll.filter);
    let classifier = Classifier::new(config.classifier);

    let snapshot = tokio::time::timeout(config.poll.timeout, poller.poll())
        .await
        .map_err(|_| anyhow::anyhow!("connection scan timed out"))??;

    for entry in snapshot.iter() {
        let label = classifier
            .classify(&entry.key)
            .map_or_else(|| "-".to_string(), |label| label.to_string());
        println!("{:<12} {:<7} {}", entry.state.name(), label, entry.key);
    }
    println!("{} connection(s)", snapshot.len());
    Ok(())
}

fn display_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "none".to_string(), |v| v.to_string())
}
