// src/main.rs
//! aodv-sim: run route discovery scenarios on the in-memory network.
//!
//! Builds a chain or grid of nodes, sends a data packet from the first node
//! to the last and prints what every node ended up with.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use aodv_rs::{Address, AodvConfig, Network};

#[derive(Parser)]
#[command(name = "aodv-sim")]
#[command(author, version, about = "AODV routing simulator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Nodes 1..N in a line
    Chain {
        /// Number of nodes
        #[arg(short, long, default_value = "5")]
        nodes: u16,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Nodes on a grid, linked to their orthogonal neighbors
    Grid {
        #[arg(long, default_value = "4")]
        width: u16,

        #[arg(long, default_value = "4")]
        height: u16,

        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Args)]
struct RunArgs {
    /// JSON file with protocol parameters (durations in milliseconds)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seed for reproducible jitter
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Simulated time to run after sending, in milliseconds
    #[arg(long, default_value = "5000")]
    duration: u64,

    /// Disable hello beacons
    #[arg(long)]
    no_hello: bool,

    /// Cut the link between the last node and its predecessor after delivery
    /// and send again
    #[arg(long)]
    cut: bool,

    /// Print per-node counters as JSON
    #[arg(long)]
    stats: bool,
}

fn load_config(path: Option<&Path>) -> Result<AodvConfig> {
    let Some(path) = path else {
        return Ok(AodvConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: AodvConfig = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    Ok(config)
}

fn run(mut net: Network, last: Address, args: &RunArgs) -> Result<()> {
    let first = Address(1);
    let duration = Duration::from_millis(args.duration);

    // Let hellos settle before sending.
    net.advance(Duration::from_millis(500));
    info!("sending {} -> {}", first, last);
    net.send_data(first, last, b"ping".to_vec())
        .context("source node missing")?;
    net.advance(duration);

    if args.cut {
        let before = Address(last.0 - 1);
        info!("cutting link {} <-> {}", before, last);
        net.disconnect(before, last);
        net.send_data(first, last, b"ping".to_vec())
            .context("source node missing")?;
        net.advance(duration);
    }

    println!("Simulated {}", net.now());
    for d in net.delivered() {
        println!(
            "delivered uid {} to {} at {} ({} bytes)",
            d.packet.uid,
            d.node,
            d.at,
            d.packet.payload.len()
        );
    }
    for d in net.dropped() {
        warn!("dropped uid {} at {}: {}", d.packet.uid, d.node, d.reason);
    }
    for (node, event) in net.drain_events() {
        println!("[{}] {:?}", node, event);
    }

    let addresses: Vec<Address> = net.addresses().collect();
    for addr in addresses {
        let Some(node) = net.node_mut(addr) else {
            continue;
        };
        println!("\nNode {} (seqno {})", addr, node.seqno());
        print!("{}", node.dump_routes());
        if args.stats {
            let json = serde_json::to_string_pretty(&node.stats())
                .context("Failed to encode stats")?;
            println!("{json}");
        }
    }
    Ok(())
}

/// Nodes are numbered from 1, so the largest usable count stops one short
/// of the broadcast address.
fn node_count(count: u32) -> Result<u16> {
    let max = u32::from(Address::BROADCAST.0 - 1);
    if !(2..=max).contains(&count) {
        bail!("network must have between 2 and {max} nodes, got {count}");
    }
    Ok(u16::try_from(count)?)
}

fn build_config(args: &RunArgs) -> Result<AodvConfig> {
    let mut config = load_config(args.config.as_deref())?.rng_seed(args.seed);
    if args.no_hello {
        config = config.enable_hello(false);
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Chain { nodes, run: args } => {
            let nodes = node_count(u32::from(nodes))?;
            let net = Network::chain(nodes, build_config(&args)?)?;
            run(net, Address(nodes), &args)
        }
        Commands::Grid {
            width,
            height,
            run: args,
        } => {
            let count = node_count(u32::from(width) * u32::from(height))?;
            let net = Network::grid(width, height, build_config(&args)?)?;
            run(net, Address(count), &args)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_count_excludes_broadcast_address() {
        assert_eq!(node_count(2).unwrap(), 2);
        assert_eq!(node_count(65534).unwrap(), 65534);
        assert!(node_count(65535).is_err());
        assert!(node_count(1).is_err());
        assert!(node_count(256 * 256).is_err());
    }
}
