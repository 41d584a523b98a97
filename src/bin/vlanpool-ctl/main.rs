use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vlanpool::config::{IpamConf, NetConf};
use vlanpool::ipam::IpamAllocator;
use vlanpool::resolver::parse_segment_list;
use vlanpool::store::{EtcdStore, KvStore};

/// Manage the address segments of the vlanpool CNI plugin
#[derive(Parser)]
#[command(name = "vlanpool-ctl", author, version, about)]
struct Cli {
    /// etcd endpoints
    #[arg(long, value_delimiter = ',', default_value = "http://127.0.0.1:2379")]
    endpoints: Vec<String>,

    /// Root of the address tree in etcd
    #[arg(long, default_value = "/ipam")]
    root: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage registered segments
    Segment {
        #[command(subcommand)]
        action: SegmentAction,
    },

    /// Release the address held by a container interface
    Release {
        /// Container ID
        container_id: String,

        /// Interface name inside the container
        ifname: String,
    },

    /// Generate a network configuration
    Generate {
        /// Network name
        #[arg(long, default_value = "vlanpool")]
        name: String,

        /// Master interface, defaults to the default-route interface
        #[arg(long)]
        master: Option<String>,

        /// Macvlan mode
        #[arg(long, default_value = "bridge")]
        mode: String,

        /// Interface MTU, 0 inherits the master's
        #[arg(long, default_value_t = 0)]
        mtu: u32,

        /// Comma separated candidate segments
        #[arg(long)]
        segments: Option<String>,

        /// Output file path
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Status of host VLAN devices
    Status {
        /// VLAN ID to check
        #[arg(long)]
        vlan: Option<u16>,
    },
}

#[derive(Subcommand)]
enum SegmentAction {
    /// Register a segment and its VLAN tag
    Add {
        /// Segment network address, e.g. 172.17.11.0
        segment: String,

        /// VLAN ID (1-4094)
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..=4094))]
        vlan: u16,
    },

    /// List registered segments with their usage
    List,

    /// Remove a segment that has no addresses in use
    Remove {
        segment: String,
    },
}

#[derive(Debug)]
struct VlanStatus {
    id: u16,
    name: String,
    state: String,
    parent: String,
}

fn get_vlan_status(vlan: Option<u16>) -> Result<Vec<VlanStatus>> {
    let output = Command::new("ip")
        .args(["-j", "-d", "link", "show", "type", "vlan"])
        .output()
        .context("Failed to execute ip link show command")?;

    if !output.status.success() {
        anyhow::bail!(
            "Failed to get interface status: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let interfaces: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout)
        .context("Failed to parse ip link output")?;

    let status = interfaces
        .iter()
        .filter_map(|iface| {
            let id = iface
                .pointer("/linkinfo/info_data/id")
                .and_then(|v| v.as_u64())? as u16;
            Some(VlanStatus {
                id,
                name: iface.get("ifname")?.as_str()?.to_string(),
                state: iface
                    .get("operstate")
                    .and_then(|v| v.as_str())
                    .unwrap_or("UNKNOWN")
                    .to_string(),
                parent: iface
                    .get("link")
                    .and_then(|v| v.as_str())
                    .unwrap_or("-")
                    .to_string(),
            })
        })
        .filter(|s| vlan.map_or(true, |id| s.id == id))
        .collect();

    Ok(status)
}

fn allocator(cli: &Cli) -> (Arc<dyn KvStore>, IpamAllocator) {
    let conf = IpamConf {
        endpoints: cli.endpoints.clone(),
        root: cli.root.clone(),
        ..IpamConf::default()
    };
    let store: Arc<dyn KvStore> = Arc::new(EtcdStore::new(&conf));
    (store.clone(), IpamAllocator::new(store, &conf))
}

async fn run_segment(cli: &Cli, action: &SegmentAction) -> Result<()> {
    let (store, allocator) = allocator(cli);
    store.connect().await.context("Failed to connect to etcd")?;

    let outcome = match action {
        SegmentAction::Add { segment, vlan } => allocator
            .register_segment(segment, *vlan)
            .await
            .map(|_| println!("Segment {} registered on VLAN {}", segment, vlan)),
        SegmentAction::List => allocator.list_segments().await.map(|segments| {
            if segments.is_empty() {
                println!("No segments registered");
                return;
            }
            println!("Segments:");
            for usage in segments {
                let vlan = usage.vlan.map_or("-".to_string(), |v| v.to_string());
                println!(
                    "  {} (vlan {}): {}/{} used",
                    usage.segment, vlan, usage.used, usage.capacity
                );
            }
        }),
        SegmentAction::Remove { segment } => allocator
            .remove_segment(segment)
            .await
            .map(|_| println!("Segment {} removed", segment)),
    };

    store.disconnect().await;
    Ok(outcome?)
}

async fn run_release(cli: &Cli, container_id: &str, ifname: &str) -> Result<()> {
    let (store, allocator) = allocator(cli);
    let released = allocator.release(container_id, ifname).await;
    store.disconnect().await;

    if released? {
        println!("Released address of {}/{}", container_id, ifname);
    } else {
        println!("No address recorded for {}/{}", container_id, ifname);
    }
    Ok(())
}

fn generate_network_config(
    cli: &Cli,
    name: &str,
    master: Option<&str>,
    mode: &str,
    mtu: u32,
    segments: Option<&str>,
) -> Result<NetConf> {
    let segments = match segments {
        Some(list) => parse_segment_list(list)?,
        None => Vec::new(),
    };

    let mut conf = NetConf::new_default(name, master, segments);
    conf.mode = mode.to_string();
    conf.mtu = mtu;
    conf.ipam.endpoints = cli.endpoints.clone();
    conf.ipam.root = cli.root.clone();

    // Round-trip through the plugin's own validation.
    let json = serde_json::to_vec(&conf)?;
    NetConf::parse(&json).context("Generated configuration is invalid")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(log_level))
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set default subscriber")?;

    match &cli.command {
        Commands::Segment { action } => run_segment(&cli, action).await?,

        Commands::Release { container_id, ifname } => {
            run_release(&cli, container_id, ifname).await?
        }

        Commands::Generate { name, master, mode, mtu, segments, output } => {
            let config = generate_network_config(
                &cli,
                name,
                master.as_deref(),
                mode,
                *mtu,
                segments.as_deref(),
            )?;

            match output {
                Some(path) => {
                    config.save(path)?;
                    println!("Network configuration written to {}", path.display());
                }
                None => println!("{}", serde_json::to_string_pretty(&config)?),
            }
        }

        Commands::Status { vlan } => {
            let status = get_vlan_status(*vlan)?;

            if status.is_empty() {
                match vlan {
                    Some(id) => println!("No VLAN interface with ID {} found", id),
                    None => println!("No VLAN interfaces found"),
                }
            } else {
                println!("VLAN Interface Status:");
                for vlan in status {
                    println!("  VLAN {} ({}):", vlan.id, vlan.name);
                    println!("    State: {}", vlan.state);
                    println!("    Parent: {}", vlan.parent);
                }
            }
        }
    }

    Ok(())
}
