use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::NetConf;
use crate::error::ErrorResult;
use crate::ipam::IpamAllocator;
use crate::link::{IpCommandDriver, InterfaceProvisioner};
use crate::netns::NetnsWorker;
use crate::plugin::VlanPlugin;
use crate::resolver::StaticResolver;
use crate::store::{EtcdStore, KvStore};
use crate::types::{CmdArgs, VersionResult};

/// Environment variable with an optional ADD deadline in seconds
pub const TIMEOUT_ENV: &str = "VLANPOOL_TIMEOUT_SECS";

/// Parse command arguments from environment
pub fn parse_args() -> Result<CmdArgs> {
    let container_id = env::var("CNI_CONTAINERID")
        .context("CNI_CONTAINERID not found in environment")?;

    // The runtime may pass an empty netns on DEL.
    let netns = env::var("CNI_NETNS").unwrap_or_default();

    let ifname = env::var("CNI_IFNAME")
        .context("CNI_IFNAME not found in environment")?;

    let path = env::var("CNI_PATH").unwrap_or_default();

    let args_str = env::var("CNI_ARGS").unwrap_or_default();
    let args = parse_cni_args(&args_str);

    let mut stdin_data = Vec::new();
    io::stdin().read_to_end(&mut stdin_data)
        .context("Failed to read from stdin")?;

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args,
        path,
        stdin_data,
    })
}

/// Parse CNI_ARGS string into key-value pairs
pub fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Plugin wired to etcd, iproute2 and a setns worker
fn build_plugin(conf: NetConf, args: CmdArgs, store: Arc<dyn KvStore>) -> Result<VlanPlugin> {
    let allocator = IpamAllocator::new(store, &conf.ipam);
    let worker = NetnsWorker::spawn().context("Failed to start namespace worker")?;
    let provisioner = InterfaceProvisioner::new(Arc::new(IpCommandDriver), worker);
    let resolver = StaticResolver::from_invocation(&conf, &args)?;

    Ok(VlanPlugin::new(conf, args, allocator, provisioner, Arc::new(resolver)))
}

/// Token cancelled on SIGTERM, SIGINT or when the ADD deadline passes.
fn cancellation() -> Result<CancellationToken> {
    let token = CancellationToken::new();

    let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let deadline = env::var(TIMEOUT_ENV)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);

    let trigger = token.clone();
    tokio::spawn(async move {
        let timeout = async {
            match deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = term.recv() => warn!("SIGTERM received, cancelling"),
            _ = int.recv() => warn!("SIGINT received, cancelling"),
            _ = timeout => warn!("Deadline reached, cancelling"),
        }
        trigger.cancel();
    });

    Ok(token)
}

/// Execute the add command
pub fn cmd_add(args: CmdArgs) -> Result<()> {
    let conf = NetConf::parse(&args.stdin_data)?;
    let store: Arc<dyn KvStore> = Arc::new(EtcdStore::new(&conf.ipam));
    let plugin = build_plugin(conf, args, store.clone())?;

    let runtime = Runtime::new().context("Failed to create Tokio runtime")?;
    let result = runtime.block_on(async {
        let cancel = cancellation()?;
        let result = plugin.add_network(&cancel).await;
        store.disconnect().await;
        result.context("ADD failed")
    })?;

    result.print()?;

    Ok(())
}

/// Execute the delete command
pub fn cmd_del(args: CmdArgs) -> Result<()> {
    let conf = NetConf::parse(&args.stdin_data)?;
    let store: Arc<dyn KvStore> = Arc::new(EtcdStore::new(&conf.ipam));
    let plugin = build_plugin(conf, args, store.clone())?;

    let runtime = Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(async {
        let result = plugin.del_network().await;
        store.disconnect().await;
        result.context("DEL failed")
    })?;

    Ok(())
}

/// Execute the check command
pub fn cmd_check(args: CmdArgs) -> Result<()> {
    let conf = NetConf::parse(&args.stdin_data)?;
    let store: Arc<dyn KvStore> = Arc::new(EtcdStore::new(&conf.ipam));
    let plugin = build_plugin(conf, args, store.clone())?;

    let runtime = Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(async {
        let result = plugin.check_network().await;
        store.disconnect().await;
        result.context("CHECK failed")
    })?;

    Ok(())
}

/// Main entry point for the CNI plugin.
///
/// Failures are reported on stdout as a CNI error document before being
/// returned.
pub fn run_cni() -> Result<()> {
    let mut version = "1.0.0".to_string();
    let outcome = dispatch(&mut version);

    if let Err(e) = &outcome {
        ErrorResult::from_anyhow(&version, e).print()?;
    }
    outcome
}

fn dispatch(version: &mut String) -> Result<()> {
    let cmd = env::var("CNI_COMMAND")
        .context("CNI_COMMAND not found in environment")?;

    if cmd == "VERSION" {
        println!("{}", serde_json::to_string(&VersionResult::current())?);
        return Ok(());
    }

    let args = parse_args()?;
    if let Some(requested) = requested_version(&args.stdin_data) {
        *version = requested;
    }
    info!("{} for container {} ({})", cmd, args.container_id, args.ifname);

    match cmd.as_str() {
        "ADD" => cmd_add(args),
        "DEL" => cmd_del(args),
        "CHECK" => cmd_check(args),
        _ => anyhow::bail!("Unknown CNI command: {}", cmd),
    }
}

/// cniVersion of the stdin configuration, for the error document
pub fn requested_version(stdin_data: &[u8]) -> Option<String> {
    serde_json::from_slice::<serde_json::Value>(stdin_data)
        .ok()?
        .get("cniVersion")?
        .as_str()
        .map(str::to_string)
}
