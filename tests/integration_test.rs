use std::collections::HashMap;
use std::process::Command;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vlanpool::config::NetConf;
use vlanpool::ipam::IpamAllocator;
use vlanpool::link::{IpCommandDriver, InterfaceProvisioner};
use vlanpool::netns::NetnsWorker;
use vlanpool::plugin::VlanPlugin;
use vlanpool::resolver::StaticResolver;
use vlanpool::store::{KvStore, MemoryStore};
use vlanpool::types::CmdArgs;

const NETNS: &str = "vlanpool_test_netns";
const MASTER: &str = "vpdummy0";

fn ip(args: &[&str]) -> Result<(), Box<dyn std::error::Error>> {
    let output = Command::new("ip").args(args).output()?;
    if !output.status.success() {
        return Err(format!(
            "ip {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }
    Ok(())
}

fn setup() -> Result<(), Box<dyn std::error::Error>> {
    teardown();
    ip(&["netns", "add", NETNS])?;
    ip(&["link", "add", MASTER, "type", "dummy"])?;
    ip(&["link", "set", MASTER, "up"])?;
    Ok(())
}

fn teardown() {
    let _ = Command::new("ip").args(["netns", "delete", NETNS]).output();
    let _ = Command::new("ip").args(["link", "delete", MASTER]).output();
}

fn plugin(store: &MemoryStore, conf: &NetConf) -> Result<VlanPlugin, Box<dyn std::error::Error>> {
    let args = CmdArgs {
        container_id: "e2e-container".to_string(),
        netns: format!("/var/run/netns/{}", NETNS),
        ifname: "net1".to_string(),
        args: HashMap::new(),
        path: "/opt/cni/bin".to_string(),
        stdin_data: serde_json::to_vec(conf)?,
    };

    let kv: Arc<dyn KvStore> = Arc::new(store.clone());
    let allocator = IpamAllocator::new(kv, &conf.ipam);
    let provisioner = InterfaceProvisioner::new(Arc::new(IpCommandDriver), NetnsWorker::spawn()?);
    let resolver = StaticResolver::new(conf.segments.clone());

    Ok(VlanPlugin::new(conf.clone(), args, allocator, provisioner, Arc::new(resolver)))
}

// Needs root and iproute2; run with `--ignored`.
#[tokio::test]
#[ignore]
async fn test_add_check_del_in_real_netns() -> Result<(), Box<dyn std::error::Error>> {
    if !nix::unistd::geteuid().is_root() {
        println!("Skipping test_add_check_del_in_real_netns: not running as root");
        return Ok(());
    }
    setup()?;

    let mut conf = NetConf::new_default("e2e", Some(MASTER), vec!["172.17.11.0".to_string()]);
    conf.ipam.retry_backoff_ms = 1;
    let store = MemoryStore::new();

    let outcome = async {
        let plugin = plugin(&store, &conf)?;
        plugin.allocator().register_segment("172.17.11.0", 100).await?;

        let result = plugin.add_network(&CancellationToken::new()).await?;
        println!("CNI result: {}", serde_json::to_string(&result)?);
        assert_eq!(
            result.first_address(),
            Some("172.17.11.11"),
            "first address of the segment"
        );

        plugin.check_network().await?;
        plugin.del_network().await?;
        assert!(plugin.check_network().await.is_err());
        plugin.del_network().await?;
        Ok::<_, Box<dyn std::error::Error>>(())
    }
    .await;

    teardown();
    outcome
}
