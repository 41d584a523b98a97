#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;

use vlanpool::config::NetConf;
use vlanpool::error::{CniError, Result};
use vlanpool::ipam::IpamAllocator;
use vlanpool::link::{InterfaceProvisioner, LinkAttrs, LinkDriver, MacvlanSpec};
use vlanpool::netns::{NamespaceSwitch, NetnsWorker};
use vlanpool::plugin::VlanPlugin;
use vlanpool::resolver::StaticResolver;
use vlanpool::store::{KvStore, MemoryStore};
use vlanpool::types::CmdArgs;

pub const HOST: &str = "host";

#[derive(Debug, Clone)]
struct FakeLink {
    attrs: LinkAttrs,
    addresses: Vec<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    current: String,
    namespaces: HashMap<String, BTreeMap<String, FakeLink>>,
    default_route: Option<String>,
    next_index: u32,
    fail_rename: bool,
    fail_move: bool,
    fail_address: bool,
    fail_container_lookup: bool,
}

impl FakeState {
    fn table(&mut self) -> Result<&mut BTreeMap<String, FakeLink>> {
        let current = self.current.clone();
        self.namespaces
            .get_mut(&current)
            .ok_or_else(|| CniError::Interface(format!("namespace {} vanished", current)))
    }
}

type Hook = Box<dyn FnOnce() + Send>;

/// Simulated kernel: one link table per namespace plus a "current"
/// namespace moved by the switch.
#[derive(Clone)]
pub struct FakeNet {
    state: Arc<Mutex<FakeState>>,
    on_macvlan: Arc<Mutex<Option<Hook>>>,
}

impl FakeNet {
    /// Host namespace with `eth0` (mtu 1500) carrying the default route
    pub fn new() -> Self {
        let mut host = BTreeMap::new();
        host.insert(
            "eth0".to_string(),
            FakeLink {
                attrs: LinkAttrs {
                    name: "eth0".into(),
                    index: 2,
                    mtu: 1500,
                    mac: Some("52:54:00:12:34:56".into()),
                    up: true,
                    ..LinkAttrs::default()
                },
                addresses: Vec::new(),
            },
        );

        let mut namespaces = HashMap::new();
        namespaces.insert(HOST.to_string(), host);

        Self {
            state: Arc::new(Mutex::new(FakeState {
                current: HOST.to_string(),
                namespaces,
                default_route: Some("eth0".into()),
                next_index: 10,
                ..FakeState::default()
            })),
            on_macvlan: Arc::new(Mutex::new(None)),
        }
    }

    pub fn add_namespace(&self, path: &Path) {
        self.state
            .lock()
            .namespaces
            .entry(path.to_string_lossy().into_owned())
            .or_default();
    }

    pub fn links(&self, ns: &str) -> Vec<String> {
        self.state
            .lock()
            .namespaces
            .get(ns)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn link(&self, ns: &str, name: &str) -> Option<LinkAttrs> {
        self.state
            .lock()
            .namespaces
            .get(ns)?
            .get(name)
            .map(|l| l.attrs.clone())
    }

    pub fn link_addresses(&self, ns: &str, name: &str) -> Vec<String> {
        self.state
            .lock()
            .namespaces
            .get(ns)
            .and_then(|t| t.get(name))
            .map(|l| l.addresses.clone())
            .unwrap_or_default()
    }

    /// Macvlan links left in the host namespace
    pub fn host_macvlans(&self) -> Vec<String> {
        self.state.lock().namespaces[HOST]
            .values()
            .filter(|l| l.attrs.kind.as_deref() == Some("macvlan"))
            .map(|l| l.attrs.name.clone())
            .collect()
    }

    pub fn fail_rename(&self, fail: bool) {
        self.state.lock().fail_rename = fail;
    }

    pub fn fail_move(&self, fail: bool) {
        self.state.lock().fail_move = fail;
    }

    pub fn fail_address(&self, fail: bool) {
        self.state.lock().fail_address = fail;
    }

    /// Run `hook` once, when the next macvlan is created.
    pub fn on_next_macvlan(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_macvlan.lock() = Some(Box::new(hook));
    }

    /// Make link lookups fail inside every container namespace.
    pub fn fail_container_lookup(&self, fail: bool) {
        self.state.lock().fail_container_lookup = fail;
    }

    pub fn worker(&self) -> NetnsWorker {
        let net = self.clone();
        NetnsWorker::with_switch(move || {
            Ok(Box::new(FakeSwitch { net }) as Box<dyn NamespaceSwitch>)
        })
        .unwrap()
    }

    pub fn provisioner(&self) -> InterfaceProvisioner {
        InterfaceProvisioner::new(Arc::new(self.clone()), self.worker())
    }
}

pub struct FakeSwitch {
    net: FakeNet,
}

impl NamespaceSwitch for FakeSwitch {
    fn enter(&mut self, target: &Path) -> Result<()> {
        let key = target.to_string_lossy().into_owned();
        let mut state = self.net.state.lock();
        if !state.namespaces.contains_key(&key) {
            return Err(CniError::Interface(format!("no such netns {}", key)));
        }
        state.current = key;
        Ok(())
    }

    fn restore(&mut self) -> Result<()> {
        self.net.state.lock().current = HOST.to_string();
        Ok(())
    }
}

impl LinkDriver for FakeNet {
    fn link_by_name(&self, name: &str) -> Result<Option<LinkAttrs>> {
        let mut state = self.state.lock();
        if state.fail_container_lookup && state.current != HOST {
            return Err(CniError::Interface(format!("cannot read {}", name)));
        }
        Ok(state.table()?.get(name).map(|l| l.attrs.clone()))
    }

    fn default_route_link(&self) -> Result<Option<String>> {
        let state = self.state.lock();
        Ok(if state.current == HOST {
            state.default_route.clone()
        } else {
            None
        })
    }

    fn add_vlan(&self, parent: &str, name: &str, vlan: u16) -> Result<()> {
        let mut state = self.state.lock();
        state.next_index += 1;
        let index = state.next_index;
        let table = state.table()?;

        if table.contains_key(name) {
            return Ok(());
        }
        let mtu = table
            .get(parent)
            .map(|p| p.attrs.mtu)
            .ok_or_else(|| CniError::Interface(format!("parent {} not found", parent)))?;

        table.insert(
            name.to_string(),
            FakeLink {
                attrs: LinkAttrs {
                    name: name.to_string(),
                    index,
                    mtu,
                    kind: Some("vlan".into()),
                    vlan_id: Some(vlan),
                    parent: Some(parent.to_string()),
                    ..LinkAttrs::default()
                },
                addresses: Vec::new(),
            },
        );
        Ok(())
    }

    fn add_macvlan(&self, spec: &MacvlanSpec) -> Result<()> {
        let hook = self.on_macvlan.lock().take();
        if let Some(hook) = hook {
            hook();
        }

        let mut state = self.state.lock();
        state.next_index += 1;
        let index = state.next_index;
        let table = state.table()?;

        let parent_mtu = table
            .get(&spec.parent)
            .map(|p| p.attrs.mtu)
            .ok_or_else(|| CniError::Interface(format!("parent {} not found", spec.parent)))?;
        if table.contains_key(&spec.name) {
            return Err(CniError::Interface(format!("{}: File exists", spec.name)));
        }

        table.insert(
            spec.name.clone(),
            FakeLink {
                attrs: LinkAttrs {
                    name: spec.name.clone(),
                    index,
                    mtu: if spec.mtu == 0 { parent_mtu } else { spec.mtu },
                    mac: Some(
                        spec.mac
                            .clone()
                            .unwrap_or_else(|| format!("0a:58:00:00:00:{:02x}", index)),
                    ),
                    kind: Some("macvlan".into()),
                    macvlan_mode: Some(spec.mode.as_str().to_string()),
                    parent: Some(spec.parent.clone()),
                    ..LinkAttrs::default()
                },
                addresses: Vec::new(),
            },
        );
        Ok(())
    }

    fn set_netns(&self, name: &str, netns: &Path) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_move {
            return Err(CniError::Interface(format!("cannot move {}", name)));
        }
        let target = netns.to_string_lossy().into_owned();
        if !state.namespaces.contains_key(&target) {
            return Err(CniError::Interface(format!("no such netns {}", target)));
        }

        let mut link = state
            .table()?
            .remove(name)
            .ok_or_else(|| CniError::Interface(format!("{} not found", name)))?;
        // The lower device stays behind.
        link.attrs.parent = None;

        if let Some(table) = state.namespaces.get_mut(&target) {
            table.insert(name.to_string(), link);
        }
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_rename {
            return Err(CniError::Interface(format!("cannot rename {}", from)));
        }
        let table = state.table()?;
        if table.contains_key(to) {
            return Err(CniError::Interface(format!("{}: File exists", to)));
        }
        let mut link = table
            .remove(from)
            .ok_or_else(|| CniError::Interface(format!("{} not found", from)))?;
        link.attrs.name = to.to_string();
        table.insert(to.to_string(), link);
        Ok(())
    }

    fn set_up(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let link = state
            .table()?
            .get_mut(name)
            .ok_or_else(|| CniError::Interface(format!("{} not found", name)))?;
        link.attrs.up = true;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool> {
        let mut state = self.state.lock();
        Ok(state.table()?.remove(name).is_some())
    }

    fn add_address(&self, name: &str, cidr: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_address {
            return Err(CniError::Interface(format!("cannot add {} to {}", cidr, name)));
        }
        let link = state
            .table()?
            .get_mut(name)
            .ok_or_else(|| CniError::Interface(format!("{} not found", name)))?;
        if !link.addresses.iter().any(|a| a == cidr) {
            link.addresses.push(cidr.to_string());
        }
        Ok(())
    }

    fn addresses(&self, name: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        Ok(state
            .table()?
            .get(name)
            .map(|l| l.addresses.clone())
            .unwrap_or_default())
    }
}

/// Network configuration with `eth0` as master and a fast retry policy
pub fn net_conf(segments: &[&str]) -> NetConf {
    let segments = serde_json::to_string(segments).unwrap();
    let json = format!(
        r#"{{
            "cniVersion": "1.0.0",
            "name": "pool",
            "type": "vlanpool",
            "master": "eth0",
            "segments": {},
            "ipam": {{"retryBackoffMs": 1}}
        }}"#,
        segments
    );
    NetConf::parse(json.as_bytes()).unwrap()
}

pub async fn register(store: &MemoryStore, conf: &NetConf, segment: &str, vlan: u16) {
    IpamAllocator::new(Arc::new(store.clone()), &conf.ipam)
        .register_segment(segment, vlan)
        .await
        .unwrap();
}

/// Keys of the address and owner trees, ignoring segment registrations
pub fn allocation_keys(store: &MemoryStore) -> Vec<String> {
    store
        .keys()
        .into_iter()
        .filter(|k| !k.starts_with("/ipam-meta/"))
        .collect()
}

/// A fake store, a fake kernel and one container namespace
pub struct Harness {
    pub store: MemoryStore,
    pub net: FakeNet,
    pub netns: NamedTempFile,
}

impl Harness {
    pub fn new() -> Self {
        let net = FakeNet::new();
        let netns = NamedTempFile::new().unwrap();
        net.add_namespace(netns.path());

        Self {
            store: MemoryStore::new(),
            net,
            netns,
        }
    }

    pub fn netns_path(&self) -> String {
        self.netns.path().to_string_lossy().into_owned()
    }

    pub fn args(&self, container_id: &str, ifname: &str, netns: &str) -> CmdArgs {
        CmdArgs {
            container_id: container_id.to_string(),
            netns: netns.to_string(),
            ifname: ifname.to_string(),
            args: HashMap::new(),
            path: "/opt/cni/bin".to_string(),
            stdin_data: Vec::new(),
        }
    }

    pub fn plugin(&self, conf: NetConf, container_id: &str, ifname: &str) -> VlanPlugin {
        let args = self.args(container_id, ifname, &self.netns_path());
        self.plugin_with_args(conf, args)
    }

    pub fn plugin_with_args(&self, conf: NetConf, args: CmdArgs) -> VlanPlugin {
        let store: Arc<dyn KvStore> = Arc::new(self.store.clone());
        let allocator = IpamAllocator::new(store, &conf.ipam);
        let resolver = StaticResolver::new(conf.segments.clone());

        VlanPlugin::new(conf, args, allocator, self.net.provisioner(), Arc::new(resolver))
    }
}
