//! ADD / CHECK / DEL orchestration
//!
//! ADD walks a fixed sequence of states. Whatever it acquired on the way
//! (an interface, a locked address) is undone if a later step fails or the
//! invocation is cancelled. DEL is best effort and repeatable. CHECK only
//! reports.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NetConf;
use crate::error::{CniError, Result};
use crate::ipam::{Allocation, IpamAllocator};
use crate::link::{CreateRequest, InterfaceProvisioner};
use crate::netns::NetNs;
use crate::resolver::SegmentResolver;
use crate::types::{CmdArgs, IPConfig, Interface, Result as CniResult};

/// Progress of an ADD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddState {
    Idle,
    ConfigLoaded,
    NamespaceOpened,
    InterfaceCreated,
    AddressAllocated,
    ResultEmitted,
    Failed,
}

/// What an ADD has acquired so far
struct AddProgress {
    state: AddState,
    interface: Option<(PathBuf, String)>,
    allocation: Option<Allocation>,
}

impl AddProgress {
    fn new() -> Self {
        Self {
            state: AddState::Idle,
            interface: None,
            allocation: None,
        }
    }

    fn advance(&mut self, next: AddState) {
        debug!("ADD {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// VLAN pool plugin
pub struct VlanPlugin {
    config: NetConf,
    args: CmdArgs,
    allocator: IpamAllocator,
    provisioner: InterfaceProvisioner,
    resolver: Arc<dyn SegmentResolver>,
}

impl VlanPlugin {
    pub fn new(
        config: NetConf,
        args: CmdArgs,
        allocator: IpamAllocator,
        provisioner: InterfaceProvisioner,
        resolver: Arc<dyn SegmentResolver>,
    ) -> Self {
        Self {
            config,
            args,
            allocator,
            provisioner,
            resolver,
        }
    }

    pub fn allocator(&self) -> &IpamAllocator {
        &self.allocator
    }

    /// Attach the container: create its interface and give it an address.
    pub async fn add_network(&self, cancel: &CancellationToken) -> Result<CniResult> {
        let mut progress = AddProgress::new();

        match self.run_add(cancel, &mut progress).await {
            Ok(result) => {
                progress.advance(AddState::ResultEmitted);
                Ok(result)
            }
            Err(e) => {
                warn!("ADD for {} failed in state {:?}: {}", self.args.container_id, progress.state, e);
                progress.advance(AddState::Failed);
                self.compensate(progress).await;
                Err(e)
            }
        }
    }

    async fn run_add(
        &self,
        cancel: &CancellationToken,
        progress: &mut AddProgress,
    ) -> Result<CniResult> {
        let netns_path = self
            .args
            .netns_path()
            .ok_or_else(|| CniError::Config("CNI_NETNS is required for ADD".into()))?;
        let ifname = self.args.ifname.as_str();
        let mode = self.config.mode()?;

        let master = match &self.config.master {
            Some(master) => master.clone(),
            None => {
                step(cancel, "resolve default route", self.provisioner.default_route_link())
                    .await?
            }
        };
        let master_mtu = step(cancel, "read master mtu", self.provisioner.link_mtu(&master)).await?;
        if self.config.mtu > master_mtu {
            return Err(CniError::Config(format!(
                "mtu {} exceeds mtu {} of master {}",
                self.config.mtu, master_mtu, master
            )));
        }
        progress.advance(AddState::ConfigLoaded);

        let candidates = step(
            cancel,
            "resolve segments",
            self.resolver
                .resolve(self.args.pod_namespace(), self.args.pod_name()),
        )
        .await?;
        debug!("Candidate segments: {:?}", candidates);

        let netns = NetNs::open(netns_path)?;
        progress.advance(AddState::NamespaceOpened);

        // The interface hangs off the VLAN of the segment it will be
        // addressed from. A planned segment can fill up before its address is
        // locked; the interface is then recreated for the next candidate.
        let mut remaining = candidates;
        let (descriptor, allocation) = loop {
            let plan = step(cancel, "plan segment", self.allocator.plan(&remaining)).await?;
            let parent = step(
                cancel,
                "vlan parent",
                self.provisioner.ensure_vlan_parent(&master, plan.vlan),
            )
            .await?;

            // Creation runs to completion once started; a half-created link
            // would otherwise escape the rollback below.
            let descriptor = self
                .provisioner
                .create(&CreateRequest {
                    parent,
                    mode,
                    mtu: self.config.mtu,
                    mac: self.config.mac.clone(),
                    netns: netns.path().to_path_buf(),
                    ifname: ifname.to_string(),
                })
                .await?;
            progress.interface = Some((netns.path().to_path_buf(), descriptor.name.clone()));
            progress.advance(AddState::InterfaceCreated);
            check_cancelled(cancel, "interface created")?;

            let allocated = step(
                cancel,
                "allocate address",
                self.allocator.allocate(std::slice::from_ref(&plan.segment)),
            )
            .await;

            let later = remaining
                .iter()
                .position(|s| *s == plan.segment)
                .map_or(0, |i| remaining.len() - i - 1);
            match allocated {
                Ok(allocation) => break (descriptor, allocation),
                Err(CniError::PoolExhausted(segment)) if later > 0 => {
                    info!("Segment {} filled up after planning, trying the next one", segment);
                    if let Some((path, name)) = &progress.interface {
                        self.provisioner.delete(path, name).await?;
                    }
                    progress.interface = None;
                    progress.advance(AddState::NamespaceOpened);
                    remaining.drain(..remaining.len() - later);
                }
                Err(e) => return Err(e),
            }
        };
        let cidr = allocation.result().cidr();
        progress.allocation = Some(allocation);
        progress.advance(AddState::AddressAllocated);

        step(
            cancel,
            "configure address",
            self.provisioner.configure_address(netns.path(), &descriptor.name, &cidr),
        )
        .await?;
        check_cancelled(cancel, "address configured")?;

        let Some(allocation) = progress.allocation.take() else {
            return Err(CniError::Validation("allocation vanished before commit".into()));
        };
        let record = self
            .allocator
            .commit(allocation, &self.args.container_id, ifname)
            .await?;

        let mut result = CniResult::new(&self.config.cni_version);
        let index = result.add_interface(Interface {
            name: descriptor.name,
            mac: descriptor.mac,
            sandbox: Some(descriptor.sandbox),
        });
        result.add_ip(IPConfig {
            version: None,
            interface: Some(index),
            address: record.cidr(),
            gateway: Some(record.gateway.to_string()),
        });
        if let Some(dns) = &self.config.dns {
            result.set_dns(dns.clone());
        }

        info!(
            "Attached {} to {} with {} (vlan {})",
            ifname, self.args.container_id, record.cidr(), record.vlan
        );
        Ok(result)
    }

    async fn compensate(&self, progress: AddProgress) {
        if let Some(allocation) = progress.allocation {
            let address = allocation.result().address;
            if let Err(e) = allocation.release().await {
                warn!("Rollback: failed to release {}: {}", address, e);
            }
        }

        if let Some((netns, ifname)) = progress.interface {
            if let Err(e) = self.provisioner.delete(&netns, &ifname).await {
                warn!("Rollback: failed to delete {} in {}: {}", ifname, netns.display(), e);
            }
        }
    }

    /// Detach the container. Anything already gone counts as deleted.
    pub async fn del_network(&self) -> Result<()> {
        let container_id = self.args.container_id.as_str();
        let ifname = self.args.ifname.as_str();
        let mut first_error = None;

        match self.allocator.find_record(container_id, ifname).await {
            Ok(Some(record)) => {
                if let Err(e) = self.allocator.release_record(&record).await {
                    warn!("DEL: failed to release {}: {}", record.address, e);
                    first_error.get_or_insert(e);
                }
            }
            Ok(None) => debug!("DEL: no allocation recorded for {}/{}", container_id, ifname),
            Err(e) => {
                warn!("DEL: failed to look up allocation: {}", e);
                first_error.get_or_insert(e);
            }
        }

        if let Some(netns) = self.args.netns_path() {
            if let Err(e) = self.provisioner.delete(Path::new(netns), ifname).await {
                warn!("DEL: failed to delete {} in {}: {}", ifname, netns, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Verify a previous ADD is still in place. Nothing is repaired.
    pub async fn check_network(&self) -> Result<()> {
        let container_id = self.args.container_id.as_str();
        let ifname = self.args.ifname.as_str();

        let netns = self
            .args
            .netns_path()
            .map(Path::new)
            .filter(|p| p.exists())
            .ok_or_else(|| CniError::Validation("container netns is missing".into()))?;

        let link = self
            .provisioner
            .inspect(netns, ifname)
            .await?
            .ok_or_else(|| {
                CniError::Validation(format!("{} not found in {}", ifname, netns.display()))
            })?;

        let mode = self.config.mode()?;
        if link.macvlan_mode.as_deref() != Some(mode.as_str()) {
            return Err(CniError::Validation(format!(
                "{} has mode {:?}, expected {}",
                ifname, link.macvlan_mode, mode
            )));
        }
        if let Some(mac) = &self.config.mac {
            if link.mac.as_deref() != Some(mac.as_str()) {
                return Err(CniError::Validation(format!(
                    "{} has mac {:?}, expected {}",
                    ifname, link.mac, mac
                )));
            }
        }

        let prev = match &self.config.prev_result {
            Some(value) => Some(
                serde_json::from_value::<CniResult>(value.clone())
                    .map_err(|e| CniError::decode("prevResult", e))?,
            ),
            None => None,
        };
        let reported_mac = prev
            .as_ref()
            .and_then(|p| p.interfaces.as_ref())
            .and_then(|interfaces| interfaces.iter().find(|i| i.name == ifname))
            .and_then(|i| i.mac.as_deref());
        if let Some(mac) = reported_mac {
            if !link.mac.as_deref().is_some_and(|m| m.eq_ignore_ascii_case(mac)) {
                return Err(CniError::Validation(format!(
                    "{} has mac {:?}, prevResult reported {}",
                    ifname, link.mac, mac
                )));
            }
        }

        let record = self
            .allocator
            .find_record(container_id, ifname)
            .await?
            .ok_or_else(|| {
                CniError::Validation(format!("no allocation recorded for {}/{}", container_id, ifname))
            })?;
        self.allocator.verify_record(&record).await?;

        let addresses = self.provisioner.addresses(netns, ifname).await?;
        if !addresses.contains(&record.cidr()) {
            return Err(CniError::Validation(format!(
                "{} does not carry {} (has {:?})",
                ifname,
                record.cidr(),
                addresses
            )));
        }

        if let Some(prev) = &prev {
            let recorded = record.address.to_string();
            if let Some(address) = prev.first_address() {
                if address != recorded {
                    return Err(CniError::Validation(format!(
                        "prevResult address {} differs from allocated {}",
                        address, recorded
                    )));
                }
            }
        }

        debug!("CHECK passed for {}/{}", container_id, ifname);
        Ok(())
    }
}

/// Run one ADD step unless the invocation is cancelled first.
async fn step<T>(
    cancel: &CancellationToken,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CniError::Cancelled(what.to_string())),
        result = fut => result,
    }
}

fn check_cancelled(cancel: &CancellationToken, what: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(CniError::Cancelled(what.to_string()));
    }
    Ok(())
}
