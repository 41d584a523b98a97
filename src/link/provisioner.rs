//! Container interface provisioning
//!
//! Creates the macvlan child on the host VLAN device under a transient name,
//! moves it into the container namespace and renames it there. A link that
//! fails a later step is deleted before the error is returned, so nothing is
//! left behind on the host.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{temp_link_name, vlan_link_name, LinkAttrs, LinkDriver, MacvlanSpec};
use crate::config::{validate_ifname, MacvlanMode};
use crate::error::{CniError, Result};
use crate::netns::NetnsWorker;

/// What to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    /// Host link the macvlan child hangs off
    pub parent: String,
    pub mode: MacvlanMode,
    /// 0 inherits the parent MTU
    pub mtu: u32,
    pub mac: Option<String>,
    pub netns: PathBuf,
    /// Final name inside the container
    pub ifname: String,
}

/// A provisioned container interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub name: String,
    pub mac: Option<String>,
    /// Namespace path the interface lives in
    pub sandbox: String,
}

/// Creates and removes container interfaces.
pub struct InterfaceProvisioner {
    driver: Arc<dyn LinkDriver>,
    worker: NetnsWorker,
}

impl InterfaceProvisioner {
    pub fn new(driver: Arc<dyn LinkDriver>, worker: NetnsWorker) -> Self {
        Self { driver, worker }
    }

    /// Host interface carrying the default route
    pub async fn default_route_link(&self) -> Result<String> {
        let driver = self.driver.clone();
        self.worker
            .run_on_host(move || driver.default_route_link())
            .await?
            .ok_or_else(|| CniError::Config("no default route on the host, set master".into()))
    }

    /// MTU of a host link
    pub async fn link_mtu(&self, name: &str) -> Result<u32> {
        let driver = self.driver.clone();
        let link = name.to_string();
        self.worker
            .run_on_host(move || driver.link_by_name(&link))
            .await?
            .map(|attrs| attrs.mtu)
            .ok_or_else(|| CniError::Interface(format!("host link {} not found", name)))
    }

    /// Make sure the host VLAN device `<master>.<vlan>` exists and is up.
    /// The device is shared by every container on the segment and is never
    /// deleted here.
    pub async fn ensure_vlan_parent(&self, master: &str, vlan: u16) -> Result<String> {
        let name = vlan_link_name(master, vlan);
        validate_ifname(&name)?;

        let driver = self.driver.clone();
        let master = master.to_string();
        let link = name.clone();

        self.worker
            .run_on_host(move || {
                if driver.link_by_name(&master)?.is_none() {
                    return Err(CniError::Interface(format!("master {} not found", master)));
                }
                match driver.link_by_name(&link)? {
                    Some(existing) if existing.vlan_id.map_or(false, |id| id != vlan) => {
                        return Err(CniError::Interface(format!(
                            "{} exists with vlan id {:?}, expected {}",
                            link, existing.vlan_id, vlan
                        )));
                    }
                    Some(_) => debug!("VLAN device {} already present", link),
                    None => {
                        info!("Creating VLAN device {}", link);
                        driver.add_vlan(&master, &link, vlan)?;
                    }
                }
                driver.set_up(&link)
            })
            .await?;

        Ok(name)
    }

    /// Create the container interface.
    pub async fn create(&self, request: &CreateRequest) -> Result<InterfaceDescriptor> {
        validate_ifname(&request.ifname)?;
        let temp = temp_link_name();

        // Host side: create under a transient name and move it.
        let driver = self.driver.clone();
        let spec = MacvlanSpec {
            parent: request.parent.clone(),
            name: temp.clone(),
            mode: request.mode,
            mtu: request.mtu,
            mac: request.mac.clone(),
        };
        let netns = request.netns.clone();

        self.worker
            .run_on_host(move || {
                let parent = driver.link_by_name(&spec.parent)?.ok_or_else(|| {
                    CniError::Interface(format!("parent link {} not found", spec.parent))
                })?;
                if spec.mtu > parent.mtu {
                    return Err(CniError::Config(format!(
                        "mtu {} exceeds mtu {} of parent {}",
                        spec.mtu, parent.mtu, spec.parent
                    )));
                }

                driver.add_macvlan(&spec)?;
                debug!("Created {} on {} (mode {})", spec.name, spec.parent, spec.mode);

                if let Err(e) = driver.set_netns(&spec.name, &netns) {
                    discard(driver.as_ref(), &spec.name);
                    return Err(CniError::Interface(format!(
                        "failed to move {} into {}: {}",
                        spec.name,
                        netns.display(),
                        e
                    )));
                }
                Ok(())
            })
            .await?;

        // Container side: rename and read back the kernel-assigned MAC.
        let driver = self.driver.clone();
        let ifname = request.ifname.clone();

        let attrs = self
            .worker
            .run_in(&request.netns, move || {
                if let Err(e) = driver.rename(&temp, &ifname) {
                    discard(driver.as_ref(), &temp);
                    return Err(CniError::Interface(format!(
                        "failed to rename {} to {}: {}",
                        temp, ifname, e
                    )));
                }

                match driver.link_by_name(&ifname) {
                    Ok(Some(attrs)) => Ok(attrs),
                    Ok(None) => {
                        discard(driver.as_ref(), &ifname);
                        Err(CniError::Interface(format!("{} vanished after rename", ifname)))
                    }
                    Err(e) => {
                        discard(driver.as_ref(), &ifname);
                        Err(CniError::Interface(format!(
                            "failed to read back {}: {}",
                            ifname, e
                        )))
                    }
                }
            })
            .await?;

        info!(
            "Provisioned {} in {} (mac {})",
            attrs.name,
            request.netns.display(),
            attrs.mac.as_deref().unwrap_or("-")
        );

        Ok(InterfaceDescriptor {
            name: attrs.name,
            mac: attrs.mac,
            sandbox: request.netns.to_string_lossy().into_owned(),
        })
    }

    /// Add the address and bring the interface up.
    pub async fn configure_address(&self, netns: &Path, ifname: &str, cidr: &str) -> Result<()> {
        let driver = self.driver.clone();
        let ifname = ifname.to_string();
        let cidr = cidr.to_string();

        self.worker
            .run_in(netns, move || {
                driver.add_address(&ifname, &cidr)?;
                driver.set_up(&ifname)
            })
            .await
    }

    /// Delete a container interface. A missing namespace or link is not an
    /// error.
    pub async fn delete(&self, netns: &Path, ifname: &str) -> Result<bool> {
        if !netns.exists() {
            debug!("Netns {} is gone, nothing to delete", netns.display());
            return Ok(false);
        }

        let driver = self.driver.clone();
        let name = ifname.to_string();
        let deleted = self.worker.run_in(netns, move || driver.delete(&name)).await?;

        if deleted {
            info!("Deleted {} in {}", ifname, netns.display());
        }
        Ok(deleted)
    }

    /// Attributes of a container interface
    pub async fn inspect(&self, netns: &Path, ifname: &str) -> Result<Option<LinkAttrs>> {
        let driver = self.driver.clone();
        let name = ifname.to_string();
        self.worker.run_in(netns, move || driver.link_by_name(&name)).await
    }

    /// IPv4 addresses of a container interface
    pub async fn addresses(&self, netns: &Path, ifname: &str) -> Result<Vec<String>> {
        let driver = self.driver.clone();
        let name = ifname.to_string();
        self.worker.run_in(netns, move || driver.addresses(&name)).await
    }
}

fn discard(driver: &dyn LinkDriver, name: &str) {
    if let Err(e) = driver.delete(name) {
        warn!("Failed to delete {} during rollback: {}", name, e);
    }
}
