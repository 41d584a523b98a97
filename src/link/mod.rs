//! Link operations
//!
//! [`LinkDriver`] is the set of link primitives the provisioner needs. The
//! calls are blocking and act on the namespace of the calling thread, so
//! they are only ever issued from the [`crate::netns::NetnsWorker`] thread.

pub mod provisioner;

pub use provisioner::{CreateRequest, InterfaceDescriptor, InterfaceProvisioner};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::Path;
use std::process::{Command, Output};
use tracing::debug;

use crate::config::MacvlanMode;
use crate::error::{CniError, Result};

/// Attributes of one link
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkAttrs {
    pub name: String,
    pub index: u32,
    pub mtu: u32,
    pub mac: Option<String>,
    /// `vlan`, `macvlan`, ... `None` for physical devices
    pub kind: Option<String>,
    pub macvlan_mode: Option<String>,
    pub vlan_id: Option<u16>,
    /// Lower device, when it lives in the same namespace
    pub parent: Option<String>,
    pub up: bool,
}

/// Parameters of a new macvlan link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacvlanSpec {
    pub parent: String,
    pub name: String,
    pub mode: MacvlanMode,
    /// 0 inherits the parent MTU
    pub mtu: u32,
    pub mac: Option<String>,
}

/// Link primitives in the current thread's namespace
pub trait LinkDriver: Send + Sync + 'static {
    fn link_by_name(&self, name: &str) -> Result<Option<LinkAttrs>>;

    /// Device of the IPv4 default route
    fn default_route_link(&self) -> Result<Option<String>>;

    /// Create an 802.1Q link. An existing link of that name is accepted.
    fn add_vlan(&self, parent: &str, name: &str, vlan: u16) -> Result<()>;

    fn add_macvlan(&self, spec: &MacvlanSpec) -> Result<()>;

    /// Move a link into the namespace at `netns`.
    fn set_netns(&self, name: &str, netns: &Path) -> Result<()>;

    fn rename(&self, from: &str, to: &str) -> Result<()>;

    fn set_up(&self, name: &str) -> Result<()>;

    /// Delete a link, returning whether it existed.
    fn delete(&self, name: &str) -> Result<bool>;

    /// Add an IPv4 address in CIDR notation. An existing address is accepted.
    fn add_address(&self, name: &str, cidr: &str) -> Result<()>;

    /// IPv4 addresses of a link in CIDR notation
    fn addresses(&self, name: &str) -> Result<Vec<String>>;
}

/// Driver shelling out to iproute2 (`ip -j`)
#[derive(Debug, Clone, Default)]
pub struct IpCommandDriver;

#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    linkinfo: Option<IpLinkInfo>,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfo {
    info_kind: Option<String>,
    #[serde(default)]
    info_data: Option<IpLinkData>,
}

#[derive(Debug, Deserialize)]
struct IpLinkData {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    id: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct IpRoute {
    #[serde(default)]
    dev: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpAddrLink {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    family: String,
    local: String,
    prefixlen: u8,
}

impl From<IpLink> for LinkAttrs {
    fn from(link: IpLink) -> Self {
        let (kind, data) = match link.linkinfo {
            Some(info) => (info.info_kind, info.info_data),
            None => (None, None),
        };
        let (macvlan_mode, vlan_id) = match data {
            Some(data) => (data.mode, data.id),
            None => (None, None),
        };

        Self {
            up: link.flags.iter().any(|f| f == "UP"),
            name: link.ifname,
            index: link.ifindex,
            mtu: link.mtu,
            mac: link.address,
            kind,
            macvlan_mode,
            vlan_id,
            parent: link.link,
        }
    }
}

impl IpCommandDriver {
    fn ip(&self, args: &[&str]) -> Result<Output> {
        debug!("ip {}", args.join(" "));
        Ok(Command::new("ip").args(args).output()?)
    }

    fn run(&self, args: &[&str]) -> Result<()> {
        let output = self.ip(args)?;
        if !output.status.success() {
            return Err(ip_failure(args, &output));
        }
        Ok(())
    }

    fn json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let output = self.ip(args)?;
        if !output.status.success() {
            return Err(ip_failure(args, &output));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| CniError::decode(format!("output of ip {}", args.join(" ")), e))
    }
}

fn ip_failure(args: &[&str], output: &Output) -> CniError {
    CniError::Interface(format!(
        "ip {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr).trim()
    ))
}

fn stderr_contains(output: &Output, needle: &str) -> bool {
    String::from_utf8_lossy(&output.stderr).contains(needle)
}

fn is_missing_device(output: &Output) -> bool {
    stderr_contains(output, "does not exist") || stderr_contains(output, "Cannot find device")
}

impl LinkDriver for IpCommandDriver {
    fn link_by_name(&self, name: &str) -> Result<Option<LinkAttrs>> {
        let args = ["-j", "-d", "link", "show", "dev", name];
        let output = self.ip(&args)?;
        if !output.status.success() {
            if is_missing_device(&output) {
                return Ok(None);
            }
            return Err(ip_failure(&args, &output));
        }

        let links: Vec<IpLink> = serde_json::from_slice(&output.stdout)
            .map_err(|e| CniError::decode(format!("link {}", name), e))?;
        Ok(links.into_iter().next().map(LinkAttrs::from))
    }

    fn default_route_link(&self) -> Result<Option<String>> {
        let routes: Vec<IpRoute> = self.json(&["-j", "-4", "route", "show", "default"])?;
        Ok(routes.into_iter().find_map(|r| r.dev))
    }

    fn add_vlan(&self, parent: &str, name: &str, vlan: u16) -> Result<()> {
        let id = vlan.to_string();
        let args = ["link", "add", "link", parent, "name", name, "type", "vlan", "id", id.as_str()];
        let output = self.ip(&args)?;

        if !output.status.success() && !stderr_contains(&output, "File exists") {
            return Err(ip_failure(&args, &output));
        }
        Ok(())
    }

    fn add_macvlan(&self, spec: &MacvlanSpec) -> Result<()> {
        let mtu = spec.mtu.to_string();
        let mut args = vec!["link", "add", "link", spec.parent.as_str(), "name", spec.name.as_str()];
        if let Some(mac) = &spec.mac {
            args.extend(["address", mac.as_str()]);
        }
        if spec.mtu > 0 {
            args.extend(["mtu", mtu.as_str()]);
        }
        args.extend(["type", "macvlan", "mode", spec.mode.as_str()]);

        self.run(&args)
    }

    fn set_netns(&self, name: &str, netns: &Path) -> Result<()> {
        let target = netns.to_string_lossy();
        self.run(&["link", "set", "dev", name, "netns", target.as_ref()])
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.run(&["link", "set", "dev", from, "name", to])
    }

    fn set_up(&self, name: &str) -> Result<()> {
        self.run(&["link", "set", "dev", name, "up"])
    }

    fn delete(&self, name: &str) -> Result<bool> {
        let args = ["link", "delete", "dev", name];
        let output = self.ip(&args)?;

        if output.status.success() {
            return Ok(true);
        }
        if is_missing_device(&output) {
            return Ok(false);
        }
        Err(ip_failure(&args, &output))
    }

    fn add_address(&self, name: &str, cidr: &str) -> Result<()> {
        let args = ["addr", "add", cidr, "dev", name];
        let output = self.ip(&args)?;

        if !output.status.success() && !stderr_contains(&output, "File exists") {
            return Err(ip_failure(&args, &output));
        }
        Ok(())
    }

    fn addresses(&self, name: &str) -> Result<Vec<String>> {
        let links: Vec<IpAddrLink> = self.json(&["-j", "addr", "show", "dev", name])?;

        Ok(links
            .into_iter()
            .flat_map(|l| l.addr_info)
            .filter(|a| a.family == "inet")
            .map(|a| format!("{}/{}", a.local, a.prefixlen))
            .collect())
    }
}

/// Name of the host VLAN device for `master` and `vlan`
pub fn vlan_link_name(master: &str, vlan: u16) -> String {
    format!("{}.{}", master, vlan)
}

/// Transient host-side name for a link about to move into a container
pub fn temp_link_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("vp{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip_link_json() {
        let json = r#"[{"ifindex":7,"link":"eth0.100","ifname":"eth1","flags":["BROADCAST","MULTICAST","UP","LOWER_UP"],
            "mtu":1500,"address":"0a:58:0a:f4:00:02",
            "linkinfo":{"info_kind":"macvlan","info_data":{"mode":"bridge"}}}]"#;
        let links: Vec<IpLink> = serde_json::from_str(json).unwrap();
        let attrs = LinkAttrs::from(links.into_iter().next().unwrap());

        assert_eq!(attrs.name, "eth1");
        assert_eq!(attrs.kind.as_deref(), Some("macvlan"));
        assert_eq!(attrs.macvlan_mode.as_deref(), Some("bridge"));
        assert_eq!(attrs.parent.as_deref(), Some("eth0.100"));
        assert!(attrs.up);
    }

    #[test]
    fn parses_vlan_link_json() {
        let json = r#"[{"ifindex":3,"link":"eth0","ifname":"eth0.100","flags":["BROADCAST"],"mtu":1500,
            "linkinfo":{"info_kind":"vlan","info_data":{"protocol":"802.1Q","id":100,"flags":["REORDER_HDR"]}}}]"#;
        let links: Vec<IpLink> = serde_json::from_str(json).unwrap();
        let attrs = LinkAttrs::from(links.into_iter().next().unwrap());

        assert_eq!(attrs.vlan_id, Some(100));
        assert!(!attrs.up);
    }

    #[test]
    fn temp_names_fit_ifnamsiz() {
        let name = temp_link_name();
        assert!(name.starts_with("vp"));
        assert_eq!(name.len(), 10);
        assert_ne!(name, temp_link_name());
    }
}
