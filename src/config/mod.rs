use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CniError, Result};
use crate::types::DNS;

/// Network configuration handed to the plugin on stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Name of the network
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Host NIC the VLAN device is stacked on. Empty means the interface
    /// holding the default route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,
    /// Macvlan mode of the container interface
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    /// Interface MTU, 0 inherits the parent's
    #[serde(default)]
    pub mtu: u32,
    /// Fixed MAC address for the container interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Candidate segments used when the runtime passes none
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<String>,
    /// DNS settings copied into the result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DNS>,
    /// Result of a previous ADD, present on CHECK
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_result: Option<serde_json::Value>,
    /// Address management settings
    #[serde(default)]
    pub ipam: IpamConf,
}

/// Address pool and store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IpamConf {
    /// etcd endpoints, tried in order
    pub endpoints: Vec<String>,
    /// Connect timeout (milliseconds)
    pub dial_timeout_ms: u64,
    /// Deadline of a single store RPC (milliseconds)
    pub request_timeout_ms: u64,
    /// TTL of the lease backing an address lock (seconds)
    pub lease_ttl_secs: i64,
    /// Keep-alive cadence of a held lock (milliseconds)
    pub renew_interval_ms: u64,
    /// TTL of the lease holding a committed allocation (seconds)
    pub hold_ttl_secs: i64,
    /// Attempts per store call before giving up
    pub store_retries: u32,
    /// Initial backoff between store attempts (milliseconds)
    pub retry_backoff_ms: u64,
    /// Root of the address tree, metadata and owner trees are derived from it
    pub root: String,
    /// Usable host range of every segment
    pub range: PoolRange,
}

impl Default for IpamConf {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            dial_timeout_ms: 5000,
            request_timeout_ms: 1000,
            lease_ttl_secs: 10,
            renew_interval_ms: 1000,
            hold_ttl_secs: 365 * 24 * 3600,
            store_retries: 3,
            retry_backoff_ms: 100,
            root: "/ipam".to_string(),
            range: PoolRange::default(),
        }
    }
}

impl IpamConf {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(CniError::Config("ipam.endpoints must not be empty".into()));
        }
        if self.lease_ttl_secs <= 0 || self.hold_ttl_secs <= 0 {
            return Err(CniError::Config("lease TTLs must be positive".into()));
        }
        // Renewal has to fire at least twice per TTL or a single slow
        // keep-alive loses the lock.
        if self.renew_interval_ms == 0
            || self.renew_interval_ms.saturating_mul(2)
                > (self.lease_ttl_secs as u64).saturating_mul(1000)
        {
            return Err(CniError::Config(format!(
                "renewIntervalMs {} must be positive and at most half of leaseTtlSecs {}",
                self.renew_interval_ms, self.lease_ttl_secs
            )));
        }
        if !self.root.starts_with('/') || self.root.ends_with('/') {
            return Err(CniError::Config(format!(
                "ipam.root {:?} must start with '/' and not end with one",
                self.root
            )));
        }
        self.range.validate()
    }
}

/// Usable host offsets of a segment.
///
/// Offsets are counted from the segment's network address; `range_end` is
/// exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolRange {
    pub range_start: u32,
    pub range_end: u32,
    pub gateway: u32,
    /// Used addresses at which the segment counts as exhausted
    pub capacity: usize,
    pub prefix_len: u8,
}

impl Default for PoolRange {
    fn default() -> Self {
        Self {
            range_start: 11,
            range_end: 250,
            gateway: 254,
            capacity: 239,
            prefix_len: 24,
        }
    }
}

impl PoolRange {
    /// Number of offsets in the usable range
    pub fn size(&self) -> usize {
        self.range_end.saturating_sub(self.range_start) as usize
    }

    pub fn offsets(&self) -> std::ops::Range<u32> {
        self.range_start..self.range_end
    }

    pub fn contains(&self, offset: u32) -> bool {
        self.offsets().contains(&offset)
    }

    fn validate(&self) -> Result<()> {
        if self.prefix_len == 0 || self.prefix_len > 30 {
            return Err(CniError::Config(format!(
                "prefixLen {} must be within 1..=30",
                self.prefix_len
            )));
        }
        let hosts = 1u64 << (32 - self.prefix_len as u32);
        if self.range_start == 0 || self.range_start >= self.range_end {
            return Err(CniError::Config(format!(
                "range {}..{} is empty or starts at the network address",
                self.range_start, self.range_end
            )));
        }
        if self.range_end as u64 >= hosts || self.gateway as u64 >= hosts - 1 {
            return Err(CniError::Config(format!(
                "range or gateway does not fit a /{} segment",
                self.prefix_len
            )));
        }
        if self.contains(self.gateway) {
            return Err(CniError::Config(format!(
                "gateway offset {} lies inside the usable range",
                self.gateway
            )));
        }
        if self.capacity == 0 || self.capacity > self.size() {
            return Err(CniError::Config(format!(
                "capacity {} must be within 1..={}",
                self.capacity,
                self.size()
            )));
        }
        Ok(())
    }
}

/// Macvlan mode of the container interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MacvlanMode {
    #[default]
    Bridge,
    Private,
    Vepa,
    Passthru,
}

impl MacvlanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MacvlanMode::Bridge => "bridge",
            MacvlanMode::Private => "private",
            MacvlanMode::Vepa => "vepa",
            MacvlanMode::Passthru => "passthru",
        }
    }
}

impl FromStr for MacvlanMode {
    type Err = CniError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "bridge" => Ok(MacvlanMode::Bridge),
            "private" => Ok(MacvlanMode::Private),
            "vepa" => Ok(MacvlanMode::Vepa),
            "passthru" => Ok(MacvlanMode::Passthru),
            other => Err(CniError::Config(format!("unknown macvlan mode: {:?}", other))),
        }
    }
}

impl fmt::Display for MacvlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut conf: NetConf = serde_json::from_slice(bytes)
            .map_err(|e| CniError::decode("network configuration", e))?;

        // Validation
        conf.mode()?;

        if let Some(mac) = &conf.mac {
            conf.mac = Some(normalize_mac(mac)?);
        }

        if conf.master.as_deref().map(str::is_empty).unwrap_or(false) {
            conf.master = None;
        }
        if let Some(master) = &conf.master {
            validate_ifname(master)?;
        }

        conf.ipam.validate()?;

        Ok(conf)
    }

    /// Parsed macvlan mode
    pub fn mode(&self) -> Result<MacvlanMode> {
        self.mode.parse()
    }

    /// Create a default configuration for a pool
    pub fn new_default(name: &str, master: Option<&str>, segments: Vec<String>) -> Self {
        Self {
            cni_version: "1.0.0".to_string(),
            name: name.to_string(),
            plugin_type: "vlanpool".to_string(),
            master: master.map(str::to_string),
            mode: String::new(),
            mtu: 0,
            mac: None,
            segments,
            dns: None,
            prev_result: None,
            ipam: IpamConf::default(),
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Validate a MAC address and return it lowercased
pub fn normalize_mac(mac: &str) -> Result<String> {
    let octets: Vec<&str> = mac.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));

    if !valid {
        return Err(CniError::Config(format!("invalid MAC address {:?}", mac)));
    }
    Ok(mac.to_ascii_lowercase())
}

/// Validate a kernel interface name
pub fn validate_ifname(name: &str) -> Result<()> {
    if name.is_empty() || name.len() >= libc::IFNAMSIZ {
        return Err(CniError::Config(format!(
            "interface name {:?} must be 1..{} bytes",
            name,
            libc::IFNAMSIZ
        )));
    }
    if name == "." || name == ".." || name.chars().any(|c| c == '/' || c.is_whitespace()) {
        return Err(CniError::Config(format!("invalid interface name {:?}", name)));
    }
    Ok(())
}
