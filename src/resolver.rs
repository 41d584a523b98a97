//! Candidate segment resolution
//!
//! Which segments a workload may draw from is decided outside the plugin.
//! The resolver is the boundary: given the pod namespace and name it returns
//! the ordered candidate list.

use async_trait::async_trait;
use itertools::Itertools;
use std::net::Ipv4Addr;
use tracing::debug;

use crate::config::NetConf;
use crate::error::{CniError, Result};
use crate::types::CmdArgs;

/// `CNI_ARGS` key carrying a comma separated segment list
pub const APP_NET_ARG: &str = "APP_NET";

/// Resolves the ordered candidate segments of a workload
#[async_trait]
pub trait SegmentResolver: Send + Sync {
    /// An empty list means no owner was found for the workload.
    async fn resolve(&self, namespace: Option<&str>, workload: Option<&str>) -> Result<Vec<String>>;
}

/// Resolver answering from a fixed list
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    segments: Vec<String>,
}

impl StaticResolver {
    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    /// Candidates for one invocation: `APP_NET` from `CNI_ARGS` when present,
    /// else the `segments` list of the network configuration.
    pub fn from_invocation(conf: &NetConf, args: &CmdArgs) -> Result<Self> {
        match args.args.get(APP_NET_ARG) {
            Some(list) => {
                debug!("Segments from {}: {}", APP_NET_ARG, list);
                Ok(Self::new(parse_segment_list(list)?))
            }
            None => Ok(Self::new(conf.segments.clone())),
        }
    }
}

#[async_trait]
impl SegmentResolver for StaticResolver {
    async fn resolve(&self, _namespace: Option<&str>, _workload: Option<&str>) -> Result<Vec<String>> {
        Ok(self.segments.clone())
    }
}

/// Parse `"172.17.11.0, 172.17.12.0"` into an ordered, de-duplicated list.
pub fn parse_segment_list(list: &str) -> Result<Vec<String>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unique()
        .map(|s| {
            s.parse::<Ipv4Addr>()
                .map(|_| s.to_string())
                .map_err(|_| CniError::Resolver(format!("malformed segment {:?} in {:?}", s, list)))
        })
        .collect()
}
