//! VLAN pool CNI plugin
//!
//! Attaches containers to VLAN-backed networks:
//! - Creates a macvlan child of the host VLAN device in the container netns
//! - Allocates its IPv4 address from segmented pools tracked in etcd
//! - Holds each address with a lease-bound lock so crashed hosts leak nothing
//! - Rolls back partially created interfaces and claims on failure

pub mod commands;
pub mod config;
pub mod error;
pub mod ipam;
pub mod link;
pub mod lock;
pub mod netns;
pub mod plugin;
pub mod resolver;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use commands::{cmd_add, cmd_check, cmd_del, run_cni};
pub use config::NetConf;
pub use error::{CniError, ErrorResult};
pub use ipam::{AllocationResult, IpamAllocator};
pub use lock::{DistributedLock, LockGuard, LockState};
pub use plugin::VlanPlugin;
pub use store::{EtcdStore, KvStore, MemoryStore};
