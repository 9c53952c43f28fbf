//! Libvirt integration: hypervisor sessions, the per-node connection pool
//! and the repositories that translate libvirt XML into the compute model.

mod domain;
mod network;
mod node;
mod pool;
mod storage_pool;
mod virsh;
mod volume;
pub mod xml;

#[cfg(test)]
pub(crate) mod memory;

pub use domain::VirtualMachineRepository;
pub use network::NetworkRepository;
pub use node::{HostInfoRepository, NodeRepository};
pub use pool::{ConnectionPool, Lease};
pub use storage_pool::VolumePoolRepository;
pub use virsh::{VirshConnection, VirshConnector};
pub use volume::VolumeRepository;

use crate::{Result, VmState};
use std::io::{Read, Write};

/// Bidirectional byte stream to a guest console or graphics server
pub trait Stream: Read + Write + Send {}

impl<T: Read + Write + Send> Stream for T {}

/// Domain run state as reported by the hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
    Other,
}

impl DomainState {
    /// Parse the state string printed by `virsh domstate`
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "no state" | "nostate" => DomainState::NoState,
            "running" => DomainState::Running,
            "idle" | "blocked" => DomainState::Blocked,
            "paused" => DomainState::Paused,
            "in shutdown" | "shutdown" => DomainState::Shutdown,
            "shut off" | "shutoff" => DomainState::Shutoff,
            "crashed" => DomainState::Crashed,
            "pmsuspended" => DomainState::PmSuspended,
            _ => DomainState::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DomainState::NoState => "no state",
            DomainState::Running => "running",
            DomainState::Blocked => "idle",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "in shutdown",
            DomainState::Shutoff => "shut off",
            DomainState::Crashed => "crashed",
            DomainState::PmSuspended => "pmsuspended",
            DomainState::Other => "other",
        }
    }

    /// Intermediate states count as stopped so they can be acted upon
    pub fn vm_state(&self) -> VmState {
        match self {
            DomainState::Running => VmState::Running,
            DomainState::Blocked
            | DomainState::Paused
            | DomainState::Shutdown
            | DomainState::Shutoff
            | DomainState::Crashed
            | DomainState::PmSuspended => VmState::Stopped,
            DomainState::NoState | DomainState::Other => VmState::Unknown,
        }
    }
}

/// One session with a hypervisor node.
///
/// Documents go in and out as libvirt XML strings. Implementations are not
/// required to be usable from several threads at once; the connection pool
/// hands a session to one caller at a time.
pub trait Hypervisor: Send {
    fn is_alive(&self) -> Result<bool>;
    fn hostname(&self) -> Result<String>;
    fn capabilities(&self) -> Result<String>;
    fn sysinfo(&self) -> Result<String>;

    // ==================== Domains ====================

    /// Names of all domains, running and inactive
    fn list_domains(&self) -> Result<Vec<String>>;
    fn domain_xml(&self, name: &str, inactive: bool) -> Result<String>;
    fn domain_state(&self, name: &str) -> Result<DomainState>;
    fn domain_autostart(&self, name: &str) -> Result<bool>;
    fn define_domain(&self, xml: &str) -> Result<()>;
    fn undefine_domain(&self, name: &str) -> Result<()>;
    fn start_domain(&self, name: &str) -> Result<()>;
    fn destroy_domain(&self, name: &str) -> Result<()>;
    fn reboot_domain(&self, name: &str) -> Result<()>;
    fn set_autostart(&self, name: &str, autostart: bool) -> Result<()>;
    /// Attach to the persistent definition, and to the running domain when `live`
    fn attach_device(&self, name: &str, xml: &str, live: bool) -> Result<()>;
    fn detach_device(&self, name: &str, xml: &str, live: bool) -> Result<()>;
    fn set_vcpus(&self, name: &str, count: u32) -> Result<()>;
    fn set_memory(&self, name: &str, kibibytes: u64) -> Result<()>;
    fn pin_vcpu(&self, name: &str, vcpu: u32, cpuset: &str) -> Result<()>;
    fn pin_emulator(&self, name: &str, cpuset: &str) -> Result<()>;
    fn open_console(&self, name: &str) -> Result<Box<dyn Stream>>;
    fn open_graphic(&self, name: &str) -> Result<Box<dyn Stream>>;

    // ==================== Storage ====================

    fn list_pools(&self) -> Result<Vec<String>>;
    fn pool_xml(&self, pool: &str) -> Result<String>;
    fn pool_is_active(&self, pool: &str) -> Result<bool>;
    /// Paths of the volumes in a pool
    fn list_volumes(&self, pool: &str) -> Result<Vec<String>>;
    fn volume_xml(&self, path: &str) -> Result<String>;
    fn volume_pool(&self, path: &str) -> Result<String>;
    /// Create a volume and return its path
    fn create_volume(&self, pool: &str, xml: &str, prealloc_metadata: bool) -> Result<String>;
    /// Create a volume with the content of `original` and return its path
    fn clone_volume(&self, pool: &str, xml: &str, original: &str) -> Result<String>;
    fn resize_volume(&self, path: &str, bytes: u64) -> Result<()>;
    fn delete_volume(&self, path: &str) -> Result<()>;
    fn upload_volume(&self, path: &str, content: &mut dyn Read, length: u64) -> Result<()>;
    fn download_volume(&self, path: &str) -> Result<Vec<u8>>;

    // ==================== Networks ====================

    fn list_networks(&self) -> Result<Vec<String>>;
    fn network_xml(&self, name: &str) -> Result<String>;
}

/// Opens hypervisor sessions by connection URI
pub trait Connector: Send + Sync {
    fn connect(&self, uri: &str) -> Result<Box<dyn Hypervisor>>;
}
