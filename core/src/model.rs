//! Domain model types for the compute layer

use crate::keys::Key;
use crate::units::Size;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// CPU architecture of a node or guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Amd64,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Arch {
    /// Map a libvirt architecture name
    pub fn from_libvirt(arch: &str) -> Self {
        match arch.trim() {
            "x86_64" => Arch::Amd64,
            _ => Arch::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Unknown => "unknown",
        }
    }

    pub fn libvirt_name(&self) -> Option<&'static str> {
        match self {
            Arch::Amd64 => Some("x86_64"),
            Arch::Unknown => None,
        }
    }
}

// ==================== Nodes ====================

/// Hugepage counts of one NUMA cell
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HugePages {
    pub count_4k: u64,
    pub count_2m: u64,
    pub count_1g: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NumaCore {
    pub socket_id: u32,
    pub cpus: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct NumaCell {
    pub id: u32,
    pub memory: Size,
    pub pages: HugePages,
    /// Cores keyed by core id
    pub cores: BTreeMap<u32, NumaCore>,
}

impl NumaCell {
    pub fn cpu_count(&self) -> usize {
        self.cores.values().map(|c| c.cpus.len()).sum()
    }
}

/// A hypervisor endpoint as described by its capabilities
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub id: String,
    pub arch: Arch,
    pub cpu_vendor: String,
    pub cpu_model: String,
    pub iommu: bool,
    pub numas: Vec<NumaCell>,
}

impl Node {
    pub fn memory(&self) -> Size {
        Size::from_bytes(self.numas.iter().map(|c| c.memory.bytes()).sum())
    }

    pub fn cpu_count(&self) -> usize {
        self.numas.iter().map(|c| c.cpu_count()).sum()
    }
}

/// Summary of a node as shown in host listings
#[derive(Debug, Clone, Default)]
pub struct HostInfo {
    pub node_id: String,
    pub hostname: String,
    pub arch: Arch,
    pub memory: Size,
    pub cpus: usize,
}

#[derive(Debug, Clone, Default)]
pub struct NodeListOptions {
    /// Restrict to these nodes; empty means all configured nodes
    pub node_ids: Vec<String>,
}

// ==================== Storage ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VolumeFormat {
    Raw,
    Qcow2,
    Iso,
    #[default]
    #[serde(other)]
    Unknown,
}

impl VolumeFormat {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "raw" => VolumeFormat::Raw,
            "qcow2" => VolumeFormat::Qcow2,
            "iso" => VolumeFormat::Iso,
            _ => VolumeFormat::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeFormat::Raw => "raw",
            VolumeFormat::Qcow2 => "qcow2",
            VolumeFormat::Iso => "iso",
            VolumeFormat::Unknown => "unknown",
        }
    }

    /// Driver type QEMU reads the image with
    pub fn driver_type(&self) -> &'static str {
        match self {
            VolumeFormat::Qcow2 => "qcow2",
            _ => "raw",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VolumeType {
    File,
    Block,
    #[default]
    Unknown,
}

impl VolumeType {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "file" => VolumeType::File,
            "block" => VolumeType::Block,
            _ => VolumeType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeType::File => "file",
            VolumeType::Block => "block",
            VolumeType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Volume {
    pub node_id: String,
    pub pool: String,
    pub path: String,
    pub name: String,
    pub size: Size,
    pub format: VolumeFormat,
    pub volume_type: VolumeType,
    /// Name of the domain using this volume, filled during listing
    pub attached_to: Option<String>,
    pub attached_as: Option<DeviceType>,
    pub image_description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct VolumeListOptions {
    pub node_ids: Vec<String>,
}

/// Parameters of a fresh volume
#[derive(Debug, Clone, Default)]
pub struct VolumeCreateParams {
    pub node_id: String,
    pub pool: String,
    pub name: String,
    pub format: VolumeFormat,
    pub size: Size,
}

/// Parameters of a volume cloned from an existing one on the same node
#[derive(Debug, Clone, Default)]
pub struct VolumeCloneParams {
    pub node_id: String,
    pub original_path: String,
    pub new_name: String,
    pub new_pool: String,
    pub new_format: VolumeFormat,
    pub new_size: Size,
}

#[derive(Debug, Clone, Default)]
pub struct VolumePool {
    pub node_id: String,
    pub name: String,
    pub size: Size,
    pub used: Size,
    pub free: Size,
}

impl VolumePool {
    /// Share of the pool capacity in use, 0-100
    pub fn usage_percent(&self) -> u64 {
        let size = self.size.bytes();
        if size == 0 {
            return 0;
        }
        ((self.used.bytes() as u128 * 100) / size as u128) as u64
    }
}

#[derive(Debug, Clone, Default)]
pub struct VolumePoolListOptions {
    pub node_ids: Vec<String>,
}

// ==================== Networks ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    #[default]
    Bridge,
    Libvirt,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Bridge => "bridge",
            NetworkType::Libvirt => "libvirt",
        }
    }
}

impl FromStr for NetworkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "bridge" => Ok(NetworkType::Bridge),
            "libvirt" | "network" => Ok(NetworkType::Libvirt),
            other => Err(Error::validation(format!("unknown network type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Network {
    pub node_id: String,
    pub name: String,
    pub network_type: NetworkType,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkListOptions {
    pub node_ids: Vec<String>,
}

// ==================== Images ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Os {
    pub name: String,
    pub version: String,
    pub arch: Arch,
}

impl Os {
    pub fn description(&self) -> String {
        format!("{} {} ({})", self.name, self.version, self.arch.as_str())
    }
}

/// Operating system description of a base image volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ImageManifest {
    pub id: String,
    pub volume_path: String,
    pub os: Os,
}

// ==================== Virtual machines ====================

/// Guest state as the UI sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmState {
    #[default]
    Unknown,
    Stopped,
    Running,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Unknown => "unknown",
            VmState::Stopped => "stopped",
            VmState::Running => "running",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, VmState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Disk,
    Cdrom,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Disk => "disk",
            DeviceType::Cdrom => "cdrom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "disk" => Some(DeviceType::Disk),
            "cdrom" => Some(DeviceType::Cdrom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBus {
    #[default]
    Virtio,
    Ide,
    Scsi,
}

impl DeviceBus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceBus::Virtio => "virtio",
            DeviceBus::Ide => "ide",
            DeviceBus::Scsi => "scsi",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "virtio" => Some(DeviceBus::Virtio),
            "ide" => Some(DeviceBus::Ide),
            "scsi" => Some(DeviceBus::Scsi),
            _ => None,
        }
    }

    /// Target device prefix used by this bus family
    pub fn device_prefix(&self) -> &'static str {
        match self {
            DeviceBus::Virtio => "vd",
            DeviceBus::Ide => "hd",
            DeviceBus::Scsi => "sd",
        }
    }
}

/// Alias of the cloud-init config drive attachment
pub const CONFIG_DRIVE_ALIAS: &str = "configdrive";

/// A volume attached to a VM
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmVolume {
    pub path: String,
    pub alias: String,
    pub device_type: DeviceType,
    pub device_bus: DeviceBus,
    /// Target device name (`vda`, `hdc`); allocated when empty
    pub device_name: String,
}

impl VmVolume {
    pub fn new(
        path: impl Into<String>,
        alias: impl Into<String>,
        device_type: DeviceType,
        device_bus: DeviceBus,
    ) -> Self {
        Self {
            path: path.into(),
            alias: alias.into(),
            device_type,
            device_bus,
            device_name: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmInterface {
    pub mac: String,
    pub model: String,
    pub network_type: NetworkType,
    pub network_name: String,
    pub access_vlan: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphicType {
    #[default]
    None,
    Vnc,
    Spice,
}

impl GraphicType {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "vnc" => GraphicType::Vnc,
            "spice" => GraphicType::Spice,
            _ => GraphicType::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GraphicType::None => "none",
            GraphicType::Vnc => "vnc",
            GraphicType::Spice => "spice",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graphic {
    pub graphic_type: GraphicType,
    pub listen: String,
    /// Port assigned by the hypervisor while running
    pub port: Option<u16>,
}

/// CPU affinity of the vcpus and the emulator thread
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuPin {
    pub vcpus: BTreeMap<u32, BTreeSet<u32>>,
    pub emulator: BTreeSet<u32>,
}

impl CpuPin {
    pub fn is_empty(&self) -> bool {
        self.vcpus.is_empty() && self.emulator.is_empty()
    }
}

/// Cloud-init payload seeded through the config drive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmConfig {
    pub hostname: String,
    pub userdata: Vec<u8>,
    pub keys: Vec<Key>,
}

#[derive(Debug, Clone, Default)]
pub struct VirtualMachine {
    pub id: String,
    pub node_id: String,
    pub arch: Arch,
    pub vcpus: u32,
    pub memory: Size,
    pub state: VmState,
    pub autostart: bool,
    pub guest_agent: bool,
    pub graphic: Graphic,
    pub cpupin: Option<CpuPin>,
    pub volumes: Vec<VmVolume>,
    pub interfaces: Vec<VmInterface>,
    pub config: Option<VmConfig>,
}

impl VirtualMachine {
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn volume_by_alias(&self, alias: &str) -> Option<&VmVolume> {
        self.volumes.iter().find(|v| v.alias == alias)
    }
}

#[derive(Debug, Clone, Default)]
pub struct VirtualMachineListOptions {
    pub node_ids: Vec<String>,
}

/// Power action requested on a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmAction {
    Start,
    Reboot,
    Poweroff,
}

impl FromStr for VmAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(VmAction::Start),
            "reboot" => Ok(VmAction::Reboot),
            "poweroff" => Ok(VmAction::Poweroff),
            other => Err(Error::UnknownAction(other.to_string())),
        }
    }
}
