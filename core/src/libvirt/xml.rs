//! Serde shapes of the libvirt XML documents we read and write.
//!
//! Only the elements the compute model needs are declared; everything else
//! in a document is skipped when parsing.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub fn from_str<T: DeserializeOwned>(xml: &str) -> Result<T> {
    quick_xml::de::from_str(xml).map_err(|e| Error::Xml(e.to_string()))
}

pub fn to_string<T: Serialize>(value: &T) -> Result<String> {
    quick_xml::se::to_string(value).map_err(|e| Error::Xml(e.to_string()))
}

/// Element without content, e.g. `<acpi/>`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// A number with an optional `unit` attribute
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scaled {
    #[serde(rename = "@unit", default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(rename = "$text", default)]
    pub value: u64,
}

impl Scaled {
    pub fn bytes(value: u64) -> Self {
        Self {
            unit: Some("bytes".to_string()),
            value,
        }
    }

    /// Value in bytes; `default_unit` applies when the attribute is absent
    pub fn to_bytes(&self, default_unit: &str) -> u64 {
        let unit = self.unit.as_deref().unwrap_or(default_unit);
        self.value.saturating_mul(unit_multiplier(unit))
    }
}

fn unit_multiplier(unit: &str) -> u64 {
    match unit {
        "b" | "bytes" => 1,
        "KB" => 1000,
        "k" | "KiB" => 1024,
        "MB" => 1000 * 1000,
        "M" | "MiB" => 1024 * 1024,
        "GB" => 1000 * 1000 * 1000,
        "G" | "GiB" => 1024 * 1024 * 1024,
        "TB" => 1000 * 1000 * 1000 * 1000,
        "T" | "TiB" => 1024 * 1024 * 1024 * 1024,
        _ => 1,
    }
}

// ==================== Domain ====================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "domain")]
pub struct DomainXml {
    #[serde(rename = "@type", default)]
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub memory: Scaled,
    #[serde(default)]
    pub vcpu: VcpuXml,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cputune: Option<CputuneXml>,
    #[serde(default)]
    pub os: OsXml,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<FeaturesXml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuModeXml>,
    #[serde(default)]
    pub devices: DevicesXml,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuXml {
    #[serde(rename = "@placement", default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<String>,
    #[serde(rename = "$text", default)]
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CputuneXml {
    #[serde(rename = "vcpupin", default)]
    pub vcpupins: Vec<VcpuPinXml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emulatorpin: Option<EmulatorPinXml>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuPinXml {
    #[serde(rename = "@vcpu")]
    pub vcpu: u32,
    #[serde(rename = "@cpuset")]
    pub cpuset: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulatorPinXml {
    #[serde(rename = "@cpuset")]
    pub cpuset: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsXml {
    #[serde(rename = "type", default)]
    pub os_type: OsTypeXml,
    #[serde(rename = "boot", default)]
    pub boot: Vec<BootXml>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsTypeXml {
    #[serde(rename = "@arch", default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(rename = "@machine", default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    #[serde(rename = "$text", default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootXml {
    #[serde(rename = "@dev")]
    pub dev: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeaturesXml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acpi: Option<Empty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apic: Option<Empty>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuModeXml {
    #[serde(rename = "@mode", default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicesXml {
    #[serde(rename = "disk", default)]
    pub disks: Vec<DiskXml>,
    #[serde(rename = "interface", default)]
    pub interfaces: Vec<InterfaceXml>,
    #[serde(rename = "serial", default)]
    pub serials: Vec<CharDeviceXml>,
    #[serde(rename = "console", default)]
    pub consoles: Vec<CharDeviceXml>,
    #[serde(rename = "channel", default)]
    pub channels: Vec<ChannelXml>,
    #[serde(rename = "graphics", default)]
    pub graphics: Vec<GraphicsXml>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "disk")]
pub struct DiskXml {
    #[serde(rename = "@type", default)]
    pub kind: String,
    #[serde(rename = "@device", default)]
    pub device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<DriverXml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<DiskSourceXml>,
    #[serde(default)]
    pub target: DiskTargetXml,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<Empty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<AliasXml>,
}

impl DiskXml {
    pub fn source_path(&self) -> Option<&str> {
        let source = self.source.as_ref()?;
        source.file.as_deref().or(source.dev.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverXml {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSourceXml {
    #[serde(rename = "@file", default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(rename = "@dev", default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskTargetXml {
    #[serde(rename = "@dev", default)]
    pub dev: String,
    #[serde(rename = "@bus", default, skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasXml {
    #[serde(rename = "@name")]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "interface")]
pub struct InterfaceXml {
    #[serde(rename = "@type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacXml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<InterfaceSourceXml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<VlanXml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelXml>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacXml {
    #[serde(rename = "@address")]
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSourceXml {
    #[serde(rename = "@bridge", default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    #[serde(rename = "@network", default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanXml {
    #[serde(rename = "tag", default)]
    pub tags: Vec<VlanTagXml>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanTagXml {
    #[serde(rename = "@id")]
    pub id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelXml {
    #[serde(rename = "@type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharDeviceXml {
    #[serde(rename = "@type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "channel")]
pub struct ChannelXml {
    #[serde(rename = "@type")]
    pub kind: String,
    pub target: ChannelTargetXml,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTargetXml {
    #[serde(rename = "@type")]
    pub kind: String,
    #[serde(rename = "@name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphicsXml {
    #[serde(rename = "@type")]
    pub kind: String,
    #[serde(rename = "@port", default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(rename = "@autoport", default, skip_serializing_if = "Option::is_none")]
    pub autoport: Option<String>,
    #[serde(rename = "@listen", default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
}

// ==================== Storage ====================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "pool")]
pub struct PoolXml {
    #[serde(rename = "@type", default)]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub capacity: Scaled,
    #[serde(default)]
    pub allocation: Scaled,
    #[serde(default)]
    pub available: Scaled,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PoolTargetXml>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolTargetXml {
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "volume")]
pub struct VolumeXml {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub capacity: Scaled,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<Scaled>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<VolumeTargetXml>,
    #[serde(
        rename = "backingStore",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub backing_store: Option<VolumeTargetXml>,
}

impl VolumeXml {
    pub fn path(&self) -> Option<&str> {
        self.target.as_ref()?.path.as_deref()
    }

    pub fn format(&self) -> Option<&str> {
        Some(self.target.as_ref()?.format.as_ref()?.kind.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeTargetXml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<FormatXml>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatXml {
    #[serde(rename = "@type")]
    pub kind: String,
}

// ==================== Network ====================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "network")]
pub struct NetworkXml {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<ForwardXml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<BridgeXml>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardXml {
    #[serde(rename = "@mode", default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeXml {
    #[serde(rename = "@name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ==================== Host ====================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapabilitiesXml {
    #[serde(default)]
    pub host: HostXml,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostXml {
    #[serde(default)]
    pub cpu: HostCpuXml,
    #[serde(default)]
    pub iommu: Option<IommuXml>,
    #[serde(default)]
    pub topology: Option<TopologyXml>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostCpuXml {
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IommuXml {
    #[serde(rename = "@support", default)]
    pub support: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopologyXml {
    #[serde(default)]
    pub cells: CellsXml,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CellsXml {
    #[serde(rename = "cell", default)]
    pub cells: Vec<CellXml>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CellXml {
    #[serde(rename = "@id", default)]
    pub id: u32,
    #[serde(default)]
    pub memory: Scaled,
    #[serde(rename = "pages", default)]
    pub pages: Vec<PagesXml>,
    #[serde(default)]
    pub cpus: Option<CellCpusXml>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PagesXml {
    #[serde(rename = "@unit", default)]
    pub unit: Option<String>,
    #[serde(rename = "@size", default)]
    pub size: u64,
    #[serde(rename = "$text", default)]
    pub count: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CellCpusXml {
    #[serde(rename = "cpu", default)]
    pub cpus: Vec<CellCpuXml>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CellCpuXml {
    #[serde(rename = "@id")]
    pub id: u32,
    #[serde(rename = "@socket_id", default)]
    pub socket_id: Option<u32>,
    #[serde(rename = "@core_id", default)]
    pub core_id: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SysinfoXml {
    #[serde(rename = "processor", default)]
    pub processors: Vec<ProcessorXml>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessorXml {
    #[serde(rename = "entry", default)]
    pub entries: Vec<EntryXml>,
}

impl ProcessorXml {
    pub fn entry(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.trim())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntryXml {
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "$text", default)]
    pub value: String,
}
