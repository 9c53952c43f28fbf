//! Virtual machines as libvirt domains

use super::xml::{
    self, AliasXml, BootXml, ChannelTargetXml, ChannelXml, CharDeviceXml, CpuModeXml,
    CputuneXml, DevicesXml, DiskSourceXml, DiskTargetXml, DiskXml, DomainXml, DriverXml,
    EmulatorPinXml, Empty, FeaturesXml, GraphicsXml, InterfaceSourceXml, InterfaceXml, MacXml,
    ModelXml, OsTypeXml, OsXml, Scaled, VcpuPinXml, VcpuXml, VlanTagXml, VlanXml, VolumeXml,
};
use super::{ConnectionPool, Hypervisor, Stream};
use crate::configdrive::{ConfigDrive, Format};
use crate::devices::DeviceNameAllocator;
use crate::units::{format_cpu_set, parse_cpu_set};
use crate::{
    Arch, Context, CpuPin, DeviceBus, DeviceType, Error, Graphic, GraphicType, NetworkType,
    Result, Size, VirtualMachine, VirtualMachineListOptions, VmInterface, VmVolume,
    CONFIG_DRIVE_ALIAS,
};
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;

const GUEST_AGENT_CHANNEL: &str = "org.qemu.guest_agent.0";
const ALIAS_PREFIX: &str = "ua-";

/// Lists, defines and drives domains on the configured nodes
#[derive(Debug)]
pub struct VirtualMachineRepository {
    pool: Arc<ConnectionPool>,
    config_drive: ConfigDrive,
    /// Config drive format tried first when reading a VM's config drive
    drive_formats: HashMap<String, Format>,
}

/// Read a domain into the model. `inactive` selects the persistent definition.
pub(super) fn load_domain(
    hv: &dyn Hypervisor,
    node_id: &str,
    name: &str,
    inactive: bool,
) -> Result<VirtualMachine> {
    let raw = hv
        .domain_xml(name, inactive)
        .with_context(|| format!("cannot get domain xml of {}", name))?;
    let domain: DomainXml = xml::from_str(&raw)?;
    let state = hv
        .domain_state(name)
        .with_context(|| format!("cannot get state of domain {}", name))?;
    let autostart = hv
        .domain_autostart(name)
        .with_context(|| format!("cannot get autostart of domain {}", name))?;

    let mut vm = vm_from_xml(node_id, &domain);
    vm.state = state.vm_state();
    vm.autostart = autostart;
    Ok(vm)
}

fn vm_from_xml(node_id: &str, domain: &DomainXml) -> VirtualMachine {
    let cpupin = domain.cputune.as_ref().map(|tune| CpuPin {
        vcpus: tune
            .vcpupins
            .iter()
            .map(|p| (p.vcpu, parse_cpu_set(&p.cpuset)))
            .collect(),
        emulator: tune
            .emulatorpin
            .as_ref()
            .map(|e| parse_cpu_set(&e.cpuset))
            .unwrap_or_default(),
    });

    let graphic = domain
        .devices
        .graphics
        .first()
        .map(|g| Graphic {
            graphic_type: GraphicType::parse(&g.kind),
            listen: g.listen.clone().unwrap_or_default(),
            port: g.port.and_then(|p| u16::try_from(p).ok()).filter(|p| *p > 0),
        })
        .unwrap_or_default();

    VirtualMachine {
        id: domain.name.clone(),
        node_id: node_id.to_string(),
        arch: domain
            .os
            .os_type
            .arch
            .as_deref()
            .map(Arch::from_libvirt)
            .unwrap_or_default(),
        vcpus: domain.vcpu.count,
        memory: Size::from_bytes(domain.memory.to_bytes("KiB")).normalized(),
        guest_agent: domain
            .devices
            .channels
            .iter()
            .any(|c| c.target.name.as_deref() == Some(GUEST_AGENT_CHANNEL)),
        graphic,
        cpupin: cpupin.filter(|p| !p.is_empty()),
        volumes: domain
            .devices
            .disks
            .iter()
            .filter_map(volume_from_disk)
            .collect(),
        interfaces: domain
            .devices
            .interfaces
            .iter()
            .map(interface_from_xml)
            .collect(),
        ..Default::default()
    }
}

fn volume_from_disk(disk: &DiskXml) -> Option<VmVolume> {
    let path = disk.source_path()?;
    let dev = disk.target.dev.as_str();
    let bus = disk
        .target
        .bus
        .as_deref()
        .and_then(DeviceBus::parse)
        .unwrap_or(match dev.get(..2) {
            Some("hd") => DeviceBus::Ide,
            Some("sd") => DeviceBus::Scsi,
            _ => DeviceBus::Virtio,
        });
    let alias = disk
        .alias
        .as_ref()
        .map(|a| a.name.strip_prefix(ALIAS_PREFIX).unwrap_or(&a.name).to_string())
        .unwrap_or_default();
    Some(VmVolume {
        path: path.to_string(),
        alias,
        device_type: DeviceType::parse(&disk.device).unwrap_or_default(),
        device_bus: bus,
        device_name: dev.to_string(),
    })
}

fn interface_from_xml(iface: &InterfaceXml) -> VmInterface {
    let source = iface.source.as_ref();
    let (network_type, network_name) = match iface.kind.as_str() {
        "network" => (
            NetworkType::Libvirt,
            source.and_then(|s| s.network.clone()).unwrap_or_default(),
        ),
        _ => (
            NetworkType::Bridge,
            source.and_then(|s| s.bridge.clone()).unwrap_or_default(),
        ),
    };
    VmInterface {
        mac: iface.mac.as_ref().map(|m| m.address.clone()).unwrap_or_default(),
        model: iface.model.as_ref().map(|m| m.kind.clone()).unwrap_or_default(),
        network_type,
        network_name,
        access_vlan: iface
            .vlan
            .as_ref()
            .and_then(|v| v.tags.first())
            .map(|t| t.id),
    }
}

/// Disk element for a volume, using the volume's own format and type
fn disk_xml(hv: &dyn Hypervisor, volume: &VmVolume) -> Result<DiskXml> {
    let raw = hv
        .volume_xml(&volume.path)
        .with_context(|| format!("cannot get volume {}", volume.path))?;
    let info: VolumeXml = xml::from_str(&raw)?;
    let format = crate::VolumeFormat::parse(info.format().unwrap_or("raw"));
    let is_block = info.kind.as_deref() == Some("block");

    Ok(DiskXml {
        kind: if is_block { "block" } else { "file" }.to_string(),
        device: volume.device_type.as_str().to_string(),
        driver: Some(DriverXml {
            name: "qemu".to_string(),
            kind: Some(format.driver_type().to_string()),
        }),
        source: Some(if is_block {
            DiskSourceXml {
                file: None,
                dev: Some(volume.path.clone()),
            }
        } else {
            DiskSourceXml {
                file: Some(volume.path.clone()),
                dev: None,
            }
        }),
        target: DiskTargetXml {
            dev: volume.device_name.clone(),
            bus: Some(volume.device_bus.as_str().to_string()),
        },
        readonly: (volume.device_type == DeviceType::Cdrom).then(Empty::default),
        alias: (!volume.alias.is_empty()).then(|| AliasXml {
            name: format!("{}{}", ALIAS_PREFIX, volume.alias),
        }),
    })
}

fn interface_xml(iface: &VmInterface) -> InterfaceXml {
    let (kind, source) = match iface.network_type {
        NetworkType::Bridge => (
            "bridge",
            InterfaceSourceXml {
                bridge: Some(iface.network_name.clone()),
                network: None,
            },
        ),
        NetworkType::Libvirt => (
            "network",
            InterfaceSourceXml {
                bridge: None,
                network: Some(iface.network_name.clone()),
            },
        ),
    };
    InterfaceXml {
        kind: kind.to_string(),
        mac: (!iface.mac.is_empty()).then(|| MacXml {
            address: iface.mac.clone(),
        }),
        source: Some(source),
        vlan: iface.access_vlan.map(|id| VlanXml {
            tags: vec![VlanTagXml { id }],
        }),
        model: Some(ModelXml {
            kind: if iface.model.is_empty() {
                "virtio".to_string()
            } else {
                iface.model.clone()
            },
        }),
    }
}

fn guest_agent_xml() -> ChannelXml {
    ChannelXml {
        kind: "unix".to_string(),
        target: ChannelTargetXml {
            kind: "virtio".to_string(),
            name: Some(GUEST_AGENT_CHANNEL.to_string()),
        },
    }
}

fn cputune_xml(pin: &CpuPin) -> CputuneXml {
    CputuneXml {
        vcpupins: pin
            .vcpus
            .iter()
            .map(|(vcpu, set)| VcpuPinXml {
                vcpu: *vcpu,
                cpuset: format_cpu_set(set),
            })
            .collect(),
        emulatorpin: (!pin.emulator.is_empty()).then(|| EmulatorPinXml {
            cpuset: format_cpu_set(&pin.emulator),
        }),
    }
}

/// Fill in empty target names, keeping the ones already chosen
fn assign_device_names(volumes: &mut [VmVolume]) {
    let mut allocator = DeviceNameAllocator::from_targets(
        volumes
            .iter()
            .filter(|v| !v.device_name.is_empty())
            .map(|v| v.device_name.as_str()),
    );
    for volume in volumes.iter_mut().filter(|v| v.device_name.is_empty()) {
        volume.device_name = allocator.next(volume.device_bus);
    }
}

/// Locally administered address in the QEMU range
fn random_mac() -> String {
    let bytes: [u8; 3] = rand::random();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

fn domain_from_vm(hv: &dyn Hypervisor, vm: &VirtualMachine) -> Result<DomainXml> {
    let disks = vm
        .volumes
        .iter()
        .map(|v| disk_xml(hv, v))
        .collect::<Result<Vec<_>>>()?;

    let graphics = match vm.graphic.graphic_type {
        GraphicType::None => Vec::new(),
        kind => vec![GraphicsXml {
            kind: kind.as_str().to_string(),
            port: Some(-1),
            autoport: Some("yes".to_string()),
            listen: (!vm.graphic.listen.is_empty()).then(|| vm.graphic.listen.clone()),
        }],
    };

    Ok(DomainXml {
        kind: "kvm".to_string(),
        name: vm.id.clone(),
        uuid: None,
        memory: Scaled {
            unit: Some("KiB".to_string()),
            value: vm.memory.kibibytes(),
        },
        vcpu: VcpuXml {
            placement: Some("static".to_string()),
            count: vm.vcpus,
        },
        cputune: vm.cpupin.as_ref().filter(|p| !p.is_empty()).map(cputune_xml),
        os: OsXml {
            os_type: OsTypeXml {
                arch: vm.arch.libvirt_name().map(String::from),
                machine: None,
                value: "hvm".to_string(),
            },
            boot: vec![BootXml {
                dev: "hd".to_string(),
            }],
        },
        features: Some(FeaturesXml {
            acpi: Some(Empty::default()),
            apic: Some(Empty::default()),
        }),
        cpu: Some(CpuModeXml {
            mode: Some("host-model".to_string()),
        }),
        devices: DevicesXml {
            disks,
            interfaces: vm.interfaces.iter().map(interface_xml).collect(),
            serials: vec![CharDeviceXml {
                kind: "pty".to_string(),
            }],
            consoles: vec![CharDeviceXml {
                kind: "pty".to_string(),
            }],
            channels: if vm.guest_agent {
                vec![guest_agent_xml()]
            } else {
                Vec::new()
            },
            graphics,
        },
    })
}

impl VirtualMachineRepository {
    pub fn new(
        pool: Arc<ConnectionPool>,
        config_drive: ConfigDrive,
        drive_formats: HashMap<String, Format>,
    ) -> Self {
        Self {
            pool,
            config_drive,
            drive_formats,
        }
    }

    pub fn list(&self, options: &VirtualMachineListOptions) -> Result<Vec<VirtualMachine>> {
        let mut vms = self.pool.fan_out(&options.node_ids, "virtual machines", |lease| {
            let names = lease.list_domains().context("cannot list domains")?;
            let mut vms = Vec::with_capacity(names.len());
            for name in names {
                match load_domain(&**lease, lease.node_id(), &name, false) {
                    Ok(vm) => vms.push(vm),
                    // undefined while we were listing
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                }
            }
            Ok(vms)
        });
        vms.sort_by(|a, b| (&a.node_id, &a.id).cmp(&(&b.node_id, &b.id)));
        Ok(vms)
    }

    /// Fetch one VM, including the cloud-init payload of its config drive
    pub fn get(&self, id: &str, node_id: &str) -> Result<VirtualMachine> {
        let lease = self.pool.acquire(node_id)?;
        let mut vm = load_domain(&*lease, node_id, id, false)?;

        let image = match vm.volume_by_alias(CONFIG_DRIVE_ALIAS) {
            Some(drive) => match lease.download_volume(&drive.path) {
                Ok(image) => Some(image),
                Err(e) => {
                    warn!("cannot download config drive of {} on {}: {}", id, node_id, e);
                    None
                }
            },
            None => None,
        };
        lease.release();

        if let Some(image) = image {
            let preferred = self.drive_formats.get(node_id).copied().unwrap_or_default();
            match self.config_drive.parse(&image, &preferred.preference()) {
                Ok(data) => vm.config = Some(data.to_config()),
                Err(e) => warn!("cannot parse config drive of {} on {}: {}", id, node_id, e),
            }
        }
        Ok(vm)
    }

    /// Define the domain without starting it. Empty device names are allocated in place.
    pub fn create(&self, vm: &mut VirtualMachine) -> Result<()> {
        assign_device_names(&mut vm.volumes);
        let lease = self.pool.acquire(&vm.node_id)?;
        let domain = domain_from_vm(&*lease, vm)?;
        lease
            .define_domain(&xml::to_string(&domain)?)
            .with_context(|| format!("cannot define domain {}", vm.id))?;
        if vm.autostart {
            lease
                .set_autostart(&vm.id, true)
                .with_context(|| format!("cannot enable autostart of {}", vm.id))?;
        }
        Ok(())
    }

    /// Remove the domain definition, forcing it off first if it runs
    pub fn delete(&self, id: &str, node_id: &str) -> Result<()> {
        let lease = self.pool.acquire(node_id)?;
        let state = lease
            .domain_state(id)
            .with_context(|| format!("cannot get state of domain {}", id))?;
        if state.vm_state().is_running() {
            lease
                .destroy_domain(id)
                .with_context(|| format!("cannot stop domain {}", id))?;
        }
        lease
            .undefine_domain(id)
            .with_context(|| format!("cannot undefine domain {}", id))?;
        Ok(())
    }

    /// Apply vcpus, memory, autostart, CPU pinning and the guest agent
    /// channel to the persistent definition
    pub fn update(&self, vm: &VirtualMachine) -> Result<()> {
        let lease = self.pool.acquire(&vm.node_id)?;
        let current = load_domain(&*lease, &vm.node_id, &vm.id, true)?;
        let id = vm.id.as_str();

        if vm.vcpus != current.vcpus {
            lease
                .set_vcpus(id, vm.vcpus)
                .with_context(|| format!("cannot set vcpus of {}", id))?;
        }
        if vm.memory != current.memory {
            lease
                .set_memory(id, vm.memory.kibibytes())
                .with_context(|| format!("cannot set memory of {}", id))?;
        }
        if vm.autostart != current.autostart {
            lease
                .set_autostart(id, vm.autostart)
                .with_context(|| format!("cannot set autostart of {}", id))?;
        }
        if let Some(pin) = vm.cpupin.as_ref().filter(|p| Some(*p) != current.cpupin.as_ref()) {
            for (vcpu, set) in &pin.vcpus {
                lease
                    .pin_vcpu(id, *vcpu, &format_cpu_set(set))
                    .with_context(|| format!("cannot pin vcpu {} of {}", vcpu, id))?;
            }
            if !pin.emulator.is_empty() {
                lease
                    .pin_emulator(id, &format_cpu_set(&pin.emulator))
                    .with_context(|| format!("cannot pin emulator of {}", id))?;
            }
        }
        if vm.guest_agent != current.guest_agent {
            let channel = xml::to_string(&guest_agent_xml())?;
            let result = if vm.guest_agent {
                lease.attach_device(id, &channel, false)
            } else {
                lease.detach_device(id, &channel, false)
            };
            result.with_context(|| format!("cannot update guest agent channel of {}", id))?;
        }
        Ok(())
    }

    /// Attach a volume; an empty device name gets the next free one on its bus
    pub fn attach_volume(&self, id: &str, node_id: &str, volume: &mut VmVolume) -> Result<()> {
        let lease = self.pool.acquire(node_id)?;
        if volume.device_name.is_empty() {
            let raw = lease
                .domain_xml(id, true)
                .with_context(|| format!("cannot get domain xml of {}", id))?;
            let domain: DomainXml = xml::from_str(&raw)?;
            // Source-less disks (empty cdrom trays) still occupy their target
            let mut allocator = DeviceNameAllocator::from_targets(
                domain.devices.disks.iter().map(|d| d.target.dev.as_str()),
            );
            volume.device_name = allocator.next(volume.device_bus);
        }
        let disk = xml::to_string(&disk_xml(&*lease, volume)?)?;
        let running = lease.domain_state(id)?.vm_state().is_running();
        lease
            .attach_device(id, &disk, running)
            .with_context(|| format!("cannot attach volume {} to {}", volume.path, id))?;
        Ok(())
    }

    pub fn detach_volume(&self, id: &str, node_id: &str, path: &str) -> Result<()> {
        let lease = self.pool.acquire(node_id)?;
        let raw = lease
            .domain_xml(id, true)
            .with_context(|| format!("cannot get domain xml of {}", id))?;
        let domain: DomainXml = xml::from_str(&raw)?;
        let disk = domain
            .devices
            .disks
            .iter()
            .find(|d| d.source_path() == Some(path))
            .ok_or_else(|| Error::not_found(format!("volume {} attached to {}", path, id)))?;
        let running = lease.domain_state(id)?.vm_state().is_running();
        lease
            .detach_device(id, &xml::to_string(disk)?, running)
            .with_context(|| format!("cannot detach volume {} from {}", path, id))?;
        Ok(())
    }

    /// Attach a network interface; an empty MAC gets a random one
    pub fn attach_interface(&self, id: &str, node_id: &str, iface: &mut VmInterface) -> Result<()> {
        if iface.mac.is_empty() {
            iface.mac = random_mac();
        }
        let lease = self.pool.acquire(node_id)?;
        let running = lease.domain_state(id)?.vm_state().is_running();
        lease
            .attach_device(id, &xml::to_string(&interface_xml(iface))?, running)
            .with_context(|| format!("cannot attach interface {} to {}", iface.mac, id))?;
        Ok(())
    }

    pub fn detach_interface(&self, id: &str, node_id: &str, mac: &str) -> Result<()> {
        let lease = self.pool.acquire(node_id)?;
        let raw = lease
            .domain_xml(id, true)
            .with_context(|| format!("cannot get domain xml of {}", id))?;
        let domain: DomainXml = xml::from_str(&raw)?;
        let iface = domain
            .devices
            .interfaces
            .iter()
            .find(|i| i.mac.as_ref().map(|m| m.address.eq_ignore_ascii_case(mac)) == Some(true))
            .ok_or_else(|| Error::not_found(format!("interface {} of {}", mac, id)))?;
        let running = lease.domain_state(id)?.vm_state().is_running();
        lease
            .detach_device(id, &xml::to_string(iface)?, running)
            .with_context(|| format!("cannot detach interface {} from {}", mac, id))?;
        Ok(())
    }

    pub fn console_stream(&self, id: &str, node_id: &str) -> Result<Box<dyn Stream>> {
        let lease = self.pool.acquire(node_id)?;
        lease
            .open_console(id)
            .with_context(|| format!("cannot open console of {}", id))
    }

    pub fn graphic_stream(&self, id: &str, node_id: &str) -> Result<Box<dyn Stream>> {
        let lease = self.pool.acquire(node_id)?;
        lease
            .open_graphic(id)
            .with_context(|| format!("cannot open graphics of {}", id))
    }

    pub fn start(&self, id: &str, node_id: &str) -> Result<()> {
        let lease = self.pool.acquire(node_id)?;
        lease
            .start_domain(id)
            .with_context(|| format!("cannot start domain {}", id))
    }

    pub fn reboot(&self, id: &str, node_id: &str) -> Result<()> {
        let lease = self.pool.acquire(node_id)?;
        lease
            .reboot_domain(id)
            .with_context(|| format!("cannot reboot domain {}", id))
    }

    /// Hard power off
    pub fn poweroff(&self, id: &str, node_id: &str) -> Result<()> {
        let lease = self.pool.acquire(node_id)?;
        lease
            .destroy_domain(id)
            .with_context(|| format!("cannot power off domain {}", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configdrive::memory::MemoryIso;
    use crate::configdrive::Data;
    use crate::keys::Key;
    use crate::libvirt::memory::{fleet, MemoryNode};
    use crate::libvirt::DomainState;
    use crate::{VmConfig, VmState};
    use std::io::Read;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn repo(nodes: &[&str]) -> (VirtualMachineRepository, Vec<Arc<MemoryNode>>, ConfigDrive) {
        let (_connector, pool, handles) = fleet(nodes);
        for node in &handles {
            node.add_pool("vms", "/vms", 100 * GIB, 0, true);
            node.add_pool("default", "/pool", 100 * GIB, 0, true);
        }
        let drive = ConfigDrive::new(Arc::new(MemoryIso::default()));
        (
            VirtualMachineRepository::new(pool, drive.clone(), HashMap::new()),
            handles,
            drive,
        )
    }

    fn vm(node_id: &str, id: &str, volumes: Vec<VmVolume>) -> VirtualMachine {
        VirtualMachine {
            id: id.to_string(),
            node_id: node_id.to_string(),
            arch: Arch::Amd64,
            vcpus: 2,
            memory: Size::gib(1),
            guest_agent: true,
            graphic: Graphic {
                graphic_type: GraphicType::Vnc,
                listen: "127.0.0.1".to_string(),
                port: None,
            },
            volumes,
            interfaces: vec![VmInterface {
                mac: "52:54:00:aa:bb:cc".to_string(),
                model: String::new(),
                network_type: NetworkType::Bridge,
                network_name: "br0".to_string(),
                access_vlan: Some(100),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_create_then_get() {
        let (repo, nodes, _) = repo(&["n1"]);
        let root = nodes[0].add_volume("vms", "vm-a-root", "qcow2", 10 * GIB);
        let mut machine = vm(
            "n1",
            "vm-a",
            vec![VmVolume::new(&root, "root", DeviceType::Disk, DeviceBus::Virtio)],
        );
        repo.create(&mut machine).unwrap();
        assert_eq!(machine.volumes[0].device_name, "vda");

        let got = repo.get("vm-a", "n1").unwrap();
        assert_eq!(got.state, VmState::Stopped);
        assert_eq!(got.arch, Arch::Amd64);
        assert_eq!(got.vcpus, 2);
        assert_eq!(got.memory, Size::gib(1));
        assert!(got.guest_agent);
        assert_eq!(got.graphic.graphic_type, GraphicType::Vnc);
        assert_eq!(got.volumes, machine.volumes);
        assert_eq!(got.interfaces[0].mac, "52:54:00:aa:bb:cc");
        assert_eq!(got.interfaces[0].model, "virtio");
        assert_eq!(got.interfaces[0].access_vlan, Some(100));
        assert!(got.config.is_none());

        let domain = nodes[0].domain("vm-a").unwrap();
        let disk = &domain.xml.devices.disks[0];
        assert_eq!(disk.driver.as_ref().unwrap().kind.as_deref(), Some("qcow2"));
        assert_eq!(disk.alias.as_ref().unwrap().name, "ua-root");
    }

    #[test]
    fn test_get_recovers_config_drive() {
        let (repo, nodes, drive) = repo(&["n1"]);
        let config = VmConfig {
            hostname: "vm-a".to_string(),
            userdata: b"#cloud-config\n".to_vec(),
            keys: vec![Key::parse("ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAAAgQC7 ops").unwrap()],
        };
        let image = drive.generate(&Data::new(Format::OpenStack, &config)).unwrap();
        let iso = nodes[0].add_volume("default", "vm-a_config.iso", "iso", image.len() as u64);
        nodes[0].set_content(&iso, image);

        let mut machine = vm(
            "n1",
            "vm-a",
            vec![VmVolume::new(&iso, CONFIG_DRIVE_ALIAS, DeviceType::Cdrom, DeviceBus::Ide)],
        );
        repo.create(&mut machine).unwrap();

        let got = repo.get("vm-a", "n1").unwrap();
        assert_eq!(got.config, Some(config));
    }

    #[test]
    fn test_broken_config_drive_is_not_fatal() {
        let (repo, nodes, _) = repo(&["n1"]);
        let iso = nodes[0].add_volume("default", "vm-a_config.iso", "iso", 4);
        nodes[0].set_content(&iso, b"junk".to_vec());
        let mut machine = vm(
            "n1",
            "vm-a",
            vec![VmVolume::new(&iso, CONFIG_DRIVE_ALIAS, DeviceType::Cdrom, DeviceBus::Ide)],
        );
        repo.create(&mut machine).unwrap();
        assert!(repo.get("vm-a", "n1").unwrap().config.is_none());
    }

    #[test]
    fn test_unknown_state_is_left_alone() {
        let (repo, nodes, _) = repo(&["n1"]);
        let mut machine = vm("n1", "vm-a", Vec::new());
        repo.create(&mut machine).unwrap();
        nodes[0].set_state("vm-a", DomainState::Other);

        let got = repo.get("vm-a", "n1").unwrap();
        assert_eq!(got.state, VmState::Unknown);
        let calls = nodes[0].calls();
        assert!(!calls.iter().any(|c| c.starts_with("start_domain")));
        assert!(!calls.iter().any(|c| c.starts_with("destroy_domain")));
    }

    #[test]
    fn test_attach_volume_allocates_after_used_names() {
        let (repo, nodes, _) = repo(&["n1"]);
        let paths: Vec<String> = ["b", "c", "d", "e"]
            .iter()
            .map(|n| nodes[0].add_volume("vms", n, "raw", GIB))
            .collect();
        let mut volumes = vec![
            VmVolume::new(&paths[0], "b", DeviceType::Disk, DeviceBus::Virtio),
            VmVolume::new(&paths[1], "c", DeviceType::Cdrom, DeviceBus::Ide),
            VmVolume::new(&paths[2], "d", DeviceType::Disk, DeviceBus::Scsi),
        ];
        volumes[0].device_name = "vdb".to_string();
        volumes[1].device_name = "hdc".to_string();
        volumes[2].device_name = "sda".to_string();
        let mut machine = vm("n1", "vm-a", volumes);
        repo.create(&mut machine).unwrap();

        let mut extra = VmVolume::new(&paths[3], "e", DeviceType::Disk, DeviceBus::Virtio);
        repo.attach_volume("vm-a", "n1", &mut extra).unwrap();
        assert_eq!(extra.device_name, "vdc");
        assert!(nodes[0].calls().contains(&"attach_device vm-a live=false".to_string()));

        let got = repo.get("vm-a", "n1").unwrap();
        assert_eq!(got.volumes.len(), 4);
        assert_eq!(got.volumes[3].device_name, "vdc");

        repo.detach_volume("vm-a", "n1", &paths[3]).unwrap();
        assert_eq!(repo.get("vm-a", "n1").unwrap().volumes.len(), 3);
        assert!(repo
            .detach_volume("vm-a", "n1", &paths[3])
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_attach_volume_skips_empty_cdrom_target() {
        let (repo, nodes, _) = repo(&["n1"]);
        let path = nodes[0].add_volume("vms", "data", "raw", GIB);
        let mut domain = DomainXml {
            kind: "kvm".to_string(),
            name: "vm-x".to_string(),
            ..Default::default()
        };
        domain.devices.disks.push(DiskXml {
            kind: "file".to_string(),
            device: "cdrom".to_string(),
            target: DiskTargetXml {
                dev: "hda".to_string(),
                bus: Some("ide".to_string()),
            },
            readonly: Some(Empty {}),
            ..Default::default()
        });
        nodes[0].add_domain(domain, DomainState::Shutoff);

        let mut volume = VmVolume::new(&path, "data", DeviceType::Disk, DeviceBus::Ide);
        repo.attach_volume("vm-x", "n1", &mut volume).unwrap();
        assert_eq!(volume.device_name, "hdb");

        let targets: Vec<String> = nodes[0]
            .domain("vm-x")
            .unwrap()
            .xml
            .devices
            .disks
            .iter()
            .map(|d| d.target.dev.clone())
            .collect();
        assert_eq!(targets, vec!["hda", "hdb"]);
    }

    #[test]
    fn test_attach_interface_generates_mac() {
        let (repo, _nodes, _) = repo(&["n1"]);
        let mut machine = vm("n1", "vm-a", Vec::new());
        repo.create(&mut machine).unwrap();
        repo.start("vm-a", "n1").unwrap();

        let mut iface = VmInterface {
            network_type: NetworkType::Libvirt,
            network_name: "default".to_string(),
            ..Default::default()
        };
        repo.attach_interface("vm-a", "n1", &mut iface).unwrap();
        assert!(iface.mac.starts_with("52:54:00:"));
        assert_eq!(iface.mac.len(), 17);

        let got = repo.get("vm-a", "n1").unwrap();
        assert_eq!(got.interfaces.len(), 2);
        assert_eq!(got.interfaces[1].network_type, NetworkType::Libvirt);

        repo.detach_interface("vm-a", "n1", &iface.mac).unwrap();
        assert_eq!(repo.get("vm-a", "n1").unwrap().interfaces.len(), 1);
    }

    #[test]
    fn test_update_definition() {
        let (repo, nodes, _) = repo(&["n1"]);
        let mut machine = vm("n1", "vm-a", Vec::new());
        repo.create(&mut machine).unwrap();

        machine.vcpus = 4;
        machine.memory = Size::gib(2);
        machine.autostart = true;
        machine.guest_agent = false;
        machine.cpupin = Some(CpuPin {
            vcpus: [(0, parse_cpu_set("0-1")), (1, parse_cpu_set("2"))].into(),
            emulator: parse_cpu_set("3"),
        });
        repo.update(&machine).unwrap();

        let got = repo.get("vm-a", "n1").unwrap();
        assert_eq!(got.vcpus, 4);
        assert_eq!(got.memory, Size::gib(2));
        assert!(got.autostart);
        assert!(!got.guest_agent);
        assert_eq!(got.cpupin, machine.cpupin);
        let tune = nodes[0].domain("vm-a").unwrap().xml.cputune.unwrap();
        assert_eq!(tune.vcpupins[0].cpuset, "0-1");
    }

    #[test]
    fn test_power_actions_and_delete() {
        let (repo, nodes, _) = repo(&["n1"]);
        let mut machine = vm("n1", "vm-a", Vec::new());
        repo.create(&mut machine).unwrap();

        repo.start("vm-a", "n1").unwrap();
        assert!(repo.get("vm-a", "n1").unwrap().is_running());
        repo.reboot("vm-a", "n1").unwrap();
        repo.poweroff("vm-a", "n1").unwrap();
        assert_eq!(repo.get("vm-a", "n1").unwrap().state, VmState::Stopped);

        repo.start("vm-a", "n1").unwrap();
        repo.delete("vm-a", "n1").unwrap();
        assert!(nodes[0].domain("vm-a").is_none());
        assert!(repo.get("vm-a", "n1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_console_stream() {
        let (repo, _nodes, _) = repo(&["n1"]);
        let mut machine = vm("n1", "vm-a", Vec::new());
        repo.create(&mut machine).unwrap();

        let mut out = String::new();
        repo.console_stream("vm-a", "n1")
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "console vm-a");
        // autoport domains have no port until started by a real hypervisor
        assert!(repo.graphic_stream("vm-a", "n1").is_err());
    }

    #[test]
    fn test_list_across_nodes() {
        let (repo, nodes, _) = repo(&["n1", "n2"]);
        for (node, id) in [("n1", "b"), ("n2", "a"), ("n1", "a")] {
            repo.create(&mut vm(node, id, Vec::new())).unwrap();
        }
        nodes[1].fail("list_domains");

        let all = repo.list(&VirtualMachineListOptions::default()).unwrap();
        let ids: Vec<_> = all.iter().map(|v| (v.node_id.as_str(), v.id.as_str())).collect();
        assert_eq!(ids, vec![("n1", "a"), ("n1", "b")]);

        let only = repo
            .list(&VirtualMachineListOptions {
                node_ids: vec!["n1".to_string()],
            })
            .unwrap();
        assert_eq!(only.len(), 2);
    }
}
