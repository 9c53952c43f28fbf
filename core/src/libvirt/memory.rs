//! In-memory hypervisor used by the repository and manager tests

use super::xml::{
    self, DiskXml, DomainXml, EmulatorPinXml, InterfaceXml, PoolTargetXml, PoolXml, Scaled,
    VcpuPinXml, VolumeTargetXml, VolumeXml, FormatXml, ChannelXml, CputuneXml, NetworkXml,
    BridgeXml,
};
use super::{ConnectionPool, Connector, DomainState, Hypervisor, Stream};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Cursor, Read};
use std::sync::Arc;

pub const CAPABILITIES: &str = r#"<capabilities>
  <host>
    <uuid>0b1c2d3e-0000-0000-0000-000000000001</uuid>
    <cpu>
      <arch>x86_64</arch>
      <model>Skylake-Client-IBRS</model>
      <vendor>Intel</vendor>
      <topology sockets='1' dies='1' cores='2' threads='2'/>
    </cpu>
    <iommu support='yes'/>
    <topology>
      <cells num='2'>
        <cell id='0'>
          <memory unit='KiB'>8388608</memory>
          <pages unit='KiB' size='4'>2097152</pages>
          <pages unit='KiB' size='2048'>16</pages>
          <pages unit='KiB' size='1048576'>0</pages>
          <cpus num='4'>
            <cpu id='0' socket_id='0' die_id='0' core_id='0' siblings='0,2'/>
            <cpu id='1' socket_id='0' die_id='0' core_id='1' siblings='1,3'/>
            <cpu id='2' socket_id='0' die_id='0' core_id='0' siblings='0,2'/>
            <cpu id='3' socket_id='0' die_id='0' core_id='1' siblings='1,3'/>
          </cpus>
        </cell>
        <cell id='1'>
          <memory unit='KiB'>4194304</memory>
          <pages unit='KiB' size='4'>1048576</pages>
          <pages unit='KiB' size='2048'>0</pages>
          <pages unit='KiB' size='1048576'>1</pages>
          <cpus num='2'>
            <cpu id='4' socket_id='1' die_id='0' core_id='0' siblings='4'/>
            <cpu id='5' socket_id='1' die_id='0' core_id='1' siblings='5'/>
          </cpus>
        </cell>
      </cells>
    </topology>
  </host>
  <guest>
    <os_type>hvm</os_type>
  </guest>
</capabilities>"#;

pub const SYSINFO: &str = r#"<sysinfo type='smbios'>
  <bios><entry name='vendor'>SeaBIOS</entry></bios>
  <processor>
    <entry name='socket_destination'>CPU 0</entry>
    <entry name='manufacturer'>Intel(R) Corporation</entry>
    <entry name='version'>Intel(R) Core(TM) i7-8550U CPU @ 1.80GHz</entry>
  </processor>
</sysinfo>"#;

#[derive(Debug, Clone)]
pub struct FakeDomain {
    pub xml: DomainXml,
    pub state: DomainState,
    pub autostart: bool,
}

#[derive(Debug, Clone)]
pub struct FakePool {
    pub xml: PoolXml,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct FakeVolume {
    pub pool: String,
    pub xml: VolumeXml,
    pub content: Vec<u8>,
    pub prealloc_metadata: bool,
    pub cloned_from: Option<String>,
}

impl FakeVolume {
    pub fn capacity(&self) -> u64 {
        self.xml.capacity.to_bytes("bytes")
    }
}

#[derive(Debug)]
struct State {
    alive: bool,
    hostname: String,
    domains: BTreeMap<String, FakeDomain>,
    pools: BTreeMap<String, FakePool>,
    volumes: BTreeMap<String, FakeVolume>,
    networks: BTreeMap<String, NetworkXml>,
    failing: HashSet<String>,
    calls: Vec<String>,
}

/// State of one fake node, shared by every session opened to it
#[derive(Debug)]
pub struct MemoryNode {
    state: Mutex<State>,
}

impl MemoryNode {
    fn new(hostname: &str) -> Self {
        Self {
            state: Mutex::new(State {
                alive: true,
                hostname: hostname.to_string(),
                domains: BTreeMap::new(),
                pools: BTreeMap::new(),
                volumes: BTreeMap::new(),
                networks: BTreeMap::new(),
                failing: HashSet::new(),
                calls: Vec::new(),
            }),
        }
    }

    pub fn set_alive(&self, alive: bool) {
        self.state.lock().alive = alive;
    }

    /// Make every call of the named trait method fail
    pub fn fail(&self, op: &str) {
        self.state.lock().failing.insert(op.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn add_pool(&self, name: &str, target: &str, capacity: u64, allocation: u64, active: bool) {
        let xml = PoolXml {
            kind: "dir".to_string(),
            name: name.to_string(),
            capacity: Scaled::bytes(capacity),
            allocation: Scaled::bytes(allocation),
            available: Scaled::bytes(capacity.saturating_sub(allocation)),
            target: Some(PoolTargetXml {
                path: target.to_string(),
            }),
        };
        self.state
            .lock()
            .pools
            .insert(name.to_string(), FakePool { xml, active });
    }

    pub fn add_volume(&self, pool: &str, name: &str, format: &str, capacity: u64) -> String {
        let mut state = self.state.lock();
        let target = state
            .pools
            .get(pool)
            .and_then(|p| p.xml.target.clone())
            .map(|t| t.path)
            .unwrap_or_else(|| format!("/{}", pool));
        let path = format!("{}/{}", target, name);
        let xml = volume_xml(name, &path, format, capacity);
        state.volumes.insert(
            path.clone(),
            FakeVolume {
                pool: pool.to_string(),
                xml,
                content: Vec::new(),
                prealloc_metadata: false,
                cloned_from: None,
            },
        );
        path
    }

    pub fn add_network(&self, name: &str, bridge: &str) {
        let xml = NetworkXml {
            name: name.to_string(),
            forward: None,
            bridge: Some(BridgeXml {
                name: Some(bridge.to_string()),
            }),
        };
        self.state.lock().networks.insert(name.to_string(), xml);
    }

    pub fn add_domain(&self, xml: DomainXml, state: DomainState) {
        self.state.lock().domains.insert(
            xml.name.clone(),
            FakeDomain {
                xml,
                state,
                autostart: false,
            },
        );
    }

    pub fn set_state(&self, name: &str, state: DomainState) {
        if let Some(d) = self.state.lock().domains.get_mut(name) {
            d.state = state;
        }
    }

    pub fn domain(&self, name: &str) -> Option<FakeDomain> {
        self.state.lock().domains.get(name).cloned()
    }

    pub fn volume(&self, path: &str) -> Option<FakeVolume> {
        self.state.lock().volumes.get(path).cloned()
    }

    pub fn set_content(&self, path: &str, content: Vec<u8>) {
        if let Some(v) = self.state.lock().volumes.get_mut(path) {
            v.content = content;
        }
    }

    pub fn volume_paths(&self) -> Vec<String> {
        self.state.lock().volumes.keys().cloned().collect()
    }
}

fn volume_xml(name: &str, path: &str, format: &str, capacity: u64) -> VolumeXml {
    VolumeXml {
        kind: Some("file".to_string()),
        name: name.to_string(),
        key: Some(path.to_string()),
        capacity: Scaled::bytes(capacity),
        allocation: Some(Scaled::bytes(0)),
        target: Some(VolumeTargetXml {
            path: Some(path.to_string()),
            format: Some(FormatXml {
                kind: format.to_string(),
            }),
        }),
        backing_store: None,
    }
}

pub struct MemoryHypervisor {
    node: Arc<MemoryNode>,
}

impl MemoryHypervisor {
    fn call<T>(&self, op: &str, detail: &str, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut state = self.node.state.lock();
        if state.failing.contains(op) {
            return Err(Error::libvirt(format!("{} failed: injected failure", op)));
        }
        state.calls.push(format!("{} {}", op, detail).trim_end().to_string());
        f(&mut *state)
    }
}

fn domain_mut<'a>(state: &'a mut State, name: &str) -> Result<&'a mut FakeDomain> {
    state
        .domains
        .get_mut(name)
        .ok_or_else(|| Error::not_found(format!("domain {}", name)))
}

fn volume_ref<'a>(state: &'a State, path: &str) -> Result<&'a FakeVolume> {
    state
        .volumes
        .get(path)
        .ok_or_else(|| Error::not_found(format!("storage volume {}", path)))
}

fn pool_target(state: &State, pool: &str) -> Result<String> {
    let pool = state
        .pools
        .get(pool)
        .ok_or_else(|| Error::not_found(format!("storage pool {}", pool)))?;
    Ok(pool
        .xml
        .target
        .as_ref()
        .map(|t| t.path.clone())
        .unwrap_or_default())
}

fn new_volume(state: &mut State, pool: &str, xml: &str) -> Result<(String, VolumeXml)> {
    let target = pool_target(state, pool)?;
    let mut parsed: VolumeXml = xml::from_str(xml)?;
    let path = format!("{}/{}", target, parsed.name);
    if state.volumes.contains_key(&path) {
        return Err(Error::libvirt(format!("storage volume {} already exists", path)));
    }
    let format = parsed
        .format()
        .map(|f| f.to_string())
        .unwrap_or_else(|| "raw".to_string());
    let capacity = parsed.capacity.to_bytes("bytes");
    parsed = VolumeXml {
        backing_store: parsed.backing_store.take(),
        ..volume_xml(&parsed.name, &path, &format, capacity)
    };
    Ok((path, parsed))
}

impl Hypervisor for MemoryHypervisor {
    fn is_alive(&self) -> Result<bool> {
        Ok(self.node.state.lock().alive)
    }

    fn hostname(&self) -> Result<String> {
        self.call("hostname", "", |s| Ok(s.hostname.clone()))
    }

    fn capabilities(&self) -> Result<String> {
        self.call("capabilities", "", |_| Ok(CAPABILITIES.to_string()))
    }

    fn sysinfo(&self) -> Result<String> {
        self.call("sysinfo", "", |_| Ok(SYSINFO.to_string()))
    }

    fn list_domains(&self) -> Result<Vec<String>> {
        self.call("list_domains", "", |s| Ok(s.domains.keys().cloned().collect()))
    }

    fn domain_xml(&self, name: &str, _inactive: bool) -> Result<String> {
        self.call("domain_xml", name, |s| xml::to_string(&domain_mut(s, name)?.xml))
    }

    fn domain_state(&self, name: &str) -> Result<DomainState> {
        self.call("domain_state", name, |s| Ok(domain_mut(s, name)?.state))
    }

    fn domain_autostart(&self, name: &str) -> Result<bool> {
        self.call("domain_autostart", name, |s| Ok(domain_mut(s, name)?.autostart))
    }

    fn define_domain(&self, xml: &str) -> Result<()> {
        let parsed: DomainXml = xml::from_str(xml)?;
        self.call("define_domain", &parsed.name.clone(), |s| {
            match s.domains.get_mut(&parsed.name) {
                Some(existing) => existing.xml = parsed,
                None => {
                    s.domains.insert(
                        parsed.name.clone(),
                        FakeDomain {
                            xml: parsed,
                            state: DomainState::Shutoff,
                            autostart: false,
                        },
                    );
                }
            }
            Ok(())
        })
    }

    fn undefine_domain(&self, name: &str) -> Result<()> {
        self.call("undefine_domain", name, |s| {
            s.domains
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| Error::not_found(format!("domain {}", name)))
        })
    }

    fn start_domain(&self, name: &str) -> Result<()> {
        self.call("start_domain", name, |s| {
            let domain = domain_mut(s, name)?;
            if domain.state == DomainState::Running {
                return Err(Error::libvirt("domain is already active"));
            }
            domain.state = DomainState::Running;
            Ok(())
        })
    }

    fn destroy_domain(&self, name: &str) -> Result<()> {
        self.call("destroy_domain", name, |s| {
            let domain = domain_mut(s, name)?;
            if domain.state != DomainState::Running {
                return Err(Error::libvirt("domain is not running"));
            }
            domain.state = DomainState::Shutoff;
            Ok(())
        })
    }

    fn reboot_domain(&self, name: &str) -> Result<()> {
        self.call("reboot_domain", name, |s| {
            if domain_mut(s, name)?.state != DomainState::Running {
                return Err(Error::libvirt("domain is not running"));
            }
            Ok(())
        })
    }

    fn set_autostart(&self, name: &str, autostart: bool) -> Result<()> {
        self.call("set_autostart", name, |s| {
            domain_mut(s, name)?.autostart = autostart;
            Ok(())
        })
    }

    fn attach_device(&self, name: &str, device: &str, live: bool) -> Result<()> {
        let detail = format!("{} live={}", name, live);
        self.call("attach_device", &detail, |s| {
            let devices = &mut domain_mut(s, name)?.xml.devices;
            let device = device.trim_start();
            if device.starts_with("<disk") {
                devices.disks.push(xml::from_str::<DiskXml>(device)?);
            } else if device.starts_with("<interface") {
                devices.interfaces.push(xml::from_str::<InterfaceXml>(device)?);
            } else if device.starts_with("<channel") {
                devices.channels.push(xml::from_str::<ChannelXml>(device)?);
            } else {
                return Err(Error::libvirt("unsupported device"));
            }
            Ok(())
        })
    }

    fn detach_device(&self, name: &str, device: &str, live: bool) -> Result<()> {
        let detail = format!("{} live={}", name, live);
        self.call("detach_device", &detail, |s| {
            let devices = &mut domain_mut(s, name)?.xml.devices;
            let device = device.trim_start();
            let before = devices.disks.len() + devices.interfaces.len() + devices.channels.len();
            if device.starts_with("<disk") {
                let disk: DiskXml = xml::from_str(device)?;
                devices.disks.retain(|d| d.target.dev != disk.target.dev);
            } else if device.starts_with("<interface") {
                let iface: InterfaceXml = xml::from_str(device)?;
                devices.interfaces.retain(|i| i.mac != iface.mac);
            } else if device.starts_with("<channel") {
                let channel: ChannelXml = xml::from_str(device)?;
                devices.channels.retain(|c| c.target.name != channel.target.name);
            }
            let after = devices.disks.len() + devices.interfaces.len() + devices.channels.len();
            if before == after {
                return Err(Error::not_found("matching device"));
            }
            Ok(())
        })
    }

    fn set_vcpus(&self, name: &str, count: u32) -> Result<()> {
        self.call("set_vcpus", name, |s| {
            domain_mut(s, name)?.xml.vcpu.count = count;
            Ok(())
        })
    }

    fn set_memory(&self, name: &str, kibibytes: u64) -> Result<()> {
        self.call("set_memory", name, |s| {
            domain_mut(s, name)?.xml.memory = Scaled {
                unit: Some("KiB".to_string()),
                value: kibibytes,
            };
            Ok(())
        })
    }

    fn pin_vcpu(&self, name: &str, vcpu: u32, cpuset: &str) -> Result<()> {
        self.call("pin_vcpu", name, |s| {
            let tune = domain_mut(s, name)?
                .xml
                .cputune
                .get_or_insert_with(CputuneXml::default);
            tune.vcpupins.retain(|p| p.vcpu != vcpu);
            tune.vcpupins.push(VcpuPinXml {
                vcpu,
                cpuset: cpuset.to_string(),
            });
            Ok(())
        })
    }

    fn pin_emulator(&self, name: &str, cpuset: &str) -> Result<()> {
        self.call("pin_emulator", name, |s| {
            domain_mut(s, name)?
                .xml
                .cputune
                .get_or_insert_with(CputuneXml::default)
                .emulatorpin = Some(EmulatorPinXml {
                cpuset: cpuset.to_string(),
            });
            Ok(())
        })
    }

    fn open_console(&self, name: &str) -> Result<Box<dyn Stream>> {
        self.call("open_console", name, |s| {
            domain_mut(s, name)?;
            Ok(Box::new(Cursor::new(format!("console {}", name).into_bytes())) as Box<dyn Stream>)
        })
    }

    fn open_graphic(&self, name: &str) -> Result<Box<dyn Stream>> {
        self.call("open_graphic", name, |s| {
            let domain = domain_mut(s, name)?;
            let port = domain
                .xml
                .devices
                .graphics
                .first()
                .and_then(|g| g.port)
                .filter(|p| *p > 0)
                .ok_or_else(|| Error::libvirt("domain has no graphics port"))?;
            Ok(Box::new(Cursor::new(format!("graphic {}:{}", name, port).into_bytes()))
                as Box<dyn Stream>)
        })
    }

    fn list_pools(&self) -> Result<Vec<String>> {
        self.call("list_pools", "", |s| Ok(s.pools.keys().cloned().collect()))
    }

    fn pool_xml(&self, pool: &str) -> Result<String> {
        self.call("pool_xml", pool, |s| {
            let found = s
                .pools
                .get(pool)
                .ok_or_else(|| Error::not_found(format!("storage pool {}", pool)))?;
            xml::to_string(&found.xml)
        })
    }

    fn pool_is_active(&self, pool: &str) -> Result<bool> {
        self.call("pool_is_active", pool, |s| {
            s.pools
                .get(pool)
                .map(|p| p.active)
                .ok_or_else(|| Error::not_found(format!("storage pool {}", pool)))
        })
    }

    fn list_volumes(&self, pool: &str) -> Result<Vec<String>> {
        self.call("list_volumes", pool, |s| {
            pool_target(s, pool)?;
            Ok(s.volumes
                .iter()
                .filter(|(_, v)| v.pool == pool)
                .map(|(path, _)| path.clone())
                .collect())
        })
    }

    fn volume_xml(&self, path: &str) -> Result<String> {
        self.call("volume_xml", path, |s| xml::to_string(&volume_ref(s, path)?.xml))
    }

    fn volume_pool(&self, path: &str) -> Result<String> {
        self.call("volume_pool", path, |s| Ok(volume_ref(s, path)?.pool.clone()))
    }

    fn create_volume(&self, pool: &str, xml: &str, prealloc_metadata: bool) -> Result<String> {
        let detail = format!("{} prealloc={}", pool, prealloc_metadata);
        self.call("create_volume", &detail, |s| {
            let (path, parsed) = new_volume(s, pool, xml)?;
            s.volumes.insert(
                path.clone(),
                FakeVolume {
                    pool: pool.to_string(),
                    xml: parsed,
                    content: Vec::new(),
                    prealloc_metadata,
                    cloned_from: None,
                },
            );
            Ok(path)
        })
    }

    fn clone_volume(&self, pool: &str, xml: &str, original: &str) -> Result<String> {
        let detail = format!("{} from={}", pool, original);
        self.call("clone_volume", &detail, |s| {
            let content = volume_ref(s, original)?.content.clone();
            let (path, parsed) = new_volume(s, pool, xml)?;
            s.volumes.insert(
                path.clone(),
                FakeVolume {
                    pool: pool.to_string(),
                    xml: parsed,
                    content,
                    prealloc_metadata: false,
                    cloned_from: Some(original.to_string()),
                },
            );
            Ok(path)
        })
    }

    fn resize_volume(&self, path: &str, bytes: u64) -> Result<()> {
        let detail = format!("{} {}", path, bytes);
        self.call("resize_volume", &detail, |s| {
            let volume = s
                .volumes
                .get_mut(path)
                .ok_or_else(|| Error::not_found(format!("storage volume {}", path)))?;
            if bytes < volume.capacity() {
                return Err(Error::libvirt("cannot shrink storage volume"));
            }
            volume.xml.capacity = Scaled::bytes(bytes);
            Ok(())
        })
    }

    fn delete_volume(&self, path: &str) -> Result<()> {
        self.call("delete_volume", path, |s| {
            s.volumes
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| Error::not_found(format!("storage volume {}", path)))
        })
    }

    fn upload_volume(&self, path: &str, content: &mut dyn Read, length: u64) -> Result<()> {
        let mut data = Vec::new();
        content.read_to_end(&mut data)?;
        self.call("upload_volume", path, |s| {
            if data.len() as u64 != length {
                return Err(Error::libvirt("stream length mismatch"));
            }
            let volume = s
                .volumes
                .get_mut(path)
                .ok_or_else(|| Error::not_found(format!("storage volume {}", path)))?;
            volume.content = data;
            Ok(())
        })
    }

    fn download_volume(&self, path: &str) -> Result<Vec<u8>> {
        self.call("download_volume", path, |s| Ok(volume_ref(s, path)?.content.clone()))
    }

    fn list_networks(&self) -> Result<Vec<String>> {
        self.call("list_networks", "", |s| Ok(s.networks.keys().cloned().collect()))
    }

    fn network_xml(&self, name: &str) -> Result<String> {
        self.call("network_xml", name, |s| {
            let network = s
                .networks
                .get(name)
                .ok_or_else(|| Error::not_found(format!("network {}", name)))?;
            xml::to_string(network)
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryConnector {
    nodes: Mutex<HashMap<String, Arc<MemoryNode>>>,
    refused: Mutex<HashSet<String>>,
    connects: Mutex<HashMap<String, usize>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, uri: &str) -> Arc<MemoryNode> {
        let hostname = uri.rsplit('/').next().unwrap_or(uri);
        self.nodes
            .lock()
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(MemoryNode::new(hostname)))
            .clone()
    }

    pub fn refuse(&self, uri: &str) {
        self.refused.lock().insert(uri.to_string());
    }

    pub fn accept(&self, uri: &str) {
        self.refused.lock().remove(uri);
    }

    pub fn connects(&self, uri: &str) -> usize {
        self.connects.lock().get(uri).copied().unwrap_or(0)
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, uri: &str) -> Result<Box<dyn Hypervisor>> {
        if self.refused.lock().contains(uri) {
            return Err(Error::libvirt(format!("cannot connect to {}: connection refused", uri)));
        }
        let node = self
            .nodes
            .lock()
            .get(uri)
            .cloned()
            .ok_or_else(|| Error::libvirt(format!("no hypervisor at {}", uri)))?;
        node.set_alive(true);
        *self.connects.lock().entry(uri.to_string()).or_insert(0) += 1;
        Ok(Box::new(MemoryHypervisor { node }))
    }
}

/// Fake fleet: each node id `n` is reachable at `mem://n`
pub fn fleet(nodes: &[&str]) -> (Arc<MemoryConnector>, Arc<ConnectionPool>, Vec<Arc<MemoryNode>>) {
    let connector = Arc::new(MemoryConnector::new());
    let handles = nodes
        .iter()
        .map(|n| connector.add_node(&format!("mem://{}", n)))
        .collect();
    let pool = ConnectionPool::new(
        connector.clone(),
        nodes
            .iter()
            .map(|n| (n.to_string(), format!("mem://{}", n)))
            .collect(),
    );
    (connector, Arc::new(pool), handles)
}
