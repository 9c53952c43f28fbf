//! Node capabilities and host summaries

use super::xml::{self, CapabilitiesXml, Scaled, SysinfoXml};
use super::{ConnectionPool, Hypervisor};
use crate::{
    Arch, Context, HostInfo, HugePages, Node, NodeListOptions, NumaCell, NumaCore, Result, Size,
};
use std::collections::BTreeMap;
use std::sync::Arc;

const PAGE_4K: u64 = 4 * 1024;
const PAGE_2M: u64 = 2 * 1024 * 1024;
const PAGE_1G: u64 = 1024 * 1024 * 1024;

fn node_from_xml(node_id: &str, caps: &CapabilitiesXml, sysinfo: &SysinfoXml) -> Node {
    let host = &caps.host;
    let cells = host
        .topology
        .as_ref()
        .map(|t| t.cells.cells.as_slice())
        .unwrap_or_default();

    let numas = cells
        .iter()
        .map(|cell| {
            let mut pages = HugePages::default();
            for p in &cell.pages {
                let size = Scaled {
                    unit: p.unit.clone(),
                    value: p.size,
                }
                .to_bytes("KiB");
                match size {
                    PAGE_4K => pages.count_4k = p.count,
                    PAGE_2M => pages.count_2m = p.count,
                    PAGE_1G => pages.count_1g = p.count,
                    _ => {}
                }
            }

            let mut cores: BTreeMap<u32, NumaCore> = BTreeMap::new();
            for cpu in cell.cpus.iter().flat_map(|c| c.cpus.iter()) {
                let core = cores
                    .entry(cpu.core_id.unwrap_or(cpu.id))
                    .or_insert_with(|| NumaCore {
                        socket_id: cpu.socket_id.unwrap_or_default(),
                        cpus: Vec::new(),
                    });
                core.cpus.push(cpu.id);
            }

            NumaCell {
                id: cell.id,
                memory: Size::from_bytes(cell.memory.to_bytes("KiB")).normalized(),
                pages,
                cores,
            }
        })
        .collect();

    // sysinfo carries the marketing name; capabilities only the libvirt model
    let cpu_model = sysinfo
        .processors
        .iter()
        .find_map(|p| p.entry("version").filter(|v| !v.is_empty()))
        .map(String::from)
        .or_else(|| host.cpu.model.clone())
        .unwrap_or_default();

    Node {
        id: node_id.to_string(),
        arch: Arch::from_libvirt(&host.cpu.arch),
        cpu_vendor: host.cpu.vendor.clone().unwrap_or_default(),
        cpu_model,
        iommu: host.iommu.as_ref().is_some_and(|i| i.support == "yes"),
        numas,
    }
}

fn load_node(hv: &dyn Hypervisor, node_id: &str) -> Result<Node> {
    let caps: CapabilitiesXml =
        xml::from_str(&hv.capabilities().context("cannot get capabilities")?)?;
    let sysinfo: SysinfoXml = xml::from_str(&hv.sysinfo().context("cannot get sysinfo")?)?;
    Ok(node_from_xml(node_id, &caps, &sysinfo))
}

#[derive(Debug)]
pub struct NodeRepository {
    pool: Arc<ConnectionPool>,
}

impl NodeRepository {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub fn get(&self, node_id: &str) -> Result<Node> {
        let lease = self.pool.acquire(node_id)?;
        load_node(&*lease, node_id)
    }

    pub fn list(&self, options: &NodeListOptions) -> Result<Vec<Node>> {
        let mut nodes = self.pool.fan_out(&options.node_ids, "nodes", |lease| {
            Ok(vec![load_node(&**lease, lease.node_id())?])
        });
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }
}

#[derive(Debug)]
pub struct HostInfoRepository {
    pool: Arc<ConnectionPool>,
}

fn load_host_info(hv: &dyn Hypervisor, node_id: &str) -> Result<HostInfo> {
    let node = load_node(hv, node_id)?;
    let hostname = hv.hostname().context("cannot get hostname")?;
    Ok(HostInfo {
        node_id: node_id.to_string(),
        hostname,
        arch: node.arch,
        memory: node.memory().normalized(),
        cpus: node.cpu_count(),
    })
}

impl HostInfoRepository {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub fn get(&self, node_id: &str) -> Result<HostInfo> {
        let lease = self.pool.acquire(node_id)?;
        load_host_info(&*lease, node_id)
    }

    pub fn list(&self, options: &NodeListOptions) -> Result<Vec<HostInfo>> {
        let mut hosts = self.pool.fan_out(&options.node_ids, "host info", |lease| {
            Ok(vec![load_host_info(&**lease, lease.node_id())?])
        });
        hosts.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(hosts)
    }
}
