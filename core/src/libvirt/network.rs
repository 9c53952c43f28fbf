use super::xml::{self, NetworkXml};
use super::ConnectionPool;
use crate::{Context, Network, NetworkListOptions, NetworkType, Result};
use std::sync::Arc;

/// Configured bridges plus the libvirt networks found on each node
#[derive(Debug)]
pub struct NetworkRepository {
    pool: Arc<ConnectionPool>,
    bridges: Vec<String>,
}

impl NetworkRepository {
    pub fn new(pool: Arc<ConnectionPool>, bridges: Vec<String>) -> Self {
        Self { pool, bridges }
    }

    pub fn list(&self, options: &NetworkListOptions) -> Result<Vec<Network>> {
        let mut networks = self.pool.fan_out(&options.node_ids, "networks", |lease| {
            let node_id = lease.node_id();
            let mut networks: Vec<Network> = self
                .bridges
                .iter()
                .map(|bridge| Network {
                    node_id: node_id.to_string(),
                    name: bridge.clone(),
                    network_type: NetworkType::Bridge,
                })
                .collect();
            for name in lease.list_networks().context("cannot list networks")? {
                let raw = lease
                    .network_xml(&name)
                    .with_context(|| format!("cannot get network xml of {}", name))?;
                let info: NetworkXml = xml::from_str(&raw)?;
                networks.push(Network {
                    node_id: node_id.to_string(),
                    name: info.name,
                    network_type: NetworkType::Libvirt,
                });
            }
            Ok(networks)
        });
        networks.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(networks)
    }
}
