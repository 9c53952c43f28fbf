use super::xml::{self, PoolXml};
use super::ConnectionPool;
use crate::{Context, Result, Size, VolumePool, VolumePoolListOptions};
use std::sync::Arc;

/// Storage pools; inactive pools are never returned
#[derive(Debug)]
pub struct VolumePoolRepository {
    pool: Arc<ConnectionPool>,
}

fn bytes(value: &xml::Scaled) -> Size {
    Size::from_bytes(value.to_bytes("bytes")).normalized()
}

impl VolumePoolRepository {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub fn list(&self, options: &VolumePoolListOptions) -> Result<Vec<VolumePool>> {
        let mut pools = self.pool.fan_out(&options.node_ids, "volume pools", |lease| {
            let mut pools = Vec::new();
            for name in lease.list_pools().context("cannot list pools")? {
                if !lease
                    .pool_is_active(&name)
                    .with_context(|| format!("cannot get state of pool {}", name))?
                {
                    continue;
                }
                let raw = lease
                    .pool_xml(&name)
                    .with_context(|| format!("cannot get pool xml of {}", name))?;
                let info: PoolXml = xml::from_str(&raw)?;
                pools.push(VolumePool {
                    node_id: lease.node_id().to_string(),
                    name: info.name.clone(),
                    size: bytes(&info.capacity),
                    used: bytes(&info.allocation),
                    free: bytes(&info.available),
                });
            }
            Ok(pools)
        });
        pools.sort_by(|a, b| (&a.node_id, &a.name).cmp(&(&b.node_id, &b.name)));
        Ok(pools)
    }
}
