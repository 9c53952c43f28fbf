//! Storage volumes

use super::xml::{self, DomainXml, FormatXml, Scaled, VolumeTargetXml, VolumeXml};
use super::{ConnectionPool, Hypervisor};
use crate::manifest::ImageManifestStore;
use crate::{
    Context, DeviceType, Error, Result, Size, Volume, VolumeCloneParams, VolumeCreateParams,
    VolumeFormat, VolumeListOptions, VolumeType,
};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;

#[derive(Debug)]
pub struct VolumeRepository {
    pool: Arc<ConnectionPool>,
    manifests: Arc<ImageManifestStore>,
    /// `(node, path)` pairs invisible to get, list and delete
    hidden: HashSet<(String, String)>,
}

fn volume_from_xml(node_id: &str, pool: &str, raw: &str) -> Result<Volume> {
    let info: VolumeXml = xml::from_str(raw)?;
    Ok(Volume {
        node_id: node_id.to_string(),
        pool: pool.to_string(),
        path: info.path().unwrap_or_default().to_string(),
        name: info.name.clone(),
        size: Size::from_bytes(info.capacity.to_bytes("bytes")).normalized(),
        format: info.format().map(VolumeFormat::parse).unwrap_or_default(),
        volume_type: info
            .kind
            .as_deref()
            .map(VolumeType::parse)
            .unwrap_or_default(),
        ..Default::default()
    })
}

fn new_volume_xml(name: &str, format: VolumeFormat, capacity: u64) -> VolumeXml {
    VolumeXml {
        kind: None,
        name: name.to_string(),
        key: None,
        capacity: Scaled::bytes(capacity),
        allocation: None,
        target: Some(VolumeTargetXml {
            path: None,
            format: Some(FormatXml {
                kind: format.as_str().to_string(),
            }),
        }),
        backing_store: None,
    }
}

/// Path -> (domain, device type) for every disk defined on the node
fn attachments(hv: &dyn Hypervisor) -> Result<HashMap<String, (String, DeviceType)>> {
    let mut attached = HashMap::new();
    for name in hv.list_domains().context("cannot list domains")? {
        let raw = match hv.domain_xml(&name, true) {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e).with_context(|| format!("cannot get domain xml of {}", name)),
        };
        let domain: DomainXml = xml::from_str(&raw)?;
        for disk in &domain.devices.disks {
            if let Some(path) = disk.source_path() {
                let device = DeviceType::parse(&disk.device).unwrap_or_default();
                attached.insert(path.to_string(), (domain.name.clone(), device));
            }
        }
    }
    Ok(attached)
}

impl VolumeRepository {
    pub fn new(
        pool: Arc<ConnectionPool>,
        manifests: Arc<ImageManifestStore>,
        hidden: HashSet<(String, String)>,
    ) -> Self {
        Self {
            pool,
            manifests,
            hidden,
        }
    }

    fn is_hidden(&self, node_id: &str, path: &str) -> bool {
        self.hidden
            .contains(&(node_id.to_string(), path.to_string()))
    }

    fn check_visible(&self, node_id: &str, path: &str) -> Result<()> {
        if self.is_hidden(node_id, path) {
            return Err(Error::not_found(format!("volume {} on {}", path, node_id)));
        }
        Ok(())
    }

    fn describe(&self, volumes: &mut [Volume]) -> Result<()> {
        let paths: Vec<String> = volumes.iter().map(|v| v.path.clone()).collect();
        let manifests = self
            .manifests
            .find_by_volume_paths(&paths)
            .context("cannot read image manifests")?;
        for volume in volumes.iter_mut() {
            if let Some(manifest) = manifests.get(&volume.path) {
                volume.image_description = Some(manifest.os.description());
            }
        }
        Ok(())
    }

    fn load(&self, hv: &dyn Hypervisor, node_id: &str, path: &str) -> Result<Volume> {
        let raw = hv
            .volume_xml(path)
            .with_context(|| format!("cannot get volume {}", path))?;
        let pool = hv
            .volume_pool(path)
            .with_context(|| format!("cannot get pool of volume {}", path))?;
        volume_from_xml(node_id, &pool, &raw)
    }

    pub fn get(&self, path: &str, node_id: &str) -> Result<Volume> {
        self.check_visible(node_id, path)?;
        let lease = self.pool.acquire(node_id)?;
        let mut volume = self.load(&*lease, node_id, path)?;
        lease.release();
        self.describe(std::slice::from_mut(&mut volume))?;
        Ok(volume)
    }

    /// Volumes of every active pool, with attachments and image descriptions filled
    pub fn list(&self, options: &VolumeListOptions) -> Result<Vec<Volume>> {
        let mut volumes = self.pool.fan_out(&options.node_ids, "volumes", |lease| {
            let node_id = lease.node_id();
            let mut volumes = Vec::new();
            for pool in lease.list_pools().context("cannot list pools")? {
                if !lease
                    .pool_is_active(&pool)
                    .with_context(|| format!("cannot get state of pool {}", pool))?
                {
                    continue;
                }
                let paths = lease
                    .list_volumes(&pool)
                    .with_context(|| format!("cannot list volumes of pool {}", pool))?;
                for path in paths {
                    if self.is_hidden(node_id, &path) {
                        continue;
                    }
                    let raw = lease
                        .volume_xml(&path)
                        .with_context(|| format!("cannot get volume {}", path))?;
                    volumes.push(volume_from_xml(node_id, &pool, &raw)?);
                }
            }

            let attached = attachments(&**lease)?;
            for volume in volumes.iter_mut() {
                if let Some((domain, device)) = attached.get(&volume.path) {
                    volume.attached_to = Some(domain.clone());
                    volume.attached_as = Some(*device);
                }
            }
            Ok(volumes)
        });
        self.describe(&mut volumes)?;
        volumes.sort_by(|a, b| (&a.node_id, &a.pool, &a.path).cmp(&(&b.node_id, &b.pool, &b.path)));
        Ok(volumes)
    }

    pub fn create(&self, params: &VolumeCreateParams) -> Result<Volume> {
        let lease = self.pool.acquire(&params.node_id)?;
        let definition = xml::to_string(&new_volume_xml(
            &params.name,
            params.format,
            params.size.bytes(),
        ))?;
        let prealloc = params.format == VolumeFormat::Qcow2;
        let path = lease
            .create_volume(&params.pool, &definition, prealloc)
            .with_context(|| format!("cannot create volume {} in {}", params.name, params.pool))?;
        self.load(&*lease, &params.node_id, &path)
    }

    /// Copy `original_path` into a new volume. A qcow2 copy keeps the
    /// original capacity and is grown afterwards; raw copies are written
    /// at the target size.
    pub fn clone_volume(&self, params: &VolumeCloneParams) -> Result<Volume> {
        let lease = self.pool.acquire(&params.node_id)?;
        let raw = lease
            .volume_xml(&params.original_path)
            .with_context(|| format!("cannot get volume {}", params.original_path))?;
        let original: VolumeXml = xml::from_str(&raw)?;
        let original_capacity = original.capacity.to_bytes("bytes");
        let target = params.new_size.bytes();

        let capacity = match params.new_format {
            VolumeFormat::Qcow2 => original_capacity,
            _ => target.max(original_capacity),
        };
        let definition = xml::to_string(&new_volume_xml(&params.new_name, params.new_format, capacity))?;
        let path = lease
            .clone_volume(&params.new_pool, &definition, &params.original_path)
            .with_context(|| {
                format!(
                    "cannot clone volume {} into {}",
                    params.original_path, params.new_name
                )
            })?;

        if params.new_format == VolumeFormat::Qcow2 && target > original_capacity {
            lease
                .resize_volume(&path, target)
                .with_context(|| format!("cannot resize volume {}", path))?;
        }
        self.load(&*lease, &params.node_id, &path)
    }

    pub fn resize(&self, path: &str, node_id: &str, size: Size) -> Result<()> {
        self.check_visible(node_id, path)?;
        let lease = self.pool.acquire(node_id)?;
        lease
            .resize_volume(path, size.bytes())
            .with_context(|| format!("cannot resize volume {}", path))
    }

    pub fn delete(&self, path: &str, node_id: &str) -> Result<()> {
        self.check_visible(node_id, path)?;
        let lease = self.pool.acquire(node_id)?;
        lease
            .delete_volume(path)
            .with_context(|| format!("cannot delete volume {}", path))
    }

    /// Stream `size` bytes of `content` into the volume
    pub fn upload(&self, path: &str, node_id: &str, content: &mut dyn Read, size: u64) -> Result<()> {
        let lease = self.pool.acquire(node_id)?;
        lease
            .upload_volume(path, content, size)
            .with_context(|| format!("cannot upload volume {}", path))
    }
}
