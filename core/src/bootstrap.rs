//! Wiring of the compute service from a loaded config

use crate::compute::{Service, VirtualMachineManager};
use crate::config::Config;
use crate::configdrive::{ConfigDrive, GenIsoImage, IsoBackend};
use crate::events::ScriptedBroker;
use crate::keys::KeyStore;
use crate::libvirt::{
    ConnectionPool, Connector, HostInfoRepository, NetworkRepository, NodeRepository,
    VirshConnector, VirtualMachineRepository, VolumePoolRepository, VolumeRepository,
};
use crate::manifest::ImageManifestStore;
use crate::Result;
use log::debug;
use std::sync::Arc;

impl Service {
    /// Production service: `virsh` sessions and `genisoimage` config drives
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::with_backends(
            config,
            Arc::new(VirshConnector::new()),
            Arc::new(GenIsoImage::new()),
        )
    }

    pub fn with_backends(
        config: &Config,
        connector: Arc<dyn Connector>,
        iso: Arc<dyn IsoBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let nodes = config.nodes();
        debug!(
            "configuring nodes: {}",
            nodes
                .iter()
                .map(|(id, uri)| format!("{}={}", id, uri))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let pool = Arc::new(ConnectionPool::new(connector, nodes.clone()));
        let config_drive = ConfigDrive::new(iso);
        let images = Arc::new(ImageManifestStore::new(config.image_manifest_path()));

        let settings: std::collections::HashMap<_, _> = nodes
            .iter()
            .map(|(id, _)| (id.clone(), config.node_settings(id)))
            .collect();
        let drive_formats = settings
            .iter()
            .map(|(id, s)| (id.clone(), s.config_drive_format))
            .collect();

        let vms = Arc::new(VirtualMachineRepository::new(
            pool.clone(),
            config_drive.clone(),
            drive_formats,
        ));
        let volumes = Arc::new(VolumeRepository::new(
            pool.clone(),
            images.clone(),
            config.hidden_volumes(),
        ));
        let manager = VirtualMachineManager::new(
            vms.clone(),
            volumes.clone(),
            images.clone(),
            config_drive,
            settings,
            Arc::new(ScriptedBroker::from_config(&config.subscriptions)),
        );

        Ok(Service {
            vms,
            volumes,
            pools: VolumePoolRepository::new(pool.clone()),
            networks: NetworkRepository::new(pool.clone(), config.bridges.clone()),
            nodes: NodeRepository::new(pool.clone()),
            hosts: HostInfoRepository::new(pool),
            keys: KeyStore::new(config.key_file_path()),
            images,
            manager,
        })
    }
}
