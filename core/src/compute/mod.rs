//! Compute facade: the single entry point front ends talk to

mod manager;

pub use manager::{CloneVolumeRequest, CreateRequest, CreateVolumeRequest, VirtualMachineManager};

use crate::keys::{Key, KeyStore};
use crate::libvirt::{
    HostInfoRepository, NetworkRepository, NodeRepository, Stream, VirtualMachineRepository,
    VolumePoolRepository, VolumeRepository,
};
use crate::manifest::ImageManifestStore;
use crate::{
    HostInfo, ImageManifest, Network, NetworkListOptions, Node, NodeListOptions, Result, Size,
    VirtualMachine, VirtualMachineListOptions, VmAction, VmInterface, VmVolume, Volume,
    VolumeCloneParams, VolumeCreateParams, VolumeListOptions, VolumePool, VolumePoolListOptions,
};
use std::io::Read;
use std::sync::Arc;

#[derive(Debug)]
pub struct Service {
    pub(crate) vms: Arc<VirtualMachineRepository>,
    pub(crate) volumes: Arc<VolumeRepository>,
    pub(crate) pools: VolumePoolRepository,
    pub(crate) networks: NetworkRepository,
    pub(crate) nodes: NodeRepository,
    pub(crate) hosts: HostInfoRepository,
    pub(crate) keys: KeyStore,
    pub(crate) images: Arc<ImageManifestStore>,
    pub(crate) manager: VirtualMachineManager,
}

impl Service {
    // ==================== Virtual machines ====================

    pub fn vm_list(&self, options: &VirtualMachineListOptions) -> Result<Vec<VirtualMachine>> {
        self.vms.list(options)
    }

    pub fn vm_detail(&self, id: &str, node_id: &str) -> Result<VirtualMachine> {
        self.vms.get(id, node_id)
    }

    pub fn vm_create(&self, req: CreateRequest) -> Result<VirtualMachine> {
        self.manager.create(req)
    }

    pub fn vm_update(&self, vm: &VirtualMachine) -> Result<()> {
        self.vms.update(vm)
    }

    pub fn vm_delete(&self, id: &str, node_id: &str, delete_volumes: bool) -> Result<()> {
        self.manager.delete(id, node_id, delete_volumes)
    }

    /// Run `start`, `reboot` or `poweroff`
    pub fn vm_action(&self, id: &str, node_id: &str, action: &str) -> Result<()> {
        match action.parse::<VmAction>()? {
            VmAction::Start => self.vms.start(id, node_id),
            VmAction::Reboot => self.vms.reboot(id, node_id),
            VmAction::Poweroff => self.vms.poweroff(id, node_id),
        }
    }

    pub fn vm_attach_volume(&self, id: &str, node_id: &str, volume: &mut VmVolume) -> Result<()> {
        self.vms.attach_volume(id, node_id, volume)
    }

    pub fn vm_detach_volume(&self, id: &str, node_id: &str, path: &str) -> Result<()> {
        self.vms.detach_volume(id, node_id, path)
    }

    pub fn vm_attach_interface(
        &self,
        id: &str,
        node_id: &str,
        iface: &mut VmInterface,
    ) -> Result<()> {
        self.vms.attach_interface(id, node_id, iface)
    }

    pub fn vm_detach_interface(&self, id: &str, node_id: &str, mac: &str) -> Result<()> {
        self.vms.detach_interface(id, node_id, mac)
    }

    pub fn vm_console(&self, id: &str, node_id: &str) -> Result<Box<dyn Stream>> {
        self.vms.console_stream(id, node_id)
    }

    pub fn vm_graphic(&self, id: &str, node_id: &str) -> Result<Box<dyn Stream>> {
        self.vms.graphic_stream(id, node_id)
    }

    // ==================== Storage ====================

    pub fn volume_list(&self, options: &VolumeListOptions) -> Result<Vec<Volume>> {
        self.volumes.list(options)
    }

    pub fn volume_get(&self, path: &str, node_id: &str) -> Result<Volume> {
        self.volumes.get(path, node_id)
    }

    pub fn volume_create(&self, params: &VolumeCreateParams) -> Result<Volume> {
        self.volumes.create(params)
    }

    pub fn volume_clone(&self, params: &VolumeCloneParams) -> Result<Volume> {
        self.volumes.clone_volume(params)
    }

    pub fn volume_resize(&self, path: &str, node_id: &str, size: Size) -> Result<()> {
        self.volumes.resize(path, node_id, size)
    }

    pub fn volume_delete(&self, path: &str, node_id: &str) -> Result<()> {
        self.volumes.delete(path, node_id)
    }

    pub fn volume_upload(
        &self,
        path: &str,
        node_id: &str,
        content: &mut dyn Read,
        size: u64,
    ) -> Result<()> {
        self.volumes.upload(path, node_id, content, size)
    }

    pub fn volume_pool_list(&self, options: &VolumePoolListOptions) -> Result<Vec<VolumePool>> {
        self.pools.list(options)
    }

    // ==================== Hosts ====================

    pub fn network_list(&self, options: &NetworkListOptions) -> Result<Vec<Network>> {
        self.networks.list(options)
    }

    pub fn node_list(&self, options: &NodeListOptions) -> Result<Vec<Node>> {
        self.nodes.list(options)
    }

    pub fn node_get(&self, node_id: &str) -> Result<Node> {
        self.nodes.get(node_id)
    }

    pub fn host_info_list(&self, options: &NodeListOptions) -> Result<Vec<HostInfo>> {
        self.hosts.list(options)
    }

    pub fn host_info(&self, node_id: &str) -> Result<HostInfo> {
        self.hosts.get(node_id)
    }

    // ==================== Keys and images ====================

    pub fn key_list(&self) -> Result<Vec<Key>> {
        self.keys.list()
    }

    pub fn key_get(&self, fingerprint: &str) -> Result<Key> {
        self.keys.get(fingerprint)
    }

    pub fn key_add(&self, line: &str) -> Result<Key> {
        self.keys.add(line)
    }

    pub fn key_delete(&self, fingerprint: &str) -> Result<()> {
        self.keys.delete(fingerprint)
    }

    pub fn image_list(&self) -> Result<Vec<ImageManifest>> {
        self.images.list()
    }

    pub fn image_get(&self, volume_path: &str) -> Result<ImageManifest> {
        self.images.get(volume_path)
    }

    pub fn image_save(&self, manifest: &ImageManifest) -> Result<()> {
        self.images.save(manifest)
    }

    pub fn image_delete(&self, volume_path: &str) -> Result<()> {
        self.images.delete(volume_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeSettings;
    use crate::configdrive::memory::MemoryIso;
    use crate::configdrive::ConfigDrive;
    use crate::events::ScriptedBroker;
    use crate::libvirt::memory::{fleet, MemoryNode};
    use crate::libvirt::xml::DomainXml;
    use crate::libvirt::DomainState;
    use crate::VmState;
    use std::collections::HashMap;
    use tempfile::{tempdir, TempDir};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn service(nodes: &[&str]) -> (Service, Vec<Arc<MemoryNode>>, TempDir) {
        let (_connector, pool, handles) = fleet(nodes);
        for node in &handles {
            node.add_pool("default", "/pool", 100 * GIB, 0, true);
        }
        let dir = tempdir().unwrap();
        let drive = ConfigDrive::new(Arc::new(MemoryIso::default()));
        let images = Arc::new(ImageManifestStore::new(dir.path().join("images.json")));
        let vms = Arc::new(VirtualMachineRepository::new(
            pool.clone(),
            drive.clone(),
            HashMap::new(),
        ));
        let volumes = Arc::new(VolumeRepository::new(
            pool.clone(),
            images.clone(),
            Default::default(),
        ));
        let settings: HashMap<String, NodeSettings> = nodes
            .iter()
            .map(|n| (n.to_string(), crate::config::Config::default().node_settings(n)))
            .collect();
        let service = Service {
            manager: VirtualMachineManager::new(
                vms.clone(),
                volumes.clone(),
                images.clone(),
                drive,
                settings,
                Arc::new(ScriptedBroker::new()),
            ),
            vms,
            volumes,
            pools: VolumePoolRepository::new(pool.clone()),
            networks: NetworkRepository::new(pool.clone(), vec!["br0".to_string()]),
            nodes: NodeRepository::new(pool.clone()),
            hosts: HostInfoRepository::new(pool),
            keys: KeyStore::new(dir.path().join("authorized_keys")),
            images,
        };
        (service, handles, dir)
    }

    fn domain(name: &str) -> DomainXml {
        DomainXml {
            kind: "kvm".to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_vm_action_dispatch() {
        let (service, nodes, _dir) = service(&["n1"]);
        nodes[0].add_domain(domain("vm-a"), DomainState::Shutoff);

        service.vm_action("vm-a", "n1", "start").unwrap();
        assert_eq!(service.vm_detail("vm-a", "n1").unwrap().state, VmState::Running);
        service.vm_action("vm-a", "n1", "reboot").unwrap();
        service.vm_action("vm-a", "n1", "poweroff").unwrap();
        assert_eq!(service.vm_detail("vm-a", "n1").unwrap().state, VmState::Stopped);

        let err = service.vm_action("vm-a", "n1", "hibernate").unwrap_err();
        assert!(err.is_unknown_action());
        assert_eq!(err.to_string(), "unknown action: hibernate");
    }

    #[test]
    fn test_unknown_node_is_not_found() {
        let (service, _nodes, _dir) = service(&["n1"]);
        assert!(service.vm_detail("vm-a", "n9").unwrap_err().is_not_found());
        assert!(service.host_info("n9").unwrap_err().is_not_found());
    }

    #[test]
    fn test_listings_span_nodes() {
        let (service, nodes, _dir) = service(&["n1", "n2"]);
        nodes[0].add_domain(domain("vm-b"), DomainState::Running);
        nodes[1].add_domain(domain("vm-a"), DomainState::Paused);
        nodes[1].add_volume("default", "disk.raw", "raw", GIB);

        let vms = service.vm_list(&VirtualMachineListOptions::default()).unwrap();
        let got: Vec<_> = vms.iter().map(|v| (v.node_id.as_str(), v.id.as_str(), v.state)).collect();
        assert_eq!(
            got,
            vec![("n1", "vm-b", VmState::Running), ("n2", "vm-a", VmState::Stopped)]
        );

        let only_n2 = VolumeListOptions {
            node_ids: vec!["n2".to_string()],
        };
        assert_eq!(service.volume_list(&only_n2).unwrap().len(), 1);
        assert_eq!(
            service
                .volume_pool_list(&VolumePoolListOptions::default())
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            service
                .network_list(&NetworkListOptions::default())
                .unwrap()
                .len(),
            2
        );
        assert_eq!(service.host_info_list(&NodeListOptions::default()).unwrap().len(), 2);
        assert_eq!(service.node_get("n1").unwrap().numas.len(), 2);
    }

    #[test]
    fn test_keys_and_images() {
        let (service, _nodes, _dir) = service(&["n1"]);
        let key = service
            .key_add("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHk2jNXg3Wy0g3iq3D6W2mGqZc6V4N6kDS4hK7hS0f0m ops@example")
            .unwrap();
        assert_eq!(service.key_list().unwrap(), vec![key.clone()]);
        assert_eq!(service.key_get(&key.fingerprint).unwrap(), key);
        service.key_delete(&key.fingerprint).unwrap();
        assert!(service.key_list().unwrap().is_empty());

        assert!(service.image_list().unwrap().is_empty());
        assert!(service.image_get("/pool/base.qcow2").unwrap_err().is_not_found());
    }
}
