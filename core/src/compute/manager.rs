//! Multi-step VM provisioning: volumes, domain, config drive, event, power on

use crate::config::NodeSettings;
use crate::configdrive::{ConfigDrive, Data};
use crate::events::{EventPublisher, VmCreatedEvent};
use crate::libvirt::{VirtualMachineRepository, VolumeRepository};
use crate::manifest::ImageManifestStore;
use crate::{
    Arch, Context, DeviceBus, DeviceType, Error, ImageManifest, Result, Size, VirtualMachine,
    VmState, VmVolume, Volume, VolumeCloneParams, VolumeCreateParams, VolumeFormat,
    CONFIG_DRIVE_ALIAS,
};
use log::{error, info};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Clone an existing volume and attach the copy
#[derive(Debug, Clone, Default)]
pub struct CloneVolumeRequest {
    pub params: VolumeCloneParams,
    pub alias: String,
    pub device_type: DeviceType,
    pub device_bus: DeviceBus,
}

/// Create an empty volume and attach it
#[derive(Debug, Clone, Default)]
pub struct CreateVolumeRequest {
    pub params: VolumeCreateParams,
    pub alias: String,
    pub device_type: DeviceType,
    pub device_bus: DeviceBus,
}

#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// Target record; `node_id` and `id` are required
    pub vm: VirtualMachine,
    /// Base image the cloned volumes come from
    pub image: Option<ImageManifest>,
    pub clone_volumes: Vec<CloneVolumeRequest>,
    pub create_volumes: Vec<CreateVolumeRequest>,
    pub start: bool,
}

pub struct VirtualMachineManager {
    vms: Arc<VirtualMachineRepository>,
    volumes: Arc<VolumeRepository>,
    manifests: Arc<ImageManifestStore>,
    config_drive: ConfigDrive,
    settings: HashMap<String, NodeSettings>,
    events: Arc<dyn EventPublisher>,
}

impl fmt::Debug for VirtualMachineManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMachineManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl VirtualMachineManager {
    pub fn new(
        vms: Arc<VirtualMachineRepository>,
        volumes: Arc<VolumeRepository>,
        manifests: Arc<ImageManifestStore>,
        config_drive: ConfigDrive,
        settings: HashMap<String, NodeSettings>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            vms,
            volumes,
            manifests,
            config_drive,
            settings,
            events,
        }
    }

    fn node_settings(&self, node_id: &str) -> Result<&NodeSettings> {
        self.settings
            .get(node_id)
            .ok_or_else(|| Error::not_found(format!("settings of node {}", node_id)))
    }

    fn clone_volume(
        &self,
        vm: &VirtualMachine,
        image: Option<&ImageManifest>,
        req: &CloneVolumeRequest,
    ) -> Result<Volume> {
        let params = VolumeCloneParams {
            node_id: vm.node_id.clone(),
            ..req.params.clone()
        };
        let volume = self.volumes.clone_volume(&params)?;

        if let Some(image) = image.filter(|i| i.volume_path == params.original_path) {
            self.manifests
                .save(&ImageManifest {
                    id: String::new(),
                    volume_path: volume.path.clone(),
                    os: image.os.clone(),
                })
                .with_context(|| format!("cannot save image manifest of {}", volume.path))?;
        }
        Ok(volume)
    }

    /// Generate, store and attach the cloud-init drive
    fn attach_config_drive(&self, vm: &mut VirtualMachine) -> Result<()> {
        let config = match &vm.config {
            Some(config) => config,
            None => return Ok(()),
        };
        let settings = self.node_settings(&vm.node_id)?;
        let image = self
            .config_drive
            .generate(&Data::new(settings.config_drive_format, config))
            .with_context(|| format!("cannot generate config drive of {}", vm.id))?;

        let volume = self
            .volumes
            .create(&VolumeCreateParams {
                node_id: vm.node_id.clone(),
                pool: settings.config_drive_pool.clone(),
                name: format!("{}{}", vm.id, settings.config_drive_suffix),
                format: VolumeFormat::Iso,
                size: Size::from_bytes(image.len() as u64),
            })
            .context("cannot create config drive volume")?;
        self.volumes
            .upload(&volume.path, &vm.node_id, &mut image.as_slice(), image.len() as u64)
            .context("cannot upload config drive")?;

        let mut drive = VmVolume::new(
            volume.path,
            CONFIG_DRIVE_ALIAS,
            DeviceType::Cdrom,
            DeviceBus::Ide,
        );
        self.vms
            .attach_volume(&vm.id, &vm.node_id, &mut drive)
            .context("cannot attach config drive")?;
        vm.volumes.push(drive);
        Ok(())
    }

    /// Provision a VM. Steps run in order and stop at the first failure;
    /// only a failed `vm_created` publish undoes the domain definition.
    pub fn create(&self, req: CreateRequest) -> Result<VirtualMachine> {
        let CreateRequest {
            mut vm,
            image,
            clone_volumes,
            create_volumes,
            start,
        } = req;

        if vm.arch == Arch::Unknown {
            if let Some(image) = &image {
                vm.arch = image.os.arch;
            }
        }

        for req in &clone_volumes {
            let volume = self.clone_volume(&vm, image.as_ref(), req)?;
            vm.volumes.push(VmVolume::new(
                volume.path,
                req.alias.clone(),
                req.device_type,
                req.device_bus,
            ));
        }

        for req in &create_volumes {
            let params = VolumeCreateParams {
                node_id: vm.node_id.clone(),
                ..req.params.clone()
            };
            let volume = self.volumes.create(&params)?;
            vm.volumes.push(VmVolume::new(
                volume.path,
                req.alias.clone(),
                req.device_type,
                req.device_bus,
            ));
        }

        self.vms
            .create(&mut vm)
            .with_context(|| format!("cannot create vm {}", vm.id))?;
        vm.state = VmState::Stopped;

        self.attach_config_drive(&mut vm)?;

        if let Err(e) = self.events.publish(&VmCreatedEvent::new(vm.clone())) {
            if let Err(cleanup) = self.vms.delete(&vm.id, &vm.node_id) {
                error!(
                    "cannot delete vm {} on {} after rejected creation: {}",
                    vm.id, vm.node_id, cleanup
                );
            }
            return Err(e).context("cannot publish vm_created event");
        }

        if start {
            self.vms
                .start(&vm.id, &vm.node_id)
                .with_context(|| format!("cannot start vm {}", vm.id))?;
            vm.state = VmState::Running;
        }
        info!("created vm {} on {}", vm.id, vm.node_id);
        Ok(vm)
    }

    /// Delete a VM, optionally together with every volume attached to it
    pub fn delete(&self, id: &str, node_id: &str, delete_volumes: bool) -> Result<()> {
        let volumes = if delete_volumes {
            self.vms.get(id, node_id)?.volumes
        } else {
            Vec::new()
        };
        self.vms.delete(id, node_id)?;
        for volume in &volumes {
            self.volumes
                .delete(&volume.path, node_id)
                .with_context(|| format!("cannot delete volume {} of vm {}", volume.path, id))?;
        }
        Ok(())
    }
}
