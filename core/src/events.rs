//! Events and the script-running broker that delivers them

use crate::config::SubscribeSection;
use crate::command::CommandOutput;
use crate::{Context, Result, VirtualMachine};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::process::Command;

pub const ENV_PREFIX: &str = "VMANGO_";

pub trait Event {
    fn name(&self) -> &str;

    /// Flat key/value view of the event
    fn plain(&self) -> BTreeMap<String, String>;
}

pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: &dyn Event) -> Result<()>;
}

/// Published once a VM has been defined
#[derive(Debug, Clone)]
pub struct VmCreatedEvent {
    pub vm: VirtualMachine,
}

impl VmCreatedEvent {
    pub const NAME: &'static str = "vm_created";

    pub fn new(vm: VirtualMachine) -> Self {
        Self { vm }
    }
}

impl Event for VmCreatedEvent {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn plain(&self) -> BTreeMap<String, String> {
        let vm = &self.vm;
        let mut fields = BTreeMap::new();
        fields.insert("vm_id".to_string(), vm.id.clone());
        fields.insert("vm_cpus".to_string(), vm.vcpus.to_string());
        fields.insert("vm_memory_mib".to_string(), vm.memory.mebibytes().to_string());
        fields.insert("vm_volume_count".to_string(), vm.volumes.len().to_string());
        fields.insert("vm_interface_count".to_string(), vm.interfaces.len().to_string());
        for (i, volume) in vm.volumes.iter().enumerate() {
            fields.insert(format!("vm_volume_{}_path", i), volume.path.clone());
            fields.insert(format!("vm_volume_{}_device", i), volume.device_name.clone());
        }
        for (i, iface) in vm.interfaces.iter().enumerate() {
            fields.insert(format!("vm_interface_{}_mac", i), iface.mac.clone());
            fields.insert(format!("vm_interface_{}_network", i), iface.network_name.clone());
            fields.insert(
                format!("vm_interface_{}_type", i),
                iface.network_type.as_str().to_string(),
            );
        }
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub event: String,
    pub script: String,
    /// A failing mandatory script fails the publish
    pub mandatory: bool,
}

impl From<&SubscribeSection> for Subscription {
    fn from(section: &SubscribeSection) -> Self {
        Self {
            event: section.event.clone(),
            script: section.script.clone(),
            mandatory: section.mandatory,
        }
    }
}

/// Runs `sh -c <script>` for every subscription matching an event, in
/// subscription order, with the event fields exported as `VMANGO_*`.
#[derive(Debug, Clone)]
pub struct ScriptedBroker {
    shell: String,
    subscriptions: Vec<Subscription>,
}

impl Default for ScriptedBroker {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            subscriptions: Vec::new(),
        }
    }
}

/// `vm_id` -> `VMANGO_VM_ID`
pub fn env_name(key: &str) -> String {
    format!("{}{}", ENV_PREFIX, key.to_uppercase())
}

impl ScriptedBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(sections: &[SubscribeSection]) -> Self {
        Self {
            subscriptions: sections.iter().map(Subscription::from).collect(),
            ..Self::default()
        }
    }

    pub fn subscribe(&mut self, event: &str, script: &str, mandatory: bool) {
        self.subscriptions.push(Subscription {
            event: event.to_string(),
            script: script.to_string(),
            mandatory,
        });
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    fn run(&self, script: &str, env: &BTreeMap<String, String>) -> Result<()> {
        let output: CommandOutput = Command::new(&self.shell)
            .arg("-c")
            .arg(script)
            .envs(env)
            .output()
            .with_context(|| format!("cannot run {}", script))?
            .into();
        debug!(
            "script {} exited with {}: {}",
            script,
            output.exit_code,
            output.stdout_str().trim()
        );
        output.check(script).map(|_| ())
    }
}

impl EventPublisher for ScriptedBroker {
    fn publish(&self, event: &dyn Event) -> Result<()> {
        let env: BTreeMap<String, String> = event
            .plain()
            .into_iter()
            .map(|(k, v)| (env_name(&k), v))
            .collect();

        for sub in self.subscriptions.iter().filter(|s| s.event == event.name()) {
            match self.run(&sub.script, &env) {
                Ok(()) => {}
                Err(e) if sub.mandatory => {
                    return Err(e).with_context(|| {
                        format!("mandatory subscriber of {} failed", event.name())
                    })
                }
                Err(e) => warn!("subscriber of {} failed: {}", event.name(), e),
            }
        }
        Ok(())
    }
}
