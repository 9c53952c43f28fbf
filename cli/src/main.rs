//! vmango command-line front end

use clap::{Parser, Subcommand};
use inquire::{Password, PasswordDisplayMode};
use log::debug;
use std::path::PathBuf;
use std::process;
use vmango_core::{
    auth, Config, Error, NetworkListOptions, NodeListOptions, Result, Service,
    VirtualMachineListOptions, VolumeListOptions, VolumePoolListOptions,
};

#[derive(Parser)]
#[command(name = "vmango", version, about = "Multi-node libvirt virtual machine manager")]
struct Cli {
    /// Config file, HCL or `*.toml` (defaults to ~/.vmango/vmango.conf)
    #[arg(long, short = 'c', global = true, env = "VMANGO_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage virtual machines
    Vm {
        #[command(subcommand)]
        action: VmCmd,
    },
    /// Manage storage volumes
    Volume {
        #[command(subcommand)]
        action: VolumeCmd,
    },
    /// Storage pools
    Pool {
        #[command(subcommand)]
        action: ListCmd,
    },
    /// Bridges and libvirt networks
    Network {
        #[command(subcommand)]
        action: ListCmd,
    },
    /// Node capabilities (NUMA, hugepages, IOMMU)
    Node {
        #[command(subcommand)]
        action: ListCmd,
    },
    /// Host summaries
    Host {
        #[command(subcommand)]
        action: ListCmd,
    },
    /// Manage authorized SSH keys
    Key {
        #[command(subcommand)]
        action: KeyCmd,
    },
    /// Image manifests
    Image {
        #[command(subcommand)]
        action: ImageCmd,
    },
    /// Read a password and print its bcrypt hash for a `web { user { } }` block
    Genpassword,
}

#[derive(Subcommand)]
enum VmCmd {
    /// List VMs
    List {
        /// Restrict to these nodes. Repeatable.
        #[arg(long, short = 'n')]
        node: Vec<String>,
    },
    /// Show one VM
    Show {
        id: String,
        #[arg(long, short = 'n')]
        node: String,
    },
    /// start, reboot or poweroff
    Action {
        id: String,
        action: String,
        #[arg(long, short = 'n')]
        node: String,
    },
    /// Delete a VM
    Delete {
        id: String,
        #[arg(long, short = 'n')]
        node: String,
        /// Also delete every attached volume
        #[arg(long)]
        volumes: bool,
    },
}

#[derive(Subcommand)]
enum VolumeCmd {
    List {
        #[arg(long, short = 'n')]
        node: Vec<String>,
    },
    Delete {
        path: String,
        #[arg(long, short = 'n')]
        node: String,
    },
}

#[derive(Subcommand)]
enum ListCmd {
    List {
        #[arg(long, short = 'n')]
        node: Vec<String>,
    },
}

#[derive(Subcommand)]
enum KeyCmd {
    List,
    /// Add a key given as an authorized_keys line
    Add { line: String },
    Delete { fingerprint: String },
}

#[derive(Subcommand)]
enum ImageCmd {
    List,
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(&path),
        None => {
            let path = Config::default_path();
            if path.exists() {
                Config::load(&path)
            } else {
                debug!("{} not found, using defaults", path.display());
                Ok(Config::default())
            }
        }
    }
}

fn genpassword() -> Result<()> {
    let password = Password::new("Password:")
        .with_display_mode(PasswordDisplayMode::Hidden)
        .prompt()
        .map_err(|e| Error::Auth(format!("cannot read password: {}", e)))?;
    println!("{}", auth::hash_password(&password)?);
    Ok(())
}

fn or_dash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}

fn vm_command(service: &Service, action: VmCmd) -> Result<()> {
    match action {
        VmCmd::List { node } => {
            let vms = service.vm_list(&VirtualMachineListOptions { node_ids: node })?;
            println!(
                "{:<12} {:<24} {:<8} {:>5} {:>10}",
                "NODE", "ID", "STATE", "CPUS", "MEMORY"
            );
            for vm in vms {
                println!(
                    "{:<12} {:<24} {:<8} {:>5} {:>10}",
                    vm.node_id,
                    vm.id,
                    vm.state.as_str(),
                    vm.vcpus,
                    vm.memory.to_string()
                );
            }
        }
        VmCmd::Show { id, node } => {
            let vm = service.vm_detail(&id, &node)?;
            println!("id:         {}", vm.id);
            println!("node:       {}", vm.node_id);
            println!("state:      {}", vm.state.as_str());
            println!("arch:       {}", vm.arch.as_str());
            println!("cpus:       {}", vm.vcpus);
            println!("memory:     {}", vm.memory);
            println!("autostart:  {}", vm.autostart);
            println!("agent:      {}", vm.guest_agent);
            println!("graphic:    {}", vm.graphic.graphic_type.as_str());
            for volume in &vm.volumes {
                println!(
                    "volume:     {} {} {} {} ({})",
                    volume.device_name,
                    volume.device_bus.as_str(),
                    volume.device_type.as_str(),
                    volume.path,
                    or_dash(&volume.alias)
                );
            }
            for iface in &vm.interfaces {
                println!(
                    "interface:  {} {}:{}",
                    iface.mac,
                    iface.network_type.as_str(),
                    iface.network_name
                );
            }
            if let Some(config) = &vm.config {
                println!("hostname:   {}", config.hostname);
                for key in &config.keys {
                    println!("key:        {} {}", key.fingerprint, or_dash(&key.comment));
                }
            }
        }
        VmCmd::Action { id, action, node } => service.vm_action(&id, &node, &action)?,
        VmCmd::Delete { id, node, volumes } => service.vm_delete(&id, &node, volumes)?,
    }
    Ok(())
}

fn volume_command(service: &Service, action: VolumeCmd) -> Result<()> {
    match action {
        VolumeCmd::List { node } => {
            let volumes = service.volume_list(&VolumeListOptions { node_ids: node })?;
            println!(
                "{:<12} {:<12} {:<48} {:<7} {:>10} {:<16}",
                "NODE", "POOL", "PATH", "FORMAT", "SIZE", "ATTACHED"
            );
            for volume in volumes {
                println!(
                    "{:<12} {:<12} {:<48} {:<7} {:>10} {:<16}",
                    volume.node_id,
                    volume.pool,
                    volume.path,
                    volume.format.as_str(),
                    volume.size.to_string(),
                    volume.attached_to.as_deref().unwrap_or("-")
                );
            }
        }
        VolumeCmd::Delete { path, node } => service.volume_delete(&path, &node)?,
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Genpassword => genpassword(),
        command => {
            let config = load_config(cli.config)?;
            let service = Service::from_config(&config)?;
            dispatch(&service, command)
        }
    }
}

fn dispatch(service: &Service, command: Commands) -> Result<()> {
    match command {
        Commands::Vm { action } => vm_command(service, action)?,
        Commands::Volume { action } => volume_command(service, action)?,
        Commands::Pool {
            action: ListCmd::List { node },
        } => {
            println!(
                "{:<12} {:<16} {:>10} {:>10} {:>10} {:>5}",
                "NODE", "NAME", "SIZE", "USED", "FREE", "USE%"
            );
            for pool in service.volume_pool_list(&VolumePoolListOptions { node_ids: node })? {
                println!(
                    "{:<12} {:<16} {:>10} {:>10} {:>10} {:>5}",
                    pool.node_id,
                    pool.name,
                    pool.size.to_string(),
                    pool.used.to_string(),
                    pool.free.to_string(),
                    pool.usage_percent()
                );
            }
        }
        Commands::Network {
            action: ListCmd::List { node },
        } => {
            println!("{:<12} {:<24} {:<8}", "NODE", "NAME", "TYPE");
            for network in service.network_list(&NetworkListOptions { node_ids: node })? {
                println!(
                    "{:<12} {:<24} {:<8}",
                    network.node_id,
                    network.name,
                    network.network_type.as_str()
                );
            }
        }
        Commands::Node {
            action: ListCmd::List { node },
        } => {
            for node in service.node_list(&NodeListOptions { node_ids: node })? {
                println!(
                    "{} {} {} {} iommu={}",
                    node.id,
                    node.arch.as_str(),
                    or_dash(&node.cpu_vendor),
                    or_dash(&node.cpu_model),
                    node.iommu
                );
                for cell in &node.numas {
                    println!(
                        "  numa {:<3} memory={:<8} cpus={:<4} 2M={:<6} 1G={}",
                        cell.id,
                        cell.memory.to_string(),
                        cell.cpu_count(),
                        cell.pages.count_2m,
                        cell.pages.count_1g
                    );
                }
            }
        }
        Commands::Host {
            action: ListCmd::List { node },
        } => {
            println!(
                "{:<12} {:<24} {:<8} {:>10} {:>5}",
                "NODE", "HOSTNAME", "ARCH", "MEMORY", "CPUS"
            );
            for host in service.host_info_list(&NodeListOptions { node_ids: node })? {
                println!(
                    "{:<12} {:<24} {:<8} {:>10} {:>5}",
                    host.node_id,
                    host.hostname,
                    host.arch.as_str(),
                    host.memory.to_string(),
                    host.cpus
                );
            }
        }
        Commands::Key { action } => match action {
            KeyCmd::List => {
                for key in service.key_list()? {
                    println!("{} {} {}", key.fingerprint, key.key_type, or_dash(&key.comment));
                }
            }
            KeyCmd::Add { line } => println!("{}", service.key_add(&line)?.fingerprint),
            KeyCmd::Delete { fingerprint } => service.key_delete(&fingerprint)?,
        },
        Commands::Image {
            action: ImageCmd::List,
        } => {
            for image in service.image_list()? {
                println!("{:<48} {}", image.volume_path, image.os.description());
            }
        }
        Commands::Genpassword => genpassword()?,
    }
    Ok(())
}

fn main() {
    env_logger::init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
