//! Hypervisor sessions driven through the `virsh` command-line client

use super::xml::{self, DomainXml, VolumeXml};
use super::{Connector, DomainState, Hypervisor, Stream};
use crate::command::{path_to_str, run_cmd, CommandOutput};
use crate::{Context, Error, Result};
use log::debug;
use std::io::{self, Read, Write};
use std::net::{IpAddr, TcpStream};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens [`VirshConnection`]s
#[derive(Debug, Clone)]
pub struct VirshConnector {
    pub virsh: String,
}

impl Default for VirshConnector {
    fn default() -> Self {
        Self {
            virsh: "virsh".to_string(),
        }
    }
}

impl VirshConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connector for VirshConnector {
    fn connect(&self, uri: &str) -> Result<Box<dyn Hypervisor>> {
        let conn = VirshConnection {
            virsh: self.virsh.clone(),
            uri: uri.to_string(),
        };
        if !conn.is_alive()? {
            return Err(Error::libvirt(format!("hypervisor at {} is not reachable", uri)));
        }
        Ok(Box::new(conn))
    }
}

/// Every call runs `virsh -c <uri> ...`
#[derive(Debug, Clone)]
pub struct VirshConnection {
    virsh: String,
    uri: String,
}

/// Map virsh stderr to a not-found error where libvirt reports a missing object
fn classify(what: &str, out: CommandOutput) -> Result<CommandOutput> {
    if out.success() {
        return Ok(out);
    }
    let stderr = out.stderr.to_lowercase();
    let missing = [
        "not found",
        "no domain with matching",
        "no storage vol with matching",
        "no storage pool with matching",
        "no network with matching",
        "failed to get domain",
        "failed to get pool",
        "failed to get vol",
        "failed to get network",
    ];
    if missing.iter().any(|m| stderr.contains(m)) {
        return Err(Error::not_found(format!("{}: {}", what, out.stderr.trim())));
    }
    out.check(what)
}

/// Names printed one per line by the `--name` listings
fn parse_names(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// `Key: value` lines of `dominfo` / `pool-info`
fn info_field<'a>(output: &'a str, key: &str) -> Option<&'a str> {
    output.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key).then(|| v.trim())
    })
}

/// Paths from the `vol-list` table (Name, Path columns)
fn parse_volume_table(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let line = line.trim();
            let name = line.split_whitespace().next()?;
            let path = line[name.len()..].trim();
            (!path.is_empty()).then(|| path.to_string())
        })
        .collect()
}

/// Host part of a libvirt URI such as `qemu+ssh://root@hv1:22/system`
fn uri_host(uri: &str) -> Option<&str> {
    let rest = uri.split_once("://")?.1;
    let authority = rest.split('/').next()?;
    let host = authority.rsplit('@').next()?;
    let host = match host.strip_prefix('[') {
        Some(v6) => v6.split(']').next()?,
        None => host.split(':').next()?,
    };
    (!host.is_empty()).then_some(host)
}

/// Where to reach a graphics server listening on `listen` of the host behind `uri`
fn graphic_host(uri: &str, listen: Option<&str>) -> String {
    let remote = uri_host(uri).unwrap_or("127.0.0.1");
    match listen.map(str::trim).filter(|l| !l.is_empty()) {
        None => remote.to_string(),
        Some(listen) => match listen.parse::<IpAddr>() {
            Ok(ip) if ip.is_loopback() || ip.is_unspecified() => remote.to_string(),
            _ => listen.to_string(),
        },
    }
}

impl VirshConnection {
    fn virsh<S: AsRef<str>>(&self, what: &str, args: &[S]) -> Result<CommandOutput> {
        let mut full = vec!["-c", self.uri.as_str(), "-q"];
        full.extend(args.iter().map(|a| a.as_ref()));
        debug!("{} {}", self.virsh, full.join(" "));
        classify(what, run_cmd(&self.virsh, &full)?)
    }

    fn virsh_stdout<S: AsRef<str>>(&self, what: &str, args: &[S]) -> Result<String> {
        Ok(self.virsh(what, args)?.stdout_str())
    }

    /// Run a command that takes an XML document from a file
    fn virsh_with_file(&self, what: &str, xml: &str, args: &[&str], trailing: &[&str]) -> Result<CommandOutput> {
        let mut file = tempfile::Builder::new()
            .prefix("vmango-")
            .suffix(".xml")
            .tempfile()?;
        file.write_all(xml.as_bytes())?;
        file.flush()?;
        let mut full: Vec<&str> = args.to_vec();
        full.push(path_to_str(file.path())?);
        full.extend_from_slice(trailing);
        self.virsh(what, &full)
    }

    fn volume_path(&self, pool: &str, name: &str) -> Result<String> {
        let out = self.virsh_stdout("cannot get volume path", &["vol-path", "--pool", pool, name])?;
        Ok(out.trim().to_string())
    }
}

impl Hypervisor for VirshConnection {
    fn is_alive(&self) -> Result<bool> {
        let out = run_cmd(&self.virsh, &["-c", self.uri.as_str(), "-q", "uri"])?;
        Ok(out.success())
    }

    fn hostname(&self) -> Result<String> {
        Ok(self.virsh_stdout("cannot get hostname", &["hostname"])?.trim().to_string())
    }

    fn capabilities(&self) -> Result<String> {
        self.virsh_stdout("cannot get capabilities", &["capabilities"])
    }

    fn sysinfo(&self) -> Result<String> {
        self.virsh_stdout("cannot get sysinfo", &["sysinfo"])
    }

    fn list_domains(&self) -> Result<Vec<String>> {
        let out = self.virsh_stdout("cannot list domains", &["list", "--all", "--name"])?;
        Ok(parse_names(&out))
    }

    fn domain_xml(&self, name: &str, inactive: bool) -> Result<String> {
        let mut args = vec!["dumpxml", name];
        if inactive {
            args.push("--inactive");
        }
        self.virsh_stdout("cannot get domain xml", &args)
    }

    fn domain_state(&self, name: &str) -> Result<DomainState> {
        let out = self.virsh_stdout("cannot get domain state", &["domstate", name])?;
        Ok(DomainState::parse(&out))
    }

    fn domain_autostart(&self, name: &str) -> Result<bool> {
        let out = self.virsh_stdout("cannot get domain info", &["dominfo", name])?;
        Ok(info_field(&out, "Autostart") == Some("enable"))
    }

    fn define_domain(&self, xml: &str) -> Result<()> {
        self.virsh_with_file("cannot define domain", xml, &["define"], &[])?;
        Ok(())
    }

    fn undefine_domain(&self, name: &str) -> Result<()> {
        self.virsh("cannot undefine domain", &["undefine", name])?;
        Ok(())
    }

    fn start_domain(&self, name: &str) -> Result<()> {
        self.virsh("cannot start domain", &["start", name])?;
        Ok(())
    }

    fn destroy_domain(&self, name: &str) -> Result<()> {
        self.virsh("cannot destroy domain", &["destroy", name])?;
        Ok(())
    }

    fn reboot_domain(&self, name: &str) -> Result<()> {
        self.virsh("cannot reboot domain", &["reboot", name])?;
        Ok(())
    }

    fn set_autostart(&self, name: &str, autostart: bool) -> Result<()> {
        let mut args = vec!["autostart", name];
        if !autostart {
            args.push("--disable");
        }
        self.virsh("cannot set autostart", &args)?;
        Ok(())
    }

    fn attach_device(&self, name: &str, device: &str, live: bool) -> Result<()> {
        let trailing: &[&str] = if live { &["--config", "--live"] } else { &["--config"] };
        self.virsh_with_file("cannot attach device", device, &["attach-device", name], trailing)?;
        Ok(())
    }

    fn detach_device(&self, name: &str, device: &str, live: bool) -> Result<()> {
        let trailing: &[&str] = if live { &["--config", "--live"] } else { &["--config"] };
        self.virsh_with_file("cannot detach device", device, &["detach-device", name], trailing)?;
        Ok(())
    }

    fn set_vcpus(&self, name: &str, count: u32) -> Result<()> {
        let count = count.to_string();
        self.virsh(
            "cannot set maximum vcpus",
            &["setvcpus", name, count.as_str(), "--config", "--maximum"],
        )?;
        self.virsh("cannot set vcpus", &["setvcpus", name, count.as_str(), "--config"])?;
        Ok(())
    }

    fn set_memory(&self, name: &str, kibibytes: u64) -> Result<()> {
        let size = format!("{}KiB", kibibytes);
        self.virsh("cannot set maximum memory", &["setmaxmem", name, size.as_str(), "--config"])?;
        self.virsh("cannot set memory", &["setmem", name, size.as_str(), "--config"])?;
        Ok(())
    }

    fn pin_vcpu(&self, name: &str, vcpu: u32, cpuset: &str) -> Result<()> {
        let vcpu = vcpu.to_string();
        self.virsh("cannot pin vcpu", &["vcpupin", name, vcpu.as_str(), cpuset, "--config"])?;
        Ok(())
    }

    fn pin_emulator(&self, name: &str, cpuset: &str) -> Result<()> {
        self.virsh("cannot pin emulator", &["emulatorpin", name, cpuset, "--config"])?;
        Ok(())
    }

    fn open_console(&self, name: &str) -> Result<Box<dyn Stream>> {
        let mut child = Command::new(&self.virsh)
            .args(["-c", self.uri.as_str(), "console", name, "--force"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("cannot open console")?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => Ok(Box::new(ConsoleStream {
                child,
                stdin,
                stdout,
            })),
            _ => {
                let _ = child.kill();
                Err(Error::libvirt("cannot open console: no pipes to virsh"))
            }
        }
    }

    fn open_graphic(&self, name: &str) -> Result<Box<dyn Stream>> {
        let domain: DomainXml = xml::from_str(&self.domain_xml(name, false)?)?;
        let graphic = domain
            .devices
            .graphics
            .first()
            .ok_or_else(|| Error::not_found(format!("graphics device of domain {}", name)))?;
        let port = graphic
            .port
            .filter(|p| *p > 0)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| Error::libvirt(format!("domain {} has no graphics port", name)))?;
        let host = graphic_host(&self.uri, graphic.listen.as_deref());

        let addr = std::net::ToSocketAddrs::to_socket_addrs(&(host.as_str(), port))
            .with_context(|| format!("cannot resolve {}", host))?
            .next()
            .ok_or_else(|| Error::libvirt(format!("cannot resolve {}", host)))?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .with_context(|| format!("cannot connect to graphics at {}", addr))?;
        Ok(Box::new(stream))
    }

    fn list_pools(&self) -> Result<Vec<String>> {
        let out = self.virsh_stdout("cannot list pools", &["pool-list", "--all", "--name"])?;
        Ok(parse_names(&out))
    }

    fn pool_xml(&self, pool: &str) -> Result<String> {
        self.virsh_stdout("cannot get pool xml", &["pool-dumpxml", pool])
    }

    fn pool_is_active(&self, pool: &str) -> Result<bool> {
        let out = self.virsh_stdout("cannot get pool info", &["pool-info", pool])?;
        Ok(info_field(&out, "State") == Some("running"))
    }

    fn list_volumes(&self, pool: &str) -> Result<Vec<String>> {
        // -q drops the table header, so ask without it
        let out = run_cmd(&self.virsh, &["-c", self.uri.as_str(), "vol-list", pool])?;
        let out = classify("cannot list volumes", out)?;
        Ok(parse_volume_table(&out.stdout_str()))
    }

    fn volume_xml(&self, path: &str) -> Result<String> {
        self.virsh_stdout("cannot get volume xml", &["vol-dumpxml", path])
    }

    fn volume_pool(&self, path: &str) -> Result<String> {
        let out = self.virsh_stdout("cannot get volume pool", &["vol-pool", path])?;
        Ok(out.trim().to_string())
    }

    fn create_volume(&self, pool: &str, xml: &str, prealloc_metadata: bool) -> Result<String> {
        let parsed: VolumeXml = xml::from_str(xml)?;
        let trailing: &[&str] = if prealloc_metadata {
            &["--prealloc-metadata"]
        } else {
            &[]
        };
        self.virsh_with_file("cannot create volume", xml, &["vol-create", pool], trailing)?;
        self.volume_path(pool, &parsed.name)
    }

    fn clone_volume(&self, pool: &str, xml: &str, original: &str) -> Result<String> {
        let parsed: VolumeXml = xml::from_str(xml)?;
        self.virsh_with_file(
            "cannot clone volume",
            xml,
            &["vol-create-from", pool],
            &[original],
        )?;
        self.volume_path(pool, &parsed.name)
    }

    fn resize_volume(&self, path: &str, bytes: u64) -> Result<()> {
        let size = format!("{}B", bytes);
        self.virsh("cannot resize volume", &["vol-resize", path, size.as_str()])?;
        Ok(())
    }

    fn delete_volume(&self, path: &str) -> Result<()> {
        self.virsh("cannot delete volume", &["vol-delete", path])?;
        Ok(())
    }

    fn upload_volume(&self, path: &str, content: &mut dyn Read, length: u64) -> Result<()> {
        let mut file = tempfile::Builder::new().prefix("vmango-upload").tempfile()?;
        let copied = io::copy(content, &mut file)?;
        file.flush()?;
        if copied != length {
            return Err(Error::libvirt(format!(
                "cannot upload volume {}: expected {} bytes, got {}",
                path, length, copied
            )));
        }
        let length = length.to_string();
        self.virsh(
            "cannot upload volume",
            &["vol-upload", path, path_to_str(file.path())?, "--length", length.as_str()],
        )?;
        Ok(())
    }

    fn download_volume(&self, path: &str) -> Result<Vec<u8>> {
        let file = tempfile::Builder::new().prefix("vmango-download").tempfile()?;
        self.virsh(
            "cannot download volume",
            &["vol-download", path, path_to_str(file.path())?],
        )?;
        let data = std::fs::read(file.path()).context("cannot read downloaded volume")?;
        Ok(data)
    }

    fn list_networks(&self) -> Result<Vec<String>> {
        let out = self.virsh_stdout("cannot list networks", &["net-list", "--all", "--name"])?;
        Ok(parse_names(&out))
    }

    fn network_xml(&self, name: &str) -> Result<String> {
        self.virsh_stdout("cannot get network xml", &["net-dumpxml", name])
    }
}

/// `virsh console` child process used as a byte stream
struct ConsoleStream {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl Read for ConsoleStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Write for ConsoleStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stdin.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stdin.flush()
    }
}

impl Drop for ConsoleStream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
