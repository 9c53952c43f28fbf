//! Configuration file: hypervisor nodes, config drive settings, event hooks

use crate::configdrive::Format;
use crate::{Context, Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_LIBVIRT_URI: &str = "qemu:///system";
pub const DEFAULT_NODE_NAME: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub libvirt_uri: String,
    pub libvirt_config_drive_pool: String,
    pub libvirt_config_drive_suffix: String,
    pub libvirt_config_drive_format: Format,
    /// Bridge names offered as networks on every node
    pub bridges: Vec<String>,
    pub key_file: String,
    pub image_manifest_file: String,
    #[serde(rename = "hypervisor", deserialize_with = "one_or_many")]
    pub hypervisors: Vec<HypervisorSection>,
    #[serde(rename = "subscribe", deserialize_with = "one_or_many")]
    pub subscriptions: Vec<SubscribeSection>,
    pub web: WebSection,
}

/// One hypervisor node and its per-node overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HypervisorSection {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_drive_pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_drive_suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_drive_format: Option<Format>,
    /// Volume paths kept out of listings on this node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hidden_volumes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribeSection {
    pub event: String,
    pub script: String,
    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub listen: String,
    pub debug: bool,
    pub static_version: String,
    pub session_secret: String,
    pub session_secure: bool,
    pub session_domain: String,
    /// Seconds
    pub session_max_age: u64,
    pub media_upload_tmp: String,
    #[serde(rename = "user", deserialize_with = "one_or_many")]
    pub users: Vec<WebUser>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebUser {
    pub full_name: String,
    pub email: String,
    pub hashed_password: String,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            debug: false,
            static_version: String::new(),
            session_secret: String::new(),
            session_secure: false,
            session_domain: String::new(),
            session_max_age: 43200,
            media_upload_tmp: "/tmp/".to_string(),
            users: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            libvirt_uri: DEFAULT_LIBVIRT_URI.to_string(),
            libvirt_config_drive_pool: "default".to_string(),
            libvirt_config_drive_suffix: "_config.iso".to_string(),
            libvirt_config_drive_format: Format::NoCloud,
            bridges: Vec::new(),
            key_file: "~/.vmango/authorized_keys".to_string(),
            image_manifest_file: "~/.vmango/images.json".to_string(),
            hypervisors: Vec::new(),
            subscriptions: Vec::new(),
            web: WebSection::default(),
        }
    }
}

/// A lone HCL block arrives as an object, repeated blocks as an array
fn one_or_many<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(items) => items,
        OneOrMany::One(item) => vec![item],
    })
}

fn is_toml(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("toml")
}

/// Config drive settings resolved for one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSettings {
    pub config_drive_format: Format,
    pub config_drive_suffix: String,
    pub config_drive_pool: String,
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".vmango")
            .join("vmango.conf")
    }

    /// Load config from a specific path; unset keys take their defaults.
    /// `*.toml` files are read as TOML, anything else as HCL.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config = if is_toml(path) {
            Self::parse_toml(&content)
        } else {
            Self::parse(&content)
        };
        config.with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Parse an HCL document
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = hcl::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a specific path, in TOML for `*.toml` and HCL otherwise
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = if is_toml(path) {
            toml::to_string_pretty(self)?
        } else {
            hcl::to_string(self)?
        };
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for hv in &self.hypervisors {
            if hv.name.trim().is_empty() {
                return Err(Error::config("hypervisor name cannot be empty"));
            }
            if hv.url.trim().is_empty() {
                return Err(Error::config(format!(
                    "hypervisor '{}' has an empty url",
                    hv.name
                )));
            }
            if !names.insert(hv.name.as_str()) {
                return Err(Error::config(format!(
                    "hypervisor '{}' is defined twice",
                    hv.name
                )));
            }
        }
        if self.hypervisors.is_empty() && self.libvirt_uri.trim().is_empty() {
            return Err(Error::config("libvirt_uri cannot be empty"));
        }
        if self.bridges.iter().any(|b| b.trim().is_empty()) {
            return Err(Error::config("bridge names cannot be empty"));
        }
        for sub in &self.subscriptions {
            if sub.event.trim().is_empty() || sub.script.trim().is_empty() {
                return Err(Error::config("subscriptions need an event and a script"));
            }
        }
        Ok(())
    }

    /// Configured nodes as `(id, uri)`; a single default node when none are listed
    pub fn nodes(&self) -> Vec<(String, String)> {
        if self.hypervisors.is_empty() {
            return vec![(DEFAULT_NODE_NAME.to_string(), self.libvirt_uri.clone())];
        }
        self.hypervisors
            .iter()
            .map(|hv| (hv.name.clone(), hv.url.clone()))
            .collect()
    }

    fn hypervisor(&self, node_id: &str) -> Option<&HypervisorSection> {
        self.hypervisors.iter().find(|hv| hv.name == node_id)
    }

    pub fn node_settings(&self, node_id: &str) -> NodeSettings {
        let hv = self.hypervisor(node_id);
        NodeSettings {
            config_drive_format: hv
                .and_then(|h| h.config_drive_format)
                .unwrap_or(self.libvirt_config_drive_format),
            config_drive_suffix: hv
                .and_then(|h| h.config_drive_suffix.clone())
                .unwrap_or_else(|| self.libvirt_config_drive_suffix.clone()),
            config_drive_pool: hv
                .and_then(|h| h.config_drive_pool.clone())
                .unwrap_or_else(|| self.libvirt_config_drive_pool.clone()),
        }
    }

    /// `(node, path)` pairs hidden from volume listings
    pub fn hidden_volumes(&self) -> HashSet<(String, String)> {
        self.hypervisors
            .iter()
            .flat_map(|hv| {
                hv.hidden_volumes
                    .iter()
                    .map(move |path| (hv.name.clone(), path.clone()))
            })
            .collect()
    }

    pub fn key_file_path(&self) -> PathBuf {
        expand_home(&self.key_file)
    }

    pub fn image_manifest_path(&self) -> PathBuf {
        expand_home(&self.image_manifest_file)
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
    }
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/"))
            .join(rest),
        None => PathBuf::from(path),
    }
}
