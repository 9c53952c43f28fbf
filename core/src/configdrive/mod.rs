//! Cloud-init config drives in the NoCloud and OpenStack layouts

mod iso;
#[cfg(test)]
pub(crate) mod memory;

pub use iso::GenIsoImage;

use crate::keys::Key;
use crate::{Error, Result, VmConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

pub const NOCLOUD_LABEL: &str = "CIDATA";
pub const OPENSTACK_LABEL: &str = "config-2";

const NOCLOUD_METADATA: &str = "meta-data";
const NOCLOUD_USERDATA: &str = "user-data";
const OPENSTACK_METADATA: &str = "openstack/latest/meta_data.json";
const OPENSTACK_USERDATA: &str = "openstack/latest/user_data";

/// Cloud-init datasource dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    NoCloud,
    OpenStack,
}

impl Format {
    pub const ALL: [Format; 2] = [Format::NoCloud, Format::OpenStack];

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::NoCloud => "nocloud",
            Format::OpenStack => "openstack",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Format::NoCloud => NOCLOUD_LABEL,
            Format::OpenStack => OPENSTACK_LABEL,
        }
    }

    /// Filesystem extensions the in-guest datasource expects
    pub fn extensions(&self) -> Extensions {
        match self {
            Format::NoCloud => Extensions {
                rock_ridge: true,
                joliet: true,
            },
            Format::OpenStack => Extensions {
                rock_ridge: true,
                joliet: false,
            },
        }
    }

    /// This format first, then the remaining ones
    pub fn preference(&self) -> Vec<Format> {
        let mut formats = vec![*self];
        formats.extend(Format::ALL.iter().filter(|f| *f != self));
        formats
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "nocloud" => Ok(Format::NoCloud),
            "openstack" => Ok(Format::OpenStack),
            other => Err(Error::validation(format!("unknown config drive format: {}", other))),
        }
    }
}

/// ISO 9660 extensions present on an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extensions {
    pub rock_ridge: bool,
    pub joliet: bool,
}

/// Produces and reads ISO 9660 images
pub trait IsoBackend: Send + Sync {
    /// Master the directory tree at `root` into an image
    fn generate(&self, root: &Path, label: &str, extensions: Extensions) -> Result<Vec<u8>>;

    fn extensions(&self, image: &[u8]) -> Result<Extensions>;

    /// Read a file by its path relative to the image root; `None` when absent
    fn read_file(&self, image: &[u8], extensions: Extensions, path: &str)
        -> Result<Option<Vec<u8>>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NoCloudMetadata {
    pub instance_id: String,
    pub hostname: String,
    pub local_hostname: String,
    #[serde(default)]
    pub public_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenStackFile {
    pub path: String,
    pub content_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenStackMetadata {
    #[serde(default)]
    pub availability_zone: String,
    #[serde(default)]
    pub files: Vec<OpenStackFile>,
    pub hostname: String,
    #[serde(default)]
    pub launch_index: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub public_keys: BTreeMap<String, String>,
    pub uuid: String,
}

/// Config drive contents in one of the two dialects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    NoCloud {
        metadata: NoCloudMetadata,
        userdata: Vec<u8>,
    },
    OpenStack {
        metadata: OpenStackMetadata,
        userdata: Vec<u8>,
    },
}

impl Data {
    /// Build a payload with a freshly generated instance id
    pub fn new(format: Format, config: &VmConfig) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        match format {
            Format::NoCloud => Data::NoCloud {
                metadata: NoCloudMetadata {
                    instance_id: id,
                    hostname: config.hostname.clone(),
                    local_hostname: config.hostname.clone(),
                    public_keys: config.keys.iter().map(Key::public_key).collect(),
                },
                userdata: config.userdata.clone(),
            },
            Format::OpenStack => {
                let mut public_keys = BTreeMap::new();
                for (i, key) in config.keys.iter().enumerate() {
                    let mut name = key.comment.clone();
                    if name.is_empty() || public_keys.contains_key(&name) {
                        name = format!("key-{}", i);
                    }
                    public_keys.insert(name, key.material());
                }
                Data::OpenStack {
                    metadata: OpenStackMetadata {
                        availability_zone: String::new(),
                        files: Vec::new(),
                        hostname: config.hostname.clone(),
                        launch_index: 0,
                        name: config.hostname.clone(),
                        meta: BTreeMap::new(),
                        public_keys,
                        uuid: id,
                    },
                    userdata: config.userdata.clone(),
                }
            }
        }
    }

    pub fn format(&self) -> Format {
        match self {
            Data::NoCloud { .. } => Format::NoCloud,
            Data::OpenStack { .. } => Format::OpenStack,
        }
    }

    pub fn hostname(&self) -> &str {
        match self {
            Data::NoCloud { metadata, .. } => &metadata.hostname,
            Data::OpenStack { metadata, .. } => &metadata.hostname,
        }
    }

    pub fn userdata(&self) -> &[u8] {
        match self {
            Data::NoCloud { userdata, .. } | Data::OpenStack { userdata, .. } => userdata,
        }
    }

    /// Keys found in the metadata; entries that do not parse are skipped
    pub fn keys(&self) -> Vec<Key> {
        match self {
            Data::NoCloud { metadata, .. } => metadata
                .public_keys
                .iter()
                .filter_map(|line| Key::parse(line).ok())
                .collect(),
            Data::OpenStack { metadata, .. } => metadata
                .public_keys
                .iter()
                .filter_map(|(name, material)| {
                    let mut key = Key::parse(material).ok()?;
                    if key.comment.is_empty() {
                        key.comment = name.clone();
                    }
                    Some(key)
                })
                .collect(),
        }
    }

    pub fn to_config(&self) -> VmConfig {
        VmConfig {
            hostname: self.hostname().to_string(),
            userdata: self.userdata().to_vec(),
            keys: self.keys(),
        }
    }

    /// Files of the payload tree, relative to the image root
    fn files(&self) -> Result<Vec<(&'static str, Vec<u8>)>> {
        match self {
            Data::NoCloud { metadata, userdata } => Ok(vec![
                (NOCLOUD_METADATA, serde_yaml::to_string(metadata)?.into_bytes()),
                (NOCLOUD_USERDATA, userdata.clone()),
            ]),
            Data::OpenStack { metadata, userdata } => Ok(vec![
                (OPENSTACK_METADATA, serde_json::to_vec(metadata)?),
                (OPENSTACK_USERDATA, userdata.clone()),
            ]),
        }
    }

    /// Write the payload tree below `root`
    pub fn write_tree(&self, root: &Path) -> Result<()> {
        for (relative, content) in self.files()? {
            let path = root.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, content)?;
        }
        Ok(())
    }
}

/// Generates and parses config drive images through an ISO backend
#[derive(Clone)]
pub struct ConfigDrive {
    backend: Arc<dyn IsoBackend>,
}

impl fmt::Debug for ConfigDrive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigDrive").finish_non_exhaustive()
    }
}

impl ConfigDrive {
    pub fn new(backend: Arc<dyn IsoBackend>) -> Self {
        Self { backend }
    }

    /// Master the payload into an ISO image
    pub fn generate(&self, data: &Data) -> Result<Vec<u8>> {
        let dir = tempfile::Builder::new().prefix("vmango-configdrive").tempdir()?;
        data.write_tree(dir.path())?;
        let format = data.format();
        self.backend
            .generate(dir.path(), format.label(), format.extensions())
    }

    /// Parse an image, trying formats in preference order
    pub fn parse(&self, image: &[u8], preference: &[Format]) -> Result<Data> {
        let extensions = self.backend.extensions(image)?;
        if !extensions.rock_ridge && !extensions.joliet {
            return Err(Error::codec(
                "image carries neither rock ridge nor joliet extensions",
            ));
        }

        let mut reasons = Vec::new();
        for format in preference {
            match self.parse_format(image, extensions, *format) {
                Ok(data) => return Ok(data),
                Err(e) => reasons.push(format!("{}: {}", format, e)),
            }
        }
        Err(Error::codec(format!(
            "no config drive format matched ({})",
            reasons.join("; ")
        )))
    }

    fn parse_format(&self, image: &[u8], extensions: Extensions, format: Format) -> Result<Data> {
        let read = |path: &str| -> Result<Vec<u8>> {
            self.backend
                .read_file(image, extensions, path)?
                .ok_or_else(|| Error::NotFound(format!("file /{}", path)))
        };
        match format {
            Format::NoCloud => {
                let metadata: NoCloudMetadata = serde_yaml::from_slice(&read(NOCLOUD_METADATA)?)?;
                let userdata = read(NOCLOUD_USERDATA)?;
                Ok(Data::NoCloud { metadata, userdata })
            }
            Format::OpenStack => {
                let metadata: OpenStackMetadata =
                    serde_json::from_slice(&read(OPENSTACK_METADATA)?)?;
                let userdata = read(OPENSTACK_USERDATA)?;
                Ok(Data::OpenStack { metadata, userdata })
            }
        }
    }
}
