//! In-memory ISO backend for tests: the "image" is a JSON document of the tree

use super::{Extensions, IsoBackend};
use crate::{Error, Result};
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize)]
struct Image {
    label: String,
    rock_ridge: bool,
    joliet: bool,
    files: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct MemoryIso {
    last: Mutex<Option<(String, Extensions)>>,
}

impl MemoryIso {
    pub fn last_generated(&self) -> Option<(String, Extensions)> {
        self.last.lock().clone()
    }
}

fn collect(root: &Path, dir: &Path, files: &mut BTreeMap<String, String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect(root, &path, files)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| Error::codec(e.to_string()))?
                .to_string_lossy()
                .into_owned();
            let content = base64::engine::general_purpose::STANDARD.encode(fs::read(&path)?);
            files.insert(relative, content);
        }
    }
    Ok(())
}

fn decode(image: &[u8]) -> Result<Image> {
    serde_json::from_slice(image).map_err(|e| Error::codec(format!("not an image: {}", e)))
}

impl IsoBackend for MemoryIso {
    fn generate(&self, root: &Path, label: &str, extensions: Extensions) -> Result<Vec<u8>> {
        let mut files = BTreeMap::new();
        collect(root, root, &mut files)?;
        *self.last.lock() = Some((label.to_string(), extensions));
        Ok(serde_json::to_vec(&Image {
            label: label.to_string(),
            rock_ridge: extensions.rock_ridge,
            joliet: extensions.joliet,
            files,
        })?)
    }

    fn extensions(&self, image: &[u8]) -> Result<Extensions> {
        let image = decode(image)?;
        Ok(Extensions {
            rock_ridge: image.rock_ridge,
            joliet: image.joliet,
        })
    }

    fn read_file(
        &self,
        image: &[u8],
        _extensions: Extensions,
        path: &str,
    ) -> Result<Option<Vec<u8>>> {
        let image = decode(image)?;
        image
            .files
            .get(path.trim_start_matches('/'))
            .map(|content| {
                base64::engine::general_purpose::STANDARD
                    .decode(content)
                    .map_err(|e| Error::codec(e.to_string()))
            })
            .transpose()
    }
}
