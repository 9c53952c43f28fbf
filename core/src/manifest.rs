//! Image manifest store: a JSON array mapping volume paths to OS descriptions

use crate::{Context, Error, ImageManifest, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// File backed manifest store. The whole file is read per operation.
#[derive(Debug)]
pub struct ImageManifestStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl ImageManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Vec<ImageManifest>> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("cannot read manifest file {}", self.path.display()))
            }
        };
        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&content)
            .with_context(|| format!("cannot parse manifest file {}", self.path.display()))
    }

    /// Replace the file atomically
    fn write(&self, manifests: &[ImageManifest]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).with_context(|| format!("cannot create {}", dir.display()))?;

        let content = serde_json::to_vec_pretty(manifests)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&content)?;
        tmp.write_all(b"\n")?;
        tmp.persist(&self.path)
            .map_err(|e| Error::Io(e.error))
            .with_context(|| format!("cannot replace manifest file {}", self.path.display()))?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ImageManifest>> {
        let _guard = self.lock.read();
        self.read()
    }

    pub fn get(&self, volume_path: &str) -> Result<ImageManifest> {
        let _guard = self.lock.read();
        self.read()?
            .into_iter()
            .find(|m| m.volume_path == volume_path)
            .ok_or_else(|| Error::NotFound(format!("image manifest for {}", volume_path)))
    }

    /// Entries for the paths present in the store; other paths are absent
    pub fn find_by_volume_paths(&self, paths: &[String]) -> Result<HashMap<String, ImageManifest>> {
        let _guard = self.lock.read();
        Ok(self
            .read()?
            .into_iter()
            .filter(|m| paths.contains(&m.volume_path))
            .map(|m| (m.volume_path.clone(), m))
            .collect())
    }

    /// Insert or replace the manifest for its volume path
    pub fn save(&self, manifest: &ImageManifest) -> Result<()> {
        let _guard = self.lock.write();
        let mut manifests = self.read()?;
        let mut manifest = manifest.clone();
        if manifest.id.is_empty() {
            manifest.id = uuid::Uuid::new_v4().to_string();
        }
        match manifests
            .iter_mut()
            .find(|m| m.volume_path == manifest.volume_path)
        {
            Some(existing) => *existing = manifest,
            None => manifests.push(manifest),
        }
        self.write(&manifests)
    }

    pub fn delete(&self, volume_path: &str) -> Result<()> {
        let _guard = self.lock.write();
        let mut manifests = self.read()?;
        let before = manifests.len();
        manifests.retain(|m| m.volume_path != volume_path);
        if manifests.len() == before {
            return Err(Error::NotFound(format!("image manifest for {}", volume_path)));
        }
        self.write(&manifests)
    }
}
