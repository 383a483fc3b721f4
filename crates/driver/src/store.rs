//! On-disk instance state for a driver. One directory per instance holding
//! `instance.json` plus whatever artefacts the backend materialises (disk
//! images, sockets, configs). Removing the directory removes the instance's
//! persistent footprint.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::warn;

use hypervisor_types::{Error, Instance, Result};

const STATE_FILE: &str = "instance.json";

/// Per-driver persistence root.
#[derive(Debug, Clone)]
pub struct InstanceStore {
    dir: PathBuf,
}

impl InstanceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        InstanceStore { dir: dir.into() }
    }

    pub async fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::internal(format!("creating state dir: {}", e)))
    }

    pub fn instance_dir(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    fn state_path(&self, id: &str) -> PathBuf {
        self.instance_dir(id).join(STATE_FILE)
    }

    /// Persist the record atomically (write-then-rename).
    pub async fn save(&self, instance: &Instance) -> Result<()> {
        let dir = self.instance_dir(&instance.id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::internal(format!("creating instance dir: {}", e)))?;
        let tmp = dir.join(format!("{}.tmp", STATE_FILE));
        let json = serde_json::to_vec_pretty(instance)?;
        fs::write(&tmp, json)
            .await
            .map_err(|e| Error::internal(format!("writing state file: {}", e)))?;
        fs::rename(&tmp, self.state_path(&instance.id))
            .await
            .map_err(|e| Error::internal(format!("committing state file: {}", e)))
    }

    pub async fn load(&self, id: &str) -> Result<Instance> {
        let raw = fs::read(self.state_path(id))
            .await
            .map_err(|_| Error::not_found(format!("instance {}", id)))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Every decodable record under the root. Undecodable state files are
    /// skipped with a warning so one corrupt instance cannot take the
    /// driver down.
    pub async fn load_all(&self) -> Result<Vec<Instance>> {
        let mut instances = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(instances),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.load(&id).await {
                Ok(instance) => instances.push(instance),
                Err(err) if err.is_not_found() => continue,
                Err(err) => {
                    warn!(instance_id = %id, error = %err, "skipping unreadable state file");
                }
            }
        }
        Ok(instances)
    }

    /// Remove the instance directory and everything in it. Idempotent.
    pub async fn remove(&self, id: &str) -> Result<()> {
        match fs::remove_dir_all(self.instance_dir(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::internal(format!("removing instance dir: {}", e))),
        }
    }

    pub fn root(&self) -> &Path {
        &self.dir
    }
}
