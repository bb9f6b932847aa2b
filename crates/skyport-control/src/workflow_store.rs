use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use skyport_model::Workflow;
use tokio::sync::Mutex;

use crate::error::ControlResult;

/// Flat JSON file mapping instance id to workflow. Read fresh on every access so the
/// scheduler always executes what is on disk.
#[derive(Clone)]
pub struct WorkflowFile {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl WorkflowFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load_all(&self) -> ControlResult<BTreeMap<String, Workflow>> {
        let raw = match tokio::fs::read(&*self.path).await {
            Ok(v) => v,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }
        serde_json::from_slice(&raw).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: {e}", self.path.display()),
            )
            .into()
        })
    }

    pub async fn get(&self, instance_id: &str) -> ControlResult<Option<Workflow>> {
        Ok(self.load_all().await?.remove(instance_id))
    }

    pub async fn contains(&self, instance_id: &str) -> ControlResult<bool> {
        Ok(self.load_all().await?.contains_key(instance_id))
    }

    pub async fn put(&self, instance_id: &str, workflow: &Workflow) -> ControlResult<()> {
        let _guard = self.lock.lock().await;
        let mut all = self.load_all().await?;
        all.insert(instance_id.to_string(), workflow.clone());
        self.write_all(&all).await
    }

    /// Returns whether an entry was removed.
    pub async fn remove(&self, instance_id: &str) -> ControlResult<bool> {
        let _guard = self.lock.lock().await;
        let mut all = self.load_all().await?;
        if all.remove(instance_id).is_none() {
            return Ok(false);
        }
        self.write_all(&all).await?;
        Ok(true)
    }

    async fn write_all(&self, all: &BTreeMap<String, Workflow>) -> ControlResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(all)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &*self.path).await?;
        Ok(())
    }
}
