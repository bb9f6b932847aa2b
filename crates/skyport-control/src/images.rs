use std::{path::Path, sync::Arc};

use skyport_model::Image;

use crate::error::ControlResult;

/// Image metadata, looked up by image reference first and display name second.
#[derive(Clone, Default)]
pub struct ImageCatalog {
    images: Arc<Vec<Image>>,
}

impl ImageCatalog {
    pub fn from_images(images: Vec<Image>) -> Self {
        Self {
            images: Arc::new(images),
        }
    }

    /// Load every `*.json` file in `dir`. A missing directory yields an empty catalog;
    /// unparsable files are skipped with a warning.
    pub async fn load_dir(dir: &Path) -> ControlResult<Self> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(v) => v,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(dir = %dir.display(), "images directory not found");
                return Ok(Self::default());
            }
            Err(err) => return Err(err.into()),
        };

        let mut images = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Image>(&raw) {
                Ok(image) => images.push(image),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping invalid image file");
                }
            }
        }

        images.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::info!(count = images.len(), "image catalog loaded");
        Ok(Self::from_images(images))
    }

    pub fn find(&self, reference: &str) -> Option<&Image> {
        let reference = reference.trim();
        self.images
            .iter()
            .find(|i| i.image == reference)
            .or_else(|| self.images.iter().find(|i| i.name == reference))
    }

    pub fn all(&self) -> &[Image] {
        &self.images
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_dir_reads_json_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("paper.json"),
            r#"{"Name":"Paper","Image":"ghcr.io/skyport/paper:latest","Env":["EULA=false"]}"#,
        )
        .await
        .unwrap();
        tokio::fs::write(dir.path().join("broken.json"), "{").await.unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), "ignored").await.unwrap();

        let catalog = ImageCatalog::load_dir(dir.path()).await.unwrap();
        assert_eq!(catalog.all().len(), 1);
        assert_eq!(catalog.find("Paper").unwrap().env, vec!["EULA=false"]);
        assert!(catalog.find("ghcr.io/skyport/paper:latest").is_some());
        assert!(catalog.find("missing").is_none());
    }

    #[tokio::test]
    async fn missing_dir_is_empty_catalog() {
        let catalog = ImageCatalog::load_dir(Path::new("/definitely/not/here"))
            .await
            .unwrap();
        assert!(catalog.all().is_empty());
    }
}
