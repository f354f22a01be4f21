//! Model downloader.
//!
//! Pulls catalog-listed files over HTTP into the model root. No automatic
//! retries; a failed transfer surfaces as [`EngineError::DownloadFailure`].
//! Partial files are written under a `.part` suffix and renamed on success.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::catalog::ModelCatalog;
use crate::error::EngineError;
use crate::Result;

pub struct ModelDownloader {
    catalog: Arc<ModelCatalog>,
}

impl ModelDownloader {
    pub fn new(catalog: Arc<ModelCatalog>) -> Self {
        Self { catalog }
    }

    fn file_path(&self, tag: &str, file: &str) -> Result<PathBuf> {
        Ok(self.catalog.model_dir(tag)?.join(file))
    }

    /// All catalog-listed files present on disk.
    pub fn is_downloaded(&self, tag: &str) -> bool {
        self.missing_files(tag)
            .map(|missing| missing.is_empty())
            .unwrap_or(false)
    }

    pub fn missing_files(&self, tag: &str) -> Result<Vec<String>> {
        let (_, entry) = self.catalog.model_info(tag)?;
        let mut missing = Vec::new();
        for file in &entry.files {
            if !self.file_path(tag, file)?.exists() {
                missing.push(file.clone());
            }
        }
        Ok(missing)
    }

    pub fn present_files(&self, tag: &str) -> Result<Vec<String>> {
        let (_, entry) = self.catalog.model_info(tag)?;
        let mut present = Vec::new();
        for file in &entry.files {
            if self.file_path(tag, file)?.exists() {
                present.push(file.clone());
            }
        }
        Ok(present)
    }

    /// Download every listed file that is absent (or all of them when
    /// `force` is set).
    pub fn pull(&self, tag: &str, force: bool) -> Result<()> {
        let (canonical, entry) = self.catalog.model_info(tag)?;
        let dir = self.catalog.model_dir(&canonical)?;
        std::fs::create_dir_all(&dir)?;

        let client = reqwest::blocking::Client::builder()
            .timeout(None)
            .build()
            .map_err(|e| EngineError::DownloadFailure(e.to_string()))?;

        let base = entry.url.trim_end_matches('/');
        for file in &entry.files {
            let target = dir.join(file);
            if target.exists() && !force {
                continue;
            }
            let url = format!("{base}/{file}");
            info!(target: "flm::engine", %url, "downloading");
            let mut response = client
                .get(&url)
                .send()
                .and_then(|r| r.error_for_status())
                .map_err(|e| EngineError::DownloadFailure(format!("{url}: {e}")))?;

            let partial = dir.join(format!("{file}.part"));
            if let Some(parent) = partial.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&partial)?;
            response
                .copy_to(&mut out)
                .map_err(|e| EngineError::DownloadFailure(format!("{url}: {e}")))?;
            std::fs::rename(&partial, &target)?;
            info!(target: "flm::engine", file = %file, "download complete");
        }
        Ok(())
    }

    /// Delete a model directory.
    pub fn remove(&self, tag: &str) -> Result<()> {
        let dir = self.catalog.model_dir(tag)?;
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            info!(target: "flm::engine", dir = %dir.display(), "model removed");
        } else {
            warn!(target: "flm::engine", dir = %dir.display(), "model directory already absent");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn catalog_with_root(root: &Path) -> Arc<ModelCatalog> {
        let list = root.join("model_list.json");
        std::fs::write(
            &list,
            serde_json::json!({
                "model_path": "models",
                "models": {
                    "tiny": {
                        "1b": {
                            "name": "Tiny-1B",
                            "url": "https://models.example/tiny",
                            "files": ["config.json", "model.q4nx"],
                            "flm_min_version": "0.9.0",
                            "details": {
                                "family": "tiny",
                                "parameter_size": "1B",
                                "quantization_level": "Q4_NX"
                            }
                        }
                    }
                }
            })
            .to_string(),
        )
        .unwrap();
        Arc::new(ModelCatalog::load(&list, root.join("models")).unwrap())
    }

    #[test]
    fn test_missing_and_present_files() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = ModelDownloader::new(catalog_with_root(dir.path()));
        assert!(!downloader.is_downloaded("tiny"));
        assert_eq!(
            downloader.missing_files("tiny").unwrap(),
            vec!["config.json".to_string(), "model.q4nx".to_string()]
        );

        let model_dir = dir.path().join("models/Tiny-1B");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("config.json"), "{}").unwrap();
        assert_eq!(
            downloader.missing_files("tiny").unwrap(),
            vec!["model.q4nx".to_string()]
        );
        assert_eq!(
            downloader.present_files("tiny").unwrap(),
            vec!["config.json".to_string()]
        );

        std::fs::write(model_dir.join("model.q4nx"), "x").unwrap();
        assert!(downloader.is_downloaded("tiny"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = ModelDownloader::new(catalog_with_root(dir.path()));
        let model_dir = dir.path().join("models/Tiny-1B");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("config.json"), "{}").unwrap();
        downloader.remove("tiny").unwrap();
        assert!(!model_dir.exists());
        // A second remove only warns.
        downloader.remove("tiny").unwrap();
    }

    #[test]
    fn test_unknown_tag_errors() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = ModelDownloader::new(catalog_with_root(dir.path()));
        assert!(matches!(
            downloader.pull("nope", false),
            Err(EngineError::ModelNotFound(_))
        ));
    }
}
