//! Model catalog (`model_list.json`) and environment resolution.
//!
//! Tag syntax is `<family>` or `<family>:<size>`; a bare family resolves to
//! the first size listed for it. The catalog file is searched in
//! `FLM_CONFIG_PATH`, the install prefix, the executable directory and the
//! working directory, in that order.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::EngineError;
use crate::Result;

const CATALOG_FILE: &str = "model_list.json";
const INSTALL_PREFIX: &str = "/usr/local/share/flm";
pub const DEFAULT_SERVE_PORT: u16 = 52625;

/// Families that never appear in the chat-model listings.
const HIDDEN_FAMILIES: &[&str] = &["whisper-v3", "embed-gemma"];

#[derive(Debug, Clone, Deserialize)]
pub struct ModelDetails {
    pub family: String,
    pub parameter_size: String,
    pub quantization_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub url: String,
    pub files: Vec<String>,
    #[serde(default)]
    pub flm_min_version: String,
    pub details: ModelDetails,
}

#[derive(Debug)]
pub struct ModelCatalog {
    config: Value,
    model_root: PathBuf,
    tags: HashSet<String>,
}

impl ModelCatalog {
    /// Parse a catalog file; model archives live under `model_root`.
    pub fn load(list_path: &Path, model_root: PathBuf) -> Result<Self> {
        let raw = std::fs::read_to_string(list_path).map_err(|e| {
            EngineError::InvalidRequest(format!("cannot read {}: {e}", list_path.display()))
        })?;
        let config: Value = serde_json::from_str(&raw)?;
        let mut tags = HashSet::new();
        let models = config
            .get("models")
            .and_then(Value::as_object)
            .ok_or_else(|| EngineError::InvalidRequest("catalog has no `models` table".into()))?;
        for (family, sizes) in models {
            tags.insert(family.clone());
            if let Some(sizes) = sizes.as_object() {
                for size in sizes.keys() {
                    tags.insert(format!("{family}:{size}"));
                }
            }
        }
        debug!(target: "flm::engine", tags = tags.len(), "catalog loaded");
        Ok(Self {
            config,
            model_root,
            tags,
        })
    }

    /// Locate the catalog file: `FLM_CONFIG_PATH`, install prefix,
    /// executable directory, then the working directory.
    pub fn locate_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("FLM_CONFIG_PATH") {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        let mut candidates = vec![Path::new(INSTALL_PREFIX).join(CATALOG_FILE)];
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                candidates.push(dir.join(CATALOG_FILE));
            }
        }
        candidates.push(PathBuf::from(CATALOG_FILE));
        candidates.into_iter().find(|p| p.exists())
    }

    /// Root directory for model archives: `FLM_MODEL_PATH` or the platform
    /// user configuration directory.
    pub fn default_model_root() -> PathBuf {
        if let Ok(path) = std::env::var("FLM_MODEL_PATH") {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("flm")
    }

    /// Serve port: explicit flag, `FLM_SERVE_PORT`, then the hard default.
    pub fn serve_port(user_port: Option<u16>) -> u16 {
        if let Some(port) = user_port {
            if port > 0 {
                return port;
            }
        }
        if let Ok(raw) = std::env::var("FLM_SERVE_PORT") {
            if let Ok(port) = raw.trim().parse::<u16>() {
                if port > 0 {
                    return port;
                }
            }
        }
        DEFAULT_SERVE_PORT
    }

    pub fn model_root(&self) -> &Path {
        &self.model_root
    }

    pub fn is_supported(&self, tag: &str) -> bool {
        self.tags.contains(Self::cut_tag(tag))
    }

    /// Some clients prefix tags (`registry/llama3.2:1b`); drop the prefix.
    fn cut_tag(tag: &str) -> &str {
        match tag.rfind('/') {
            Some(pos) => &tag[pos + 1..],
            None => tag,
        }
    }

    /// Canonical `family:size` form; a bare family takes its first size.
    pub fn rectify_tag(&self, tag: &str) -> Result<String> {
        let tag = Self::cut_tag(tag);
        if tag.contains(':') {
            if self.tags.contains(tag) {
                return Ok(tag.to_string());
            }
            return Err(EngineError::ModelNotFound(tag.to_string()));
        }
        let sizes = self.config["models"]
            .get(tag)
            .and_then(Value::as_object)
            .ok_or_else(|| EngineError::ModelNotFound(tag.to_string()))?;
        let first = sizes
            .keys()
            .next()
            .ok_or_else(|| EngineError::ModelNotFound(tag.to_string()))?;
        Ok(format!("{tag}:{first}"))
    }

    /// Resolve a tag to its canonical form and catalog entry.
    pub fn model_info(&self, tag: &str) -> Result<(String, ModelEntry)> {
        let canonical = self.rectify_tag(tag)?;
        let (family, size) = canonical
            .split_once(':')
            .ok_or_else(|| EngineError::ModelNotFound(canonical.clone()))?;
        let value = self.config["models"]
            .get(family)
            .and_then(|f| f.get(size))
            .cloned()
            .ok_or_else(|| EngineError::ModelNotFound(canonical.clone()))?;
        let entry: ModelEntry = serde_json::from_value(value)?;
        Ok((canonical, entry))
    }

    /// On-disk directory of a model archive.
    pub fn model_dir(&self, tag: &str) -> Result<PathBuf> {
        let (_, entry) = self.model_info(tag)?;
        Ok(self.model_root.join(&entry.name))
    }

    /// Every canonical `family:size` tag in file order.
    pub fn all_model_tags(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(models) = self.config["models"].as_object() {
            for (family, sizes) in models {
                if let Some(sizes) = sizes.as_object() {
                    for size in sizes.keys() {
                        out.push(format!("{family}:{size}"));
                    }
                }
            }
        }
        out
    }

    /// `/api/tags` payload.
    pub fn ollama_models_json(&self) -> Value {
        let mut models = Vec::new();
        if let Some(table) = self.config["models"].as_object() {
            for (family, sizes) in table {
                if HIDDEN_FAMILIES.contains(&family.as_str()) {
                    continue;
                }
                if let Some(sizes) = sizes.as_object() {
                    for (size, info) in sizes {
                        let tag = format!("{family}:{size}");
                        models.push(json!({
                            "name": tag,
                            "model": tag,
                            "details": {
                                "family": info["details"]["family"],
                                "parameter_size": info["details"]["parameter_size"],
                                "quantization_level": info["details"]["quantization_level"],
                            }
                        }));
                    }
                }
            }
        }
        json!({ "models": models })
    }

    /// `/v1/models` payload.
    pub fn openai_models_json(&self, created: i64) -> Value {
        let mut data = Vec::new();
        if let Some(table) = self.config["models"].as_object() {
            for (family, sizes) in table {
                if HIDDEN_FAMILIES.contains(&family.as_str()) {
                    continue;
                }
                if let Some(sizes) = sizes.as_object() {
                    for size in sizes.keys() {
                        data.push(json!({
                            "id": format!("{family}:{size}"),
                            "object": "model",
                            "created": created,
                            "owned_by": "flm",
                        }));
                    }
                }
            }
        }
        json!({ "object": "list", "data": data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_catalog() -> ModelCatalog {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CATALOG_FILE);
        std::fs::write(
            &path,
            serde_json::to_string_pretty(&json!({
                "model_path": "models",
                "models": {
                    "llama3.2": {
                        "1b": {
                            "name": "Llama-3.2-1B-Instruct-NPU",
                            "url": "https://models.example/llama32-1b",
                            "files": ["config.json", "tokenizer.json", "model.q4nx"],
                            "flm_min_version": "0.9.0",
                            "details": {
                                "family": "llama",
                                "parameter_size": "1.2B",
                                "quantization_level": "Q4_NX"
                            }
                        },
                        "3b": {
                            "name": "Llama-3.2-3B-Instruct-NPU",
                            "url": "https://models.example/llama32-3b",
                            "files": ["config.json", "tokenizer.json", "model.q4nx"],
                            "flm_min_version": "0.9.0",
                            "details": {
                                "family": "llama",
                                "parameter_size": "3.2B",
                                "quantization_level": "Q4_NX"
                            }
                        }
                    },
                    "whisper-v3": {
                        "turbo": {
                            "name": "Whisper-V3-Turbo-NPU",
                            "url": "https://models.example/whisper",
                            "files": ["config.json"],
                            "flm_min_version": "0.9.0",
                            "details": {
                                "family": "whisper",
                                "parameter_size": "0.8B",
                                "quantization_level": "Q4_NX"
                            }
                        }
                    }
                }
            }))
            .unwrap(),
        )
        .unwrap();
        ModelCatalog::load(&path, PathBuf::from("/tmp/models")).unwrap()
    }

    #[test]
    fn test_bare_family_resolves_to_first_size() {
        let catalog = sample_catalog();
        assert_eq!(catalog.rectify_tag("llama3.2").unwrap(), "llama3.2:1b");
        assert_eq!(catalog.rectify_tag("llama3.2:3b").unwrap(), "llama3.2:3b");
        assert_eq!(
            catalog.rectify_tag("registry/llama3.2:1b").unwrap(),
            "llama3.2:1b"
        );
    }

    #[test]
    fn test_unknown_tag_is_an_error() {
        let catalog = sample_catalog();
        assert!(matches!(
            catalog.rectify_tag("qwen9"),
            Err(EngineError::ModelNotFound(_))
        ));
        assert!(matches!(
            catalog.rectify_tag("llama3.2:70b"),
            Err(EngineError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_model_info_and_dir() {
        let catalog = sample_catalog();
        let (tag, entry) = catalog.model_info("llama3.2").unwrap();
        assert_eq!(tag, "llama3.2:1b");
        assert_eq!(entry.details.family, "llama");
        assert_eq!(
            catalog.model_dir("llama3.2").unwrap(),
            PathBuf::from("/tmp/models/Llama-3.2-1B-Instruct-NPU")
        );
    }

    #[test]
    fn test_listings_hide_asr_families() {
        let catalog = sample_catalog();
        let ollama = catalog.ollama_models_json();
        let names: Vec<&str> = ollama["models"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"llama3.2:1b"));
        assert!(!names.iter().any(|n| n.starts_with("whisper")));

        let openai = catalog.openai_models_json(123);
        assert_eq!(openai["object"], "list");
        assert!(openai["data"].as_array().unwrap().len() >= 2);
    }

    #[test]
    fn test_serve_port_resolution() {
        assert_eq!(ModelCatalog::serve_port(Some(8000)), 8000);
        // With no flag and no environment override the hard default wins.
        std::env::remove_var("FLM_SERVE_PORT");
        assert_eq!(ModelCatalog::serve_port(None), DEFAULT_SERVE_PORT);
    }
}
