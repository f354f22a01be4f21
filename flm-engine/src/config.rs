//! Model configuration (`config.json` in the model directory).

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::EngineError;
use crate::Result;

fn default_layer_bin() -> String {
    "layer.xclbin".into()
}
fn default_lm_head_bin() -> String {
    "lm_head.xclbin".into()
}
fn default_dequant_bin() -> String {
    "dequant.xclbin".into()
}
fn default_mm_engine_bin() -> String {
    "mm.xclbin".into()
}
fn default_mha_engine_bin() -> String {
    "attn.xclbin".into()
}

/// Architecture parameters of a text model, plus the accelerator binaries it
/// ships with. Vision-tower fields are present only for multimodal archives.
#[derive(Debug, Clone, Deserialize)]
pub struct LmConfig {
    pub model_type: String,
    pub vocab_size: u32,
    pub hidden_size: u32,
    pub intermediate_size: u32,
    pub num_attention_heads: u32,
    pub num_hidden_layers: u32,
    pub num_key_value_heads: u32,
    pub head_dim: u32,
    pub rms_norm_eps: f32,
    pub rope_theta: f32,
    #[serde(default = "default_flm_version")]
    pub flm_version: String,

    #[serde(default)]
    pub hidden_act: String,
    #[serde(default)]
    pub sliding_window: u32,
    #[serde(default)]
    pub sliding_window_pattern: u32,
    #[serde(default)]
    pub eos_token_ids: Vec<u32>,
    #[serde(default)]
    pub bos_token_id: Option<u32>,

    // On-device buffer windows used by the sequence builders.
    #[serde(default)]
    pub addr_qk: u32,
    #[serde(default)]
    pub addr_kv: u32,
    #[serde(default)]
    pub addr_l_begin_mha: u32,
    #[serde(default)]
    pub addr_l_end_mha: u32,
    #[serde(default)]
    pub addr_kk: u32,

    #[serde(default = "default_layer_bin")]
    pub layer_xclbin_name: String,
    #[serde(default = "default_lm_head_bin")]
    pub lm_head_xclbin_name: String,
    #[serde(default = "default_dequant_bin")]
    pub dequant_xclbin_name: String,
    #[serde(default = "default_mm_engine_bin")]
    pub mm_engine_xclbin_name: String,
    #[serde(default = "default_mha_engine_bin")]
    pub mha_engine_xclbin_name: String,

    #[serde(default)]
    pub vision_model_weight: String,
    #[serde(default)]
    pub vision_hidden_size: u32,
    #[serde(default)]
    pub vision_num_hidden_layers: u32,
    #[serde(default)]
    pub vision_num_attention_heads: u32,
}

fn default_flm_version() -> String {
    "0.0.0".into()
}

impl LmConfig {
    /// Read and validate `<dir>/config.json`.
    pub fn from_pretrained(dir: &Path) -> Result<Self> {
        let path = dir.join("config.json");
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            EngineError::InvalidRequest(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let checks = [
            (self.vocab_size, "vocab_size"),
            (self.hidden_size, "hidden_size"),
            (self.intermediate_size, "intermediate_size"),
            (self.num_attention_heads, "num_attention_heads"),
            (self.num_hidden_layers, "num_hidden_layers"),
            (self.num_key_value_heads, "num_key_value_heads"),
            (self.head_dim, "head_dim"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(EngineError::InvalidRequest(format!(
                    "config.json: {name} must be positive"
                )));
            }
        }
        if self.rms_norm_eps <= 0.0 {
            return Err(EngineError::InvalidRequest(
                "config.json: rms_norm_eps must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn is_vlm(&self) -> bool {
        !self.vision_model_weight.is_empty()
    }

    /// Whether layer `l` uses sliding-window attention. With pattern `p`,
    /// every p-th layer is a full-attention layer and the rest slide; a zero
    /// pattern means every layer attends globally.
    pub fn is_sliding(&self, layer: u32) -> bool {
        if self.sliding_window_pattern == 0 || self.sliding_window == 0 {
            return false;
        }
        (layer + 1) % self.sliding_window_pattern != 0
    }

    pub fn layer_bin(&self, dir: &Path) -> PathBuf {
        dir.join(&self.layer_xclbin_name)
    }

    pub fn lm_head_bin(&self, dir: &Path) -> PathBuf {
        dir.join(&self.lm_head_xclbin_name)
    }

    pub fn dequant_bin(&self, dir: &Path) -> PathBuf {
        dir.join(&self.dequant_xclbin_name)
    }

    pub fn mm_engine_bin(&self, dir: &Path) -> PathBuf {
        dir.join(&self.mm_engine_xclbin_name)
    }

    pub fn mha_engine_bin(&self, dir: &Path) -> PathBuf {
        dir.join(&self.mha_engine_xclbin_name)
    }

    /// Human summary for `/show` and the REPL.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "  model_type:             {}", self.model_type);
        let _ = writeln!(out, "  compatible_flm_version: >= {}", self.flm_version);
        let _ = writeln!(out, "  head_dim:               {}", self.head_dim);
        let _ = writeln!(out, "  hidden_size:            {}", self.hidden_size);
        if !self.hidden_act.is_empty() {
            let _ = writeln!(out, "  hidden_act:             {}", self.hidden_act);
        }
        let _ = writeln!(out, "  intermediate_size:      {}", self.intermediate_size);
        let _ = writeln!(out, "  num_attention_heads:    {}", self.num_attention_heads);
        let _ = writeln!(out, "  num_hidden_layers:      {}", self.num_hidden_layers);
        let _ = writeln!(out, "  num_key_value_heads:    {}", self.num_key_value_heads);
        let _ = writeln!(out, "  rms_norm_eps:           {}", self.rms_norm_eps);
        if self.sliding_window > 0 {
            let _ = writeln!(out, "  sliding_window:         {}", self.sliding_window);
            let _ = writeln!(out, "  sliding_window_pattern: {}", self.sliding_window_pattern);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_config_json() -> serde_json::Value {
        serde_json::json!({
            "model_type": "gemma3_text",
            "vocab_size": 262144,
            "hidden_size": 1152,
            "intermediate_size": 6912,
            "num_attention_heads": 4,
            "num_hidden_layers": 26,
            "num_key_value_heads": 1,
            "head_dim": 256,
            "rms_norm_eps": 1e-6,
            "rope_theta": 1000000.0,
            "flm_version": "0.9.0",
            "sliding_window": 512,
            "sliding_window_pattern": 6,
            "eos_token_ids": [1, 106]
        })
    }

    #[test]
    fn test_parse_and_defaults() {
        let config: LmConfig = serde_json::from_value(sample_config_json()).unwrap();
        assert_eq!(config.num_hidden_layers, 26);
        assert_eq!(config.layer_xclbin_name, "layer.xclbin");
        assert!(!config.is_vlm());
    }

    #[test]
    fn test_sliding_schedule() {
        let config: LmConfig = serde_json::from_value(sample_config_json()).unwrap();
        // Every 6th layer is global, the rest slide.
        assert!(config.is_sliding(0));
        assert!(config.is_sliding(4));
        assert!(!config.is_sliding(5));
        assert!(!config.is_sliding(11));
        assert!(config.is_sliding(12));
    }

    #[test]
    fn test_no_pattern_means_full_attention() {
        let mut value = sample_config_json();
        value["sliding_window_pattern"] = serde_json::json!(0);
        let config: LmConfig = serde_json::from_value(value).unwrap();
        assert!(!config.is_sliding(0));
        assert!(!config.is_sliding(25));
    }

    #[test]
    fn test_zero_field_rejected() {
        let mut value = sample_config_json();
        value["hidden_size"] = serde_json::json!(0);
        let config: LmConfig = serde_json::from_value(value).unwrap();
        assert!(config.validate().is_err());
    }
}
