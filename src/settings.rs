use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::config::{HarnessConfig, DEFAULT_MAX_NEW_TOKENS};
use crate::error::HarnessError;

/// One point of a hyperparameter sweep. Unset options are left to the
/// engine's own defaults and never rendered on the command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialConfig {
    pub model: Option<PathBuf>,
    pub threads: Option<u32>,
    pub ctx_size: Option<u32>,
    pub batch_size: Option<u32>,
    pub ubatch_size: Option<u32>,
    pub cache_type_k: Option<String>,
    pub cache_type_v: Option<String>,
    pub temperature: Option<f64>,
    pub repeat_penalty: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub keep: Option<i32>,
    pub flash_attn: Option<FlashAttention>,
    pub context_shift: bool,
    pub poll: Option<u32>,
    /// `Some(false)` renders `--no-mmap`.
    pub mmap: Option<bool>,
    pub max_new_tokens: u32,
    /// Inline prompts longer than this are written to a prompt file and
    /// passed with `-f` instead.
    pub inline_prompt_max_chars: Option<usize>,
    pub extra_args: Vec<String>,
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            model: None,
            threads: None,
            ctx_size: None,
            batch_size: None,
            ubatch_size: None,
            cache_type_k: None,
            cache_type_v: None,
            temperature: None,
            repeat_penalty: None,
            top_p: None,
            top_k: None,
            keep: None,
            flash_attn: None,
            context_shift: false,
            poll: None,
            mmap: None,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            inline_prompt_max_chars: None,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashAttention {
    On,
    Off,
    Auto,
}

impl FlashAttention {
    pub fn as_arg(&self) -> &'static str {
        match self {
            FlashAttention::On => "on",
            FlashAttention::Off => "off",
            FlashAttention::Auto => "auto",
        }
    }
}

impl TrialConfig {
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.threads == Some(0) {
            return Err(HarnessError::Config("threads must be > 0".into()));
        }
        if let Some(t) = self.temperature {
            if t.is_nan() || t < 0.0 {
                return Err(HarnessError::Config(format!(
                    "temperature must be >= 0, got {}",
                    t
                )));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(HarnessError::Config(format!(
                    "top_p must be in [0, 1], got {}",
                    p
                )));
            }
        }
        if self.max_new_tokens == 0 {
            return Err(HarnessError::Config("max_new_tokens must be > 0".into()));
        }
        Ok(())
    }
}

pub fn effective_config_path(config: &HarnessConfig) -> PathBuf {
    config.run_dir.join("trial-config.json")
}

/// Load a sweep point. Unlike the engine's own defaults, a broken file is
/// fatal: silently running a different configuration would mislabel the run.
pub fn load_trial_config(path: &Path) -> Result<TrialConfig, HarnessError> {
    let content = std::fs::read_to_string(path)?;
    let config: TrialConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

pub fn save_trial_config(path: &Path, config: &TrialConfig) {
    match serde_json::to_string_pretty(config) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                warn!("Failed to save trial config to {:?}: {}", path, e);
            }
        }
        Err(e) => {
            warn!("Failed to serialize trial config: {}", e);
        }
    }
}
