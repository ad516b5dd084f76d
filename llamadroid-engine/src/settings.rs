//! Settings configuration
//!
//! Default values are defined in `config/default.toml`; a user file only
//! needs the keys it overrides.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{ContextParams, DEFAULT_N_BATCH};
use crate::generation::GenerationConfig;
use crate::sampling::SamplerParams;
use crate::window::SelfExtendConfig;

/// Default configuration TOML embedded from config/default.toml
const DEFAULT_CONFIG_TOML: &str = include_str!("../../config/default.toml");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub context: ContextSettings,
    pub generation: GenerationSettings,
    pub self_extend: SelfExtendConfig,
    pub sampling: SamplerParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSettings {
    /// Context window in tokens (0 = model default)
    pub n_ctx: u32,
    /// Number of inference threads (0 = available cores minus two, 1..=8)
    pub n_threads: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationSettings {
    /// Tokens per decode call during prefill
    pub prefill_batch: usize,
    /// Upper bound on generated tokens per request
    pub max_tokens: u32,
}

impl Default for Settings {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG_TOML).expect("embedded default.toml must be valid")
    }
}

/// Recursively merge `overlay` TOML values on top of `base`.
fn merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(key) {
                    Some(base_value) => merge_toml(base_value, value),
                    None => {
                        base_table.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, _) => *base = overlay.clone(),
    }
}

/// Parse user TOML content merged on top of default.toml.
fn parse_with_defaults(user_content: &str) -> Result<Settings> {
    let mut base: toml::Value = toml::from_str(DEFAULT_CONFIG_TOML)?;
    let user: toml::Value = toml::from_str(user_content)?;
    merge_toml(&mut base, &user);
    let settings: Settings = base.try_into()?;
    settings.validate()?;
    Ok(settings)
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "llamadroid", "llamadroid")
}

impl Settings {
    pub fn config_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
    }

    pub fn config_file() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Load settings from the default configuration file.
    /// Falls back to embedded default.toml if the config file does not exist.
    pub fn load() -> Result<Self> {
        let Some(config_file) = Self::config_file() else {
            warn!("Could not determine config directory, using defaults");
            return Ok(Self::default());
        };

        if !config_file.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        debug!("Loading config from {:?}", config_file);
        let content = fs::read_to_string(&config_file)?;
        parse_with_defaults(&content)
    }

    /// Load settings from a specific file, merged on top of defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        parse_with_defaults(&content)
    }

    /// Save settings to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.self_extend.validate()?;
        self.sampling.validate()?;
        if self.generation.prefill_batch == 0 {
            anyhow::bail!("generation.prefill_batch must be > 0");
        }
        Ok(())
    }

    /// The decode batch is sized so a full prefill chunk fits in one call.
    pub fn context_params(&self) -> ContextParams {
        let n_batch = u32::try_from(self.generation.prefill_batch).unwrap_or(u32::MAX);
        ContextParams::new(self.context.n_ctx, self.context.n_threads)
            .with_n_batch(n_batch.max(DEFAULT_N_BATCH))
    }

    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            window: self.self_extend,
            prefill_batch: self.generation.prefill_batch,
        }
    }
}
