//! Sampler parameters and runtime defaults

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// One stage of the candidate-filtering chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerStage {
    Dry,
    TopK,
    TypicalP,
    TopP,
    MinP,
    Xtc,
    Temperature,
}

pub const DEFAULT_STAGES: [SamplerStage; 7] = [
    SamplerStage::Dry,
    SamplerStage::TopK,
    SamplerStage::TypicalP,
    SamplerStage::TopP,
    SamplerStage::MinP,
    SamplerStage::Xtc,
    SamplerStage::Temperature,
];

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_TOP_P: f32 = 0.9;
pub const DEFAULT_MAX_TOKENS: u32 = 2048;
pub const MIN_MAX_TOKENS: u32 = 128;
pub const MAX_MAX_TOKENS: u32 = 4096;

/// Immutable configuration of one sampler chain.
///
/// Doubles as the `[sampling]` section of the settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub min_p: f32,
    pub typical_p: f32,
    pub repeat_penalty: f32,
    /// Tokens of history considered by the repetition penalty
    pub penalty_last_n: i32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    /// 0 = off, 1 or 2 = mirostat version (replaces `stages`)
    pub mirostat: u8,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    /// 0.0 disables DRY
    pub dry_multiplier: f32,
    pub dry_base: f32,
    pub dry_allowed_length: i32,
    pub dry_penalty_last_n: i32,
    /// 0.0 disables XTC
    pub xtc_probability: f32,
    pub xtc_threshold: f32,
    /// Fixed seed; wall-clock seconds when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    pub stages: Vec<SamplerStage>,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            top_k: 40,
            min_p: 0.05,
            typical_p: 1.0,
            repeat_penalty: 1.1,
            penalty_last_n: 64,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            dry_multiplier: 0.0,
            dry_base: 1.75,
            dry_allowed_length: 2,
            dry_penalty_last_n: -1,
            xtc_probability: 0.0,
            xtc_threshold: 0.1,
            seed: None,
            stages: DEFAULT_STAGES.to_vec(),
        }
    }
}

impl SamplerParams {
    pub fn validate(&self) -> Result<()> {
        if self.mirostat > 2 {
            return Err(EngineError::Config(format!(
                "sampling.mirostat must be 0, 1 or 2, got {}",
                self.mirostat
            )));
        }
        if self.penalty_last_n < -1 {
            return Err(EngineError::Config(format!(
                "sampling.penalty_last_n must be >= -1, got {}",
                self.penalty_last_n
            )));
        }
        Ok(())
    }

    /// Overlay the runtime temperature and top-p.
    pub fn with_defaults(&self, defaults: &SamplerDefaults) -> Self {
        Self {
            temperature: defaults.temperature,
            top_p: defaults.top_p,
            ..self.clone()
        }
    }

    pub fn resolve_seed(&self) -> u32 {
        self.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0)
        })
    }
}

/// Values the host may change between samplers.
///
/// Setters clamp to the accepted range and return the stored value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDefaults {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for SamplerDefaults {
    fn default() -> Self {
        Self::new()
    }
}

impl SamplerDefaults {
    pub const fn new() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn set_temperature(&mut self, value: f32) -> f32 {
        self.temperature = clamp_unit(value, DEFAULT_TEMPERATURE);
        self.temperature
    }

    pub fn set_top_p(&mut self, value: f32) -> f32 {
        self.top_p = clamp_unit(value, DEFAULT_TOP_P);
        self.top_p
    }

    pub fn set_max_tokens(&mut self, value: i64) -> u32 {
        self.max_tokens = value.clamp(MIN_MAX_TOKENS as i64, MAX_MAX_TOKENS as i64) as u32;
        self.max_tokens
    }
}

// NaN would survive `clamp`
fn clamp_unit(value: f32, fallback: f32) -> f32 {
    if value.is_nan() {
        fallback
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_chain_order() {
        let params = SamplerParams::default();
        assert_eq!(params.stages, DEFAULT_STAGES);
        assert_eq!(params.penalty_last_n, 64);
        assert!((params.repeat_penalty - 1.1).abs() < f32::EPSILON);
        assert_eq!(params.mirostat, 0);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_setters_clamp() {
        let mut defaults = SamplerDefaults::new();
        assert_eq!(defaults.set_temperature(1.5), 1.0);
        assert_eq!(defaults.set_temperature(-0.2), 0.0);
        assert_eq!(defaults.set_temperature(f32::NAN), DEFAULT_TEMPERATURE);
        assert_eq!(defaults.set_top_p(0.5), 0.5);
        assert_eq!(defaults.set_top_p(2.0), 1.0);
        assert_eq!(defaults.set_max_tokens(10), MIN_MAX_TOKENS);
        assert_eq!(defaults.set_max_tokens(100_000), MAX_MAX_TOKENS);
        assert_eq!(defaults.set_max_tokens(1000), 1000);
    }

    #[test]
    fn test_with_defaults_overlays() {
        let mut defaults = SamplerDefaults::new();
        defaults.set_temperature(0.2);
        defaults.set_top_p(0.5);
        let params = SamplerParams::default().with_defaults(&defaults);
        assert_eq!(params.temperature, 0.2);
        assert_eq!(params.top_p, 0.5);
        assert_eq!(params.top_k, 40);
    }

    #[test]
    fn test_fixed_seed() {
        let params = SamplerParams {
            seed: Some(42),
            ..SamplerParams::default()
        };
        assert_eq!(params.resolve_seed(), 42);
    }

    #[test]
    fn test_rejects_unknown_mirostat() {
        let params = SamplerParams {
            mirostat: 3,
            ..SamplerParams::default()
        };
        assert!(params.validate().is_err());
    }
}
