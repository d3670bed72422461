//! 采样器配置

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// 采样器配置
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Controls diversity via top-k sampling.
    /// Higher values mean more diverse outputs.
    #[serde(default)]
    pub top_k: i32,

    /// Controls diversity via nucleus sampling.
    /// Lower values mean more focused outputs.
    #[serde(default)]
    pub top_p: f32,

    /// Controls randomness.
    /// Values <= 0.0 select greedy (deterministic) sampling.
    #[serde(default)]
    pub temperature: f32,

    /// Min-p 采样阈值
    #[serde(default)]
    pub min_p: f32,

    /// Seed for random number generation.
    /// 0 表示随机
    #[serde(default)]
    pub seed: u32,

    /// Size of the sliding window for repeat penalty
    #[serde(default)]
    pub penalty_last_n: i32,

    /// Repeat penalty coefficient
    #[serde(default)]
    pub penalty_repeat: f32,

    /// Frequency penalty coefficient
    #[serde(default)]
    pub penalty_freq: f32,

    /// Presence penalty coefficient
    #[serde(default)]
    pub penalty_present: f32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            seed: 0,
            penalty_last_n: 64,
            penalty_repeat: 1.0,
            penalty_freq: 0.0,
            penalty_present: 0.0,
        }
    }
}

impl SamplerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic sampling, used by every session preset.
    pub fn greedy() -> Self {
        Self::default().with_temperature(0.0)
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_k(mut self, top_k: i32) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_min_p(mut self, min_p: f32) -> Self {
        self.min_p = min_p;
        self
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_penalty_repeat(mut self, penalty_last_n: i32, penalty_repeat: f32) -> Self {
        self.penalty_last_n = penalty_last_n;
        self.penalty_repeat = penalty_repeat;
        self
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    pub fn seed(&self) -> u32 {
        // 随机值
        if self.seed == 0 {
            rand::rng().next_u32()
        } else {
            self.seed
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(Error::InvalidInput {
                field: "top_p".into(),
                message: format!("{} is outside [0, 1]", self.top_p),
            });
        }
        if !(0.0..=1.0).contains(&self.min_p) {
            return Err(Error::InvalidInput {
                field: "min_p".into(),
                message: format!("{} is outside [0, 1]", self.min_p),
            });
        }
        if self.penalty_last_n < -1 {
            return Err(Error::InvalidInput {
                field: "penalty_last_n".into(),
                message: "must be -1 (whole context), 0 (disabled) or positive".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greedy() {
        let config = SamplerConfig::greedy();
        assert!(config.is_greedy());
        assert!(SamplerConfig::default().with_temperature(-1.0).is_greedy());
        assert!(!SamplerConfig::default().is_greedy());
    }

    #[test]
    fn test_seed() {
        assert_eq!(SamplerConfig::default().with_seed(42).seed(), 42);
    }

    #[test]
    fn test_validate() {
        assert!(SamplerConfig::default().validate().is_ok());
        assert!(SamplerConfig::default().with_top_p(1.5).validate().is_err());
    }
}
