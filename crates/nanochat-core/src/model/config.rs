//! Model configuration.

use crate::error::{ConfigError, NanochatError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Multiplier applied to `block_size` when sizing the rotary table, so that
/// incremental decoding can run past the training context.
pub const ROTARY_OVER_ALLOCATION: usize = 10;

/// Architecture dimensions of a GPT model.
///
/// Checkpoints written by older tooling name the context length
/// `sequence_len`; it is read only when `block_size` is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawModelConfig")]
pub struct ModelConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Maximum training context length.
    pub block_size: usize,
    /// Embedding width.
    pub n_embd: usize,
    /// Number of query heads.
    pub n_head: usize,
    /// Number of key/value heads (grouped-query attention).
    pub n_kv_head: usize,
    /// Number of transformer blocks.
    pub n_layer: usize,
}

/// On-disk form of [`ModelConfig`] with both context-length spellings.
#[derive(Deserialize)]
struct RawModelConfig {
    vocab_size: usize,
    block_size: Option<usize>,
    sequence_len: Option<usize>,
    n_embd: usize,
    n_head: usize,
    n_kv_head: usize,
    n_layer: usize,
}

impl TryFrom<RawModelConfig> for ModelConfig {
    type Error = String;

    fn try_from(raw: RawModelConfig) -> std::result::Result<Self, Self::Error> {
        let block_size = raw
            .block_size
            .or(raw.sequence_len)
            .ok_or_else(|| "missing field `block_size`".to_string())?;
        Ok(Self {
            vocab_size: raw.vocab_size,
            block_size,
            n_embd: raw.n_embd,
            n_head: raw.n_head,
            n_kv_head: raw.n_kv_head,
            n_layer: raw.n_layer,
        })
    }
}

impl ModelConfig {
    /// Create and validate a configuration.
    pub fn new(
        vocab_size: usize,
        block_size: usize,
        n_embd: usize,
        n_head: usize,
        n_kv_head: usize,
        n_layer: usize,
    ) -> Result<Self> {
        let config = Self {
            vocab_size,
            block_size,
            n_embd,
            n_head,
            n_kv_head,
            n_layer,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the structural invariants.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let fields = [
            ("vocab_size", self.vocab_size),
            ("block_size", self.block_size),
            ("n_embd", self.n_embd),
            ("n_head", self.n_head),
            ("n_kv_head", self.n_kv_head),
            ("n_layer", self.n_layer),
        ];
        if let Some((field, _)) = fields.into_iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::ZeroDimension { field });
        }

        if self.n_embd % self.n_head != 0 {
            return Err(ConfigError::InvalidDimensions {
                lhs: "n_embd",
                rhs: "n_head",
                reason: format!(
                    "n_embd ({}) must be divisible by n_head ({})",
                    self.n_embd, self.n_head
                ),
            });
        }
        if self.n_kv_head > self.n_head {
            return Err(ConfigError::InvalidDimensions {
                lhs: "n_head",
                rhs: "n_kv_head",
                reason: format!(
                    "n_kv_head ({}) must not exceed n_head ({})",
                    self.n_kv_head, self.n_head
                ),
            });
        }
        if self.n_head % self.n_kv_head != 0 {
            return Err(ConfigError::InvalidDimensions {
                lhs: "n_head",
                rhs: "n_kv_head",
                reason: format!(
                    "n_head ({}) must be divisible by n_kv_head ({})",
                    self.n_head, self.n_kv_head
                ),
            });
        }
        Ok(())
    }

    /// Dimension of a single attention head.
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Query heads sharing one key/value head.
    pub fn kv_group_size(&self) -> usize {
        self.n_head / self.n_kv_head
    }

    /// Number of positions covered by the rotary table.
    pub fn rotary_positions(&self) -> usize {
        self.block_size * ROTARY_OVER_ALLOCATION
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a JSON document.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Load from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(NanochatError::not_found(path));
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 50304,
            block_size: 1024,
            n_embd: 768,
            n_head: 6,
            n_kv_head: 6,
            n_layer: 12,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ModelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.kv_group_size(), 1);
        assert_eq!(config.rotary_positions(), 10240);
    }

    #[test]
    fn embd_not_divisible_by_heads() {
        let err = ModelConfig::new(1000, 128, 100, 3, 3, 2).unwrap_err();
        match err {
            NanochatError::Config(e) => assert_eq!(e.pair(), Some(("n_embd", "n_head"))),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn heads_not_divisible_by_kv_heads() {
        let err = ModelConfig::new(1000, 128, 64, 4, 3, 2).unwrap_err();
        match err {
            NanochatError::Config(e) => assert_eq!(e.pair(), Some(("n_head", "n_kv_head"))),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn more_kv_heads_than_heads() {
        let config = ModelConfig {
            vocab_size: 1000,
            block_size: 128,
            n_embd: 64,
            n_head: 2,
            n_kv_head: 4,
            n_layer: 2,
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.pair(), Some(("n_head", "n_kv_head")));
        assert!(err.to_string().contains("must not exceed"));
    }

    #[test]
    fn zero_dimension_named() {
        let err = ModelConfig::new(1000, 128, 64, 4, 4, 0).unwrap_err();
        assert!(matches!(
            err,
            NanochatError::Config(ConfigError::ZeroDimension { field: "n_layer" })
        ));
    }

    #[test]
    fn sequence_len_alias() {
        let json = r#"{"vocab_size":1000,"sequence_len":256,"n_embd":64,"n_head":4,"n_kv_head":2,"n_layer":2}"#;
        let config = ModelConfig::from_json_str(json).unwrap();
        assert_eq!(config.block_size, 256);
        assert_eq!(config.kv_group_size(), 2);
    }

    #[test]
    fn block_size_wins_over_sequence_len() {
        let json = r#"{"vocab_size":1000,"block_size":128,"sequence_len":256,"n_embd":64,"n_head":4,"n_kv_head":4,"n_layer":2}"#;
        let config = ModelConfig::from_json_str(json).unwrap();
        assert_eq!(config.block_size, 128);
    }

    #[test]
    fn missing_context_length() {
        let json = r#"{"vocab_size":1000,"n_embd":64,"n_head":4,"n_kv_head":4,"n_layer":2}"#;
        let err = ModelConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, NanochatError::Serde(_)));
        assert!(err.to_string().contains("block_size"));
    }

    #[test]
    fn json_validation_is_eager() {
        let json = r#"{"vocab_size":1000,"block_size":256,"n_embd":65,"n_head":4,"n_kv_head":4,"n_layer":2}"#;
        assert!(ModelConfig::from_json_str(json).is_err());
    }

    #[test]
    fn json_round_trip_uses_block_size() {
        let config = ModelConfig::new(1000, 128, 64, 4, 4, 2).unwrap();
        let json = config.to_json_string().unwrap();
        assert!(json.contains("\"block_size\":128"));
        assert_eq!(ModelConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = ModelConfig::from_file(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(matches!(err, NanochatError::NotFound { .. }));
    }
}
