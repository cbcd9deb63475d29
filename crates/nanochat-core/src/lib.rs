//! # nanochat Core
//!
//! Inference and fine-tuning core for small GPT chat models.
//!
//! This crate provides:
//! - **GPT forward pass** with rotary embeddings, QK norm, grouped-query
//!   attention, squared-ReLU MLP and logit softcapping
//! - **Training-mode loss** (masked cross-entropy) that stays differentiable
//! - **KV cache** for prefill + single-token decoding, growing on demand
//! - **Sampling** with temperature, top-k and top-p
//! - **Streaming generation engine** over any [`model::TextTokenizer`]
//! - **Checkpoint I/O** in safetensors format with JSON config metadata

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod engine;
pub mod error;
pub mod model;
pub mod sampling;

pub use error::{ConfigError, NanochatError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::engine::{Engine, EngineConfig, GeneratedToken, Prompt, TokenStream};
    pub use crate::error::{ConfigError, NanochatError, Result};
    pub use crate::model::{
        Checkpoint, Gpt, KvCache, KvCacheConfig, ModelConfig, ModelOutput, TextTokenizer,
        Tokenizer,
    };
    pub use crate::sampling::{sample, SamplingParams};
}
