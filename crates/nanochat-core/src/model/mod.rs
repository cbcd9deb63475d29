//! GPT model.
//!
//! Provides the pieces of the transformer stack:
//! - Model configuration
//! - Rotary embeddings and RMS normalization
//! - Attention, MLP and the residual block
//! - The KV cache used for incremental decoding
//! - Checkpoint and tokenizer adapters

mod attention;
mod config;
mod kv_cache;
mod layer;
mod loader;
mod mlp;
mod rmsnorm;
mod rope;
mod tokenizer;
mod transformer;

pub use attention::{repeat_kv, AttentionMask, CausalSelfAttention};
pub use config::{ModelConfig, ROTARY_OVER_ALLOCATION};
pub use kv_cache::{KvCache, KvCacheConfig, GROWTH_STEP};
pub use layer::Block;
pub use loader::{Checkpoint, CONFIG_METADATA_KEY};
pub use mlp::{Mlp, MLP_EXPANSION};
pub use rmsnorm::{rms_norm, RMS_NORM_EPS};
pub use rope::{apply_rotary, RotaryTable, ROTARY_BASE};
pub use tokenizer::{TextTokenizer, Tokenizer, BOS_TOKENS, EOS_TOKENS};
pub use transformer::{Gpt, ModelOutput, IGNORE_INDEX, LOGIT_SOFTCAP};
