//! # nanochat
//!
//! Chat inference for small GPT models trained nanochat-style.
//!
//! - **Streaming generation**: tokens are produced lazily, one forward pass each
//! - **KV cache**: the prompt is prefilled once, then one token per step
//! - **Chat rendering**: conversations map onto the `<|user_start|>` /
//!   `<|assistant_start|>` special-token format
//! - **Checkpoints**: safetensors weights with the model config in metadata
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use nanochat::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let engine = EngineBuilder::new()
//!         .checkpoint("model/model.safetensors")
//!         .seed(42)
//!         .build()?;
//!
//!     let mut chat = ChatSession::new(engine)?;
//!     let params = SamplingParams::default().with_temperature(0.6).with_top_k(50);
//!     chat.send("Why is the sky blue?", params, 256, |token| print!("{}", token.text))?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use nanochat_core::*;

pub mod chat;
pub mod engine;

pub use chat::{ChatSession, Conversation, Message, Role};
pub use engine::EngineBuilder;

/// Commonly used types.
pub mod prelude {
    pub use crate::chat::{ChatSession, Conversation, Message, Role};
    pub use crate::engine::EngineBuilder;
    pub use nanochat_core::prelude::*;

    // Re-export useful external types
    pub use anyhow;
    pub use tracing;
}
