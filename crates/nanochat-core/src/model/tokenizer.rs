//! Tokenizer integration for text-to-token and token-to-text conversion.
//!
//! The engine only depends on the [`TextTokenizer`] trait. [`Tokenizer`]
//! implements it on top of a HuggingFace `tokenizer.json`.

use crate::error::{NanochatError, Result};
use std::path::Path;
use tokenizers::Tokenizer as HfTokenizer;

/// Candidate spellings of the beginning-of-sequence token, in lookup order.
pub const BOS_TOKENS: [&str; 3] = ["<|bos|>", "<s>", "<|begin_of_text|>"];

/// Candidate spellings of the end-of-sequence token, in lookup order.
pub const EOS_TOKENS: [&str; 4] = [
    "<|assistant_end|>",
    "</s>",
    "<|end_of_text|>",
    "<|endoftext|>",
];

/// Text <-> token id conversion used by the engine.
pub trait TextTokenizer {
    /// Encode text to token ids. Special tokens written literally in `text`
    /// map to their ids; nothing is prepended.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids to text.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Number of distinct ids.
    fn vocab_size(&self) -> usize;

    /// Beginning-of-sequence id, if the vocabulary has one.
    fn bos_token_id(&self) -> Option<u32>;

    /// End-of-sequence id, if the vocabulary has one.
    fn eos_token_id(&self) -> Option<u32>;

    /// Id of a single token string.
    fn token_to_id(&self, token: &str) -> Option<u32>;
}

/// HuggingFace tokenizer adapter.
#[derive(Clone)]
pub struct Tokenizer {
    /// Underlying HuggingFace tokenizer.
    inner: HfTokenizer,
    /// BOS token ID.
    bos_token_id: Option<u32>,
    /// EOS token ID.
    eos_token_id: Option<u32>,
}

impl Tokenizer {
    /// Load a tokenizer from a tokenizer.json file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(NanochatError::not_found(path));
        }
        let inner = HfTokenizer::from_file(path).map_err(|e| {
            NanochatError::Tokenizer(format!("failed to load {}: {e}", path.display()))
        })?;
        Ok(Self::from_hf(inner))
    }

    /// Load `tokenizer.json` from a model directory.
    pub fn from_dir<P: AsRef<Path>>(model_dir: P) -> Result<Self> {
        Self::from_file(model_dir.as_ref().join("tokenizer.json"))
    }

    /// Wrap an already constructed HuggingFace tokenizer.
    pub fn from_hf(inner: HfTokenizer) -> Self {
        let lookup = |candidates: &[&str]| candidates.iter().find_map(|t| inner.token_to_id(t));
        let bos_token_id = lookup(&BOS_TOKENS);
        let eos_token_id = lookup(&EOS_TOKENS);

        Self {
            inner,
            bos_token_id,
            eos_token_id,
        }
    }

    /// Token to string (for debugging).
    pub fn id_to_token(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }
}

impl TextTokenizer for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| NanochatError::Tokenizer(format!("failed to encode text: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| NanochatError::Tokenizer(format!("failed to decode tokens: {e}")))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("bos_token_id", &self.bos_token_id)
            .field("eos_token_id", &self.eos_token_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const WORD_LEVEL_JSON: &str = r#"{
      "version": "1.0",
      "truncation": null,
      "padding": null,
      "added_tokens": [
        {"id": 0, "content": "<|bos|>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
        {"id": 1, "content": "<|assistant_end|>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
      ],
      "normalizer": null,
      "pre_tokenizer": {"type": "Whitespace"},
      "post_processor": null,
      "decoder": null,
      "model": {
        "type": "WordLevel",
        "vocab": {"<|bos|>": 0, "<|assistant_end|>": 1, "<unk>": 2, "hello": 3, "world": 4},
        "unk_token": "<unk>"
      }
    }"#;

    fn write_tokenizer(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("nanochat_tokenizer_{name}_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("tokenizer.json"), WORD_LEVEL_JSON).unwrap();
        dir
    }

    #[test]
    fn tokenizer_special_tokens() {
        let dir = write_tokenizer("special");
        let tokenizer = Tokenizer::from_dir(&dir).unwrap();

        assert_eq!(tokenizer.bos_token_id(), Some(0));
        assert_eq!(tokenizer.eos_token_id(), Some(1));
        assert_eq!(tokenizer.token_to_id("world"), Some(4));
        assert!(tokenizer.vocab_size() >= 5);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn tokenizer_encode_decode() {
        let dir = write_tokenizer("encode");
        let tokenizer = Tokenizer::from_dir(&dir).unwrap();

        let ids = tokenizer.encode("<|bos|>hello world").unwrap();
        assert_eq!(ids, vec![0, 3, 4]);

        assert_eq!(tokenizer.decode(&[3, 4]).unwrap(), "hello world");
        assert_eq!(tokenizer.id_to_token(3).as_deref(), Some("hello"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_tokenizer_is_not_found() {
        let err = Tokenizer::from_dir("/nonexistent/model").unwrap_err();
        match err {
            NanochatError::NotFound { path } => {
                assert_eq!(path, Path::new("/nonexistent/model/tokenizer.json"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn malformed_tokenizer_file() {
        let dir =
            std::env::temp_dir().join(format!("nanochat_tokenizer_bad_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("tokenizer.json"), "{ not json").unwrap();

        let err = Tokenizer::from_dir(&dir).unwrap_err();
        assert!(matches!(err, NanochatError::Tokenizer(_)));

        let _ = fs::remove_dir_all(&dir);
    }
}
