//! Autoregressive generation.
//!
//! The [`Engine`] owns a model, a tokenizer and a seeded RNG.
//! [`Engine::generate_stream`] returns a [`TokenStream`], a lazy iterator
//! that runs one forward pass per `next()`:
//!
//! 1. Prefill: the whole prompt goes through the model and fills a fresh
//!    [`KvCache`].
//! 2. Decode: each later step feeds only the previously sampled token.
//!
//! The stream ends without emitting when the end-of-sequence id is sampled
//! or after `max_tokens` steps. An error is yielded once and ends the stream.

use crate::error::{NanochatError, Result};
use crate::model::{Gpt, KvCache, KvCacheConfig, TextTokenizer};
use crate::sampling::{sample, SamplingParams};
use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, trace};

/// Prompt given as text or as already encoded ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt<'a> {
    /// Text, encoded with the engine's tokenizer.
    Text(&'a str),
    /// Token ids, used as-is.
    Tokens(&'a [u32]),
}

impl<'a> From<&'a str> for Prompt<'a> {
    fn from(text: &'a str) -> Self {
        Self::Text(text)
    }
}

impl<'a> From<&'a String> for Prompt<'a> {
    fn from(text: &'a String) -> Self {
        Self::Text(text.as_str())
    }
}

impl<'a> From<&'a [u32]> for Prompt<'a> {
    fn from(ids: &'a [u32]) -> Self {
        Self::Tokens(ids)
    }
}

impl<'a> From<&'a Vec<u32>> for Prompt<'a> {
    fn from(ids: &'a Vec<u32>) -> Self {
        Self::Tokens(ids.as_slice())
    }
}

/// Engine settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// RNG seed. `None` seeds from system entropy.
    pub seed: Option<u64>,
    /// Id that ends generation. `None` falls back to the tokenizer's.
    pub eos_token_id: Option<u32>,
}

impl EngineConfig {
    /// Set the RNG seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the end-of-sequence id.
    pub fn with_eos_token_id(mut self, id: u32) -> Self {
        self.eos_token_id = Some(id);
        self
    }
}

/// One emitted token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedToken {
    /// Decoded text of this token alone.
    pub text: String,
    /// Token id.
    pub id: u32,
}

/// Generation engine.
pub struct Engine<T> {
    model: Gpt,
    tokenizer: T,
    eos_token_id: Option<u32>,
    rng: StdRng,
}

impl<T: TextTokenizer> Engine<T> {
    /// Create an engine.
    pub fn new(model: Gpt, tokenizer: T, config: EngineConfig) -> Self {
        let eos_token_id = config.eos_token_id.or_else(|| tokenizer.eos_token_id());
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            model,
            tokenizer,
            eos_token_id,
            rng,
        }
    }

    /// Replace the end-of-sequence id.
    pub fn with_eos_token_id(mut self, id: u32) -> Self {
        self.eos_token_id = Some(id);
        self
    }

    /// Replace the end-of-sequence id in place.
    pub fn set_eos_token_id(&mut self, id: Option<u32>) {
        self.eos_token_id = id;
    }

    /// Reseed the RNG.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Start generating from `prompt`.
    ///
    /// Nothing runs until the stream is polled. An empty prompt yields an
    /// already finished stream.
    pub fn generate_stream<'p>(
        &mut self,
        prompt: impl Into<Prompt<'p>>,
        max_tokens: usize,
        sampling: SamplingParams,
    ) -> Result<TokenStream<'_, T>> {
        sampling.validate()?;

        let ids = match prompt.into() {
            Prompt::Text(text) => self.tokenizer.encode(text)?,
            Prompt::Tokens(ids) => ids.to_vec(),
        };
        let prompt_len = ids.len();

        let cache = if ids.is_empty() || max_tokens == 0 {
            None
        } else {
            let config = KvCacheConfig::for_model(self.model.config(), 1, prompt_len + max_tokens);
            Some(KvCache::new(config, self.model.dtype(), self.model.device())?)
        };
        let done = cache.is_none();

        debug!(prompt_len, max_tokens, ?sampling, "starting generation");

        Ok(TokenStream {
            engine: self,
            cache,
            pending: ids,
            sampling,
            max_tokens,
            prompt_len,
            generated: Vec::new(),
            forward_passes: 0,
            done,
        })
    }

    /// Generate and concatenate the decoded text of every emitted token.
    pub fn generate<'p>(
        &mut self,
        prompt: impl Into<Prompt<'p>>,
        max_tokens: usize,
        sampling: SamplingParams,
    ) -> Result<String> {
        let mut text = String::new();
        for token in self.generate_stream(prompt, max_tokens, sampling)? {
            text.push_str(&token?.text);
        }
        Ok(text)
    }

    /// Get the model.
    pub fn model(&self) -> &Gpt {
        &self.model
    }

    /// Get the tokenizer.
    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    /// Id that ends generation, if any.
    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }
}

impl<T> std::fmt::Debug for Engine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", self.model.config())
            .field("device", self.model.device())
            .field("eos_token_id", &self.eos_token_id)
            .finish()
    }
}

/// Lazy stream of generated tokens.
///
/// Holds the engine mutably for its whole life, so a single generation owns
/// the model, the RNG and its cache.
pub struct TokenStream<'a, T> {
    engine: &'a mut Engine<T>,
    cache: Option<KvCache>,
    /// Ids for the next forward pass: the prompt, then the last sample.
    pending: Vec<u32>,
    sampling: SamplingParams,
    max_tokens: usize,
    prompt_len: usize,
    generated: Vec<u32>,
    forward_passes: usize,
    done: bool,
}

impl<'a, T: TextTokenizer> TokenStream<'a, T> {
    /// Ids emitted so far.
    pub fn generated_ids(&self) -> &[u32] {
        &self.generated
    }

    /// Number of prompt tokens.
    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    /// Forward passes run so far.
    pub fn forward_passes(&self) -> usize {
        self.forward_passes
    }

    /// Whether the stream has ended.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn step(&mut self) -> Result<Option<GeneratedToken>> {
        let engine = &mut *self.engine;
        let cache = self
            .cache
            .as_mut()
            .ok_or_else(|| NanochatError::State("token stream has no cache".into()))?;

        let input = Tensor::new(self.pending.as_slice(), engine.model.device())?.unsqueeze(0)?;
        let logits = engine.model.logits(&input, Some(cache))?;
        self.forward_passes += 1;

        let seq_len = logits.dim(1)?;
        let last = logits.narrow(1, seq_len - 1, 1)?.squeeze(1)?;
        let id = sample(&last, &self.sampling, &mut engine.rng)?
            .first()
            .copied()
            .ok_or_else(|| NanochatError::State("sampler returned no id".into()))?;

        if Some(id) == engine.eos_token_id {
            trace!(id, "end of sequence");
            return Ok(None);
        }

        let text = engine.tokenizer.decode(&[id])?;
        trace!(id, text = %text, "token");

        self.generated.push(id);
        self.pending.clear();
        self.pending.push(id);
        Ok(Some(GeneratedToken { text, id }))
    }

    fn finish(&mut self, reason: &'static str) {
        self.done = true;
        self.cache = None;
        debug!(
            reason,
            generated = self.generated.len(),
            forward_passes = self.forward_passes,
            "generation finished"
        );
    }
}

impl<'a, T: TextTokenizer> Iterator for TokenStream<'a, T> {
    type Item = Result<GeneratedToken>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.forward_passes >= self.max_tokens {
            self.finish("max_tokens");
            return None;
        }

        match self.step() {
            Ok(Some(token)) => Some(Ok(token)),
            Ok(None) => {
                self.finish("eos");
                None
            }
            Err(e) => {
                self.finish("error");
                Some(Err(e))
            }
        }
    }
}

impl<'a, T: TextTokenizer> std::iter::FusedIterator for TokenStream<'a, T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelConfig;
    use candle_core::Device;

    /// Maps every char to `byte % vocab` and renders ids as `[id]`.
    struct ByteTokenizer {
        vocab_size: usize,
        eos: Option<u32>,
    }

    impl TextTokenizer for ByteTokenizer {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.bytes().map(|b| b as u32 % self.vocab_size as u32).collect())
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            Ok(ids.iter().map(|id| format!("[{id}]")).collect())
        }

        fn vocab_size(&self) -> usize {
            self.vocab_size
        }

        fn bos_token_id(&self) -> Option<u32> {
            None
        }

        fn eos_token_id(&self) -> Option<u32> {
            self.eos
        }

        fn token_to_id(&self, _token: &str) -> Option<u32> {
            None
        }
    }

    fn config() -> ModelConfig {
        ModelConfig::new(64, 32, 32, 4, 2, 2).unwrap()
    }

    fn engine(model: Gpt, eos: Option<u32>, seed: u64) -> Engine<ByteTokenizer> {
        let tokenizer = ByteTokenizer {
            vocab_size: 64,
            eos,
        };
        Engine::new(model, tokenizer, EngineConfig::default().with_seed(seed))
    }

    fn greedy_ids(
        engine: &mut Engine<ByteTokenizer>,
        prompt: &[u32],
        max_tokens: usize,
    ) -> Vec<u32> {
        engine
            .generate_stream(prompt, max_tokens, SamplingParams::greedy())
            .unwrap()
            .map(|t| t.unwrap().id)
            .collect()
    }

    #[test]
    fn empty_prompt_runs_nothing() {
        let mut engine = engine(Gpt::random(config(), &Device::Cpu).unwrap(), None, 0);

        let mut stream = engine
            .generate_stream("", 10, SamplingParams::default())
            .unwrap();
        assert!(stream.is_done());
        assert!(stream.next().is_none());
        assert_eq!(stream.forward_passes(), 0);
        assert!(stream.generated_ids().is_empty());

        let empty: &[u32] = &[];
        assert_eq!(engine.generate(empty, 10, SamplingParams::default()).unwrap(), "");
    }

    #[test]
    fn zero_max_tokens_runs_nothing() {
        let mut engine = engine(Gpt::random(config(), &Device::Cpu).unwrap(), None, 0);
        let stream = engine
            .generate_stream("abc", 0, SamplingParams::default())
            .unwrap();
        assert!(stream.is_done());
    }

    #[test]
    fn stops_after_max_tokens() {
        let mut engine = engine(Gpt::random(config(), &Device::Cpu).unwrap(), None, 1);

        let mut stream = engine
            .generate_stream("hello", 6, SamplingParams::default())
            .unwrap();
        let mut count = 0;
        for token in stream.by_ref() {
            let token = token.unwrap();
            assert_eq!(token.text, format!("[{}]", token.id));
            count += 1;
        }
        assert_eq!(count, 6);
        assert_eq!(stream.forward_passes(), 6);
        assert_eq!(stream.prompt_len(), 5);
        assert_eq!(stream.generated_ids().len(), 6);
        assert!(stream.is_done());
        assert!(stream.next().is_none());
    }

    #[test]
    fn eos_stops_without_emission() {
        let model = Gpt::random(config(), &Device::Cpu).unwrap();
        let prompt = [1u32, 2, 3];

        let mut free = engine(model.clone(), None, 0);
        let reference = greedy_ids(&mut free, &prompt, 8);

        // First position whose id has not appeared before
        let cut = (0..reference.len())
            .find(|&i| i > 0 && !reference[..i].contains(&reference[i]))
            .unwrap_or(0);
        let eos = reference[cut];

        let mut stopping = engine(model, Some(eos), 0);
        let mut stream = stopping
            .generate_stream(&prompt[..], 8, SamplingParams::greedy())
            .unwrap();
        let emitted: Vec<u32> = stream.by_ref().map(|t| t.unwrap().id).collect();

        assert_eq!(emitted, reference[..cut].to_vec());
        assert!(!emitted.contains(&eos));
        assert_eq!(stream.forward_passes(), cut + 1);
    }

    #[test]
    fn eos_defaults_to_tokenizer() {
        let engine = engine(Gpt::random(config(), &Device::Cpu).unwrap(), Some(9), 0);
        assert_eq!(engine.eos_token_id(), Some(9));
        assert_eq!(engine.with_eos_token_id(4).eos_token_id(), Some(4));
    }

    #[test]
    fn greedy_stream_matches_uncached_decoding() {
        let model = Gpt::random(config(), &Device::Cpu).unwrap();
        let prompt = vec![5u32, 17, 42, 8];

        let mut engine = engine(model.clone(), None, 0);
        let streamed = greedy_ids(&mut engine, &prompt, 6);

        // Recompute the full sequence every step without a cache
        let mut sequence = prompt.clone();
        let mut expected = Vec::new();
        for _ in 0..6 {
            let idx = Tensor::new(sequence.as_slice(), &Device::Cpu)
                .unwrap()
                .unsqueeze(0)
                .unwrap();
            let logits = model.logits(&idx, None).unwrap();
            let last: Vec<f32> = logits
                .narrow(1, sequence.len() - 1, 1)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            let next = last
                .iter()
                .enumerate()
                .fold(0, |best, (i, v)| if *v > last[best] { i } else { best }) as u32;
            expected.push(next);
            sequence.push(next);
        }

        assert_eq!(streamed, expected);
    }

    #[test]
    fn seeded_engines_agree() {
        let model = Gpt::random(config(), &Device::Cpu).unwrap();
        let params = SamplingParams::default().with_temperature(0.9).with_top_k(20);

        let mut a = engine(model.clone(), None, 1234);
        let mut b = engine(model, None, 1234);
        assert_eq!(
            a.generate("seed", 12, params).unwrap(),
            b.generate("seed", 12, params).unwrap()
        );
    }

    #[test]
    fn generate_concatenates_stream() {
        let model = Gpt::random(config(), &Device::Cpu).unwrap();
        let mut a = engine(model.clone(), None, 3);
        let mut b = engine(model, None, 3);

        let text = a.generate("xyz", 5, SamplingParams::greedy()).unwrap();
        let pieces: String = b
            .generate_stream("xyz", 5, SamplingParams::greedy())
            .unwrap()
            .map(|t| t.unwrap().text)
            .collect();
        assert_eq!(text, pieces);
    }

    #[test]
    fn invalid_sampling_fails_before_running() {
        let mut engine = engine(Gpt::random(config(), &Device::Cpu).unwrap(), None, 0);
        let result = engine.generate_stream("abc", 4, SamplingParams::default().with_top_k(0));
        assert!(matches!(result.err(), Some(NanochatError::InvalidSampling(_))));
    }

    #[test]
    fn error_is_yielded_once() {
        // block_size 2 -> 20 rotary positions; a 19-token prompt leaves room
        // for one decode step before the table runs out
        let config = ModelConfig::new(64, 2, 32, 4, 2, 1).unwrap();
        let mut engine = engine(Gpt::random(config, &Device::Cpu).unwrap(), None, 0);
        let prompt: Vec<u32> = (0..19).collect();

        let mut stream = engine
            .generate_stream(&prompt, 5, SamplingParams::greedy())
            .unwrap();
        assert!(stream.next().unwrap().is_ok());
        assert!(stream.next().unwrap().is_ok());
        assert!(matches!(
            stream.next(),
            Some(Err(NanochatError::SequenceTooLong { .. }))
        ));
        assert!(stream.next().is_none());
        assert!(stream.is_done());
    }
}
