//! Incremental decoding with a randomly initialised model.
//!
//! Generates from a fixed prompt twice: once through the engine (prefill +
//! cached single-token steps) and once by re-running the whole sequence
//! each step. Both use greedy decoding, so the ids must match; the timings
//! show what the cache saves.
//!
//! Run with:
//! ```bash
//! cargo run -p nanochat-core --release --example incremental_decode -- 64
//! ```

use candle_core::{Device, Tensor};
use nanochat_core::prelude::*;
use std::time::Instant;

/// Renders ids as `<id>`.
struct IdTokenizer {
    vocab_size: usize,
}

impl TextTokenizer for IdTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text
            .bytes()
            .map(|b| b as u32 % self.vocab_size as u32)
            .collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(ids.iter().map(|id| format!("<{id}>")).collect())
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn bos_token_id(&self) -> Option<u32> {
        None
    }

    fn eos_token_id(&self) -> Option<u32> {
        None
    }

    fn token_to_id(&self, _token: &str) -> Option<u32> {
        None
    }
}

fn main() -> anyhow::Result<()> {
    let max_tokens: usize = std::env::args()
        .nth(1)
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(32);

    println!("Incremental Decode Example");
    println!("==========================\n");

    #[cfg(feature = "cuda")]
    let device = Device::new_cuda(0)?;
    #[cfg(not(feature = "cuda"))]
    let device = Device::Cpu;

    let config = ModelConfig::new(512, 256, 128, 4, 2, 4)?;
    let model = Gpt::random(config, &device)?;
    println!(
        "Model: {} layers, {} embd, {} heads ({} kv), {} params",
        config.n_layer,
        config.n_embd,
        config.n_head,
        config.n_kv_head,
        model.num_parameters()
    );

    let prompt = "The quick brown fox jumps over the lazy dog.";
    let tokenizer = IdTokenizer {
        vocab_size: config.vocab_size,
    };
    let prompt_ids = tokenizer.encode(prompt)?;
    println!("Prompt: {} tokens, generating {max_tokens}\n", prompt_ids.len());

    // Cached decoding through the engine
    let mut engine = Engine::new(model.clone(), tokenizer, EngineConfig::default().with_seed(0));
    let start = Instant::now();
    let mut stream = engine.generate_stream(&prompt_ids, max_tokens, SamplingParams::greedy())?;
    let mut cached = Vec::with_capacity(max_tokens);
    for token in stream.by_ref() {
        cached.push(token?.id);
    }
    let passes = stream.forward_passes();
    let cached_time = start.elapsed();

    // Recompute the full sequence every step
    let start = Instant::now();
    let mut sequence = prompt_ids.clone();
    let mut recomputed = Vec::with_capacity(max_tokens);
    for _ in 0..max_tokens {
        let idx = Tensor::new(sequence.as_slice(), &device)?.unsqueeze(0)?;
        let logits = model.logits(&idx, None)?;
        let last = logits.narrow(1, sequence.len() - 1, 1)?.squeeze(1)?;
        let mut rng = rand::thread_rng();
        let next = sample(&last, &SamplingParams::greedy(), &mut rng)?[0];
        recomputed.push(next);
        sequence.push(next);
    }
    let recompute_time = start.elapsed();

    println!("Cached:     {passes} forward passes in {cached_time:.2?}");
    println!("Recomputed: {max_tokens} forward passes in {recompute_time:.2?}");
    println!(
        "Speedup:    {:.2}x",
        recompute_time.as_secs_f64() / cached_time.as_secs_f64().max(f64::EPSILON)
    );
    println!("Ids match:  {}", cached == recomputed);

    Ok(())
}
