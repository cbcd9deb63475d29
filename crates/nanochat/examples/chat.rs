//! Interactive chat example.
//!
//! Loads a checkpoint (and the `tokenizer.json` next to it) and chats on
//! stdin/stdout. Type `/reset` to start a new conversation, an empty line
//! to quit.
//!
//! Run with:
//! ```bash
//! RUST_LOG=nanochat=debug cargo run -p nanochat --release --example chat -- /path/to/model.safetensors
//! ```

use anyhow::{Context, Result};
use nanochat::prelude::*;
use std::io::{self, BufRead, Write};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let checkpoint = std::env::args()
        .nth(1)
        .context("usage: chat <model.safetensors> [system prompt]")?;
    let system_prompt = std::env::args().nth(2);

    #[cfg(feature = "cuda")]
    let device = candle_core::Device::new_cuda(0)?;
    #[cfg(not(feature = "cuda"))]
    let device = candle_core::Device::Cpu;

    let engine = EngineBuilder::new()
        .checkpoint(&checkpoint)
        .device(device)
        .build()?;
    println!("Loaded {checkpoint}");
    println!("Model: {:?}\n", engine.model().config());

    let mut chat = ChatSession::new(engine)?;
    let fresh_conversation = || {
        let mut conversation = Conversation::new();
        if let Some(system) = &system_prompt {
            conversation.system(system.clone());
        }
        conversation
    };
    chat = chat.with_conversation(fresh_conversation());

    let params = SamplingParams::default()
        .with_temperature(0.6)
        .with_top_k(50);

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("User: ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if line == "/reset" {
            chat = chat.with_conversation(fresh_conversation());
            println!("(conversation cleared)\n");
            continue;
        }

        print!("Assistant: ");
        stdout.flush()?;
        chat.send(line, params, 512, |token| {
            print!("{}", token.text);
            let _ = io::stdout().flush();
        })?;
        println!("\n");
    }

    Ok(())
}
