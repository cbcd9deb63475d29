//! Chat conversations.
//!
//! Conversations render to token ids with the nanochat special tokens:
//!
//! ```text
//! <|bos|><|user_start|>...<|user_end|><|assistant_start|>...<|assistant_end|>...
//! ```
//!
//! A system message has no tokens of its own; it is prepended to the first
//! user message, separated by a blank line.

use anyhow::{bail, Context, Result};
use nanochat_core::{
    engine::{Engine, GeneratedToken},
    model::TextTokenizer,
    sampling::SamplingParams,
};

/// Beginning of a document.
pub const BOS: &str = "<|bos|>";
/// Opens a user turn.
pub const USER_START: &str = "<|user_start|>";
/// Closes a user turn.
pub const USER_END: &str = "<|user_end|>";
/// Opens an assistant turn.
pub const ASSISTANT_START: &str = "<|assistant_start|>";
/// Closes an assistant turn. Generation stops here.
pub const ASSISTANT_END: &str = "<|assistant_end|>";

/// Speaker of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Instructions merged into the first user message.
    System,
    /// Human turn.
    User,
    /// Model turn.
    Assistant,
}

/// A single conversation turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Who spoke.
    pub role: Role,
    /// What was said.
    pub content: String,
}

/// Ordered list of messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    messages: Vec<Message>,
}

/// Resolved ids of the chat special tokens.
#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    bos: u32,
    user_start: u32,
    user_end: u32,
    assistant_start: u32,
    assistant_end: u32,
}

impl SpecialTokens {
    fn resolve<T: TextTokenizer>(tokenizer: &T) -> Result<Self> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .with_context(|| format!("tokenizer has no {token} token"))
        };
        Ok(Self {
            bos: id(BOS)?,
            user_start: id(USER_START)?,
            user_end: id(USER_END)?,
            assistant_start: id(ASSISTANT_START)?,
            assistant_end: id(ASSISTANT_END)?,
        })
    }
}

impl Conversation {
    /// Create an empty conversation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message.
    pub fn push(&mut self, role: Role, content: impl Into<String>) -> &mut Self {
        self.messages.push(Message {
            role,
            content: content.into(),
        });
        self
    }

    /// Append a system message.
    pub fn system(&mut self, content: impl Into<String>) -> &mut Self {
        self.push(Role::System, content)
    }

    /// Append a user message.
    pub fn user(&mut self, content: impl Into<String>) -> &mut Self {
        self.push(Role::User, content)
    }

    /// Append an assistant message.
    pub fn assistant(&mut self, content: impl Into<String>) -> &mut Self {
        self.push(Role::Assistant, content)
    }

    /// All messages in order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if there are no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Remove the last message.
    pub fn pop(&mut self) -> Option<Message> {
        self.messages.pop()
    }

    /// Remove every message.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Render the whole conversation.
    ///
    /// Turns must alternate user/assistant starting with a user turn; a
    /// system message may only come first.
    pub fn render<T: TextTokenizer>(&self, tokenizer: &T) -> Result<Vec<u32>> {
        let special = SpecialTokens::resolve(tokenizer)?;
        let mut ids = vec![special.bos];

        for (turn, (role, content)) in self.turns()?.into_iter().enumerate() {
            let expected = if turn % 2 == 0 { Role::User } else { Role::Assistant };
            if role != expected {
                bail!("turn {turn} is {role:?}, expected {expected:?}");
            }
            let (open, close) = match role {
                Role::User => (special.user_start, special.user_end),
                _ => (special.assistant_start, special.assistant_end),
            };
            ids.push(open);
            ids.extend(tokenizer.encode(&content)?);
            ids.push(close);
        }
        Ok(ids)
    }

    /// Render for the assistant to reply: the last turn must be a user turn,
    /// and an opening assistant token is appended.
    pub fn render_for_completion<T: TextTokenizer>(&self, tokenizer: &T) -> Result<Vec<u32>> {
        match self.messages.last() {
            Some(Message {
                role: Role::User, ..
            }) => {}
            Some(last) => bail!("last message is {:?}, expected a user message", last.role),
            None => bail!("cannot complete an empty conversation"),
        }
        let special = SpecialTokens::resolve(tokenizer)?;
        let mut ids = self.render(tokenizer)?;
        ids.push(special.assistant_start);
        Ok(ids)
    }

    /// Messages with the system message folded into the first user turn.
    fn turns(&self) -> Result<Vec<(Role, String)>> {
        let (system, rest) = match self.messages.split_first() {
            Some((first, rest)) if first.role == Role::System => (Some(&first.content), rest),
            _ => (None, self.messages.as_slice()),
        };

        let mut turns: Vec<(Role, String)> = Vec::with_capacity(rest.len());
        for message in rest {
            if message.role == Role::System {
                bail!("a system message may only open the conversation");
            }
            turns.push((message.role, message.content.clone()));
        }

        if let Some(system) = system {
            match turns.first_mut() {
                Some((Role::User, content)) => *content = format!("{system}\n\n{content}"),
                _ => bail!("a system message must be followed by a user message"),
            }
        }
        Ok(turns)
    }
}

/// Multi-turn chat driving an [`Engine`].
pub struct ChatSession<T> {
    engine: Engine<T>,
    conversation: Conversation,
}

impl<T: TextTokenizer> ChatSession<T> {
    /// Wrap `engine`; generation will stop at `<|assistant_end|>`.
    pub fn new(mut engine: Engine<T>) -> Result<Self> {
        let assistant_end = SpecialTokens::resolve(engine.tokenizer())?.assistant_end;
        engine.set_eos_token_id(Some(assistant_end));
        Ok(Self {
            engine,
            conversation: Conversation::new(),
        })
    }

    /// Start from an existing conversation (e.g. one with a system message).
    pub fn with_conversation(mut self, conversation: Conversation) -> Self {
        self.conversation = conversation;
        self
    }

    /// Send a user message and stream the assistant's reply through
    /// `on_token`. The reply is recorded as an assistant turn and returned.
    ///
    /// On error the user message is withdrawn so the conversation stays
    /// well formed.
    pub fn send<F>(
        &mut self,
        user_text: &str,
        sampling: SamplingParams,
        max_tokens: usize,
        mut on_token: F,
    ) -> Result<String>
    where
        F: FnMut(&GeneratedToken),
    {
        self.conversation.user(user_text);
        match self.reply(sampling, max_tokens, &mut on_token) {
            Ok(reply) => {
                self.conversation.assistant(reply.clone());
                Ok(reply)
            }
            Err(e) => {
                self.conversation.pop();
                Err(e)
            }
        }
    }

    fn reply<F>(
        &mut self,
        sampling: SamplingParams,
        max_tokens: usize,
        on_token: &mut F,
    ) -> Result<String>
    where
        F: FnMut(&GeneratedToken),
    {
        let prompt = self.conversation.render_for_completion(self.engine.tokenizer())?;
        let mut reply = String::new();
        for token in self.engine.generate_stream(&prompt, max_tokens, sampling)? {
            let token = token?;
            on_token(&token);
            reply.push_str(&token.text);
        }
        Ok(reply)
    }

    /// The conversation so far.
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Forget every turn.
    pub fn reset(&mut self) {
        self.conversation.clear();
    }

    /// Get the engine.
    pub fn engine(&self) -> &Engine<T> {
        &self.engine
    }
}
