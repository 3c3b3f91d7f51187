//! Deterministic scripted backend.
//!
//! [`ScriptedModel`] tokenizes at the byte level and "predicts" a fixed
//! reply: every decode that asks for logits peaks on the next token of the
//! script. It enforces the same contracts as a real model (contiguous
//! positions, bounded context) so the generation loop and session manager
//! can be exercised without weights.

use jarvis_core::{
    ChatTemplate, GenerationError, LanguageModel, LoadError, ModelHeader, ModelLoader,
    TokenBatch, TokenId,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const BOS: TokenId = 0;
pub const EOS: TokenId = 1;
pub const PAD: TokenId = 2;
const BYTE_OFFSET: TokenId = 3;
const VOCAB_SIZE: usize = 256 + BYTE_OFFSET as usize;

/// Context window used when the model file does not declare one.
pub const DEFAULT_SCRIPTED_CONTEXT: usize = 1024;

pub struct ScriptedModel {
    script: Vec<TokenId>,
    cursor: usize,
    next_position: usize,
    decode_calls: usize,
    context_window: usize,
    template: ChatTemplate,
    fail_on_decode: Option<usize>,
    decode_delay: Option<Duration>,
    /// Every token submitted through `decode`, in order.
    pub seen: Vec<TokenId>,
}

impl ScriptedModel {
    /// A model that answers every prompt with `reply` and then EOS.
    pub fn new(reply: &str) -> Self {
        let mut script = encode_bytes(reply);
        script.push(EOS);
        Self {
            script,
            cursor: 0,
            next_position: 0,
            decode_calls: 0,
            context_window: DEFAULT_SCRIPTED_CONTEXT,
            template: ChatTemplate::ChatMl,
            fail_on_decode: None,
            decode_delay: None,
            seen: Vec::new(),
        }
    }

    /// A model that never emits EOS.
    pub fn endless(reply: &str) -> Self {
        let mut model = Self::new(reply);
        model.script.pop();
        model
    }

    pub fn with_context_window(mut self, n: usize) -> Self {
        self.context_window = n;
        self
    }

    /// The `n`-th decode call (0-based, prefill batches included) fails.
    pub fn failing_on_decode(mut self, n: usize) -> Self {
        self.fail_on_decode = Some(n);
        self
    }

    pub fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = Some(delay);
        self
    }

    pub fn with_template(mut self, template: ChatTemplate) -> Self {
        self.template = template;
        self
    }

    /// Next token of the script; endless scripts wrap around.
    fn next_scripted(&mut self) -> TokenId {
        if self.script.is_empty() {
            return EOS;
        }
        let token = self.script[self.cursor % self.script.len()];
        self.cursor += 1;
        token
    }

    fn logits_for(&self, peak: TokenId) -> Vec<f32> {
        (0..VOCAB_SIZE)
            .map(|i| {
                if i as TokenId == peak {
                    10.0
                } else {
                    ((i * 31 + self.decode_calls * 7) % 13) as f32 * 0.01
                }
            })
            .collect()
    }
}

fn encode_bytes(text: &str) -> Vec<TokenId> {
    text.bytes().map(|b| b as TokenId + BYTE_OFFSET).collect()
}

impl LanguageModel for ScriptedModel {
    fn context_window(&self) -> usize {
        self.context_window
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        token == EOS
    }

    fn chat_template(&self) -> ChatTemplate {
        self.template
    }

    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>, GenerationError> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special {
            tokens.push(BOS);
        }
        tokens.extend(encode_bytes(text));
        Ok(tokens)
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String, GenerationError> {
        let bytes: Vec<u8> = tokens
            .iter()
            .filter(|t| **t >= BYTE_OFFSET)
            .map(|t| (t - BYTE_OFFSET) as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.next_position = 0;
    }

    fn decode(&mut self, batch: &TokenBatch) -> Result<Option<Vec<f32>>, GenerationError> {
        let call = self.decode_calls;
        self.decode_calls += 1;

        if let Some(delay) = self.decode_delay {
            std::thread::sleep(delay);
        }
        if self.fail_on_decode == Some(call) {
            return Err(GenerationError::Decode(format!("scripted failure on decode {call}")));
        }
        let Some(start) = batch.start_position() else {
            return Ok(None);
        };
        if start != self.next_position {
            return Err(GenerationError::Decode(format!(
                "non-contiguous batch: expected position {}, got {start}",
                self.next_position
            )));
        }
        if start + batch.len() > self.context_window {
            return Err(GenerationError::Decode("context window overflow".into()));
        }

        self.seen.extend(batch.tokens());
        self.next_position += batch.len();

        let wants_logits = batch.entries().last().is_some_and(|e| e.logits);
        if !wants_logits {
            return Ok(None);
        }
        let peak = self.next_scripted();
        Ok(Some(self.logits_for(peak)))
    }
}

/// How a [`ScriptedLoader`] load attempt ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Succeed,
    OutOfMemory,
    Panic,
}

/// Loader producing [`ScriptedModel`]s. The context window comes from the
/// model header when present.
pub struct ScriptedLoader {
    reply: String,
    endless: bool,
    outcome: LoadOutcome,
    load_delay: Option<Duration>,
    decode_delay: Option<Duration>,
    fail_on_decode: Option<usize>,
    loads: Arc<AtomicUsize>,
}

impl ScriptedLoader {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            endless: false,
            outcome: LoadOutcome::Succeed,
            load_delay: None,
            decode_delay: None,
            fail_on_decode: None,
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn endless(mut self) -> Self {
        self.endless = true;
        self
    }

    pub fn with_outcome(mut self, outcome: LoadOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    pub fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = Some(delay);
        self
    }

    pub fn failing_on_decode(mut self, n: usize) -> Self {
        self.fail_on_decode = Some(n);
        self
    }

    /// Shared counter of completed `load` calls.
    pub fn load_counter(&self) -> Arc<AtomicUsize> {
        self.loads.clone()
    }
}

impl ModelLoader for ScriptedLoader {
    fn name(&self) -> &str {
        "scripted"
    }

    fn load(&self, _path: &Path, header: &ModelHeader) -> Result<Box<dyn LanguageModel>, LoadError> {
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
        match self.outcome {
            LoadOutcome::Succeed => {}
            LoadOutcome::OutOfMemory => {
                return Err(LoadError::OutOfMemory("scripted allocation failure".into()));
            }
            LoadOutcome::Panic => panic!("scripted loader panic"),
        }

        let mut model = if self.endless {
            ScriptedModel::endless(&self.reply)
        } else {
            ScriptedModel::new(&self.reply)
        };
        if let Some(n) = header.context_length {
            model = model.with_context_window(n);
        }
        if let Some(raw) = &header.chat_template {
            model = model.with_template(ChatTemplate::detect(raw));
        }
        model.fail_on_decode = self.fail_on_decode;
        model.decode_delay = self.decode_delay;

        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_tokenizer_roundtrip() {
        let model = ScriptedModel::new("");
        let tokens = model.tokenize("héllo", true).unwrap();
        assert_eq!(tokens[0], BOS);
        assert_eq!(model.detokenize(&tokens).unwrap(), "héllo");
        let again = model.tokenize(&model.detokenize(&tokens).unwrap(), true).unwrap();
        assert_eq!(again, tokens);
    }

    #[test]
    fn rejects_non_contiguous_batches() {
        let mut model = ScriptedModel::new("hi");
        let mut batch = TokenBatch::new(4);
        batch.add(5, 3, 0, true).unwrap();
        assert!(model.decode(&batch).is_err());
    }

    #[test]
    fn logits_follow_script() {
        let mut model = ScriptedModel::new("ok");
        let mut batch = TokenBatch::new(4);
        batch.add(BOS, 0, 0, true).unwrap();
        let logits = model.decode(&batch).unwrap().unwrap();
        assert_eq!(crate::sampler::argmax(&logits), b'o' as TokenId + BYTE_OFFSET);
    }
}
