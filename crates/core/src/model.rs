//! Language model capability traits.
//!
//! The engine never talks to a concrete inference library. A backend
//! provides a [`ModelLoader`] that turns a model file into a boxed
//! [`LanguageModel`]; the session manager and generation loop only see
//! these two traits.
//!
//! Implementations: Candle quantized GGUF (feature `local` in
//! `jarvis-inference`), scripted deterministic model (tests).

use crate::error::{GenerationError, LoadError};
use crate::prompt::ChatTemplate;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Vocabulary index of a token.
pub type TokenId = u32;

/// Identifies an independent decoding sequence inside one context.
pub type SequenceId = u32;

/// One entry of a [`TokenBatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    pub position: usize,
    pub sequence: SequenceId,
    /// Whether the caller needs logits for this position.
    pub logits: bool,
}

/// Adding past the fixed capacity of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("token batch is full (capacity {capacity})")]
pub struct BatchFull {
    pub capacity: usize,
}

/// A bounded set of tokens submitted to the model in one decode step.
///
/// Capacity is fixed at construction; [`TokenBatch::add`] fails instead of
/// silently dropping tokens.
#[derive(Debug, Clone)]
pub struct TokenBatch {
    capacity: usize,
    entries: Vec<BatchEntry>,
}

impl TokenBatch {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn add(
        &mut self,
        token: TokenId,
        position: usize,
        sequence: SequenceId,
        logits: bool,
    ) -> Result<(), BatchFull> {
        if self.entries.len() >= self.capacity {
            return Err(BatchFull { capacity: self.capacity });
        }
        self.entries.push(BatchEntry { token, position, sequence, logits });
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn tokens(&self) -> Vec<TokenId> {
        self.entries.iter().map(|e| e.token).collect()
    }

    /// Position of the first entry, which is where the batch starts in the context.
    pub fn start_position(&self) -> Option<usize> {
        self.entries.first().map(|e| e.position)
    }
}

/// A loaded model with one decoding context.
///
/// All methods are synchronous and may be slow; callers run them on a
/// blocking worker.
pub trait LanguageModel: Send {
    /// Maximum number of positions the context can hold.
    fn context_window(&self) -> usize;

    fn vocab_size(&self) -> usize;

    /// Whether `token` ends generation.
    fn is_end_of_sequence(&self, token: TokenId) -> bool;

    fn chat_template(&self) -> ChatTemplate;

    /// Convert text to token ids. `add_special` prepends BOS where the model expects one.
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>, GenerationError>;

    /// Convert token ids back to text, skipping special tokens.
    fn detokenize(&self, tokens: &[TokenId]) -> Result<String, GenerationError>;

    /// Forget all decoded positions so the next batch may start at position 0.
    fn reset(&mut self);

    /// Run the model over a batch of contiguous positions of one sequence.
    ///
    /// Returns the logits of the last entry when it was flagged as needing
    /// them, `None` otherwise.
    fn decode(&mut self, batch: &TokenBatch) -> Result<Option<Vec<f32>>, GenerationError>;
}

/// Metadata recovered from a model file header before weights are loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelHeader {
    pub format_version: u32,
    pub architecture: Option<String>,
    pub name: Option<String>,
    pub context_length: Option<usize>,
    pub chat_template: Option<String>,
    pub tensor_count: u64,
}

/// Turns a validated model file into a ready [`LanguageModel`].
pub trait ModelLoader: Send + Sync {
    /// Backend name (e.g. "candle", "scripted").
    fn name(&self) -> &str;

    /// Load weights and allocate a decoding context. Slow; runs on a blocking worker.
    fn load(&self, path: &Path, header: &ModelHeader) -> Result<Box<dyn LanguageModel>, LoadError>;
}

/// Cooperative cancellation signal shared between a caller and a generation.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
