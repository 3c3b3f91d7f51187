//! The autoregressive generation loop.
//!
//! One [`GenerationSession`] drives one response on one model:
//!
//! ```text
//! Initialized → Prefilling → Decoding ⇄ Sampling → Completed | Cancelled | Errored
//! ```
//!
//! The prompt is rendered with the model's chat template, tokenized, and
//! decoded in batches no larger than the configured capacity. Each step then
//! samples one token, checks the stop conditions, emits the newly stable text
//! and decodes the token at the next position. Everything here is synchronous
//! and runs on a blocking worker.

use jarvis_config::GenerationConfig;
use jarvis_core::{
    CancelFlag, Error, GenerationError, LanguageModel, Prompt, TokenBatch, TokenId,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::sampler::Sampler;

/// Only one sequence is decoded per context.
const SEQUENCE: u32 = 0;

/// Why a completed generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndOfSequence,
    MaxTokens,
    ContextExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStage {
    Initialized,
    Prefilling,
    Decoding,
    Sampling,
    Completed(StopReason),
    Cancelled,
    Errored,
}

impl GenerationStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Cancelled | Self::Errored)
    }
}

/// Counters reported with every stage transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub prompt_tokens: usize,
    pub position: usize,
    pub tokens_generated: usize,
    pub context_window: usize,
}

/// Receives stage transitions and streamed text.
pub trait GenerationObserver {
    fn on_stage(&mut self, _stage: GenerationStage, _progress: &Progress) {}

    /// A newly stable piece of output text. Never empty.
    fn on_token(&mut self, _text: &str) {}
}

impl GenerationObserver for () {}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Completed(StopReason),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub text: String,
    pub termination: Termination,
    pub prompt_tokens: usize,
    pub tokens_generated: usize,
    pub elapsed: Duration,
}

/// In-flight state of one response.
pub struct GenerationSession<'m> {
    model: &'m mut dyn LanguageModel,
    config: GenerationConfig,
    cancel: CancelFlag,
    sampler: Sampler,
    stage: GenerationStage,
    progress: Progress,
    generated: Vec<TokenId>,
    output: String,
    started: Instant,
}

impl<'m> GenerationSession<'m> {
    pub fn new(model: &'m mut dyn LanguageModel, config: &GenerationConfig, cancel: CancelFlag) -> Self {
        let context_window = model.context_window();
        Self {
            model,
            config: config.clone(),
            cancel,
            sampler: Sampler::new(&config.sampling),
            stage: GenerationStage::Initialized,
            progress: Progress {
                context_window,
                ..Progress::default()
            },
            generated: Vec::new(),
            output: String::new(),
            started: Instant::now(),
        }
    }

    pub fn stage(&self) -> GenerationStage {
        self.stage
    }

    /// Text emitted so far.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Run to a terminal state.
    ///
    /// Tokenization, decode and sampling failures return
    /// [`Error::Generation`] carrying the text produced before the failure.
    pub fn run(
        mut self,
        prompt: &Prompt,
        observer: &mut dyn GenerationObserver,
    ) -> Result<GenerationOutcome, Error> {
        observer.on_stage(GenerationStage::Initialized, &self.progress);
        match self.drive(prompt, observer) {
            Ok(termination) => {
                let stage = match termination {
                    Termination::Completed(reason) => GenerationStage::Completed(reason),
                    Termination::Cancelled => GenerationStage::Cancelled,
                };
                self.enter(stage, observer);
                debug!(
                    prompt_tokens = self.progress.prompt_tokens,
                    tokens_generated = self.progress.tokens_generated,
                    termination = ?termination,
                    "Generation finished"
                );
                Ok(GenerationOutcome {
                    text: self.output,
                    termination,
                    prompt_tokens: self.progress.prompt_tokens,
                    tokens_generated: self.progress.tokens_generated,
                    elapsed: self.started.elapsed(),
                })
            }
            Err(error) => {
                self.enter(GenerationStage::Errored, observer);
                debug!(kind = error.kind(), partial_len = self.output.len(), "Generation failed");
                Err(Error::Generation {
                    error,
                    partial: self.output,
                })
            }
        }
    }

    fn enter(&mut self, stage: GenerationStage, observer: &mut dyn GenerationObserver) {
        self.stage = stage;
        observer.on_stage(stage, &self.progress);
    }

    fn drive(
        &mut self,
        prompt: &Prompt,
        observer: &mut dyn GenerationObserver,
    ) -> Result<Termination, GenerationError> {
        let text = self.model.chat_template().render(prompt);
        let tokens = self.model.tokenize(&text, true)?;
        if tokens.is_empty() {
            return Err(GenerationError::Tokenization("prompt produced no tokens".into()));
        }
        let window = self.progress.context_window;
        if tokens.len() > window {
            return Err(GenerationError::PromptTooLarge {
                prompt_tokens: tokens.len(),
                context_window: window,
            });
        }
        self.progress.prompt_tokens = tokens.len();

        self.enter(GenerationStage::Prefilling, observer);
        let mut logits = self.prefill(&tokens)?;
        self.enter(GenerationStage::Decoding, observer);

        let mut batch = TokenBatch::new(1);
        loop {
            if self.cancel.is_cancelled() {
                return Ok(Termination::Cancelled);
            }
            if self.generated.len() >= self.config.max_tokens {
                return Ok(Termination::Completed(StopReason::MaxTokens));
            }

            self.enter(GenerationStage::Sampling, observer);
            let token = self.sampler.sample(&logits)?;
            if self.cancel.is_cancelled() {
                return Ok(Termination::Cancelled);
            }
            if self.model.is_end_of_sequence(token) {
                self.flush(observer)?;
                return Ok(Termination::Completed(StopReason::EndOfSequence));
            }

            self.generated.push(token);
            self.progress.tokens_generated = self.generated.len();
            self.emit_stable(observer, false)?;

            if self.progress.position >= window {
                self.flush(observer)?;
                return Ok(Termination::Completed(StopReason::ContextExhausted));
            }

            self.enter(GenerationStage::Decoding, observer);
            batch.clear();
            batch
                .add(token, self.progress.position, SEQUENCE, true)
                .map_err(|e| GenerationError::Decode(e.to_string()))?;
            logits = self
                .model
                .decode(&batch)?
                .ok_or_else(|| GenerationError::Decode("model returned no logits".into()))?;
            self.progress.position += 1;
        }
    }

    /// Decode the prompt in capacity-sized batches; only the final position
    /// requests logits.
    fn prefill(&mut self, tokens: &[TokenId]) -> Result<Vec<f32>, GenerationError> {
        self.model.reset();
        let capacity = self.config.batch_capacity.max(1);
        let mut batch = TokenBatch::new(capacity);
        let mut last_logits = None;

        for chunk in tokens.chunks(capacity) {
            batch.clear();
            for token in chunk {
                let position = self.progress.position;
                let is_last = position + 1 == tokens.len();
                batch
                    .add(*token, position, SEQUENCE, is_last)
                    .map_err(|e| GenerationError::Decode(e.to_string()))?;
                self.progress.position += 1;
            }
            last_logits = self.model.decode(&batch)?;
        }

        last_logits.ok_or_else(|| GenerationError::Decode("prefill returned no logits".into()))
    }

    /// Emit the part of the full detokenization not yet emitted.
    ///
    /// Held back while the tail is an incomplete multi-byte sequence or the
    /// tokenizer rewrote already-emitted text, unless `final_flush` is set.
    fn emit_stable(
        &mut self,
        observer: &mut dyn GenerationObserver,
        final_flush: bool,
    ) -> Result<(), GenerationError> {
        let full = self.model.detokenize(&self.generated)?;
        if !full.starts_with(self.output.as_str()) || full.len() == self.output.len() {
            return Ok(());
        }
        if !final_flush && full.ends_with('\u{FFFD}') {
            return Ok(());
        }
        let delta = full[self.output.len()..].to_string();
        self.output.push_str(&delta);
        observer.on_token(&delta);
        Ok(())
    }

    fn flush(&mut self, observer: &mut dyn GenerationObserver) -> Result<(), GenerationError> {
        self.emit_stable(observer, true)
    }
}
