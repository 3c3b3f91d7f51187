//! Local inference backend: runs GGUF-quantized models on your hardware.
//!
//! Uses [Candle](https://github.com/huggingface/candle) (Rust-native ML) with
//! the quantized Llama implementation, which also covers the Mistral, Qwen
//! and SmolLM families that share its tensor layout. The tokenizer is read
//! from a `tokenizer.json` next to the model file.

use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::quantized_llama as qlm;
use jarvis_core::{
    ChatTemplate, GenerationError, LanguageModel, LoadError, ModelHeader, ModelLoader,
    TokenBatch, TokenId,
};
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Positions precomputed by the quantized Llama rotary embedding.
const MAX_POSITIONS: usize = 4096;

/// Candidate end-of-sequence tokens across common chat formats.
const EOS_TOKENS: [&str; 4] = ["</s>", "<|endoftext|>", "<|im_end|>", "<|eot_id|>"];

/// Loads GGUF files into [`CandleModel`]s on a fixed device.
pub struct CandleLoader {
    device: Device,
}

impl CandleLoader {
    pub fn cpu() -> Self {
        Self { device: Device::Cpu }
    }

    pub fn new(device: Device) -> Self {
        Self { device }
    }
}

impl Default for CandleLoader {
    fn default() -> Self {
        Self::cpu()
    }
}

impl ModelLoader for CandleLoader {
    fn name(&self) -> &str {
        "candle"
    }

    fn load(&self, path: &Path, header: &ModelHeader) -> Result<Box<dyn LanguageModel>, LoadError> {
        info!(path = %path.display(), "Loading local GGUF model");

        let tokenizer_path = path.with_file_name("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(LoadError::InvalidFormat(format!(
                "no tokenizer.json next to {}",
                path.display()
            )));
        }
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| LoadError::InvalidFormat(format!("Failed to load tokenizer: {e}")))?;

        let mut file = std::fs::File::open(path).map_err(|_| LoadError::FileNotFound {
            path: path.to_path_buf(),
        })?;
        let gguf = gguf_file::Content::read(&mut file)
            .map_err(|e| LoadError::InvalidFormat(format!("Failed to parse GGUF file: {e}")))?;
        let weights =
            qlm::ModelWeights::from_gguf(gguf, &mut file, &self.device).map_err(map_load_err)?;

        let eos_tokens: Vec<TokenId> = EOS_TOKENS
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect();
        let context_window = header
            .context_length
            .unwrap_or(MAX_POSITIONS)
            .min(MAX_POSITIONS);
        let template = header
            .chat_template
            .as_deref()
            .map(ChatTemplate::detect)
            .unwrap_or_default();

        info!(
            eos_tokens = ?eos_tokens,
            context_window,
            template = ?template,
            "Local model loaded successfully"
        );

        Ok(Box::new(CandleModel {
            vocab_size: tokenizer.get_vocab_size(true),
            weights,
            tokenizer,
            device: self.device.clone(),
            eos_tokens,
            template,
            context_window,
        }))
    }
}

/// Quantized weights plus tokenizer. The KV cache lives inside the weights
/// and restarts whenever a batch begins at position 0.
pub struct CandleModel {
    weights: qlm::ModelWeights,
    tokenizer: Tokenizer,
    device: Device,
    eos_tokens: Vec<TokenId>,
    template: ChatTemplate,
    context_window: usize,
    vocab_size: usize,
}

impl LanguageModel for CandleModel {
    fn context_window(&self) -> usize {
        self.context_window
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        self.eos_tokens.contains(&token)
    }

    fn chat_template(&self) -> ChatTemplate {
        self.template
    }

    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>, GenerationError> {
        self.tokenizer
            .encode(text, add_special)
            .map(|enc| enc.get_ids().to_vec())
            .map_err(|e| GenerationError::Tokenization(e.to_string()))
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String, GenerationError> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| GenerationError::Tokenization(format!("Detokenization failed: {e}")))
    }

    fn reset(&mut self) {}

    fn decode(&mut self, batch: &TokenBatch) -> Result<Option<Vec<f32>>, GenerationError> {
        let Some(start) = batch.start_position() else {
            return Ok(None);
        };
        let tokens = batch.tokens();
        debug!(start, len = tokens.len(), "Decoding batch");

        // The causal mask assumes an empty cache, so continuation batches go
        // one position at a time.
        let steps: Vec<(usize, &[TokenId])> = if start == 0 {
            vec![(0, tokens.as_slice())]
        } else {
            tokens
                .chunks(1)
                .enumerate()
                .map(|(i, t)| (start + i, t))
                .collect()
        };

        let mut logits = None;
        for (position, chunk) in steps {
            let input = Tensor::new(chunk, &self.device)
                .and_then(|t| t.unsqueeze(0))
                .map_err(map_candle_err)?;
            // Logits of the last position only: shape (1, vocab).
            logits = Some(self.weights.forward(&input, position).map_err(map_candle_err)?);
        }
        let Some(logits) = logits else {
            return Ok(None);
        };

        if !batch.entries().last().is_some_and(|e| e.logits) {
            return Ok(None);
        }
        let logits = logits
            .squeeze(0)
            .and_then(|l| l.to_dtype(DType::F32))
            .and_then(|l| l.to_vec1::<f32>())
            .map_err(map_candle_err)?;
        Ok(Some(logits))
    }
}

/// Map Candle errors raised during a forward pass.
fn map_candle_err(e: candle_core::Error) -> GenerationError {
    GenerationError::Decode(format!("Candle inference error: {e}"))
}

/// Map Candle errors raised while materializing weights.
fn map_load_err(e: candle_core::Error) -> LoadError {
    let message = e.to_string();
    let lower = message.to_lowercase();
    if lower.contains("out of memory") || lower.contains("alloc") {
        LoadError::OutOfMemory(message)
    } else {
        LoadError::InvalidFormat(format!("Failed to load model weights: {message}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_failures_map_to_out_of_memory() {
        let err = map_load_err(candle_core::Error::Msg("failed to allocate 4GiB".into()));
        assert_eq!(err.kind(), "out_of_memory");
        let err = map_load_err(candle_core::Error::Msg("unknown dtype 99".into()));
        assert_eq!(err.kind(), "invalid_format");
    }

    #[test]
    fn missing_tokenizer_is_invalid_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");
        crate::gguf::GgufStub::new("llama").write(&path).unwrap();
        let header = crate::gguf::read_header(&path).unwrap();
        let err = CandleLoader::cpu().load(&path, &header).err().unwrap();
        assert_eq!(err.kind(), "invalid_format");
        assert!(err.to_string().contains("tokenizer.json"));
    }
}
