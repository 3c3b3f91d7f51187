//! Error types for the JARVIS domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; the top-level [`Error`]
//! is what crosses the engine boundary.

use crate::tier::ModelTier;
use std::path::PathBuf;
use thiserror::Error;

/// The top-level error type for all JARVIS engine operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Model lifecycle ---
    #[error("Model load failed: {0}")]
    Load(#[from] LoadError),

    // --- Generation ---
    #[error("Generation failed: {error}")]
    Generation {
        #[source]
        error: GenerationError,
        /// Text produced before the failure.
        partial: String,
    },

    #[error("Generation cancelled")]
    Cancelled {
        /// Text produced before cancellation.
        partial: String,
    },

    // --- Memory ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Prompt assembly ---
    #[error("Prompt too large: {0}")]
    PromptTooLarge(#[from] AssemblyError),

    // --- Admission ---
    #[error("Model session for tier '{0}' is busy")]
    SessionBusy(ModelTier),

    #[error("No model is loaded and ready")]
    NoModelAvailable,

    // --- Configuration ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable, machine-readable error kind used on terminal stream events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Load(e) => e.kind(),
            Self::Generation { error, .. } => error.kind(),
            Self::Cancelled { .. } => "cancelled",
            Self::Memory(_) => "store_unavailable",
            Self::PromptTooLarge(_) => "prompt_too_large",
            Self::SessionBusy(_) => "session_busy",
            Self::NoModelAvailable => "no_model_available",
            Self::Config { .. } => "config",
            Self::Internal(_) => "internal",
        }
    }

    /// Partial output carried by a generation failure, if any.
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            Self::Generation { partial, .. } | Self::Cancelled { partial }
                if !partial.is_empty() =>
            {
                Some(partial)
            }
            _ => None,
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failure to bring a model session to `Ready`. Fatal to that tier only.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("Model file not found or unreadable: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("Invalid model format: {0}")]
    InvalidFormat(String),

    #[error("Out of memory while allocating model context: {0}")]
    OutOfMemory(String),
}

impl LoadError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FileNotFound { .. } => "file_not_found",
            Self::InvalidFormat(_) => "invalid_format",
            Self::OutOfMemory(_) => "out_of_memory",
        }
    }
}

/// Failure inside one generation session.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Sampling failed: {0}")]
    Sampling(String),

    #[error("Prompt of {prompt_tokens} tokens does not fit a context window of {context_window}")]
    PromptTooLarge {
        prompt_tokens: usize,
        context_window: usize,
    },
}

impl GenerationError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tokenization(_) => "tokenization_error",
            Self::Decode(_) => "decode_error",
            Self::Sampling(_) => "sampling_error",
            Self::PromptTooLarge { .. } => "prompt_too_large",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum MemoryError {
    /// The backing store is unreachable or corrupted.
    #[error("Memory store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Persona and current user turn do not fit the token budget.
#[derive(Debug, Clone, Error)]
#[error(
    "persona ({persona_tokens} tokens) + user message ({user_tokens} tokens) exceed budget ({budget} tokens)"
)]
pub struct AssemblyError {
    pub persona_tokens: usize,
    pub user_tokens: usize,
    pub budget: usize,
}
