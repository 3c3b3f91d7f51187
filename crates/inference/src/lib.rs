//! # JARVIS Inference
//!
//! Everything between a model file on disk and a stream of generated text:
//!
//! - [`gguf`] reads model headers before anything is torn down
//! - [`session`] owns one model session per tier
//! - [`generation`] runs prefill, sampling and decoding
//! - [`sampler`] picks tokens from logits
//!
//! Backends plug in through [`jarvis_core::ModelLoader`]. The Candle backend
//! is behind the `local` feature; a deterministic scripted backend is
//! available under `test-utils`.

pub mod generation;
pub mod gguf;
pub mod sampler;
pub mod session;

#[cfg(feature = "local")]
pub mod candle;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use generation::{
    GenerationObserver, GenerationOutcome, GenerationSession, GenerationStage, Progress,
    StopReason, Termination,
};
pub use sampler::Sampler;
pub use session::{ModelSession, ModelSessionManager, SessionInfo, SessionLease};

#[cfg(feature = "local")]
pub use candle::{CandleLoader, CandleModel};
