//! # JARVIS Core
//!
//! Domain types, traits, and error definitions for the JARVIS local
//! assistant engine. This crate has no runtime or inference dependencies:
//! it defines the model, memory and prompt contracts that the other crates
//! implement against.

pub mod error;
pub mod event;
pub mod memory;
pub mod model;
pub mod prompt;
pub mod tier;
pub mod token;

// Re-export key types at crate root for ergonomics
pub use error::{AssemblyError, Error, GenerationError, LoadError, MemoryError, Result};
pub use event::{ThoughtLog, ThoughtLogEntry};
pub use memory::{MemoryDigest, MemoryRecord, MemoryStats, MemoryStore, Preference, UserProfile};
pub use model::{
    BatchFull, CancelFlag, LanguageModel, ModelHeader, ModelLoader, TokenBatch, TokenId,
};
pub use prompt::{ChatTemplate, Conversation, Prompt, Role, Segment, SegmentKind, Turn};
pub use tier::{LifecycleState, ModelTier};
pub use token::{HeuristicCounter, TokenCounter, estimate_tokens};
