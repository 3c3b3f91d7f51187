//! Prompt assembly under a token budget.

pub mod assembler;

pub use assembler::{
    AssembledContext, AssemblyInput, AssemblyMetadata, ContextAssembler, DropInfo, LayerStats,
};
