//! Token counting.
//!
//! The assembler and the memory digest both need to measure text against a
//! token budget. When a model is loaded its tokenizer gives exact counts;
//! otherwise a character heuristic (~4 characters per token) is used.

/// Anything that can measure text in tokens.
pub trait TokenCounter {
    fn count_tokens(&self, text: &str) -> usize;
}

/// Character-based estimator: 1 token ≈ 4 characters, rounded up.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count_tokens(&self, text: &str) -> usize {
        estimate_tokens(text)
    }
}

impl<F> TokenCounter for F
where
    F: Fn(&str) -> usize,
{
    fn count_tokens(&self, text: &str) -> usize {
        self(text)
    }
}

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(4)
}

/// Per-segment overhead for role markers and delimiters in chat templates.
pub const SEGMENT_OVERHEAD: usize = 4;
