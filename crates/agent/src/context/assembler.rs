//! Context assembly: packs persona, memory, history and the user turn into
//! a prompt that fits a token budget.
//!
//! Budget priority:
//!
//! 1. **Persona** and **user message**: never trimmed; if they alone
//!    overflow the budget assembly fails with [`AssemblyError`]
//! 2. **Conversation history**: newest turns kept, oldest dropped first
//! 3. **Memory digest**: fills what is left, trailing lines dropped first
//!
//! Segments are emitted in reading order: persona, memory, history (oldest
//! first), user message.
//!
//! Per-segment costs are estimates. [`ContextAssembler::assemble_to_fit`]
//! measures the fully rendered prompt (template markup, BOS, assistant cue)
//! and shrinks the budget until that measurement fits a hard limit.
//!
//! # Determinism
//!
//! Identical inputs and counter always produce identical prompts.

use jarvis_core::token::SEGMENT_OVERHEAD;
use jarvis_core::{AssemblyError, Conversation, Prompt, Role, Segment, TokenCounter, Turn};
use serde::{Deserialize, Serialize};

/// Everything the assembler needs for one generation.
pub struct AssemblyInput<'a> {
    pub persona: &'a str,
    pub history: &'a Conversation,
    /// Memory digest text; empty when memory is unavailable.
    pub memory_context: &'a str,
    pub user_message: &'a str,
}

/// The packed prompt plus what it cost.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub prompt: Prompt,
    pub metadata: AssemblyMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyMetadata {
    /// Tokens consumed by every included segment.
    pub total_tokens: usize,
    pub budget: usize,
    /// Budget utilization percentage (0.0–100.0).
    pub utilization_pct: f32,
    pub per_layer: Vec<LayerStats>,
    pub drops: Vec<DropInfo>,
    /// Tokens of the rendered prompt, when it was measured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered_tokens: Option<usize>,
}

impl AssemblyMetadata {
    /// Items dropped across all layers.
    pub fn items_dropped(&self) -> usize {
        self.drops.iter().map(|d| d.items_dropped).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerStats {
    pub name: String,
    pub tokens: usize,
    pub items_included: usize,
    pub items_total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropInfo {
    pub layer: String,
    pub items_dropped: usize,
    pub reason: String,
}

/// Stateless assembler bound to one token budget.
pub struct ContextAssembler {
    budget: usize,
}

impl ContextAssembler {
    pub fn new(budget: usize) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn assemble(
        &self,
        input: &AssemblyInput<'_>,
        counter: &dyn TokenCounter,
    ) -> Result<AssembledContext, AssemblyError> {
        let cost = |text: &str| counter.count_tokens(text) + SEGMENT_OVERHEAD;

        let persona_tokens = cost(input.persona);
        let user_tokens = cost(input.user_message);
        let reserved = persona_tokens + user_tokens;
        if reserved > self.budget {
            return Err(AssemblyError {
                persona_tokens,
                user_tokens,
                budget: self.budget,
            });
        }
        let mut remaining = self.budget - reserved;

        let mut per_layer = vec![LayerStats {
            name: "persona".into(),
            tokens: persona_tokens,
            items_included: 1,
            items_total: 1,
        }];
        let mut drops = Vec::new();

        // History is packed before memory.
        let (history, history_stats) = Self::fit_history(input.history, remaining, &cost);
        remaining -= history_stats.tokens;
        if history_stats.items_included < history_stats.items_total {
            drops.push(DropInfo {
                layer: "history".into(),
                items_dropped: history_stats.items_total - history_stats.items_included,
                reason: "Oldest turns dropped".into(),
            });
        }

        let (memory, memory_stats) = Self::fit_memory(input.memory_context, remaining, &cost);
        if memory_stats.items_included < memory_stats.items_total {
            drops.push(DropInfo {
                layer: "memory".into(),
                items_dropped: memory_stats.items_total - memory_stats.items_included,
                reason: "Trailing digest lines dropped".into(),
            });
        }

        let mut prompt = Prompt::default();
        prompt.push(Segment::persona(input.persona));
        if let Some(memory) = memory {
            prompt.push(Segment::memory(memory));
        }
        for turn in history {
            prompt.push(Segment::history(Role::User, &turn.user));
            prompt.push(Segment::history(Role::Assistant, &turn.assistant));
        }
        prompt.push(Segment::user_turn(input.user_message));

        per_layer.push(memory_stats);
        per_layer.push(history_stats);
        per_layer.push(LayerStats {
            name: "user_message".into(),
            tokens: user_tokens,
            items_included: 1,
            items_total: 1,
        });

        let total_tokens: usize = per_layer.iter().map(|s| s.tokens).sum();
        let utilization_pct = if self.budget == 0 {
            0.0
        } else {
            (total_tokens as f32 / self.budget as f32) * 100.0
        };

        Ok(AssembledContext {
            prompt,
            metadata: AssemblyMetadata {
                total_tokens,
                budget: self.budget,
                utilization_pct,
                per_layer,
                drops,
                rendered_tokens: None,
            },
        })
    }

    /// Assemble so that `measure(prompt)` is at most `limit`.
    ///
    /// Each overflow is taken off the budget and the prompt is packed again,
    /// so memory lines go first, then the oldest history turns. Fails only
    /// when persona and user message alone cannot fit.
    pub fn assemble_to_fit(
        &self,
        input: &AssemblyInput<'_>,
        counter: &dyn TokenCounter,
        limit: usize,
        measure: &dyn Fn(&Prompt) -> usize,
    ) -> Result<AssembledContext, AssemblyError> {
        let mut budget = self.budget.min(limit);
        loop {
            let mut ctx = ContextAssembler::new(budget).assemble(input, counter)?;
            let rendered = measure(&ctx.prompt);
            if rendered <= limit {
                ctx.metadata.rendered_tokens = Some(rendered);
                return Ok(ctx);
            }
            budget = budget.saturating_sub(rendered - limit);
        }
    }

    /// Keep the newest whole turns that fit, returned oldest first.
    fn fit_history<'h>(
        history: &'h Conversation,
        budget: usize,
        cost: &dyn Fn(&str) -> usize,
    ) -> (Vec<&'h Turn>, LayerStats) {
        let total = history.len();
        let mut used = 0;
        let mut kept: Vec<&Turn> = Vec::new();

        for turn in history.turns().collect::<Vec<_>>().into_iter().rev() {
            let turn_tokens = cost(&turn.user) + cost(&turn.assistant);
            if used + turn_tokens > budget {
                break;
            }
            used += turn_tokens;
            kept.push(turn);
        }
        kept.reverse();

        let stats = LayerStats {
            name: "history".into(),
            tokens: used,
            items_included: kept.len(),
            items_total: total,
        };
        (kept, stats)
    }

    /// Longest prefix of the digest's lines that fits, without a dangling
    /// section header at the end.
    fn fit_memory(
        digest: &str,
        budget: usize,
        cost: &dyn Fn(&str) -> usize,
    ) -> (Option<String>, LayerStats) {
        let lines: Vec<&str> = digest.lines().filter(|l| !l.trim().is_empty()).collect();
        let total = lines.len();

        let mut keep = 0;
        let mut tokens = 0;
        for n in (1..=total).rev() {
            let candidate = lines[..n].join("\n");
            let candidate_tokens = cost(&candidate);
            if candidate_tokens <= budget {
                keep = n;
                tokens = candidate_tokens;
                break;
            }
        }
        while keep > 0 && lines[keep - 1].trim_end().ends_with(':') {
            keep -= 1;
            tokens = if keep == 0 {
                0
            } else {
                cost(&lines[..keep].join("\n"))
            };
        }

        let stats = LayerStats {
            name: "memory".into(),
            tokens,
            items_included: keep,
            items_total: total,
        };
        let text = (keep > 0).then(|| lines[..keep].join("\n"));
        (text, stats)
    }
}
