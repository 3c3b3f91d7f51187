//! Prompt and conversation value objects.
//!
//! A [`Prompt`] is what the context assembler hands to the generation loop:
//! an ordered list of role-tagged segments. A [`ChatTemplate`] flattens it
//! into the exact text a given model family was trained on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// The role of a segment sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Persona and injected context
    System,
    /// The end user
    User,
    /// The assistant
    Assistant,
}

/// Where a segment came from. Drives truncation priority during assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Persona,
    Memory,
    History,
    UserTurn,
}

/// A single role-tagged piece of text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub role: Role,
    pub kind: SegmentKind,
    pub content: String,
}

impl Segment {
    pub fn persona(content: impl Into<String>) -> Self {
        Self { role: Role::System, kind: SegmentKind::Persona, content: content.into() }
    }

    pub fn memory(content: impl Into<String>) -> Self {
        Self { role: Role::System, kind: SegmentKind::Memory, content: content.into() }
    }

    pub fn history(role: Role, content: impl Into<String>) -> Self {
        Self { role, kind: SegmentKind::History, content: content.into() }
    }

    pub fn user_turn(content: impl Into<String>) -> Self {
        Self { role: Role::User, kind: SegmentKind::UserTurn, content: content.into() }
    }
}

/// An ordered sequence of segments, ready to be rendered and tokenized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub segments: Vec<Segment>,
}

impl Prompt {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn push(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    /// Segments of one kind, in order.
    pub fn of_kind(&self, kind: SegmentKind) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(move |s| s.kind == kind)
    }

    /// The current user turn, if present.
    pub fn user_turn(&self) -> Option<&str> {
        self.of_kind(SegmentKind::UserTurn).last().map(|s| s.content.as_str())
    }
}

/// Chat template format used to structure segments for the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatTemplate {
    /// `<|system|>\n{content}</s>\n<|user|>\n{content}</s>\n<|assistant|>\n`
    Zephyr,
    /// `<|im_start|>system\n{content}<|im_end|>\n...<|im_start|>assistant\n`
    #[default]
    ChatMl,
    /// `[INST] <<SYS>>\n{system}\n<</SYS>>\n\n{content} [/INST]`
    Llama2,
    /// `<|start_header_id|>system<|end_header_id|>\n\n{content}<|eot_id|>`
    ///
    /// `<|begin_of_text|>` is left to the tokenizer's special tokens.
    Llama3,
}

impl ChatTemplate {
    /// Guess the template from a GGUF `tokenizer.chat_template` string.
    pub fn detect(raw_template: &str) -> Self {
        if raw_template.contains("<|start_header_id|>") {
            Self::Llama3
        } else if raw_template.contains("<|im_start|>") {
            Self::ChatMl
        } else if raw_template.contains("[INST]") {
            Self::Llama2
        } else if raw_template.contains("<|system|>") || raw_template.contains("<|user|>") {
            Self::Zephyr
        } else {
            Self::default()
        }
    }

    /// Flatten a prompt into model input text, ending with the assistant cue.
    pub fn render(&self, prompt: &Prompt) -> String {
        match self {
            Self::Zephyr => render_zephyr(prompt),
            Self::ChatMl => render_chatml(prompt),
            Self::Llama2 => render_llama2(prompt),
            Self::Llama3 => render_llama3(prompt),
        }
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn render_zephyr(prompt: &Prompt) -> String {
    let mut out = String::new();
    for seg in &prompt.segments {
        out.push_str("<|");
        out.push_str(role_name(seg.role));
        out.push_str("|>\n");
        out.push_str(&seg.content);
        out.push_str("</s>\n");
    }
    out.push_str("<|assistant|>\n");
    out
}

fn render_chatml(prompt: &Prompt) -> String {
    let mut out = String::new();
    for seg in &prompt.segments {
        out.push_str("<|im_start|>");
        out.push_str(role_name(seg.role));
        out.push('\n');
        out.push_str(&seg.content);
        out.push_str("<|im_end|>\n");
    }
    out.push_str("<|im_start|>assistant\n");
    out
}

fn render_llama2(prompt: &Prompt) -> String {
    let mut out = String::new();
    let mut system = String::new();

    for seg in &prompt.segments {
        match seg.role {
            Role::System => {
                if !system.is_empty() {
                    system.push_str("\n\n");
                }
                system.push_str(&seg.content);
            }
            Role::User => {
                out.push_str("[INST] ");
                if !system.is_empty() {
                    out.push_str("<<SYS>>\n");
                    out.push_str(&system);
                    out.push_str("\n<</SYS>>\n\n");
                    system.clear();
                }
                out.push_str(&seg.content);
                out.push_str(" [/INST]");
            }
            Role::Assistant => {
                out.push(' ');
                out.push_str(&seg.content);
                out.push_str(" </s>");
            }
        }
    }
    out
}

fn render_llama3(prompt: &Prompt) -> String {
    let mut out = String::new();
    for seg in &prompt.segments {
        out.push_str("<|start_header_id|>");
        out.push_str(role_name(seg.role));
        out.push_str("<|end_header_id|>\n\n");
        out.push_str(&seg.content);
        out.push_str("<|eot_id|>");
    }
    out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    out
}

/// One completed exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub user: String,
    pub assistant: String,
    pub timestamp: DateTime<Utc>,
}

/// Bounded history of completed turns, oldest first.
#[derive(Debug, Clone)]
pub struct Conversation {
    turns: VecDeque<Turn>,
    max_turns: usize,
}

impl Conversation {
    pub fn new(max_turns: usize) -> Self {
        Self { turns: VecDeque::new(), max_turns }
    }

    /// Record a completed exchange, evicting the oldest past capacity.
    pub fn push(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        if self.max_turns == 0 {
            return;
        }
        if self.turns.len() == self.max_turns {
            self.turns.pop_front();
        }
        self.turns.push_back(Turn {
            user: user.into(),
            assistant: assistant.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    /// History flattened to role-tagged segments, oldest first.
    pub fn segments(&self) -> Vec<Segment> {
        self.turns
            .iter()
            .flat_map(|t| {
                [
                    Segment::history(Role::User, &t.user),
                    Segment::history(Role::Assistant, &t.assistant),
                ]
            })
            .collect()
    }
}
