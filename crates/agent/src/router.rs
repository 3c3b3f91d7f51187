//! Model tier routing.
//!
//! A message is classified as simple or complex from cheap textual signals;
//! simple messages prefer the fast tier, complex ones the deep tier. When the
//! preferred tier is not ready the router falls back to the fallback tier,
//! then to whichever tier remains.

use jarvis_config::RouterConfig;
use jarvis_core::{Error, LifecycleState, ModelTier};
use serde::{Deserialize, Serialize};

const CODE_MARKERS: &[&str] = &["```", "fn ", "def ", "=>", "};", "{"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Complex,
}

/// The outcome of routing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouteDecision {
    pub complexity: Complexity,
    pub preferred: ModelTier,
    pub tier: ModelTier,
}

impl RouteDecision {
    pub fn fell_back(&self) -> bool {
        self.tier != self.preferred
    }
}

/// Keyword intents recognised in a user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    GetWeather,
    GetTrainTimes,
    GetFlights,
    SaveMemory,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetWeather => "get_weather",
            Self::GetTrainTimes => "get_train_times",
            Self::GetFlights => "get_flights",
            Self::SaveMemory => "save_memory",
        }
    }
}

/// Deterministic, side-effect-free tier router.
#[derive(Debug, Clone)]
pub struct TierRouter {
    config: RouterConfig,
}

impl Default for TierRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl TierRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, message: &str) -> Complexity {
        let lower = message.to_lowercase();

        let long = message.chars().count() >= self.config.long_message_chars
            || message.split_whitespace().count() >= self.config.long_message_words;
        let many_questions = self.config.question_marks > 0
            && message.matches('?').count() >= self.config.question_marks;
        let code = CODE_MARKERS.iter().any(|m| message.contains(m)) || looks_like_markup(message);
        let keyword = self
            .config
            .complex_keywords
            .iter()
            .any(|k| contains_phrase(&lower, &k.to_lowercase()));

        if long || many_questions || code || keyword {
            Complexity::Complex
        } else {
            Complexity::Simple
        }
    }

    /// Pick a ready tier for `message`, given each tier's lifecycle state.
    pub fn route<F>(&self, message: &str, status: F) -> Result<RouteDecision, Error>
    where
        F: Fn(ModelTier) -> LifecycleState,
    {
        let complexity = self.classify(message);
        let preferred = match complexity {
            Complexity::Simple => ModelTier::Fast,
            Complexity::Complex => ModelTier::Deep,
        };

        fallback_order(preferred)
            .into_iter()
            .find(|t| status(*t) == LifecycleState::Ready)
            .map(|tier| RouteDecision {
                complexity,
                preferred,
                tier,
            })
            .ok_or(Error::NoModelAvailable)
    }
}

/// Preferred tier, then the fallback tier, then the remaining one.
fn fallback_order(preferred: ModelTier) -> Vec<ModelTier> {
    let mut order = vec![preferred];
    if preferred != ModelTier::Fallback {
        order.push(ModelTier::Fallback);
    }
    for tier in ModelTier::ALL {
        if !order.contains(&tier) {
            order.push(tier);
        }
    }
    order
}

/// Whole-word (or whole-phrase) match on already-lowercased text.
fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    if phrase.is_empty() {
        return false;
    }
    haystack.match_indices(phrase).any(|(start, _)| {
        let end = start + phrase.len();
        let before = haystack[..start].chars().next_back();
        let after = haystack[end..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

/// An opening or closing tag such as `<div>` or `</p>`.
fn looks_like_markup(message: &str) -> bool {
    let mut rest = message;
    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];
        let name = after.strip_prefix('/').unwrap_or(after);
        if let Some(close) = name.find('>') {
            let tag = &name[..close];
            if !tag.is_empty() && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                return true;
            }
        }
        rest = after;
    }
    false
}

/// Keyword intent detection used to annotate a turn.
pub fn detect_intents(message: &str) -> Vec<Intent> {
    let lower = message.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    let mut intents = Vec::new();
    if has(&["weather", "temperature"]) {
        intents.push(Intent::GetWeather);
    }
    if has(&["train", "metro"]) {
        intents.push(Intent::GetTrainTimes);
    }
    if has(&["flight", "plane"]) {
        intents.push(Intent::GetFlights);
    }
    if has(&["remember", "note"]) {
        intents.push(Intent::SaveMemory);
    }
    intents
}
