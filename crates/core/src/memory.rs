//! Memory store trait: persisted profile, preferences and memories.
//!
//! The store is a leaf dependency: the assistant reads a ranked digest of it
//! for every turn and writes to it on explicit user actions and on facts
//! extracted from the conversation.

use crate::error::MemoryError;
use crate::token::estimate_tokens;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Importance assigned when the caller does not say otherwise.
pub const DEFAULT_IMPORTANCE: i32 = 5;

/// Highest importance a memory can carry.
pub const MAX_IMPORTANCE: i32 = 10;

/// Categories that configure the assistant instead of describing the user.
pub const SYSTEM_CATEGORY: &str = "system";
pub const LLM_CATEGORY: &str = "llm";

/// A single remembered item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique, monotonically increasing id
    pub id: i64,

    pub content: String,

    /// Free-form tag ("general", "preference", "user", ...)
    pub category: String,

    /// 0–10
    pub importance: i32,

    pub created_at: DateTime<Utc>,

    pub last_accessed: DateTime<Utc>,

    /// Relevance score (set by search operations)
    #[serde(default)]
    pub score: f32,
}

/// A stored preference, unique per (category, key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preference {
    pub category: String,
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
    /// Monotonic write sequence; the highest committed write wins.
    pub seq: i64,
}

/// The singleton user profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: Option<String>,
    pub facts: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// The rendered memory digest plus what went into it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryDigest {
    pub text: String,
    /// Memories ranked as relevant to the query.
    pub relevant: Vec<MemoryRecord>,
    /// Other high-importance memories used to fill the digest.
    pub background: Vec<MemoryRecord>,
}

impl MemoryDigest {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Clamp an importance value into the valid range.
pub fn clamp_importance(importance: i32) -> i32 {
    importance.clamp(0, MAX_IMPORTANCE)
}

/// Counts describing what the store holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub has_profile: bool,
    pub user_name: Option<String>,
    pub fact_count: usize,
    pub preference_count: usize,
    pub memory_count: usize,
}

/// The core MemoryStore trait.
///
/// Implementations: SQLite (persistent), in-memory (tests, ephemeral sessions).
/// Every operation is atomic on its own. Any failure of the backing store
/// surfaces as [`MemoryError::StoreUnavailable`].
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Store a new memory and return its id.
    async fn add_memory(
        &self,
        content: &str,
        category: &str,
        importance: i32,
    ) -> Result<i64, MemoryError>;

    /// Rank memories against `query`, returning at most `limit`.
    async fn search_memories(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryError>;

    /// Most recently created memories first.
    async fn recent_memories(&self, limit: usize) -> Result<Vec<MemoryRecord>, MemoryError>;

    /// Memories with at least `min_importance`, most important first, then
    /// newest.
    async fn important_memories(
        &self,
        min_importance: i32,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryError>;

    /// Delete one memory. Returns whether it existed.
    async fn delete_memory(&self, id: i64) -> Result<bool, MemoryError>;

    async fn memory_count(&self) -> Result<usize, MemoryError>;

    async fn stats(&self) -> Result<MemoryStats, MemoryError> {
        let profile = self.get_profile().await?;
        Ok(MemoryStats {
            has_profile: profile.name.is_some(),
            user_name: profile.name,
            fact_count: profile.facts.len(),
            preference_count: self.get_all_preferences().await?.len(),
            memory_count: self.memory_count().await?,
        })
    }

    async fn get_profile(&self) -> Result<UserProfile, MemoryError>;

    async fn set_name(&self, name: &str) -> Result<(), MemoryError>;

    /// Append a fact to the profile unless it is already present.
    async fn add_user_fact(&self, fact: &str) -> Result<(), MemoryError>;

    async fn get_preference(&self, category: &str, key: &str)
    -> Result<Option<String>, MemoryError>;

    /// All preferences ordered by (category, key).
    async fn get_all_preferences(&self) -> Result<Vec<Preference>, MemoryError>;

    /// Insert or replace the value for (category, key).
    async fn set_preference(
        &self,
        category: &str,
        key: &str,
        value: &str,
    ) -> Result<(), MemoryError>;

    /// Build the memory digest for a turn.
    ///
    /// Relevant memories come first, then the most important remaining ones,
    /// until `max_tokens` is reached. Identical store contents and inputs
    /// always render identical text.
    async fn build_digest(
        &self,
        query: &str,
        recall_limit: usize,
        max_tokens: usize,
    ) -> Result<MemoryDigest, MemoryError> {
        let profile = self.get_profile().await?;
        let prefs = self.get_all_preferences().await?;
        let relevant = if query.trim().is_empty() {
            Vec::new()
        } else {
            self.search_memories(query, recall_limit).await?
        };
        let background: Vec<MemoryRecord> = self
            .search_memories("", recall_limit * 2)
            .await?
            .into_iter()
            .filter(|m| !relevant.iter().any(|r| r.id == m.id))
            .take(recall_limit)
            .collect();

        let text = render_digest(&profile, &prefs, &relevant, &background, max_tokens);
        Ok(MemoryDigest { text, relevant, background })
    }

    /// The digest text alone.
    async fn build_context(&self, query: &str, max_tokens: usize) -> Result<String, MemoryError> {
        Ok(self.build_digest(query, 5, max_tokens).await?.text)
    }
}

/// Render the natural-language digest, cut at the first line that would
/// exceed `max_tokens`.
pub fn render_digest(
    profile: &UserProfile,
    prefs: &[Preference],
    relevant: &[MemoryRecord],
    background: &[MemoryRecord],
    max_tokens: usize,
) -> String {
    let mut sections: Vec<(Option<&str>, Vec<String>)> = Vec::new();

    let mut about = Vec::new();
    if let Some(name) = &profile.name {
        about.push(format!("User's name is {name}."));
    }
    let lookup = |key: &str| {
        prefs
            .iter()
            .find(|p| p.category == SYSTEM_CATEGORY && p.key == key)
            .map(|p| p.value.as_str())
    };
    if let (Some(city), Some(region)) = (lookup("city"), lookup("region")) {
        about.push(format!("Current location: {city}, {region}."));
    }
    sections.push((None, about));

    sections.push((
        Some("User facts:"),
        profile.facts.iter().map(|f| format!("- {f}")).collect(),
    ));

    sections.push((
        Some("User preferences:"),
        prefs
            .iter()
            .filter(|p| p.category != SYSTEM_CATEGORY && p.category != LLM_CATEGORY)
            .map(|p| format!("- {}/{}: {}", p.category, p.key, p.value))
            .collect(),
    ));

    sections.push((
        Some("Relevant memories:"),
        relevant.iter().map(|m| format!("- {}", m.content)).collect(),
    ));

    sections.push((
        Some("Other things to remember:"),
        background.iter().map(|m| format!("- {}", m.content)).collect(),
    ));

    let mut out = String::new();
    let mut used = 0;

    'sections: for (header, lines) in sections {
        if lines.is_empty() {
            continue;
        }
        let mut block = String::new();
        if let Some(h) = header {
            if !out.is_empty() {
                block.push('\n');
            }
            block.push_str(h);
            block.push('\n');
        }
        let mut wrote_item = false;
        for line in lines {
            let candidate = format!("{line}\n");
            let header_cost = if wrote_item { 0 } else { estimate_tokens(&block) };
            let cost = header_cost + estimate_tokens(&candidate);
            if used + cost > max_tokens {
                if wrote_item {
                    out.push_str(&block);
                }
                break 'sections;
            }
            used += cost;
            block.push_str(&candidate);
            wrote_item = true;
        }
        out.push_str(&block);
    }

    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, content: &str, importance: i32) -> MemoryRecord {
        MemoryRecord {
            id,
            content: content.into(),
            category: "general".into(),
            importance,
            created_at: Utc::now(),
            last_accessed: Utc::now(),
            score: 0.0,
        }
    }

    fn pref(category: &str, key: &str, value: &str) -> Preference {
        Preference {
            category: category.into(),
            key: key.into(),
            value: value.into(),
            updated_at: Utc::now(),
            seq: 1,
        }
    }

    #[test]
    fn digest_lists_profile_prefs_and_memories() {
        let profile = UserProfile {
            name: Some("Sam".into()),
            facts: vec!["Works night shifts".into()],
            ..Default::default()
        };
        let prefs = vec![
            pref("system", "city", "Arlington"),
            pref("system", "region", "VA"),
            pref("ui", "theme", "dark"),
            pref("llm", "system_prompt", "You are JARVIS"),
        ];
        let text = render_digest(
            &profile,
            &prefs,
            &[record(1, "likes dark mode", 8)],
            &[record(2, "prefers concise answers", 3)],
            1_000,
        );
        assert!(text.starts_with("User's name is Sam."));
        assert!(text.contains("Current location: Arlington, VA."));
        assert!(text.contains("- ui/theme: dark"));
        assert!(!text.contains("system_prompt"));
        let dark = text.find("likes dark mode").unwrap();
        let concise = text.find("prefers concise answers").unwrap();
        assert!(dark < concise);
    }

    #[test]
    fn digest_respects_budget_and_drops_dangling_headers() {
        let profile = UserProfile {
            name: Some("Sam".into()),
            ..Default::default()
        };
        let memories: Vec<_> = (0..20)
            .map(|i| record(i, &format!("memory number {i} with some padding text"), 5))
            .collect();
        let text = render_digest(&profile, &[], &memories, &[], 30);
        assert!(estimate_tokens(&text) <= 30);
        assert!(text.contains("memory number 0"));
        assert!(!text.contains("memory number 19"));
        assert!(!text.ends_with("Relevant memories:"));
    }

    #[test]
    fn digest_is_empty_for_empty_store() {
        let text = render_digest(&UserProfile::default(), &[], &[], &[], 100);
        assert!(text.is_empty());
    }

    #[test]
    fn importance_is_clamped() {
        assert_eq!(clamp_importance(-3), 0);
        assert_eq!(clamp_importance(42), 10);
        assert_eq!(clamp_importance(7), 7);
    }
}
