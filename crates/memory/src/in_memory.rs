//! In-memory store: useful for testing and ephemeral sessions.

use crate::ranking;
use async_trait::async_trait;
use chrono::Utc;
use jarvis_core::error::MemoryError;
use jarvis_core::memory::{
    MemoryRecord, MemoryStore, Preference, UserProfile, clamp_importance,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    memories: Vec<MemoryRecord>,
    next_id: i64,
    profile: Option<UserProfile>,
    preferences: BTreeMap<(String, String), Preference>,
    seq: i64,
}

/// An in-memory store that keeps everything behind one `RwLock`.
/// Reads run concurrently; writes are serialized by the lock.
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State {
                next_id: 1,
                ..State::default()
            })),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn add_memory(
        &self,
        content: &str,
        category: &str,
        importance: i32,
    ) -> Result<i64, MemoryError> {
        let mut state = self.state.write().await;
        let id = state.next_id;
        state.next_id += 1;
        let now = Utc::now();
        state.memories.push(MemoryRecord {
            id,
            content: content.to_string(),
            category: category.to_string(),
            importance: clamp_importance(importance),
            created_at: now,
            last_accessed: now,
            score: 0.0,
        });
        Ok(id)
    }

    async fn search_memories(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let mut state = self.state.write().await;
        let mut results = ranking::rank(state.memories.clone(), query, limit);

        let now = Utc::now();
        for r in &mut results {
            r.last_accessed = now;
            if let Some(stored) = state.memories.iter_mut().find(|m| m.id == r.id) {
                stored.last_accessed = now;
            }
        }
        Ok(results)
    }

    async fn recent_memories(&self, limit: usize) -> Result<Vec<MemoryRecord>, MemoryError> {
        let state = self.state.read().await;
        let mut all = state.memories.clone();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        all.truncate(limit);
        Ok(all)
    }

    async fn important_memories(
        &self,
        min_importance: i32,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let state = self.state.read().await;
        let mut found: Vec<MemoryRecord> = state
            .memories
            .iter()
            .filter(|m| m.importance >= min_importance)
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            b.importance
                .cmp(&a.importance)
                .then(b.created_at.cmp(&a.created_at))
                .then(b.id.cmp(&a.id))
        });
        found.truncate(limit);
        Ok(found)
    }

    async fn delete_memory(&self, id: i64) -> Result<bool, MemoryError> {
        let mut state = self.state.write().await;
        let before = state.memories.len();
        state.memories.retain(|m| m.id != id);
        Ok(state.memories.len() < before)
    }

    async fn memory_count(&self) -> Result<usize, MemoryError> {
        Ok(self.state.read().await.memories.len())
    }

    async fn get_profile(&self) -> Result<UserProfile, MemoryError> {
        Ok(self.state.read().await.profile.clone().unwrap_or_default())
    }

    async fn set_name(&self, name: &str) -> Result<(), MemoryError> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let profile = state.profile.get_or_insert_with(|| UserProfile {
            created_at: Some(now),
            ..UserProfile::default()
        });
        profile.name = Some(name.to_string());
        profile.updated_at = Some(now);
        Ok(())
    }

    async fn add_user_fact(&self, fact: &str) -> Result<(), MemoryError> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let profile = state.profile.get_or_insert_with(|| UserProfile {
            created_at: Some(now),
            ..UserProfile::default()
        });
        if !profile.facts.iter().any(|f| f == fact) {
            profile.facts.push(fact.to_string());
            profile.updated_at = Some(now);
        }
        Ok(())
    }

    async fn get_preference(
        &self,
        category: &str,
        key: &str,
    ) -> Result<Option<String>, MemoryError> {
        let state = self.state.read().await;
        Ok(state
            .preferences
            .get(&(category.to_string(), key.to_string()))
            .map(|p| p.value.clone()))
    }

    async fn get_all_preferences(&self) -> Result<Vec<Preference>, MemoryError> {
        Ok(self.state.read().await.preferences.values().cloned().collect())
    }

    async fn set_preference(
        &self,
        category: &str,
        key: &str,
        value: &str,
    ) -> Result<(), MemoryError> {
        let mut state = self.state.write().await;
        state.seq += 1;
        let seq = state.seq;
        state.preferences.insert(
            (category.to_string(), key.to_string()),
            Preference {
                category: category.to_string(),
                key: key.to_string(),
                value: value.to_string(),
                updated_at: Utc::now(),
                seq,
            },
        );
        Ok(())
    }
}
