//! The assistant orchestrator.
//!
//! One chat turn:
//!
//! 1. **Route** the message to a ready model tier
//! 2. **Extract facts** the user stated explicitly and store them
//! 3. **Recall** a memory digest (degrading to no memory on store failure)
//! 4. **Acquire** the tier's session under the configured busy policy
//! 5. **Assemble** the prompt and **generate** on a blocking worker
//!
//! Every step is narrated as a [`ThoughtLogEntry`]. Streaming turns forward
//! thoughts and tokens over a [`ChatStream`] and end with exactly one
//! terminal event.

use crate::context::{AssemblyInput, ContextAssembler};
use crate::facts::{self, ExtractedFact};
use crate::router::{Complexity, Intent, TierRouter, detect_intents};
use crate::stream::{ChatEvent, ChatStream, EventSink};
use jarvis_config::AppConfig;
use jarvis_core::memory::LLM_CATEGORY;
use jarvis_core::{
    CancelFlag, Conversation, Error, LifecycleState, MemoryRecord, MemoryStats, MemoryStore, ModelTier,
    Preference, Prompt, Result, ThoughtLog, ThoughtLogEntry, UserProfile, estimate_tokens,
};
use jarvis_core::event::THOUGHT_LOG_CAPACITY;
use jarvis_inference::{
    GenerationObserver, GenerationSession, GenerationStage, ModelSessionManager, Progress,
    SessionInfo, StopReason, Termination,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, info, warn};

/// Preference key that overrides the configured persona.
pub const SYSTEM_PROMPT_KEY: &str = "system_prompt";

/// The result of a completed chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: String,
    /// Whether a non-empty memory digest went into the prompt.
    pub memory_context_used: bool,
    /// Memories ranked as relevant to the message.
    pub memories_retrieved: usize,
    pub tier: ModelTier,
    pub prompt_tokens: usize,
    pub tokens_generated: usize,
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub intents: Vec<Intent>,
}

/// Lifecycle of one tier as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub tier: ModelTier,
    pub state: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
    /// Why the last load attempt failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// The assistant core. Cheap to clone; clones share sessions, memory,
/// history and the thought log.
#[derive(Clone)]
pub struct Assistant {
    config: Arc<AppConfig>,
    sessions: Arc<ModelSessionManager>,
    memory: Arc<dyn MemoryStore>,
    router: Arc<TierRouter>,
    conversation: Arc<StdMutex<Conversation>>,
    thoughts: Arc<StdMutex<ThoughtLog>>,
}

/// What a turn produced before the conversation was updated.
struct TurnResult {
    response: ChatResponse,
    user_message: String,
}

impl Assistant {
    pub fn new(
        config: AppConfig,
        sessions: Arc<ModelSessionManager>,
        memory: Arc<dyn MemoryStore>,
    ) -> Self {
        let router = TierRouter::new(config.router.clone());
        let conversation = Conversation::new(config.context.history_turns);
        Self {
            config: Arc::new(config),
            sessions,
            memory,
            router: Arc::new(router),
            conversation: Arc::new(StdMutex::new(conversation)),
            thoughts: Arc::new(StdMutex::new(ThoughtLog::new(THOUGHT_LOG_CAPACITY))),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<ModelSessionManager> {
        &self.sessions
    }

    // ── Chat ──────────────────────────────────────────────────────────────

    /// Run one turn to completion.
    pub async fn chat(&self, message: &str) -> Result<ChatResponse> {
        let turn = self.run_turn(message, None, CancelFlag::new()).await?;
        self.remember_turn(&turn);
        Ok(turn.response)
    }

    /// Run one turn, streaming thoughts and tokens.
    ///
    /// Never fails up front: every failure arrives as the stream's terminal
    /// `error` event.
    pub fn start_chat_stream(&self, message: &str) -> ChatStream {
        let (sink, rx, cancel) = ChatStream::channel();
        let this = self.clone();
        let message = message.to_string();
        let turn_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            let terminal = match this.run_turn(&message, Some(sink.clone()), turn_cancel).await {
                Ok(turn) => {
                    this.remember_turn(&turn);
                    ChatEvent::Complete(turn.response)
                }
                Err(Error::Cancelled { partial }) => ChatEvent::Cancelled { partial },
                Err(e) => {
                    warn!(kind = e.kind(), error = %e, "Streamed chat failed");
                    ChatEvent::from_error(&e)
                }
            };
            sink.send(terminal).await;
        });

        ChatStream::new(rx, cancel, task)
    }

    async fn run_turn(
        &self,
        message: &str,
        sink: Option<EventSink>,
        cancel: CancelFlag,
    ) -> Result<TurnResult> {
        // 1. Route
        let decision = self.router.route(message, |t| self.sessions.status(t))?;
        let intents = detect_intents(message);
        let complexity = match decision.complexity {
            Complexity::Simple => "simple",
            Complexity::Complex => "complex",
        };
        let mut detail = format!("{complexity} request, using the {} model", decision.tier);
        if decision.fell_back() {
            detail.push_str(&format!(" ({} model not ready)", decision.preferred));
        }
        if !intents.is_empty() {
            let names: Vec<&str> = intents.iter().map(Intent::as_str).collect();
            detail.push_str(&format!("; intents: {}", names.join(", ")));
        }
        self.think(sink.as_ref(), "Tier Selection", detail).await;

        // 2. Explicit facts
        for fact in facts::extract_facts(message) {
            let (written, result) = match &fact {
                ExtractedFact::Name(name) => {
                    (format!("name set to {name}"), self.memory.set_name(name).await)
                }
                ExtractedFact::Memory(content) => (
                    format!("remembered \"{content}\""),
                    self.memory
                        .add_memory(content, facts::REMEMBERED_CATEGORY, facts::REMEMBERED_IMPORTANCE)
                        .await
                        .map(|_| ()),
                ),
            };
            match result {
                Ok(()) => self.think(sink.as_ref(), "Memory Write", written).await,
                Err(e) => {
                    warn!(error = %e, "Failed to store extracted fact");
                    self.think(sink.as_ref(), "Degraded Mode", format!("could not store fact: {e}"))
                        .await;
                }
            }
        }

        // 3. Recall
        let digest = match self
            .memory
            .build_digest(
                message,
                self.config.memory.recall_limit,
                self.config.memory.context_tokens,
            )
            .await
        {
            Ok(digest) => {
                let preview: Vec<&str> = digest
                    .relevant
                    .iter()
                    .take(3)
                    .map(|m: &MemoryRecord| m.content.as_str())
                    .collect();
                let detail = if preview.is_empty() {
                    "no relevant memories".to_string()
                } else {
                    format!("{} relevant: {}", digest.relevant.len(), preview.join("; "))
                };
                self.think(sink.as_ref(), "Memory Search", detail).await;
                digest
            }
            Err(e) => {
                warn!(error = %e, "Memory unavailable, continuing without it");
                self.think(
                    sink.as_ref(),
                    "Degraded Mode",
                    format!("memory unavailable, answering without it: {e}"),
                )
                .await;
                Default::default()
            }
        };
        let persona = self.persona().await;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                partial: String::new(),
            });
        }

        // 4. Acquire
        let lease = self
            .sessions
            .acquire(decision.tier, self.config.generation.busy_policy)
            .await?;

        // 5. Assemble + generate on a blocking worker
        let history = self
            .conversation
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let worker = GenerationWorker {
            tier: decision.tier,
            config: self.config.clone(),
            thoughts: self.thoughts.clone(),
            sink,
            user_cancel: cancel,
        };
        let memory_context = digest.text.clone();
        let user_message = message.to_string();

        let outcome = tokio::task::spawn_blocking(move || {
            let mut lease = lease;
            worker.run(&mut lease, &persona, &history, &memory_context, &user_message)
        })
        .await
        .map_err(|e| Error::Internal(format!("generation worker failed: {e}")))??;

        let stop_reason = match outcome.termination {
            Termination::Completed(reason) => reason,
            Termination::Cancelled => {
                info!(tier = %decision.tier, "Generation cancelled");
                return Err(Error::Cancelled {
                    partial: outcome.text,
                });
            }
        };

        info!(
            tier = %decision.tier,
            prompt_tokens = outcome.prompt_tokens,
            tokens_generated = outcome.tokens_generated,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Chat turn complete"
        );

        Ok(TurnResult {
            response: ChatResponse {
                message: outcome.text,
                memory_context_used: !digest.text.is_empty(),
                memories_retrieved: digest.relevant.len(),
                tier: decision.tier,
                prompt_tokens: outcome.prompt_tokens,
                tokens_generated: outcome.tokens_generated,
                stop_reason,
                intents,
            },
            user_message: message.to_string(),
        })
    }

    fn remember_turn(&self, turn: &TurnResult) {
        self.conversation
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(&turn.user_message, &turn.response.message);
    }

    /// Persona from the `llm/system_prompt` preference, else the config.
    async fn persona(&self) -> String {
        match self.memory.get_preference(LLM_CATEGORY, SYSTEM_PROMPT_KEY).await {
            Ok(Some(prompt)) if !prompt.trim().is_empty() => prompt,
            Ok(_) => self.config.persona.system_prompt.clone(),
            Err(e) => {
                debug!(error = %e, "Persona preference unavailable, using configured persona");
                self.config.persona.system_prompt.clone()
            }
        }
    }

    async fn think(&self, sink: Option<&EventSink>, step: &str, detail: impl Into<String>) {
        let entry = record_thought(&self.thoughts, step, detail.into());
        if let Some(sink) = sink {
            sink.send(ChatEvent::Thought(entry)).await;
        }
    }

    /// The last thoughts, oldest first.
    pub fn recent_thoughts(&self) -> Vec<ThoughtLogEntry> {
        self.thoughts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entries()
    }

    /// Forget the conversation history.
    pub fn clear_history(&self) {
        let turns = self.config.context.history_turns;
        *self.conversation.lock().unwrap_or_else(|p| p.into_inner()) = Conversation::new(turns);
    }

    // ── Models ────────────────────────────────────────────────────────────

    /// Load `path` into `tier`, replacing the current session.
    pub async fn set_model_path(&self, tier: ModelTier, path: &Path) -> Result<SessionInfo> {
        let info = self.sessions.load(tier, path).await?;
        record_thought(
            &self.thoughts,
            "Model Load",
            format!("{} model ready: {}", tier, path.display()),
        );
        Ok(info)
    }

    /// Load every model path in the configuration. Failures are per tier.
    pub async fn load_configured_models(&self) -> Vec<(ModelTier, Result<SessionInfo>)> {
        let mut results = Vec::new();
        for (tier, path) in self.config.models.configured() {
            let result = self.set_model_path(tier, &path).await;
            if let Err(e) = &result {
                warn!(tier = %tier, path = %path.display(), error = %e, "Configured model failed to load");
            }
            results.push((tier, result));
        }
        results
    }

    pub async fn unload_model(&self, tier: ModelTier) {
        self.sessions.unload(tier).await;
    }

    pub fn model_status(&self) -> Vec<ModelStatus> {
        ModelTier::ALL
            .iter()
            .map(|tier| ModelStatus {
                tier: *tier,
                state: self.sessions.status(*tier),
                session: self.sessions.session_info(*tier),
                last_error: self.sessions.last_error(*tier),
            })
            .collect()
    }

    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }

    // ── Memory ────────────────────────────────────────────────────────────

    pub async fn get_user_profile(&self) -> Result<UserProfile> {
        Ok(self.memory.get_profile().await?)
    }

    pub async fn set_user_name(&self, name: &str) -> Result<()> {
        Ok(self.memory.set_name(name).await?)
    }

    pub async fn add_user_fact(&self, fact: &str) -> Result<()> {
        Ok(self.memory.add_user_fact(fact).await?)
    }

    pub async fn add_memory(&self, content: &str, category: &str, importance: i32) -> Result<i64> {
        Ok(self.memory.add_memory(content, category, importance).await?)
    }

    pub async fn delete_memory(&self, id: i64) -> Result<bool> {
        Ok(self.memory.delete_memory(id).await?)
    }

    pub async fn important_memories(&self, min_importance: i32, limit: usize) -> Result<Vec<MemoryRecord>> {
        Ok(self.memory.important_memories(min_importance, limit).await?)
    }

    pub async fn memory_stats(&self) -> Result<MemoryStats> {
        Ok(self.memory.stats().await?)
    }

    pub async fn search_memories(&self, query: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        Ok(self.memory.search_memories(query, limit).await?)
    }

    pub async fn get_memory_context(&self, query: &str) -> Result<String> {
        let digest = self
            .memory
            .build_digest(
                query,
                self.config.memory.recall_limit,
                self.config.memory.context_tokens,
            )
            .await?;
        Ok(digest.text)
    }

    pub async fn get_all_preferences(&self) -> Result<Vec<Preference>> {
        Ok(self.memory.get_all_preferences().await?)
    }

    pub async fn set_preference(&self, category: &str, key: &str, value: &str) -> Result<()> {
        Ok(self.memory.set_preference(category, key, value).await?)
    }
}

fn record_thought(log: &StdMutex<ThoughtLog>, step: &str, detail: String) -> ThoughtLogEntry {
    debug!(step, detail = %detail, "Thought");
    let entry = ThoughtLogEntry::new(step, detail);
    log.lock()
        .unwrap_or_else(|p| p.into_inner())
        .record(entry.clone());
    entry
}

/// Room kept free in the window for the reply.
fn reply_reserve(max_tokens: usize, window: usize) -> usize {
    max_tokens.min(window / 4)
}

fn stop_label(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndOfSequence => "end of sequence",
        StopReason::MaxTokens => "token limit",
        StopReason::ContextExhausted => "context window exhausted",
    }
}

/// Everything the blocking half of a turn needs.
struct GenerationWorker {
    tier: ModelTier,
    config: Arc<AppConfig>,
    thoughts: Arc<StdMutex<ThoughtLog>>,
    sink: Option<EventSink>,
    user_cancel: CancelFlag,
}

impl GenerationWorker {
    fn run(
        self,
        lease: &mut jarvis_inference::SessionLease,
        persona: &str,
        history: &Conversation,
        memory_context: &str,
        user_message: &str,
    ) -> Result<jarvis_inference::GenerationOutcome> {
        let lease_cancel = lease.cancel_flag();
        let session = lease.session_mut().ok_or(Error::NoModelAvailable)?;

        let window = session.model().context_window();
        let budget = self.config.context.token_budget.min(window);
        let limit = window - reply_reserve(self.config.generation.max_tokens, window);
        let assembled = {
            let model = session.model();
            let template = model.chat_template();
            let counter = |text: &str| {
                model
                    .tokenize(text, false)
                    .map(|t| t.len())
                    .unwrap_or_else(|_| estimate_tokens(text))
            };
            let measure = |prompt: &Prompt| {
                let text = template.render(prompt);
                model
                    .tokenize(&text, true)
                    .map(|t| t.len())
                    .unwrap_or_else(|_| estimate_tokens(&text))
            };
            ContextAssembler::new(budget).assemble_to_fit(
                &AssemblyInput {
                    persona,
                    history,
                    memory_context,
                    user_message,
                },
                &counter,
                limit,
                &measure,
            )?
        };
        let detail = format!(
            "{} prompt tokens of a {} token limit, {} items dropped",
            assembled.metadata.rendered_tokens.unwrap_or(assembled.metadata.total_tokens),
            limit,
            assembled.metadata.items_dropped()
        );
        self.emit_thought("Context Assembly", detail, &lease_cancel);

        let mut observer = TurnObserver {
            worker: &self,
            lease_cancel: lease_cancel.clone(),
        };
        GenerationSession::new(session.model_mut(), &self.config.generation, lease_cancel)
            .run(&assembled.prompt, &mut observer)
    }

    fn emit_thought(&self, step: &str, detail: String, interrupt: &CancelFlag) {
        let entry = record_thought(&self.thoughts, step, detail);
        if let Some(sink) = &self.sink {
            sink.send_blocking(ChatEvent::Thought(entry), interrupt);
        }
    }
}

/// Forwards generation progress to the thought log and the stream, and
/// relays caller cancellation to the session.
struct TurnObserver<'w> {
    worker: &'w GenerationWorker,
    lease_cancel: CancelFlag,
}

impl TurnObserver<'_> {
    fn relay_cancel(&self) {
        if self.worker.user_cancel.is_cancelled() {
            self.lease_cancel.cancel();
        }
    }
}

impl GenerationObserver for TurnObserver<'_> {
    fn on_stage(&mut self, stage: GenerationStage, progress: &Progress) {
        self.relay_cancel();
        let tier = self.worker.tier;
        let detail = match stage {
            GenerationStage::Prefilling => format!(
                "{} prompt tokens on the {tier} model ({} token window)",
                progress.prompt_tokens, progress.context_window
            ),
            GenerationStage::Completed(reason) => format!(
                "{} tokens generated, stopped on {}",
                progress.tokens_generated,
                stop_label(reason)
            ),
            GenerationStage::Cancelled => {
                format!("cancelled after {} tokens", progress.tokens_generated)
            }
            GenerationStage::Errored => {
                format!("failed after {} tokens", progress.tokens_generated)
            }
            _ => return,
        };
        let step = if stage == GenerationStage::Prefilling {
            "Prefill"
        } else {
            "Generation"
        };
        self.worker.emit_thought(step, detail, &self.lease_cancel);
    }

    fn on_token(&mut self, text: &str) {
        self.relay_cancel();
        if let Some(sink) = &self.worker.sink {
            sink.send_blocking(
                ChatEvent::Token {
                    text: text.to_string(),
                },
                &self.lease_cancel,
            );
            self.relay_cancel();
        }
    }
}
