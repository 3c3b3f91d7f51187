//! End-to-end chat tests: real session manager, real memory stores, scripted
//! model backend.

use async_trait::async_trait;
use jarvis_agent::{Assistant, ChatEvent};
use jarvis_config::{AppConfig, BusyPolicy};
use jarvis_core::{
    LifecycleState, MemoryError, MemoryRecord, MemoryStore, ModelTier, Preference, UserProfile,
};
use jarvis_inference::gguf::GgufStub;
use jarvis_inference::testing::ScriptedLoader;
use jarvis_inference::{ModelSessionManager, StopReason};
use jarvis_memory::{InMemoryStore, SqliteMemoryStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn model_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    GgufStub::new("llama")
        .name(name)
        .context_length(2048)
        .write(&path)
        .unwrap();
    path
}

async fn assistant(
    loader: ScriptedLoader,
    config: AppConfig,
    memory: Arc<dyn MemoryStore>,
    dir: &tempfile::TempDir,
) -> Assistant {
    let sessions = Arc::new(ModelSessionManager::new(Arc::new(loader)));
    let assistant = Assistant::new(config, sessions, memory);
    assistant
        .set_model_path(ModelTier::Fast, &model_file(dir, "fast.gguf"))
        .await
        .unwrap();
    assistant
}

fn small_window_file(dir: &tempfile::TempDir, name: &str, context_length: u32) -> PathBuf {
    let path = dir.path().join(name);
    GgufStub::new("llama")
        .context_length(context_length)
        .write(&path)
        .unwrap();
    path
}

fn slow_endless(reply: &str) -> ScriptedLoader {
    ScriptedLoader::new(reply)
        .endless()
        .with_decode_delay(Duration::from_millis(5))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streamed_chat_orders_thoughts_tokens_and_one_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let assistant = assistant(
        ScriptedLoader::new("Héllo there ✓"),
        AppConfig::default(),
        Arc::new(InMemoryStore::new()),
        &dir,
    )
    .await;

    let events = assistant.start_chat_stream("Hi").collect().await;
    let terminals: Vec<&ChatEvent> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminals.len(), 1);
    assert!(events.last().unwrap().is_terminal());

    let first_token = events.iter().position(|e| e.event_type() == "token").unwrap();
    let first_thought = events.iter().position(|e| e.event_type() == "thought").unwrap();
    assert!(first_thought < first_token);

    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::Token { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    match events.last().unwrap() {
        ChatEvent::Complete(response) => {
            assert_eq!(response.message, "Héllo there ✓");
            assert_eq!(response.message, streamed);
            assert_eq!(response.stop_reason, StopReason::EndOfSequence);
        }
        other => panic!("expected complete, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn greedy_chat_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let assistant = assistant(
        ScriptedLoader::new("Same answer."),
        AppConfig::default(),
        Arc::new(InMemoryStore::new()),
        &dir,
    )
    .await;
    let a = assistant.chat("Hello").await.unwrap();
    assistant.clear_history();
    let b = assistant.chat("Hello").await.unwrap();
    assert_eq!(a.message, b.message);
    assert_eq!(a.prompt_tokens, b.prompt_tokens);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_stream_never_completes() {
    let dir = tempfile::tempdir().unwrap();
    let assistant = assistant(
        slow_endless("tick "),
        AppConfig::default(),
        Arc::new(InMemoryStore::new()),
        &dir,
    )
    .await;

    let mut stream = assistant.start_chat_stream("Hi");
    let mut streamed = String::new();
    let mut tokens = 0;
    let terminal = loop {
        let event = stream.next_event().await.expect("stream ended without terminal event");
        match event {
            ChatEvent::Token { text } => {
                streamed.push_str(&text);
                tokens += 1;
                if tokens == 3 {
                    stream.cancel();
                }
            }
            ChatEvent::Thought(_) => {}
            terminal => break terminal,
        }
    };

    match terminal {
        ChatEvent::Cancelled { partial } => {
            assert!(partial.starts_with(&streamed));
            assert!(!partial.is_empty());
        }
        other => panic!("expected cancelled, got {other:?}"),
    }
    assert!(stream.next_event().await.is_none());

    // Cancelled before generation starts.
    let next = assistant.start_chat_stream("again");
    next.cancel();
    let events = next.collect().await;
    assert_eq!(events.last().unwrap().event_type(), "cancelled");
    assert!(events.iter().all(|e| e.event_type() != "complete"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn busy_session_is_rejected_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let assistant = assistant(
        slow_endless("busy "),
        AppConfig::default(),
        Arc::new(InMemoryStore::new()),
        &dir,
    )
    .await;

    let mut first = assistant.start_chat_stream("Hi");
    // Wait until the first turn holds the session.
    loop {
        match first.next_event().await.unwrap() {
            ChatEvent::Token { .. } => break,
            e if e.is_terminal() => panic!("first turn ended early: {e:?}"),
            _ => {}
        }
    }

    let err = assistant.chat("Hello?").await.unwrap_err();
    assert_eq!(err.kind(), "session_busy");

    first.cancel();
    let rest = first.collect().await;
    assert_eq!(rest.last().unwrap().event_type(), "cancelled");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_policy_waits_for_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.generation.busy_policy = BusyPolicy::Queue;
    config.generation.max_tokens = 20;
    let assistant = assistant(
        slow_endless("q"),
        config,
        Arc::new(InMemoryStore::new()),
        &dir,
    )
    .await;

    let mut first = assistant.start_chat_stream("Hi");
    loop {
        if first.next_event().await.unwrap().event_type() == "token" {
            break;
        }
    }

    let second = assistant.chat("Hello").await.unwrap();
    assert_eq!(second.stop_reason, StopReason::MaxTokens);
    assert_eq!(second.tokens_generated, 20);

    let rest = first.collect().await;
    match rest.last().unwrap() {
        ChatEvent::Complete(r) => assert_eq!(r.stop_reason, StopReason::MaxTokens),
        other => panic!("expected complete, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_cancels_in_flight_generation() {
    let dir = tempfile::tempdir().unwrap();
    let assistant = assistant(
        slow_endless("old "),
        AppConfig::default(),
        Arc::new(InMemoryStore::new()),
        &dir,
    )
    .await;

    let mut stream = assistant.start_chat_stream("Hi");
    loop {
        if stream.next_event().await.unwrap().event_type() == "token" {
            break;
        }
    }

    let info = assistant
        .set_model_path(ModelTier::Fast, &model_file(&dir, "fast-v2.gguf"))
        .await
        .unwrap();
    assert_eq!(info.name.as_deref(), Some("fast-v2.gguf"));

    let rest = stream.collect().await;
    assert_eq!(rest.last().unwrap().event_type(), "cancelled");
    assert_eq!(
        assistant.sessions().status(ModelTier::Fast),
        LifecycleState::Ready
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_path_keeps_prior_session() {
    let dir = tempfile::tempdir().unwrap();
    let assistant = assistant(
        ScriptedLoader::new("still here"),
        AppConfig::default(),
        Arc::new(InMemoryStore::new()),
        &dir,
    )
    .await;

    let err = assistant
        .set_model_path(ModelTier::Fast, &dir.path().join("missing.gguf"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "file_not_found");

    let status = assistant.model_status();
    let fast = status.iter().find(|s| s.tier == ModelTier::Fast).unwrap();
    assert_eq!(fast.state, LifecycleState::Ready);
    assert_eq!(
        fast.session.as_ref().unwrap().name.as_deref(),
        Some("fast.gguf")
    );
    assert_eq!(assistant.chat("Hi").await.unwrap().message, "still here");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn complex_message_falls_back_to_ready_tier() {
    let dir = tempfile::tempdir().unwrap();
    let assistant = assistant(
        ScriptedLoader::new("fallback answer"),
        AppConfig::default(),
        Arc::new(InMemoryStore::new()),
        &dir,
    )
    .await;
    assistant
        .set_model_path(ModelTier::Fallback, &model_file(&dir, "fallback.gguf"))
        .await
        .unwrap();

    let response = assistant
        .chat("Explain step by step how borrow checking works")
        .await
        .unwrap();
    assert_eq!(response.tier, ModelTier::Fallback);
    let selection = assistant
        .recent_thoughts()
        .into_iter()
        .find(|t| t.step == "Tier Selection")
        .unwrap();
    assert!(selection.detail.contains("deep model not ready"));
}

/// A store whose backing database is gone.
struct UnavailableStore;

fn gone() -> MemoryError {
    MemoryError::StoreUnavailable("database is locked".into())
}

#[async_trait]
impl MemoryStore for UnavailableStore {
    fn name(&self) -> &str {
        "unavailable"
    }
    async fn add_memory(&self, _: &str, _: &str, _: i32) -> Result<i64, MemoryError> {
        Err(gone())
    }
    async fn search_memories(&self, _: &str, _: usize) -> Result<Vec<MemoryRecord>, MemoryError> {
        Err(gone())
    }
    async fn recent_memories(&self, _: usize) -> Result<Vec<MemoryRecord>, MemoryError> {
        Err(gone())
    }
    async fn important_memories(&self, _: i32, _: usize) -> Result<Vec<MemoryRecord>, MemoryError> {
        Err(gone())
    }
    async fn delete_memory(&self, _: i64) -> Result<bool, MemoryError> {
        Err(gone())
    }
    async fn memory_count(&self) -> Result<usize, MemoryError> {
        Err(gone())
    }
    async fn get_profile(&self) -> Result<UserProfile, MemoryError> {
        Err(gone())
    }
    async fn set_name(&self, _: &str) -> Result<(), MemoryError> {
        Err(gone())
    }
    async fn add_user_fact(&self, _: &str) -> Result<(), MemoryError> {
        Err(gone())
    }
    async fn get_preference(&self, _: &str, _: &str) -> Result<Option<String>, MemoryError> {
        Err(gone())
    }
    async fn get_all_preferences(&self) -> Result<Vec<Preference>, MemoryError> {
        Err(gone())
    }
    async fn set_preference(&self, _: &str, _: &str, _: &str) -> Result<(), MemoryError> {
        Err(gone())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unavailable_memory_degrades_gracefully() {
    let dir = tempfile::tempdir().unwrap();
    let assistant = assistant(
        ScriptedLoader::new("I can still talk."),
        AppConfig::default(),
        Arc::new(UnavailableStore),
        &dir,
    )
    .await;

    let events = assistant
        .start_chat_stream("My name is Sam. What's up?")
        .collect()
        .await;
    let degraded = events
        .iter()
        .filter(|e| matches!(e, ChatEvent::Thought(t) if t.step == "Degraded Mode"))
        .count();
    assert_eq!(degraded, 2);
    match events.last().unwrap() {
        ChatEvent::Complete(r) => {
            assert_eq!(r.message, "I can still talk.");
            assert!(!r.memory_context_used);
        }
        other => panic!("expected complete, got {other:?}"),
    }

    let err = assistant.get_user_profile().await.unwrap_err();
    assert_eq!(err.kind(), "store_unavailable");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sqlite_memory_feeds_the_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteMemoryStore::open(&dir.path().join("jarvis.db")).await.unwrap();
    let assistant = assistant(
        ScriptedLoader::new("You like dark mode."),
        AppConfig::default(),
        Arc::new(store),
        &dir,
    )
    .await;

    assistant.set_user_name("Sam").await.unwrap();
    assistant.add_memory("likes dark mode", "preference", 8).await.unwrap();
    assistant
        .add_memory("prefers concise answers", "preference", 3)
        .await
        .unwrap();

    let context = assistant
        .get_memory_context("What UI theme do I like?")
        .await
        .unwrap();
    assert!(context.contains("User's name is Sam."));
    assert!(
        context.find("likes dark mode").unwrap() < context.find("prefers concise answers").unwrap()
    );

    let response = assistant.chat("What UI theme do I like?").await.unwrap();
    assert!(response.memory_context_used);
    assert_eq!(response.memories_retrieved, 1);

    assistant
        .set_preference("llm", "system_prompt", "Be formal")
        .await
        .unwrap();
    assistant
        .set_preference("llm", "system_prompt", "Be brief")
        .await
        .unwrap();
    let prompts: Vec<Preference> = assistant
        .get_all_preferences()
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.category == "llm" && p.key == "system_prompt")
        .collect();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].value, "Be brief");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn long_conversation_drops_oldest_turns_to_fit_the_window() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(ModelSessionManager::new(Arc::new(ScriptedLoader::new(
        &"r".repeat(150),
    ))));
    let assistant = Assistant::new(AppConfig::default(), sessions, Arc::new(InMemoryStore::new()));
    let path = small_window_file(&dir, "small.gguf", 512);
    assistant.set_model_path(ModelTier::Fast, &path).await.unwrap();

    let mut prompt_sizes = Vec::new();
    for turn in 0..5 {
        let response = assistant
            .chat("Hi")
            .await
            .unwrap_or_else(|e| panic!("turn {turn} failed: {e}"));
        assert!(response.prompt_tokens <= 512 - 128, "turn {turn}: {}", response.prompt_tokens);
        assert!(response.tokens_generated > 0);
        prompt_sizes.push(response.prompt_tokens);
    }

    // Later prompts stay bounded instead of growing with every turn.
    assert!(prompt_sizes[4] < prompt_sizes[0] + 2 * 160);
    let last_assembly = assistant
        .recent_thoughts()
        .into_iter()
        .rev()
        .find(|t| t.step == "Context Assembly")
        .unwrap();
    assert!(!last_assembly.detail.ends_with(" 0 items dropped"), "{}", last_assembly.detail);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_is_not_blocked_by_a_stalled_consumer() {
    let dir = tempfile::tempdir().unwrap();
    let assistant = assistant(
        ScriptedLoader::new("spam ").endless(),
        AppConfig::default(),
        Arc::new(InMemoryStore::new()),
        &dir,
    )
    .await;

    // Held but never read, so the event channel fills up.
    let stream = assistant.start_chat_stream("Hi");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let fast_v2 = model_file(&dir, "fast-v2.gguf");
    let reload = assistant.set_model_path(ModelTier::Fast, &fast_v2);
    let info = tokio::time::timeout(Duration::from_secs(5), reload)
        .await
        .expect("reload stalled behind a full stream")
        .unwrap();
    assert_eq!(info.name.as_deref(), Some("fast-v2.gguf"));

    let events = stream.collect().await;
    assert_eq!(events.last().unwrap().event_type(), "cancelled");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_a_stalled_stream_releases_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let assistant = assistant(
        ScriptedLoader::new("spam ").endless(),
        AppConfig::default(),
        Arc::new(InMemoryStore::new()),
        &dir,
    )
    .await;

    let stream = assistant.start_chat_stream("Hi");
    tokio::time::sleep(Duration::from_millis(300)).await;
    stream.cancel();

    let events = tokio::time::timeout(Duration::from_secs(5), stream.collect())
        .await
        .expect("cancelled stream never finished");
    assert_eq!(events.last().unwrap().event_type(), "cancelled");
    assert!(events.iter().all(|e| e.event_type() != "complete"));
}
