pub mod chat;
pub mod config_cmd;
pub mod memory;
pub mod models;
pub mod prefs;
pub mod profile;

use jarvis_agent::Assistant;
use jarvis_config::AppConfig;
use jarvis_core::{MemoryStore, ModelLoader};
#[cfg(not(feature = "local"))]
use jarvis_core::{LanguageModel, LoadError, ModelHeader};
use jarvis_inference::ModelSessionManager;
use std::sync::Arc;

pub type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub fn load_config() -> CliResult<AppConfig> {
    Ok(AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?)
}

pub async fn open_memory(config: &AppConfig) -> CliResult<Arc<dyn MemoryStore>> {
    Ok(jarvis_memory::open_store(&config.memory)
        .await
        .map_err(|e| format!("Failed to open memory store: {e}"))?)
}

/// Stand-in loader for builds without an inference backend.
#[cfg(not(feature = "local"))]
struct NoBackend;

#[cfg(not(feature = "local"))]
impl ModelLoader for NoBackend {
    fn name(&self) -> &str {
        "none"
    }

    fn load(&self, _path: &std::path::Path, _header: &ModelHeader) -> Result<Box<dyn LanguageModel>, LoadError> {
        Err(LoadError::InvalidFormat(
            "jarvis was built without the `local` feature; rebuild with --features local".into(),
        ))
    }
}

fn model_loader() -> Arc<dyn ModelLoader> {
    #[cfg(feature = "local")]
    {
        Arc::new(jarvis_inference::CandleLoader::cpu())
    }
    #[cfg(not(feature = "local"))]
    {
        Arc::new(NoBackend)
    }
}

/// Build an assistant and load every configured model tier.
pub async fn assistant(config: AppConfig) -> CliResult<Assistant> {
    let memory = open_memory(&config).await?;
    let sessions = Arc::new(ModelSessionManager::new(model_loader()));
    tracing::debug!(backend = sessions.backend(), store = memory.name(), "Building assistant");
    let assistant = Assistant::new(config, sessions, memory);

    for (tier, result) in assistant.load_configured_models().await {
        if let Err(e) = result {
            eprintln!("  ⚠️  {tier} model not loaded: {e}");
        }
    }
    Ok(assistant)
}
