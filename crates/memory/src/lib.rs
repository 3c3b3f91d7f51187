//! Memory store implementations for JARVIS.

pub mod in_memory;
pub mod ranking;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteMemoryStore;

use jarvis_config::MemoryConfig;
use jarvis_core::{MemoryError, MemoryStore};
use std::sync::Arc;
use tracing::info;

/// Open the store selected by `config.backend`.
pub async fn open_store(config: &MemoryConfig) -> Result<Arc<dyn MemoryStore>, MemoryError> {
    let store: Arc<dyn MemoryStore> = match config.backend.as_str() {
        "in_memory" => Arc::new(InMemoryStore::new()),
        #[cfg(feature = "sqlite")]
        "sqlite" => Arc::new(SqliteMemoryStore::open(&config.database_path()).await?),
        other => {
            return Err(MemoryError::StoreUnavailable(format!(
                "unsupported memory backend '{other}'"
            )));
        }
    };
    info!(backend = store.name(), "Memory store ready");
    Ok(store)
}
