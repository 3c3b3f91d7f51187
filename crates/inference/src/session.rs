//! Model session manager.
//!
//! Owns at most one [`ModelSession`] per [`ModelTier`]. Loading runs on a
//! blocking worker; status reads are lock-free. A tier's session is guarded
//! by an async mutex, and a generation holds it for its whole run through a
//! [`SessionLease`].
//!
//! Load order for a tier:
//! 1. read the GGUF header (a bad path leaves the current session alone),
//! 2. cancel the in-flight generation and wait for it to release the session,
//! 3. drop the old session, then load and publish the new one.

use chrono::{DateTime, Utc};
use jarvis_config::BusyPolicy;
use jarvis_core::{
    CancelFlag, Error, LanguageModel, LifecycleState, LoadError, ModelHeader, ModelLoader,
    ModelTier,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::gguf;

/// A loaded model bound to a tier.
pub struct ModelSession {
    pub tier: ModelTier,
    pub path: PathBuf,
    pub header: ModelHeader,
    pub loaded_at: DateTime<Utc>,
    model: Box<dyn LanguageModel>,
}

impl ModelSession {
    pub fn model(&self) -> &dyn LanguageModel {
        self.model.as_ref()
    }

    pub fn model_mut(&mut self) -> &mut dyn LanguageModel {
        self.model.as_mut()
    }
}

/// Read-only description of a loaded session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub tier: ModelTier,
    pub path: PathBuf,
    pub backend: String,
    pub architecture: Option<String>,
    pub name: Option<String>,
    pub context_window: usize,
    pub vocab_size: usize,
    pub loaded_at: DateTime<Utc>,
}

struct TierSlot {
    state: AtomicU8,
    session: Arc<Mutex<Option<ModelSession>>>,
    /// Serializes load/unload for the tier.
    load_lock: Mutex<()>,
    /// Cancel flag of the generation currently holding the session.
    active_cancel: StdMutex<Option<CancelFlag>>,
    info: StdRwLock<Option<SessionInfo>>,
    last_error: StdMutex<Option<String>>,
}

impl TierSlot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Unloaded as u8),
            session: Arc::new(Mutex::new(None)),
            load_lock: Mutex::new(()),
            active_cancel: StdMutex::new(None),
            info: StdRwLock::new(None),
            last_error: StdMutex::new(None),
        }
    }

    fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn set_info(&self, info: Option<SessionInfo>) {
        let mut guard = self.info.write().unwrap_or_else(|p| p.into_inner());
        *guard = info;
    }

    fn info(&self) -> Option<SessionInfo> {
        self.info.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = error;
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn cancel_active(&self) {
        let guard = self.active_cancel.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(flag) = guard.as_ref() {
            flag.cancel();
        }
    }

    fn register(&self, flag: CancelFlag) {
        *self.active_cancel.lock().unwrap_or_else(|p| p.into_inner()) = Some(flag);
    }

    fn clear(&self) {
        *self.active_cancel.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

/// Exclusive use of a tier's session for one generation.
///
/// Dropping the lease releases the session. Loading or unloading the tier
/// while a lease is held cancels the lease's flag and waits for the drop.
pub struct SessionLease {
    tier: ModelTier,
    slot: Arc<TierSlot>,
    cancel: CancelFlag,
    guard: OwnedMutexGuard<Option<ModelSession>>,
}

impl SessionLease {
    pub fn tier(&self) -> ModelTier {
        self.tier
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn session(&self) -> Option<&ModelSession> {
        self.guard.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut ModelSession> {
        self.guard.as_mut()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.slot.clear();
    }
}

pub struct ModelSessionManager {
    loader: Arc<dyn ModelLoader>,
    slots: [Arc<TierSlot>; 3],
}

impl ModelSessionManager {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            slots: [
                Arc::new(TierSlot::new()),
                Arc::new(TierSlot::new()),
                Arc::new(TierSlot::new()),
            ],
        }
    }

    fn slot(&self, tier: ModelTier) -> &Arc<TierSlot> {
        &self.slots[tier.index()]
    }

    pub fn backend(&self) -> &str {
        self.loader.name()
    }

    /// Load `path` into `tier`, replacing any existing session.
    pub async fn load(&self, tier: ModelTier, path: &Path) -> Result<SessionInfo, LoadError> {
        let slot = self.slot(tier).clone();
        let _load = slot.load_lock.lock().await;
        let path = path.to_path_buf();

        let header_path = path.clone();
        let header = tokio::task::spawn_blocking(move || gguf::read_header(&header_path))
            .await
            .map_err(|e| LoadError::InvalidFormat(format!("header read failed: {e}")))??;

        info!(
            tier = %tier,
            path = %path.display(),
            architecture = header.architecture.as_deref().unwrap_or("unknown"),
            context_length = ?header.context_length,
            "Loading model"
        );

        // Tear down the previous session once any generation on it has stopped.
        slot.cancel_active();
        let mut guard = slot.session.clone().lock_owned().await;
        if guard.take().is_some() {
            info!(tier = %tier, "Released previous model session");
        }
        slot.set_info(None);
        slot.set_state(LifecycleState::Loading);

        let loader = self.loader.clone();
        let load_path = path.clone();
        let load_header = header.clone();
        let loaded =
            tokio::task::spawn_blocking(move || loader.load(&load_path, &load_header)).await;

        let model = match loaded {
            Ok(Ok(model)) => model,
            Ok(Err(e)) => {
                warn!(tier = %tier, error = %e, "Model load failed");
                slot.set_last_error(Some(e.to_string()));
                slot.set_state(LifecycleState::Unloaded);
                return Err(e);
            }
            Err(join) => {
                warn!(tier = %tier, error = %join, "Model loader panicked");
                let e = LoadError::InvalidFormat(format!("model loader panicked: {join}"));
                slot.set_last_error(Some(e.to_string()));
                slot.set_state(LifecycleState::Unloaded);
                return Err(e);
            }
        };

        let info = SessionInfo {
            tier,
            path: path.clone(),
            backend: self.loader.name().to_string(),
            architecture: header.architecture.clone(),
            name: header.name.clone(),
            context_window: model.context_window(),
            vocab_size: model.vocab_size(),
            loaded_at: Utc::now(),
        };
        *guard = Some(ModelSession {
            tier,
            path,
            header,
            loaded_at: info.loaded_at,
            model,
        });
        slot.set_info(Some(info.clone()));
        slot.set_last_error(None);
        slot.set_state(LifecycleState::Ready);

        info!(
            tier = %tier,
            context_window = info.context_window,
            backend = %info.backend,
            "Model ready"
        );
        Ok(info)
    }

    /// Release the tier's session. No-op when nothing is loaded.
    pub async fn unload(&self, tier: ModelTier) {
        let slot = self.slot(tier).clone();
        let _load = slot.load_lock.lock().await;
        if slot.state() == LifecycleState::Unloaded {
            return;
        }
        slot.cancel_active();
        let mut guard = slot.session.clone().lock_owned().await;
        guard.take();
        slot.set_info(None);
        slot.set_state(LifecycleState::Unloaded);
        info!(tier = %tier, "Model unloaded");
    }

    /// Unload every tier.
    pub async fn shutdown(&self) {
        for tier in ModelTier::ALL {
            self.unload(tier).await;
        }
    }

    /// Current lifecycle state. Never blocks.
    pub fn status(&self, tier: ModelTier) -> LifecycleState {
        self.slot(tier).state()
    }

    pub fn statuses(&self) -> Vec<(ModelTier, LifecycleState)> {
        ModelTier::ALL.iter().map(|t| (*t, self.status(*t))).collect()
    }

    pub fn is_ready(&self, tier: ModelTier) -> bool {
        self.status(tier) == LifecycleState::Ready
    }

    pub fn session_info(&self, tier: ModelTier) -> Option<SessionInfo> {
        self.slot(tier).info()
    }

    /// Why the last load of `tier` failed after tearing down its session,
    /// until a load succeeds.
    pub fn last_error(&self, tier: ModelTier) -> Option<String> {
        self.slot(tier).last_error()
    }

    /// Take exclusive use of a ready tier for one generation.
    ///
    /// With [`BusyPolicy::Reject`] a held session fails fast with
    /// [`Error::SessionBusy`]; with [`BusyPolicy::Queue`] callers wait in
    /// FIFO order.
    pub async fn acquire(&self, tier: ModelTier, policy: BusyPolicy) -> Result<SessionLease, Error> {
        let slot = self.slot(tier).clone();
        if slot.state() != LifecycleState::Ready {
            return Err(Error::NoModelAvailable);
        }

        let guard = match policy {
            BusyPolicy::Reject => slot
                .session
                .clone()
                .try_lock_owned()
                .map_err(|_| Error::SessionBusy(tier))?,
            BusyPolicy::Queue => slot.session.clone().lock_owned().await,
        };
        if guard.is_none() {
            // Unloaded while we waited.
            return Err(Error::NoModelAvailable);
        }

        let cancel = CancelFlag::new();
        slot.register(cancel.clone());
        Ok(SessionLease {
            tier,
            slot,
            cancel,
            guard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::GgufStub;
    use crate::testing::{LoadOutcome, ScriptedLoader};
    use std::time::Duration;

    fn model_file(dir: &tempfile::TempDir, name: &str, ctx: u32) -> PathBuf {
        let path = dir.path().join(name);
        GgufStub::new("llama").name(name).context_length(ctx).write(&path).unwrap();
        path
    }

    fn manager(loader: ScriptedLoader) -> ModelSessionManager {
        ModelSessionManager::new(Arc::new(loader))
    }

    #[tokio::test]
    async fn load_reports_header_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "fast.gguf", 512);
        let mgr = manager(ScriptedLoader::new("hi"));

        assert_eq!(mgr.status(ModelTier::Fast), LifecycleState::Unloaded);
        let info = mgr.load(ModelTier::Fast, &path).await.unwrap();
        assert_eq!(info.context_window, 512);
        assert_eq!(info.backend, "scripted");
        assert_eq!(mgr.status(ModelTier::Fast), LifecycleState::Ready);
        assert_eq!(mgr.status(ModelTier::Deep), LifecycleState::Unloaded);
        assert_eq!(mgr.session_info(ModelTier::Fast).unwrap().name.as_deref(), Some("fast.gguf"));
    }

    #[tokio::test]
    async fn invalid_path_leaves_prior_session_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let good = model_file(&dir, "good.gguf", 256);
        let mgr = manager(ScriptedLoader::new("hi"));
        let before = mgr.load(ModelTier::Deep, &good).await.unwrap();

        let err = mgr
            .load(ModelTier::Deep, &dir.path().join("missing.gguf"))
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::FileNotFound { .. }));
        assert_eq!(mgr.status(ModelTier::Deep), LifecycleState::Ready);
        assert_eq!(mgr.session_info(ModelTier::Deep), Some(before));

        let junk = dir.path().join("junk.gguf");
        std::fs::write(&junk, b"nope").unwrap();
        let err = mgr.load(ModelTier::Deep, &junk).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_format");
        assert!(mgr.is_ready(ModelTier::Deep));
    }

    #[tokio::test]
    async fn out_of_memory_fails_only_that_tier() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "big.gguf", 256);
        let ok = manager(ScriptedLoader::new("hi"));
        ok.load(ModelTier::Fast, &path).await.unwrap();

        let oom = manager(ScriptedLoader::new("hi").with_outcome(LoadOutcome::OutOfMemory));
        let err = oom.load(ModelTier::Deep, &path).await.unwrap_err();
        assert_eq!(err.kind(), "out_of_memory");
        assert_eq!(oom.status(ModelTier::Deep), LifecycleState::Unloaded);
        assert!(oom.session_info(ModelTier::Deep).is_none());
        assert!(oom.last_error(ModelTier::Deep).unwrap().contains("scripted allocation failure"));
        assert!(ok.is_ready(ModelTier::Fast));
    }

    #[tokio::test]
    async fn loader_panic_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "boom.gguf", 256);
        let mgr = manager(ScriptedLoader::new("hi").with_outcome(LoadOutcome::Panic));
        let err = mgr.load(ModelTier::Fast, &path).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_format");
        assert_eq!(mgr.status(ModelTier::Fast), LifecycleState::Unloaded);
        assert!(mgr.acquire(ModelTier::Fast, BusyPolicy::Reject).await.is_err());
    }

    #[tokio::test]
    async fn reload_replaces_session() {
        let dir = tempfile::tempdir().unwrap();
        let a = model_file(&dir, "a.gguf", 128);
        let b = model_file(&dir, "b.gguf", 256);
        let loader = ScriptedLoader::new("hi");
        let loads = loader.load_counter();
        let mgr = manager(loader);

        mgr.load(ModelTier::Fast, &a).await.unwrap();
        mgr.load(ModelTier::Fast, &b).await.unwrap();
        let info = mgr.session_info(ModelTier::Fast).unwrap();
        assert_eq!(info.path, b);
        assert_eq!(info.context_window, 256);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unload_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "m.gguf", 128);
        let mgr = manager(ScriptedLoader::new("hi"));

        mgr.unload(ModelTier::Fast).await;
        assert_eq!(mgr.status(ModelTier::Fast), LifecycleState::Unloaded);

        mgr.load(ModelTier::Fast, &path).await.unwrap();
        mgr.load(ModelTier::Fallback, &path).await.unwrap();
        mgr.shutdown().await;
        assert!(mgr.statuses().iter().all(|(_, s)| *s == LifecycleState::Unloaded));
        assert!(matches!(
            mgr.acquire(ModelTier::Fast, BusyPolicy::Reject).await,
            Err(Error::NoModelAvailable)
        ));
    }

    #[tokio::test]
    async fn reject_policy_fails_fast_when_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "m.gguf", 128);
        let mgr = manager(ScriptedLoader::new("hi"));
        mgr.load(ModelTier::Fast, &path).await.unwrap();

        let lease = mgr.acquire(ModelTier::Fast, BusyPolicy::Reject).await.unwrap();
        assert!(lease.session().is_some());
        let busy = mgr.acquire(ModelTier::Fast, BusyPolicy::Reject).await;
        assert!(matches!(busy, Err(Error::SessionBusy(ModelTier::Fast))));
        drop(lease);
        assert!(mgr.acquire(ModelTier::Fast, BusyPolicy::Reject).await.is_ok());
    }

    #[tokio::test]
    async fn queue_policy_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "m.gguf", 128);
        let mgr = Arc::new(manager(ScriptedLoader::new("hi")));
        mgr.load(ModelTier::Fast, &path).await.unwrap();

        let lease = mgr.acquire(ModelTier::Fast, BusyPolicy::Queue).await.unwrap();
        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.acquire(ModelTier::Fast, BusyPolicy::Queue).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(lease);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn load_cancels_active_lease() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "m.gguf", 128);
        let mgr = Arc::new(manager(ScriptedLoader::new("hi")));
        mgr.load(ModelTier::Fast, &path).await.unwrap();

        let lease = mgr.acquire(ModelTier::Fast, BusyPolicy::Reject).await.unwrap();
        let flag = lease.cancel_flag();
        let reload = {
            let mgr = mgr.clone();
            let path = path.clone();
            tokio::spawn(async move { mgr.load(ModelTier::Fast, &path).await })
        };
        // The reload signals cancellation, then waits for the lease to go away.
        for _ in 0..50 {
            if flag.is_cancelled() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(flag.is_cancelled());
        assert!(!reload.is_finished());
        drop(lease);
        reload.await.unwrap().unwrap();
        assert!(mgr.is_ready(ModelTier::Fast));
    }
}
