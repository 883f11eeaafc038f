//! Sync orchestrator: validation, per-path serialization, session driving.
//!
//! ```text
//! sync(path)
//!   ├─ validate           (blocking, no events; failure → InvocationError)
//!   ├─ per-path slot      (wait, or Busy under BusyPolicy::Reject)
//!   └─ session task
//!        (Scanning, 0)
//!        ├─ empty diff    → (UpdateNotRequired, 100)
//!        └─ changes       → (Updating, 0) … (Updating, n) → (Updated, 100)
//!        error            → (Failed, last)
//!        cancel           → rollback, (Cancelled, last)
//! ```
//!
//! The slot is released only after the terminal event is published, so a
//! queued caller's `(Scanning, 0)` always follows the previous terminal event.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stencil_core::{percent, BusyPolicy, SourceKey, StencilConfig, SyncStatus};
use stencil_sync::{
    pipeline::{self, PipelineOptions, PipelineOutcome, Stage},
    validate, ChangeSummary, DefaultResolver, SourceResolver, ValidatedSource,
};

use crate::error::InvocationError;
use crate::progress::{ProgressChannel, Subscription};
use crate::session::{SessionHandle, SessionSnapshot};

/// What the caller of `sync` gets back once its session is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub session_id: Uuid,
    pub source: String,
    pub status: SyncStatus,
    pub progress: u8,
    pub summary: ChangeSummary,
    pub duration_ms: u128,
}

struct Inner {
    cache_root: PathBuf,
    keep_generations: usize,
    busy_policy: BusyPolicy,
    resolver: Arc<dyn SourceResolver>,
    channel: ProgressChannel,
    slots: Mutex<HashMap<SourceKey, Arc<AsyncMutex<()>>>>,
    sessions: Mutex<HashMap<SourceKey, SessionHandle>>,
}

/// Entry point for transport hosts. Cheap to clone.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    /// Build an orchestrator from config rooted at `home`, resolving local
    /// directories only.
    pub fn new(home: &Path, config: &StencilConfig) -> Self {
        Self::with_resolver(home, config, Arc::new(DefaultResolver::new()))
    }

    pub fn with_resolver(
        home: &Path,
        config: &StencilConfig,
        resolver: Arc<dyn SourceResolver>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache_root: config.cache_root_at(home),
                keep_generations: config.keep_generations,
                busy_policy: config.busy_policy,
                resolver,
                channel: ProgressChannel::new(config.subscriber_capacity),
                slots: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn channel(&self) -> &ProgressChannel {
        &self.inner.channel
    }

    pub fn cache_root(&self) -> &Path {
        &self.inner.cache_root
    }

    /// Snapshots of every non-retired session, sorted by source.
    pub fn active_sessions(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<_> = self
            .inner
            .sessions
            .lock()
            .values()
            .map(SessionHandle::snapshot)
            .collect();
        snapshots.sort_by(|a, b| a.source.cmp(&b.source));
        snapshots
    }

    /// Synchronize `path` and resolve once the session is terminal.
    pub async fn sync(&self, path: &str) -> Result<SyncOutcome, InvocationError> {
        self.sync_with_cancel(path, CancellationToken::new()).await
    }

    /// Like [`sync`](Self::sync), cancelled when `cancel` fires or when the
    /// returned future is dropped.
    ///
    /// Errors only describe why no session ran; in-session failures come back
    /// as an `Ok` outcome with status `Failed` or `Cancelled`.
    pub async fn sync_with_cancel(
        &self,
        path: &str,
        cancel: CancellationToken,
    ) -> Result<SyncOutcome, InvocationError> {
        self.invoke(path, cancel, None).await
    }

    /// Like [`sync_with_cancel`](Self::sync_with_cancel), and hands the
    /// invoker a subscription to its own session through `subscribed`.
    ///
    /// The subscription is registered once the per-path slot is held and
    /// before `(Scanning, 0)`, so it never carries events of a session queued
    /// ahead on the same path. `subscribed` is dropped unsent when the
    /// invocation is rejected.
    pub async fn sync_subscribed(
        &self,
        path: &str,
        cancel: CancellationToken,
        subscribed: oneshot::Sender<Subscription>,
    ) -> Result<SyncOutcome, InvocationError> {
        self.invoke(path, cancel, Some(subscribed)).await
    }

    async fn invoke(
        &self,
        path: &str,
        cancel: CancellationToken,
        subscribed: Option<oneshot::Sender<Subscription>>,
    ) -> Result<SyncOutcome, InvocationError> {
        let validated = self.validate(path).await?;
        let guard = cancel.clone().drop_guard();
        let result = self.run_session(validated, cancel, subscribed).await;
        guard.disarm();
        result
    }

    async fn run_session(
        &self,
        validated: ValidatedSource,
        cancel: CancellationToken,
        subscribed: Option<oneshot::Sender<Subscription>>,
    ) -> Result<SyncOutcome, InvocationError> {
        let key = validated.key.clone();
        let permit = self.acquire(&key, &cancel).await?;

        if let Some(subscribed) = subscribed {
            let _ = subscribed.send(self.inner.channel.subscribe_key(key.clone()));
        }

        let session = SessionHandle::new(key.clone(), self.inner.channel.clone());
        self.inner
            .sessions
            .lock()
            .insert(key.clone(), session.clone());
        tracing::info!(session = %session.id(), source = %key, "sync session started");

        let guard = SessionGuard::new(self.inner.clone(), key.clone(), session, permit);
        let task = tokio::spawn(drive(self.inner.clone(), validated, guard, cancel));
        task.await.map_err(|err| {
            tracing::error!(source = %key, error = %err, "sync session task failed");
            InvocationError::Internal(format!("sync task join error: {err}"))
        })
    }

    async fn validate(&self, path: &str) -> Result<ValidatedSource, InvocationError> {
        let resolver = self.inner.resolver.clone();
        let raw = path.to_string();
        let validated = tokio::task::spawn_blocking(move || validate(&raw, resolver.as_ref()))
            .await
            .map_err(|err| InvocationError::Internal(format!("validation join error: {err}")))?;
        validated.map_err(|err| {
            tracing::info!(path, error = %err, "sync rejected");
            InvocationError::from(err)
        })
    }

    async fn acquire(
        &self,
        key: &SourceKey,
        cancel: &CancellationToken,
    ) -> Result<SlotPermit, InvocationError> {
        let slot = self.inner.slot(key);
        let guard = match self.inner.busy_policy {
            BusyPolicy::Reject => slot.try_lock_owned().map_err(|_| InvocationError::Busy {
                source_key: key.to_string(),
            }),
            BusyPolicy::Wait => {
                tokio::select! {
                    guard = slot.lock_owned() => Ok(guard),
                    _ = cancel.cancelled() => Err(InvocationError::Cancelled),
                }
            }
        };
        match guard {
            Ok(guard) => Ok(SlotPermit {
                guard: Some(guard),
                key: key.clone(),
                inner: self.inner.clone(),
            }),
            Err(err) => {
                self.inner.release_slot(key);
                Err(err)
            }
        }
    }
}

impl Inner {
    fn slot(&self, key: &SourceKey) -> Arc<AsyncMutex<()>> {
        self.slots
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Drop the slot once nobody holds or waits on it.
    fn release_slot(&self, key: &SourceKey) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(key) {
            if Arc::strong_count(slot) == 1 {
                slots.remove(key);
            }
        }
    }

    fn retire(&self, key: &SourceKey, session: &SessionHandle) {
        let mut sessions = self.sessions.lock();
        if sessions.get(key).map(SessionHandle::id) == Some(session.id()) {
            sessions.remove(key);
        }
    }
}

/// Holds the per-path slot; releasing it also prunes the slot table.
struct SlotPermit {
    guard: Option<OwnedMutexGuard<()>>,
    key: SourceKey,
    inner: Arc<Inner>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.inner.release_slot(&self.key);
    }
}

/// Owned by the session task. Dropping it, including while unwinding out of
/// a panic, makes the session terminal and retires it before the slot is
/// released.
struct SessionGuard {
    inner: Arc<Inner>,
    key: SourceKey,
    session: SessionHandle,
    permit: Option<SlotPermit>,
}

impl SessionGuard {
    fn new(inner: Arc<Inner>, key: SourceKey, session: SessionHandle, permit: SlotPermit) -> Self {
        Self {
            inner,
            key,
            session,
            permit: Some(permit),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self
            .session
            .emit(SyncStatus::Failed, self.session.progress())
            .is_some()
        {
            tracing::error!(
                session = %self.session.id(),
                source = %self.key,
                "sync session ended without a terminal status",
            );
        }
        self.inner.retire(&self.key, &self.session);
        drop(self.permit.take());
    }
}

async fn drive(
    inner: Arc<Inner>,
    validated: ValidatedSource,
    guard: SessionGuard,
    cancel: CancellationToken,
) -> SyncOutcome {
    let started = Instant::now();
    let key = validated.key.clone();
    let session = guard.session.clone();
    session.emit(SyncStatus::Scanning, 0);

    let reporter = session.clone();
    let cache_root = inner.cache_root.clone();
    let keep_generations = inner.keep_generations;
    let token = cancel.clone();
    let result = tokio::task::spawn_blocking(move || {
        let options = PipelineOptions {
            cache_root: &cache_root,
            keep_generations,
        };
        pipeline::run(&validated, &options, &token, &mut |stage| match stage {
            Stage::Updating { .. } => {
                reporter.emit(SyncStatus::Updating, 0);
            }
            Stage::Progress { done, total } => {
                reporter.emit(SyncStatus::Updating, percent(done, total));
            }
        })
    })
    .await;

    let (status, summary) = match result {
        Ok(Ok(PipelineOutcome::UpToDate)) => (SyncStatus::UpdateNotRequired, ChangeSummary::default()),
        Ok(Ok(PipelineOutcome::Applied { summary, .. })) => (SyncStatus::Updated, summary),
        Ok(Err(err)) if err.is_cancelled() => {
            tracing::info!(session = %session.id(), source = %key, "sync cancelled; staged work discarded");
            (SyncStatus::Cancelled, ChangeSummary::default())
        }
        Ok(Err(err)) => {
            tracing::error!(session = %session.id(), source = %key, error = %err, "sync failed");
            (SyncStatus::Failed, ChangeSummary::default())
        }
        Err(err) => {
            tracing::error!(session = %session.id(), source = %key, error = %err, "sync worker join error");
            (SyncStatus::Failed, ChangeSummary::default())
        }
    };

    session.emit(status, session.progress());
    drop(guard);

    let snapshot = session.snapshot();
    tracing::info!(
        session = %snapshot.id,
        source = %key,
        status = %snapshot.status,
        added = summary.added,
        updated = summary.updated,
        removed = summary.removed,
        duration_ms = started.elapsed().as_millis() as u64,
        "sync session finished",
    );

    SyncOutcome {
        session_id: snapshot.id,
        source: key.to_string(),
        status: snapshot.status,
        progress: snapshot.progress,
        summary,
        duration_ms: started.elapsed().as_millis(),
    }
}
