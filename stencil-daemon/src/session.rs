//! One in-flight synchronization attempt.
//!
//! [`SessionHandle::emit`] is the only way a session's status changes, and it
//! publishes while holding the session lock, so events leave in the order the
//! state changed even when the blocking writer thread and the async driver
//! both report.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use stencil_core::{ProgressEvent, SourceKey, SyncStatus};

use crate::progress::ProgressChannel;

#[derive(Debug, Clone)]
pub struct SyncSession {
    pub id: Uuid,
    pub source: SourceKey,
    pub status: SyncStatus,
    pub progress: u8,
    pub started_at: DateTime<Utc>,
}

impl SyncSession {
    fn new(source: SourceKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            status: SyncStatus::Validating,
            progress: 0,
            started_at: Utc::now(),
        }
    }
}

/// Read-only view for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub source: String,
    pub status: SyncStatus,
    pub progress: u8,
    pub started_at: DateTime<Utc>,
}

/// Shared handle to a session and the channel it reports to.
#[derive(Clone)]
pub struct SessionHandle {
    state: Arc<Mutex<SyncSession>>,
    channel: ProgressChannel,
}

impl SessionHandle {
    pub fn new(source: SourceKey, channel: ProgressChannel) -> Self {
        Self {
            state: Arc::new(Mutex::new(SyncSession::new(source))),
            channel,
        }
    }

    pub fn id(&self) -> Uuid {
        self.state.lock().id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            id: state.id,
            source: state.source.to_string(),
            status: state.status,
            progress: state.progress,
            started_at: state.started_at,
        }
    }

    pub fn progress(&self) -> u8 {
        self.state.lock().progress
    }

    /// Move to `status` and broadcast the resulting event.
    ///
    /// Progress never decreases, `Updated`/`UpdateNotRequired` always report
    /// 100, and nothing is published after a terminal event. Repeats of the
    /// current `(status, progress)` are swallowed. Returns the event that was
    /// published, if any.
    pub fn emit(&self, status: SyncStatus, progress: u8) -> Option<ProgressEvent> {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            tracing::debug!(
                session = %state.id,
                ignored = %status,
                "session already terminal",
            );
            return None;
        }

        let progress = if status.completes_progress() {
            100
        } else {
            progress.min(100).max(state.progress)
        };
        if state.status == status && state.progress == progress {
            return None;
        }

        state.status = status;
        state.progress = progress;
        let event = ProgressEvent::new(status, progress);
        let delivered = self.channel.publish(&state.source, event);
        tracing::debug!(
            session = %state.id,
            status = %status,
            progress,
            delivered,
            "progress published",
        );
        Some(event)
    }
}
