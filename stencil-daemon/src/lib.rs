//! Sync sessions, progress broadcast and the reference socket host.
//!
//! [`SyncOrchestrator`] is the entry point: it validates a path, serializes
//! sessions per source and drives each one on its own task, publishing every
//! state change through the [`ProgressChannel`]. The `runtime` and `protocol`
//! modules expose it over a Unix socket.

mod error;
pub mod orchestrator;
pub mod paths;
pub mod progress;
pub mod protocol;
mod runtime;
pub mod session;

pub use error::{DaemonError, InvocationError, InvocationErrorKind};
pub use orchestrator::{SyncOrchestrator, SyncOutcome};
pub use progress::{ProgressChannel, Subscription, SubscriptionId};
pub use protocol::{
    request_status, request_stop, request_sync, send_request, DaemonRequest, DaemonResponse,
    ProgressMessage,
};
pub use runtime::{init_tracing, run, serve, start_blocking};
pub use session::{SessionHandle, SessionSnapshot, SyncSession};
