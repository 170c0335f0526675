use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::state::BuildManagerState;

/// Receives every state transition, in order.
///
/// The orchestrator awaits each notification before starting the next phase,
/// so a slow observer delays the build rather than seeing transitions out of
/// order.
pub trait StateObserver: Send + Sync {
    fn on_state_changed<'a>(
        &'a self,
        state: &'a BuildManagerState,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

pub struct NoopObserver;

impl StateObserver for NoopObserver {
    fn on_state_changed<'a>(
        &'a self,
        _state: &'a BuildManagerState,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }
}

/// Emits transitions as structured log events.
pub struct TracingObserver;

impl StateObserver for TracingObserver {
    fn on_state_changed<'a>(
        &'a self,
        state: &'a BuildManagerState,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            tracing::info!(
                phase = ?state.phase,
                percent = state.percent_complete,
                message = %state.message,
                "Build manager state changed"
            );
        })
    }
}

/// Keeps a snapshot of every notification.
#[derive(Default)]
pub struct RecordingObserver {
    seen: Mutex<Vec<BuildManagerState>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<BuildManagerState> {
        self.seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Drain and return the recorded snapshots.
    pub fn take(&self) -> Vec<BuildManagerState> {
        std::mem::take(
            &mut *self
                .seen
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }
}

impl StateObserver for RecordingObserver {
    fn on_state_changed<'a>(
        &'a self,
        state: &'a BuildManagerState,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.seen
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(state.clone());
        })
    }
}

/// Forwards snapshots to a channel, e.g. a UI task. A closed receiver is
/// ignored.
impl StateObserver for mpsc::UnboundedSender<BuildManagerState> {
    fn on_state_changed<'a>(
        &'a self,
        state: &'a BuildManagerState,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if self.send(state.clone()).is_err() {
                tracing::debug!("State observer channel closed");
            }
        })
    }
}
