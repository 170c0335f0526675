use serde::{Deserialize, Serialize};

/// The orchestrator's current activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    NotInitialized,
    Idle,
    Initializing,
    Building,
    Executing,
}

/// Progress record observers read on every transition.
///
/// Owned by a single [`BuildManager`](crate::orchestrator::BuildManager);
/// observers only ever see it by reference or as a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManagerState {
    pub phase: Phase,
    /// 0–100, only meaningful while initializing.
    pub percent_complete: u8,
    pub message: String,
}

impl BuildManagerState {
    pub fn new() -> Self {
        Self {
            phase: Phase::NotInitialized,
            percent_complete: 0,
            message: String::new(),
        }
    }

    pub(crate) fn enter(&mut self, phase: Phase, message: impl Into<String>) {
        self.phase = phase;
        self.percent_complete = 0;
        self.message = message.into();
    }

    pub(crate) fn progress(&mut self, percent: u8, message: impl Into<String>) {
        self.percent_complete = percent.min(100);
        self.message = message.into();
    }

    /// Terminal transition: `{Idle, 0, ""}`.
    pub(crate) fn reset_to_idle(&mut self) {
        self.enter(Phase::Idle, String::new());
    }

    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }
}

impl Default for BuildManagerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Floor of `index / total * 100`.
pub(crate) fn percent_of(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((index * 100) / total).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_not_initialized() {
        let state = BuildManagerState::new();
        assert_eq!(state.phase, Phase::NotInitialized);
        assert_eq!(state.percent_complete, 0);
        assert!(state.message.is_empty());
    }

    #[test]
    fn reset_clears_progress_and_message() {
        let mut state = BuildManagerState::new();
        state.enter(Phase::Initializing, "Downloading");
        state.progress(42, "core.wasm");
        state.reset_to_idle();
        assert_eq!(state, BuildManagerState {
            phase: Phase::Idle,
            percent_complete: 0,
            message: String::new(),
        });
    }

    #[test]
    fn percent_is_floored() {
        assert_eq!(percent_of(0, 3), 0);
        assert_eq!(percent_of(1, 3), 33);
        assert_eq!(percent_of(2, 3), 66);
        assert_eq!(percent_of(3, 3), 100);
        assert_eq!(percent_of(0, 0), 100);
    }
}
