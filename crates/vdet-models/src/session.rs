//! Stream session lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a stream session.
///
/// `Created → Starting → Running → Stopping → Stopped`, with `Failed` reachable
/// from `Starting` and `Running`. A session stopped before it was ever started
/// goes straight from `Created` to `Stopped`. `Stopped` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }

    /// Whether the session may move from `self` to `next`.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Created, Stopped)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Created,
            1 => SessionState::Starting,
            2 => SessionState::Running,
            3 => SessionState::Stopping,
            4 => SessionState::Stopped,
            _ => SessionState::Failed,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free holder for a [`SessionState`] shared between the controller and
/// its pull thread.
#[derive(Debug, Default)]
pub struct AtomicSessionState(std::sync::atomic::AtomicU8);

impl AtomicSessionState {
    pub fn new(state: SessionState) -> Self {
        Self(std::sync::atomic::AtomicU8::new(state.to_u8()))
    }

    pub fn load(&self) -> SessionState {
        SessionState::from_u8(self.0.load(std::sync::atomic::Ordering::SeqCst))
    }

    /// Move to `next` if the transition is legal from the current state.
    ///
    /// Returns the previous state on success.
    pub fn transition(&self, next: SessionState) -> Result<SessionState, SessionState> {
        let mut current = self.load();
        loop {
            if !current.can_transition_to(next) {
                return Err(current);
            }
            match self.0.compare_exchange(
                current.to_u8(),
                next.to_u8(),
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(current),
                Err(actual) => current = SessionState::from_u8(actual),
            }
        }
    }
}
