//! Session state and its transition function
//!
//! The controller actor is the only caller of [`SessionState::apply`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Finalizing,
    Stopped,
    Failed(ErrorKind),
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed(_))
    }

    /// Next state for `event`, or `None` when the event does not apply here
    pub fn apply(self, event: Transition) -> Option<SessionState> {
        use SessionState::*;
        use Transition as T;

        if self.is_terminal() {
            return None;
        }
        let next = match (self, event) {
            (Idle, T::Start) => Connecting,

            (Connecting, T::Connected) => Streaming,
            (Reconnecting, T::Connected) => Streaming,

            (Connecting, T::TransportLost) => Connecting,
            (Streaming | Reconnecting, T::TransportLost) => Reconnecting,

            (Connecting | Reconnecting | Streaming, T::GaveUp(kind)) => Failed(kind),

            (Connecting | Streaming | Reconnecting, T::StopRequested) => Finalizing,
            (Finalizing, T::FlushDone) => Stopped,

            (Idle, T::StorageLost) => return None,
            (_, T::StorageLost) => Finalizing,

            (_, T::Fatal(kind)) => Failed(kind),

            _ => return None,
        };
        Some(next)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::Streaming => f.write_str("streaming"),
            SessionState::Reconnecting => f.write_str("reconnecting"),
            SessionState::Finalizing => f.write_str("finalizing"),
            SessionState::Stopped => f.write_str("stopped"),
            SessionState::Failed(kind) => write!(f, "failed ({})", kind),
        }
    }
}

/// Events the controller feeds into the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    /// A transport session opened (first connect or reconnect)
    Connected,
    TransportLost,
    /// Reconnect attempts exhausted
    GaveUp(ErrorKind),
    StopRequested,
    FlushDone,
    /// The storage grant became invalid
    StorageLost,
    /// Unrecoverable: bad configuration or write retries exhausted
    Fatal(ErrorKind),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;
    use SessionState::*;

    #[test]
    fn test_happy_path() {
        let s = Idle.apply(Transition::Start).unwrap();
        assert_eq!(s, Connecting);
        let s = s.apply(Transition::Connected).unwrap();
        assert_eq!(s, Streaming);
        let s = s.apply(Transition::TransportLost).unwrap();
        assert_eq!(s, Reconnecting);
        let s = s.apply(Transition::Connected).unwrap();
        assert_eq!(s, Streaming);
        let s = s.apply(Transition::StopRequested).unwrap();
        assert_eq!(s, Finalizing);
        assert_eq!(s.apply(Transition::FlushDone), Some(Stopped));
    }

    #[test]
    fn test_connecting_errors_stay_connecting() {
        assert_eq!(Connecting.apply(Transition::TransportLost), Some(Connecting));
        let refused = ErrorKind::Transport(TransportErrorKind::Refused);
        assert_eq!(Connecting.apply(Transition::GaveUp(refused)), Some(Failed(refused)));
    }

    #[test]
    fn test_storage_loss_finalizes_from_any_live_state() {
        for s in [Connecting, Streaming, Reconnecting, Finalizing] {
            assert_eq!(s.apply(Transition::StorageLost), Some(Finalizing));
        }
    }

    #[test]
    fn test_terminal_states_absorb_events() {
        assert_eq!(Stopped.apply(Transition::Start), None);
        assert_eq!(Failed(ErrorKind::Io).apply(Transition::FlushDone), None);
    }

    #[test]
    fn test_inapplicable_events_are_ignored() {
        assert_eq!(Idle.apply(Transition::Connected), None);
        assert_eq!(Streaming.apply(Transition::FlushDone), None);
        assert_eq!(Finalizing.apply(Transition::StopRequested), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Failed(ErrorKind::Permission).to_string(), "failed (permission)");
        assert_eq!(Reconnecting.to_string(), "reconnecting");
    }
}
