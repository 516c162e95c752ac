use std::fmt;

/// Lifecycle of an [`IsolationSupervisor`](super::IsolationSupervisor).
///
/// ```text
/// NotStarted -> Starting -> Running -> GracefulExit
///                  ^           |
///                  |           v
///           RestartAttempt <- Crashed -> Terminal
///
/// any -> Disposed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorState {
    NotStarted,
    Starting,
    Running,
    GracefulExit,
    Crashed,
    RestartAttempt,
    /// No further restarts happen.
    Terminal,
    Disposed,
}

impl SupervisorState {
    /// True once the supervisor will not start another host.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            SupervisorState::GracefulExit | SupervisorState::Terminal | SupervisorState::Disposed
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SupervisorState) -> bool {
        use SupervisorState::*;

        match (self, next) {
            (_, Disposed) => true,
            (Disposed, _) => false,
            (NotStarted, Starting)
            | (Starting, Running)
            | (Starting, Crashed)
            | (Starting, Terminal)
            | (Running, GracefulExit)
            | (Running, Crashed)
            | (Crashed, RestartAttempt)
            | (Crashed, Terminal)
            | (RestartAttempt, Starting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::NotStarted => "not_started",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::GracefulExit => "graceful_exit",
            SupervisorState::Crashed => "crashed",
            SupervisorState::RestartAttempt => "restart_attempt",
            SupervisorState::Terminal => "terminal",
            SupervisorState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::SupervisorState::*;

    #[test]
    fn test_restart_cycle_is_legal() {
        let cycle = [NotStarted, Starting, Running, Crashed, RestartAttempt, Starting, Running];
        for pair in cycle.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!NotStarted.can_transition_to(Running));
        assert!(!GracefulExit.can_transition_to(Starting));
        assert!(!Terminal.can_transition_to(RestartAttempt));
        assert!(!Disposed.can_transition_to(Starting));
        assert!(Running.can_transition_to(Disposed));
    }

    #[test]
    fn test_final_states() {
        assert!(Terminal.is_final());
        assert!(GracefulExit.is_final());
        assert!(!Crashed.is_final());
        assert!(!Running.is_final());
    }
}
