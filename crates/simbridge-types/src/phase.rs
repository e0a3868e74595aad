use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Phase of the simulation run as seen by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RunPhase {
    /// No run is active; waiting for the engine to announce a start.
    #[default]
    AwaitingStart,
    /// A run is in progress and snapshots are being processed.
    Running,
    /// The engine reported the end of the run; update hand-off pending.
    Ended,
}

/// Events that drive run phase transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunEvent {
    /// The engine announced a new run.
    Start,
    /// A snapshot was received.
    Step,
    /// The engine announced the end of the run.
    End,
    /// The engine was restarted after the end of a run.
    Restarted,
    /// A snapshot arrived without a preceding start, e.g. after this process restarted mid-run.
    Resume,
}

impl RunPhase {
    pub fn transition(self, event: RunEvent) -> Result<RunPhase> {
        match (self, event) {
            // From AwaitingStart
            (RunPhase::AwaitingStart, RunEvent::Start) => Ok(RunPhase::Running),
            (RunPhase::AwaitingStart, RunEvent::Resume) => Ok(RunPhase::Running),
            // End of a run this process restarted into before its next snapshot.
            (RunPhase::AwaitingStart, RunEvent::End) => Ok(RunPhase::Ended),

            // From Running
            (RunPhase::Running, RunEvent::Step) => Ok(RunPhase::Running),
            (RunPhase::Running, RunEvent::Start) => Ok(RunPhase::Running),
            (RunPhase::Running, RunEvent::End) => Ok(RunPhase::Ended),

            // From Ended
            (RunPhase::Ended, RunEvent::Restarted) => Ok(RunPhase::AwaitingStart),
            (RunPhase::Ended, RunEvent::Start) => Ok(RunPhase::Running),

            (phase, event) => Err(BridgeError::InvalidTransition { from: phase, event }),
        }
    }

    /// Whether snapshots should be scored and forwarded in this phase.
    pub fn accepts_snapshots(&self) -> bool {
        matches!(self, RunPhase::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_run_cycle() {
        let phase = RunPhase::default();
        assert_eq!(phase, RunPhase::AwaitingStart);

        let phase = phase.transition(RunEvent::Start).unwrap();
        assert_eq!(phase, RunPhase::Running);
        let phase = phase.transition(RunEvent::Step).unwrap();
        assert_eq!(phase, RunPhase::Running);
        let phase = phase.transition(RunEvent::End).unwrap();
        assert_eq!(phase, RunPhase::Ended);
        let phase = phase.transition(RunEvent::Restarted).unwrap();
        assert_eq!(phase, RunPhase::AwaitingStart);
    }

    #[test]
    fn test_restart_without_end() {
        let phase = RunPhase::Running.transition(RunEvent::Start).unwrap();
        assert_eq!(phase, RunPhase::Running);
    }

    #[test]
    fn test_resume_from_checkpoint() {
        let phase = RunPhase::AwaitingStart.transition(RunEvent::Resume).unwrap();
        assert!(phase.accepts_snapshots());
    }

    #[test]
    fn test_end_before_first_snapshot() {
        let phase = RunPhase::AwaitingStart.transition(RunEvent::End).unwrap();
        assert_eq!(phase, RunPhase::Ended);
        assert_eq!(phase.transition(RunEvent::Restarted).unwrap(), RunPhase::AwaitingStart);
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(RunPhase::AwaitingStart.transition(RunEvent::Step).is_err());
        assert!(RunPhase::Ended.transition(RunEvent::Step).is_err());
        assert!(RunPhase::Ended.transition(RunEvent::End).is_err());
        assert!(RunPhase::Running.transition(RunEvent::Restarted).is_err());

        match RunPhase::Ended.transition(RunEvent::Step) {
            Err(BridgeError::InvalidTransition { from, event }) => {
                assert_eq!(from, RunPhase::Ended);
                assert_eq!(event, RunEvent::Step);
            }
            other => panic!("expected invalid transition, got {other:?}"),
        }
    }
}
