//! Round state machine
//!
//! Phases and the pure transition function driving the controller. The
//! controller does the I/O; this module only decides what comes next.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    Idle,
    AwaitingRoundBoundary,
    Fetching,
    Aggregating,
    Submitting,
    Confirming,
    Reconfiguring,
}

impl RoundPhase {
    pub fn name(&self) -> &'static str {
        match self {
            RoundPhase::Idle => "idle",
            RoundPhase::AwaitingRoundBoundary => "awaiting_round_boundary",
            RoundPhase::Fetching => "fetching",
            RoundPhase::Aggregating => "aggregating",
            RoundPhase::Submitting => "submitting",
            RoundPhase::Confirming => "confirming",
            RoundPhase::Reconfiguring => "reconfiguring",
        }
    }
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// What happened in the current phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Startup finished
    Ready,
    BoundaryReached,
    /// Symbol set, committee or precision changed on-chain
    ChangeDetected,
    FetchFinished,
    /// `reportable` is false when nothing should be submitted this round
    Aggregated { reportable: bool },
    /// A transaction is out and worth confirming
    Submitted,
    /// Rejected, abandoned or skipped
    SubmissionEnded,
    ConfirmationFinished,
    Reconfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("No transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: RoundPhase,
    pub event: PhaseEvent,
}

/// Next phase for `event` observed in `from`
pub fn transition(from: RoundPhase, event: PhaseEvent) -> Result<RoundPhase, InvalidTransition> {
    use PhaseEvent::*;
    use RoundPhase::*;

    let next = match (from, event) {
        (Idle, Ready) => AwaitingRoundBoundary,
        (AwaitingRoundBoundary, BoundaryReached) => Fetching,
        (AwaitingRoundBoundary, ChangeDetected) => Reconfiguring,
        (Reconfiguring, Reconfigured) => AwaitingRoundBoundary,
        (Fetching, FetchFinished) => Aggregating,
        (Aggregating, Aggregated { reportable: true }) => Submitting,
        (Aggregating, Aggregated { reportable: false }) => Idle,
        (Submitting, Submitted) => Confirming,
        (Submitting, SubmissionEnded) => Idle,
        (Confirming, ConfirmationFinished) => Idle,
        _ => return Err(InvalidTransition { from, event }),
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_cycle() {
        let events = [
            PhaseEvent::Ready,
            PhaseEvent::BoundaryReached,
            PhaseEvent::FetchFinished,
            PhaseEvent::Aggregated { reportable: true },
            PhaseEvent::Submitted,
            PhaseEvent::ConfirmationFinished,
        ];
        let mut phase = RoundPhase::Idle;
        let mut visited = vec![phase];
        for event in events {
            phase = transition(phase, event).unwrap();
            visited.push(phase);
        }

        assert_eq!(
            visited,
            vec![
                RoundPhase::Idle,
                RoundPhase::AwaitingRoundBoundary,
                RoundPhase::Fetching,
                RoundPhase::Aggregating,
                RoundPhase::Submitting,
                RoundPhase::Confirming,
                RoundPhase::Idle,
            ]
        );
    }

    #[test]
    fn test_reconfiguring_returns_to_waiting() {
        let phase = transition(RoundPhase::AwaitingRoundBoundary, PhaseEvent::ChangeDetected).unwrap();
        assert_eq!(phase, RoundPhase::Reconfiguring);
        assert_eq!(
            transition(phase, PhaseEvent::Reconfigured).unwrap(),
            RoundPhase::AwaitingRoundBoundary
        );
    }

    #[test]
    fn test_fetching_needs_a_boundary() {
        let err = transition(RoundPhase::Reconfiguring, PhaseEvent::BoundaryReached).unwrap_err();
        assert_eq!(err.from, RoundPhase::Reconfiguring);
        assert!(transition(RoundPhase::Idle, PhaseEvent::FetchFinished).is_err());
        assert!(transition(RoundPhase::Confirming, PhaseEvent::ChangeDetected).is_err());
    }

    #[test]
    fn test_nothing_to_report_skips_submission() {
        assert_eq!(
            transition(RoundPhase::Aggregating, PhaseEvent::Aggregated { reportable: false }).unwrap(),
            RoundPhase::Idle
        );
        assert_eq!(
            transition(RoundPhase::Submitting, PhaseEvent::SubmissionEnded).unwrap(),
            RoundPhase::Idle
        );
    }
}
