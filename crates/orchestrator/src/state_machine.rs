use membreak_core::SessionPhase;

use crate::error::{OrchestratorError, Result};

/// Transition table for a single agent session.
pub struct PhaseStateMachine;

impl PhaseStateMachine {
    pub fn validate_transition(from: &SessionPhase, to: &SessionPhase) -> Result<()> {
        if Self::allowed_transitions(from).contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    pub fn allowed_transitions(from: &SessionPhase) -> Vec<SessionPhase> {
        let mut allowed = match Self::next_phase(from) {
            Some(next) => vec![next],
            None => return vec![],
        };
        allowed.extend([
            SessionPhase::Failed,
            SessionPhase::TimedOut,
            SessionPhase::Cancelled,
        ]);
        allowed
    }

    pub fn can_transition(from: &SessionPhase, to: &SessionPhase) -> bool {
        Self::validate_transition(from, to).is_ok()
    }

    /// The next phase on the success path.
    pub fn next_phase(current: &SessionPhase) -> Option<SessionPhase> {
        match current {
            SessionPhase::Init => Some(SessionPhase::PreCompression),
            SessionPhase::PreCompression => Some(SessionPhase::DeepDive),
            SessionPhase::DeepDive => Some(SessionPhase::MemoryOnly),
            SessionPhase::MemoryOnly => Some(SessionPhase::Evaluation),
            SessionPhase::Evaluation => Some(SessionPhase::Done),
            SessionPhase::Done
            | SessionPhase::Failed
            | SessionPhase::TimedOut
            | SessionPhase::Cancelled => None,
        }
    }
}
