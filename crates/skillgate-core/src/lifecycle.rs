//! The lifecycle state machine: which edges exist and what each one needs.
//!
//! ```text
//! prototype --promote--> staged --promote--> production
//! prototype <--demote--- staged <--rollback-- production
//! any non-retired state --retire--> retired (terminal)
//! ```

use skillgate_state::{LifecycleEvent, LifecycleEventKind, LifecycleLog, LifecycleState};
use tracing::error;

use crate::domain::{Result, SkillError};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Promote,
    Demote,
    Rollback,
    Retire,
}

impl TransitionKind {
    /// Automatic, safety-first edges never wait on a human.
    pub fn requires_approval(self) -> bool {
        matches!(self, TransitionKind::Promote | TransitionKind::Retire)
    }

    pub fn event_kind(self) -> LifecycleEventKind {
        match self {
            TransitionKind::Promote => LifecycleEventKind::Promotion,
            TransitionKind::Demote => LifecycleEventKind::Demotion,
            TransitionKind::Rollback => LifecycleEventKind::Rollback,
            TransitionKind::Retire => LifecycleEventKind::Retirement,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransitionKind::Promote => "promote",
            TransitionKind::Demote => "demote",
            TransitionKind::Rollback => "rollback",
            TransitionKind::Retire => "retire",
        }
    }
}

/// The edge from `from` to `to`, if one exists.
pub fn classify(from: LifecycleState, to: LifecycleState) -> Option<TransitionKind> {
    use LifecycleState::*;
    match (from, to) {
        (Prototype, Staged) | (Staged, Production) => Some(TransitionKind::Promote),
        (Staged, Prototype) => Some(TransitionKind::Demote),
        (Production, Staged) => Some(TransitionKind::Rollback),
        (Prototype | Staged | Production, Retired) => Some(TransitionKind::Retire),
        _ => None,
    }
}

/// Like [`classify`], as an `InvalidTransition` error when no edge exists.
pub fn check_transition(
    skill_id: &str,
    from: LifecycleState,
    to: LifecycleState,
) -> Result<TransitionKind> {
    classify(from, to).ok_or_else(|| SkillError::InvalidTransition {
        skill_id: skill_id.to_string(),
        from,
        to,
    })
}

/// Target of a promotion from `state`.
pub fn promotion_target(state: LifecycleState) -> Option<LifecycleState> {
    match state {
        LifecycleState::Prototype => Some(LifecycleState::Staged),
        LifecycleState::Staged => Some(LifecycleState::Production),
        _ => None,
    }
}

/// Where an automatic or manual step back from `state` lands.
pub fn fallback_target(state: LifecycleState) -> Option<LifecycleState> {
    match state {
        LifecycleState::Production => Some(LifecycleState::Staged),
        LifecycleState::Staged => Some(LifecycleState::Prototype),
        _ => None,
    }
}

/// Append an audit event after the registry change it describes has
/// committed. The change cannot be undone at this point, so a failed append
/// is logged rather than returned.
pub(crate) async fn record_event(
    log: &dyn LifecycleLog,
    retry: &RetryPolicy,
    event: &LifecycleEvent,
) {
    let appended = retry
        .without_timeout()
        .run("history_append", || log.append(event))
        .await;
    if let Err(e) = appended {
        error!(
            skill_id = %event.skill_id,
            kind = ?event.kind,
            to = %event.to,
            error = %e,
            "lifecycle event could not be recorded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn prototype_never_jumps_to_production() {
        assert!(classify(Prototype, Production).is_none());
        assert!(check_transition("s", Prototype, Production).is_err());
    }

    #[test]
    fn retired_is_terminal() {
        for to in LifecycleState::ALL {
            assert!(classify(Retired, to).is_none(), "retired -> {to}");
        }
    }

    #[test]
    fn every_live_state_can_retire() {
        for from in [Prototype, Staged, Production] {
            assert_eq!(classify(from, Retired), Some(TransitionKind::Retire));
        }
    }

    #[test]
    fn self_loops_are_not_edges() {
        for s in LifecycleState::ALL {
            assert!(classify(s, s).is_none());
        }
    }

    #[test]
    fn only_backward_edges_bypass_approval() {
        assert!(TransitionKind::Promote.requires_approval());
        assert!(TransitionKind::Retire.requires_approval());
        assert!(!TransitionKind::Rollback.requires_approval());
        assert!(!TransitionKind::Demote.requires_approval());
    }

    #[test]
    fn targets_follow_edges() {
        for s in [Prototype, Staged] {
            let to = promotion_target(s).unwrap();
            assert_eq!(classify(s, to), Some(TransitionKind::Promote));
        }
        for s in [Production, Staged] {
            let to = fallback_target(s).unwrap();
            assert!(!classify(s, to).unwrap().requires_approval());
        }
        assert!(promotion_target(Production).is_none());
        assert!(fallback_target(Prototype).is_none());
    }
}
