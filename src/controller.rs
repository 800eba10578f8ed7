//! Per-subject runtime state: which workflow state a subject is in and
//! whether a transition is currently in flight.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobId;
use crate::workflow::{GraphId, State, StateId};

pub type ControllerId = Uuid;

/// Tagged reference to the business object a controller governs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectRef {
    pub subject_type: String,
    pub subject_id: String,
}

impl SubjectRef {
    pub fn new(subject_type: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            subject_type: subject_type.into(),
            subject_id: subject_id.into(),
        }
    }

    /// Parses `type:id`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (subject_type, subject_id) = raw.split_once(':')?;
        if subject_type.is_empty() || subject_id.is_empty() {
            return None;
        }
        Some(Self::new(subject_type, subject_id))
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject_type, self.subject_id)
    }
}

/// Host-supplied capability to check that a subject exists.
pub trait SubjectLookup: Send + Sync {
    fn exists(&self, subject: &SubjectRef) -> bool;
}

/// Accepts every subject.
pub struct AnySubject;

impl SubjectLookup for AnySubject {
    fn exists(&self, _subject: &SubjectRef) -> bool {
        true
    }
}

/// Concurrency flag guarding "one in-flight transition per subject".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InnerState {
    Idle,
    Running,
}

impl fmt::Display for InnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InnerState::Idle => write!(f, "idle"),
            InnerState::Running => write!(f, "running"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateController {
    pub id: ControllerId,
    pub subject: SubjectRef,
    pub graph_id: GraphId,
    pub current_state: StateId,
    pub inner_state: InnerState,
    /// Job currently driving this controller, if any.
    pub job_id: Option<JobId>,
}

impl StateController {
    pub fn new(subject: SubjectRef, graph_id: GraphId, initial_state: StateId) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject,
            graph_id,
            current_state: initial_state,
            inner_state: InnerState::Idle,
            job_id: None,
        }
    }

    /// A transition may only be requested while no other one is in flight.
    /// Whether `next` is reachable from the current state is decided when the
    /// runner resolves the transition.
    pub fn can_change_to(&self, _next: &State) -> bool {
        self.inner_state == InnerState::Idle
    }

    pub fn is_running(&self) -> bool {
        self.inner_state == InnerState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> StateController {
        StateController::new(SubjectRef::new("ticket", "1"), Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn new_controller_is_idle() {
        let c = controller();
        assert_eq!(c.inner_state, InnerState::Idle);
        assert!(c.job_id.is_none());
        assert!(c.can_change_to(&State::new("next", "")));
    }

    #[test]
    fn running_controller_refuses_every_target() {
        let mut c = controller();
        c.inner_state = InnerState::Running;
        for code in ["a", "b", "c"] {
            assert!(!c.can_change_to(&State::new(code, "")));
        }
    }

    #[test]
    fn subject_ref_parse() {
        let s = SubjectRef::parse("ticket:42").unwrap();
        assert_eq!(s, SubjectRef::new("ticket", "42"));
        assert_eq!(s.to_string(), "ticket:42");
        assert!(SubjectRef::parse("ticket").is_none());
        assert!(SubjectRef::parse(":42").is_none());
    }

    #[test]
    fn inner_state_serializes_lowercase() {
        let json = serde_json::to_string(&InnerState::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
