use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type StateId = Uuid;
pub type GraphId = Uuid;
pub type TransitionId = Uuid;
pub type TaskDefinitionId = Uuid;

/// Opaque capability tag exposed to callers while a subject sits in a state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    pub name: String,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub id: StateId,
    pub code: String,
    pub description: String,
    pub actions: Vec<Action>,
}

impl State {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.into(),
            description: description.into(),
            actions: Vec::new(),
        }
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }

    pub fn allows(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a.name == action)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)
    }
}

/// A named workflow definition. Transitions live in the store keyed by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub id: GraphId,
    pub name: String,
    pub initial_state: Option<StateId>,
}

impl WorkflowGraph {
    pub fn new(name: impl Into<String>, initial_state: Option<StateId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            initial_state,
        }
    }
}

/// Anything that can be asked whether it holds a set of permissions.
pub trait Actor {
    fn has_perms(&self, perms: &[String]) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub id: TransitionId,
    pub name: String,
    pub graph_id: GraphId,
    pub from_state: StateId,
    pub to_state: StateId,
    /// Permission codenames; empty means anyone may take the transition.
    pub permissions: Vec<String>,
}

impl Transition {
    pub fn new(name: impl Into<String>, graph_id: GraphId, from: StateId, to: StateId) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            graph_id,
            from_state: from,
            to_state: to,
            permissions: Vec::new(),
        }
    }

    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self
    }

    /// Whether `actor` may execute this transition.
    pub fn is_available(&self, actor: &dyn Actor) -> bool {
        self.permissions.is_empty() || actor.has_perms(&self.permissions)
    }
}

/// A catalogued task implementation, referenced by transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: TaskDefinitionId,
    pub name: String,
    /// Registry identifier, e.g. `statewright.tasks.Noop`.
    pub identifier: String,
    pub description: String,
}

impl TaskDefinition {
    pub fn new(
        name: impl Into<String>,
        identifier: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            identifier: identifier.into(),
            description: description.into(),
        }
    }
}

/// Ordered link between a transition and a task definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionTask {
    pub transition_id: TransitionId,
    pub task_definition_id: TaskDefinitionId,
    pub order: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct User(Vec<&'static str>);

    impl Actor for User {
        fn has_perms(&self, perms: &[String]) -> bool {
            perms.iter().all(|p| self.0.contains(&p.as_str()))
        }
    }

    #[test]
    fn transition_without_permissions_is_open() {
        let t = Transition::new("open", Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(t.is_available(&User(vec![])));
    }

    #[test]
    fn transition_requires_every_permission() {
        let t = Transition::new("approve", Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
            .with_permissions(vec!["tickets.approve".into(), "tickets.view".into()]);

        assert!(t.is_available(&User(vec!["tickets.approve", "tickets.view"])));
        assert!(!t.is_available(&User(vec!["tickets.approve"])));
    }

    #[test]
    fn state_actions() {
        let state = State::new("open", "Open ticket")
            .with_actions(vec![Action::new("comment"), Action::new("assign")]);
        assert!(state.allows("comment"));
        assert!(!state.allows("close"));
        assert_eq!(state.to_string(), "open");
    }
}
