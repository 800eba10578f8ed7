//! TOML description of a workflow graph, used to seed a store.
//!
//! ```toml
//! name = "tickets"
//! initial = "open"
//!
//! [[states]]
//! code = "open"
//! actions = ["comment"]
//!
//! [[states]]
//! code = "closed"
//!
//! [[tasks]]
//! name = "Noop"
//! class = "statewright.tasks.Noop"
//!
//! [[transitions]]
//! name = "close"
//! from = "open"
//! to = "closed"
//! tasks = ["statewright.tasks.Noop"]
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use super::graph::{Action, State, TaskDefinition, Transition, WorkflowGraph};
use crate::error::{EngineError, Result};
use crate::store::WorkflowStore;
use crate::task::TaskLoader;

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDocument {
    pub name: String,
    #[serde(default)]
    pub initial: Option<String>,
    #[serde(default)]
    pub states: Vec<DocumentState>,
    #[serde(default)]
    pub tasks: Vec<DocumentTask>,
    #[serde(default)]
    pub transitions: Vec<DocumentTransition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentState {
    pub code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentTask {
    pub name: String,
    pub class: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentTransition {
    pub name: String,
    pub from: String,
    pub to: String,
    /// Task identifiers in execution order.
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl WorkflowDocument {
    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Checks the document without touching a store: an initial state is
    /// named and declared, transitions reference declared states and are
    /// unique per (from, to), and every task identifier resolves through
    /// `loader`, including the validation tasks those tasks ask for.
    pub fn validate(&self, loader: &dyn TaskLoader) -> Result<()> {
        let codes: HashSet<&str> = self.states.iter().map(|s| s.code.as_str()).collect();
        let initial = self.initial.as_deref().ok_or_else(|| {
            EngineError::InvalidDocument(format!("{} has no initial state", self.name))
        })?;
        if !codes.contains(initial) {
            return Err(EngineError::StateNotFound(initial.to_string()));
        }

        self.check_transitions(&codes)?;
        for transition in &self.transitions {
            for identifier in &transition.tasks {
                let task = loader.load_task(identifier)?;
                if let Some(validation) = task.validation_class() {
                    loader.load_task(validation)?;
                }
            }
        }
        Ok(())
    }

    /// Every transition joins declared states and no (from, to) pair repeats.
    fn check_transitions(&self, codes: &HashSet<&str>) -> Result<()> {
        let mut seen = HashSet::new();
        for transition in &self.transitions {
            for code in [&transition.from, &transition.to] {
                if !codes.contains(code.as_str()) {
                    return Err(EngineError::StateNotFound(code.clone()));
                }
            }
            if !seen.insert((transition.from.as_str(), transition.to.as_str())) {
                return Err(EngineError::InvalidDocument(format!(
                    "more than one transition from {} to {}",
                    transition.from, transition.to
                )));
            }
        }
        Ok(())
    }

    /// Creates the graph with its states, task definitions, transitions and
    /// ordered task links. Task identifiers used by transitions but missing
    /// from `[[tasks]]` get a definition named after the identifier.
    ///
    /// The document's structure is checked before the first write, so a
    /// rejected document leaves the store untouched.
    pub fn load_into(&self, store: &dyn WorkflowStore) -> Result<WorkflowGraph> {
        let mut states: HashMap<&str, State> = HashMap::new();
        for doc in &self.states {
            let actions = doc.actions.iter().map(Action::new).collect();
            let state = State::new(doc.code.clone(), doc.description.clone()).with_actions(actions);
            states.insert(doc.code.as_str(), state);
        }

        let state_id = |code: &str| {
            states
                .get(code)
                .map(|s| s.id)
                .ok_or_else(|| EngineError::StateNotFound(code.to_string()))
        };

        let initial = match self.initial.as_deref() {
            Some(code) => Some(state_id(code)?),
            None => None,
        };
        let graph = WorkflowGraph::new(self.name.clone(), initial);
        if graph.initial_state.is_none() {
            return Err(EngineError::MissingInitialState(graph.id));
        }
        let codes: HashSet<&str> = states.keys().copied().collect();
        self.check_transitions(&codes)?;

        let mut transitions = Vec::with_capacity(self.transitions.len());
        for doc in &self.transitions {
            let (from, to) = (state_id(&doc.from)?, state_id(&doc.to)?);
            let transition = Transition::new(doc.name.clone(), graph.id, from, to)
                .with_permissions(doc.permissions.clone());
            transitions.push((transition, doc));
        }

        for state in states.values() {
            store.insert_state(state.clone())?;
        }
        store.insert_graph(graph.clone())?;

        let mut definitions = HashMap::new();
        for doc in &self.tasks {
            let definition =
                TaskDefinition::new(doc.name.clone(), doc.class.clone(), doc.description.clone());
            let (definition, _) = store.upsert_task_definition(definition)?;
            definitions.insert(doc.class.clone(), definition.id);
        }

        for (transition, doc) in transitions {
            let transition_id = transition.id;
            store.insert_transition(transition)?;
            for identifier in &doc.tasks {
                let definition_id = match definitions.get(identifier) {
                    Some(id) => *id,
                    None => {
                        let (definition, _) = store.upsert_task_definition(TaskDefinition::new(
                            identifier.clone(),
                            identifier.clone(),
                            "",
                        ))?;
                        definitions.insert(identifier.clone(), definition.id);
                        definition.id
                    }
                };
                store.link_task(transition_id, definition_id)?;
            }
        }

        info!(
            graph = %graph.name,
            states = self.states.len(),
            transitions = self.transitions.len(),
            "workflow loaded"
        );
        Ok(graph)
    }
}
