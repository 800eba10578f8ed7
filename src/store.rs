//! Persistence boundary.
//!
//! [`WorkflowStore`] is everything the engine needs from storage: lookups by
//! key, explicit collection queries and a few conditional updates on the
//! controller row. [`InMemoryStore`] implements it over `RwLock`ed tables and
//! backs the CLI and the tests.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::controller::{ControllerId, InnerState, StateController, SubjectRef};
use crate::error::{EngineError, Result};
use crate::history::{StateSnapshot, TransitionLog};
use crate::job::JobId;
use crate::workflow::{
    GraphId, State, StateId, TaskDefinition, TaskDefinitionId, Transition, TransitionId,
    TransitionTask, WorkflowGraph,
};

/// Storage used by the engine, the runner and the history subscribers.
///
/// Lookups return `Ok(None)` for a missing row. `Err` is reserved for the
/// backend itself failing.
pub trait WorkflowStore: Send + Sync {
    // --- definitions ---

    /// Inserts or replaces a state, keyed by its id.
    fn insert_state(&self, state: State) -> Result<()>;
    fn state(&self, id: StateId) -> Result<Option<State>>;
    /// First state whose code matches.
    fn state_by_code(&self, code: &str) -> Result<Option<State>>;

    /// Inserts or replaces a graph, keyed by its id.
    fn insert_graph(&self, graph: WorkflowGraph) -> Result<()>;
    fn graph(&self, id: GraphId) -> Result<Option<WorkflowGraph>>;
    fn graph_by_name(&self, name: &str) -> Result<Option<WorkflowGraph>>;

    /// Fails with [`EngineError::DuplicateTransition`] when (graph, from, to)
    /// is already taken.
    fn insert_transition(&self, transition: Transition) -> Result<()>;
    /// Transitions of `graph` leaving `from`, in insertion order.
    fn transitions_from(&self, graph: GraphId, from: StateId) -> Result<Vec<Transition>>;
    /// Transitions of `graph` joining `from` to `to`. More than one only on
    /// a backend without the uniqueness constraint.
    fn transitions_between(
        &self,
        graph: GraphId,
        from: StateId,
        to: StateId,
    ) -> Result<Vec<Transition>>;

    /// Inserts without checking the identifier. Prefer
    /// [`WorkflowStore::upsert_task_definition`].
    fn insert_task_definition(&self, definition: TaskDefinition) -> Result<()>;
    fn task_definitions(&self) -> Result<Vec<TaskDefinition>>;
    /// Get-or-create keyed by identifier. Returns the stored row and whether
    /// it was created.
    fn upsert_task_definition(&self, definition: TaskDefinition) -> Result<(TaskDefinition, bool)>;
    /// Removes the definition and every transition link pointing at it.
    /// Returns `false` when no definition had that identifier.
    fn delete_task_definition(&self, identifier: &str) -> Result<bool>;

    /// Appends `task` to the end of the transition's ordered task list.
    fn link_task(&self, transition: TransitionId, task: TaskDefinitionId) -> Result<TransitionTask>;
    /// Links of `transition`, sorted by order.
    fn task_links(&self, transition: TransitionId) -> Result<Vec<TransitionTask>>;
    /// Task definitions attached to `transition`, in stored order.
    fn transition_tasks(&self, transition: TransitionId) -> Result<Vec<TaskDefinition>>;

    // --- controllers ---

    /// Fails with [`EngineError::AlreadyInitialized`] when the subject
    /// already has a controller.
    fn create_controller(&self, controller: StateController) -> Result<()>;
    fn controller(&self, id: ControllerId) -> Result<Option<StateController>>;
    /// The controller attached to `subject`, if any.
    fn controller_for(&self, subject: &SubjectRef) -> Result<Option<StateController>>;

    /// Idle -> Running with `job` as the in-flight job, in one step. Returns
    /// `false` and changes nothing if the controller is not idle.
    fn try_begin_run(&self, id: ControllerId, job: JobId) -> Result<bool>;
    /// Running -> Idle and clears the job id, but only while `job` is still
    /// the controller's in-flight job.
    fn finish_run(&self, id: ControllerId, job: JobId) -> Result<bool>;
    /// Moves the controller to `next`, flips it to Idle and clears the job id,
    /// but only while `job` is still the controller's in-flight job. Returns
    /// the updated controller, or `None` and changes nothing for a stale job.
    fn commit_transition(
        &self,
        id: ControllerId,
        job: JobId,
        next: StateId,
    ) -> Result<Option<StateController>>;

    // --- history ---

    fn append_log(&self, log: TransitionLog) -> Result<()>;
    /// Newest first.
    fn transition_logs(&self, controller: ControllerId) -> Result<Vec<TransitionLog>>;
    fn append_snapshot(&self, snapshot: StateSnapshot) -> Result<()>;
    /// Most recent snapshot recorded for `controller` while in `state`.
    fn latest_snapshot(
        &self,
        controller: ControllerId,
        state: StateId,
    ) -> Result<Option<StateSnapshot>>;
    /// Newest first.
    fn snapshots(&self, controller: ControllerId) -> Result<Vec<StateSnapshot>>;
}

#[derive(Default)]
struct Tables {
    states: HashMap<StateId, State>,
    graphs: HashMap<GraphId, WorkflowGraph>,
    transitions: Vec<Transition>,
    task_definitions: Vec<TaskDefinition>,
    task_links: Vec<TransitionTask>,
    controllers: HashMap<ControllerId, StateController>,
    subjects: HashMap<SubjectRef, ControllerId>,
    logs: Vec<TransitionLog>,
    snapshots: Vec<StateSnapshot>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    allow_duplicate_transitions: bool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skips the (graph, from, to) uniqueness check, like a backend without
    /// the constraint. Lets callers exercise ambiguous-transition handling.
    pub fn allow_duplicate_transitions(mut self) -> Self {
        self.allow_duplicate_transitions = true;
        self
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| EngineError::Storage("store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| EngineError::Storage("store lock poisoned".into()))
    }
}

impl WorkflowStore for InMemoryStore {
    fn insert_state(&self, state: State) -> Result<()> {
        self.write()?.states.insert(state.id, state);
        Ok(())
    }

    fn state(&self, id: StateId) -> Result<Option<State>> {
        Ok(self.read()?.states.get(&id).cloned())
    }

    fn state_by_code(&self, code: &str) -> Result<Option<State>> {
        Ok(self.read()?.states.values().find(|s| s.code == code).cloned())
    }

    fn insert_graph(&self, graph: WorkflowGraph) -> Result<()> {
        self.write()?.graphs.insert(graph.id, graph);
        Ok(())
    }

    fn graph(&self, id: GraphId) -> Result<Option<WorkflowGraph>> {
        Ok(self.read()?.graphs.get(&id).cloned())
    }

    fn graph_by_name(&self, name: &str) -> Result<Option<WorkflowGraph>> {
        Ok(self.read()?.graphs.values().find(|g| g.name == name).cloned())
    }

    fn insert_transition(&self, transition: Transition) -> Result<()> {
        let mut tables = self.write()?;
        let taken = tables.transitions.iter().any(|t| {
            t.graph_id == transition.graph_id
                && t.from_state == transition.from_state
                && t.to_state == transition.to_state
        });
        if taken && !self.allow_duplicate_transitions {
            return Err(EngineError::DuplicateTransition {
                graph: transition.graph_id,
                from: transition.from_state,
                to: transition.to_state,
            });
        }
        tables.transitions.push(transition);
        Ok(())
    }

    fn transitions_from(&self, graph: GraphId, from: StateId) -> Result<Vec<Transition>> {
        Ok(self
            .read()?
            .transitions
            .iter()
            .filter(|t| t.graph_id == graph && t.from_state == from)
            .cloned()
            .collect())
    }

    fn transitions_between(
        &self,
        graph: GraphId,
        from: StateId,
        to: StateId,
    ) -> Result<Vec<Transition>> {
        Ok(self
            .read()?
            .transitions
            .iter()
            .filter(|t| t.graph_id == graph && t.from_state == from && t.to_state == to)
            .cloned()
            .collect())
    }

    fn insert_task_definition(&self, definition: TaskDefinition) -> Result<()> {
        self.write()?.task_definitions.push(definition);
        Ok(())
    }

    fn task_definitions(&self) -> Result<Vec<TaskDefinition>> {
        Ok(self.read()?.task_definitions.clone())
    }

    fn upsert_task_definition(&self, definition: TaskDefinition) -> Result<(TaskDefinition, bool)> {
        let mut tables = self.write()?;
        if let Some(existing) = tables
            .task_definitions
            .iter()
            .find(|d| d.identifier == definition.identifier)
        {
            return Ok((existing.clone(), false));
        }
        tables.task_definitions.push(definition.clone());
        Ok((definition, true))
    }

    fn delete_task_definition(&self, identifier: &str) -> Result<bool> {
        let mut tables = self.write()?;
        let Some(pos) = tables
            .task_definitions
            .iter()
            .position(|d| d.identifier == identifier)
        else {
            return Ok(false);
        };
        let removed = tables.task_definitions.remove(pos);
        tables
            .task_links
            .retain(|link| link.task_definition_id != removed.id);
        Ok(true)
    }

    fn link_task(
        &self,
        transition: TransitionId,
        task: TaskDefinitionId,
    ) -> Result<TransitionTask> {
        let mut tables = self.write()?;
        let order = tables
            .task_links
            .iter()
            .filter(|l| l.transition_id == transition)
            .map(|l| l.order + 1)
            .max()
            .unwrap_or(0);
        let link = TransitionTask {
            transition_id: transition,
            task_definition_id: task,
            order,
        };
        tables.task_links.push(link.clone());
        Ok(link)
    }

    fn task_links(&self, transition: TransitionId) -> Result<Vec<TransitionTask>> {
        let mut links: Vec<TransitionTask> = self
            .read()?
            .task_links
            .iter()
            .filter(|l| l.transition_id == transition)
            .cloned()
            .collect();
        links.sort_by_key(|l| l.order);
        Ok(links)
    }

    fn transition_tasks(&self, transition: TransitionId) -> Result<Vec<TaskDefinition>> {
        let links = self.task_links(transition)?;
        let tables = self.read()?;
        links
            .iter()
            .map(|link| {
                tables
                    .task_definitions
                    .iter()
                    .find(|d| d.id == link.task_definition_id)
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::Storage(format!(
                            "transition {transition} links missing task definition {}",
                            link.task_definition_id
                        ))
                    })
            })
            .collect()
    }

    fn create_controller(&self, controller: StateController) -> Result<()> {
        let mut tables = self.write()?;
        if tables.subjects.contains_key(&controller.subject) {
            return Err(EngineError::AlreadyInitialized(controller.subject));
        }
        tables.subjects.insert(controller.subject.clone(), controller.id);
        tables.controllers.insert(controller.id, controller);
        Ok(())
    }

    fn controller(&self, id: ControllerId) -> Result<Option<StateController>> {
        Ok(self.read()?.controllers.get(&id).cloned())
    }

    fn controller_for(&self, subject: &SubjectRef) -> Result<Option<StateController>> {
        let tables = self.read()?;
        Ok(tables
            .subjects
            .get(subject)
            .and_then(|id| tables.controllers.get(id))
            .cloned())
    }

    fn try_begin_run(&self, id: ControllerId, job: JobId) -> Result<bool> {
        let mut tables = self.write()?;
        let controller = tables
            .controllers
            .get_mut(&id)
            .ok_or(EngineError::ControllerNotFound(id))?;
        if controller.inner_state != InnerState::Idle {
            return Ok(false);
        }
        controller.inner_state = InnerState::Running;
        controller.job_id = Some(job);
        Ok(true)
    }

    fn finish_run(&self, id: ControllerId, job: JobId) -> Result<bool> {
        let mut tables = self.write()?;
        let controller = tables
            .controllers
            .get_mut(&id)
            .ok_or(EngineError::ControllerNotFound(id))?;
        if controller.job_id != Some(job) {
            return Ok(false);
        }
        controller.inner_state = InnerState::Idle;
        controller.job_id = None;
        Ok(true)
    }

    fn commit_transition(
        &self,
        id: ControllerId,
        job: JobId,
        next: StateId,
    ) -> Result<Option<StateController>> {
        let mut tables = self.write()?;
        let controller = tables
            .controllers
            .get_mut(&id)
            .ok_or(EngineError::ControllerNotFound(id))?;
        if controller.job_id != Some(job) {
            return Ok(None);
        }
        controller.inner_state = InnerState::Idle;
        controller.current_state = next;
        controller.job_id = None;
        Ok(Some(controller.clone()))
    }

    fn append_log(&self, log: TransitionLog) -> Result<()> {
        self.write()?.logs.push(log);
        Ok(())
    }

    fn transition_logs(&self, controller: ControllerId) -> Result<Vec<TransitionLog>> {
        Ok(self
            .read()?
            .logs
            .iter()
            .rev()
            .filter(|l| l.controller_id == controller)
            .cloned()
            .collect())
    }

    fn append_snapshot(&self, snapshot: StateSnapshot) -> Result<()> {
        self.write()?.snapshots.push(snapshot);
        Ok(())
    }

    fn latest_snapshot(
        &self,
        controller: ControllerId,
        state: StateId,
    ) -> Result<Option<StateSnapshot>> {
        Ok(self
            .read()?
            .snapshots
            .iter()
            .rev()
            .find(|s| s.controller_id == controller && s.state_id == state)
            .cloned())
    }

    fn snapshots(&self, controller: ControllerId) -> Result<Vec<StateSnapshot>> {
        Ok(self
            .read()?
            .snapshots
            .iter()
            .rev()
            .filter(|s| s.controller_id == controller)
            .cloned()
            .collect())
    }
}
