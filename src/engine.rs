//! Entry point for host applications.
//!
//! An [`Engine`] wires a store, the event bus (with the history subscribers
//! installed), the task registry and a job system together, and exposes the
//! per-subject operations: initialize a subject on a graph, inspect where it
//! is and where it can go, and request a transition.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::controller::{AnySubject, ControllerId, StateController, SubjectLookup, SubjectRef};
use crate::error::{EngineError, Result};
use crate::events::{EventBus, EventBusBuilder, EventKind, Subscriber, WorkflowEvent};
use crate::history::{self, StateSnapshot, TransitionLog};
use crate::job::{JobHandle, JobSystem, LocalJobSystem};
use crate::runner::TaskRunner;
use crate::store::WorkflowStore;
use crate::task::{ReconcileReport, TaskEnv, TaskLoader, TaskRegistry};
use crate::workflow::{Actor, GraphId, State, StateId, Transition};

/// Per-subject workflow operations over one store. Built with
/// [`Engine::builder`].
pub struct Engine {
    store: Arc<dyn WorkflowStore>,
    events: Arc<EventBus>,
    registry: TaskRegistry,
    jobs: Arc<dyn JobSystem>,
    subjects: Arc<dyn SubjectLookup>,
}

pub struct EngineBuilder {
    store: Arc<dyn WorkflowStore>,
    registry: TaskRegistry,
    subjects: Arc<dyn SubjectLookup>,
    /// Host subscribers. The history recorders are added at build time.
    events: EventBusBuilder,
    /// Units allowed to run at once on the local job system.
    concurrency: usize,
    /// Reconcile the registry against the store when building.
    auto_reconcile: bool,
}

impl EngineBuilder {
    /// Replaces the default registry of built-in tasks.
    pub fn registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Existence check run by [`Engine::initialize`]. Defaults to
    /// accepting every subject.
    pub fn subjects(mut self, subjects: Arc<dyn SubjectLookup>) -> Self {
        self.subjects = subjects;
        self
    }

    /// Adds a subscriber next to the history recorders.
    pub fn subscribe(mut self, kinds: &[EventKind], subscriber: Arc<dyn Subscriber>) -> Self {
        self.events = self.events.subscribe(kinds, subscriber);
        self
    }

    /// Upper bound on units running at once. Ignored by `build_with`.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Whether `build` reconciles the registry. On by default.
    pub fn auto_reconcile(mut self, enabled: bool) -> Self {
        self.auto_reconcile = enabled;
        self
    }

    /// Applies the concurrency and auto-reconcile settings from a config.
    pub fn config(self, config: &EngineConfig) -> Self {
        self.concurrency(config.worker_concurrency)
            .auto_reconcile(config.auto_reconcile)
    }

    /// Builds the engine on the in-process job system.
    pub fn build(self) -> Result<Engine> {
        let concurrency = self.concurrency;
        self.build_with(|env| Arc::new(LocalJobSystem::new(env, concurrency)) as Arc<dyn JobSystem>)
    }

    /// Builds the engine on a job system created from the task environment.
    pub fn build_with<F>(self, jobs: F) -> Result<Engine>
    where
        F: FnOnce(TaskEnv) -> Arc<dyn JobSystem>,
    {
        let events = Arc::new(history::install(self.events, Arc::clone(&self.store)).build());
        let env = TaskEnv::new(Arc::clone(&self.store), Arc::clone(&events));
        let engine = Engine {
            store: self.store,
            events,
            registry: self.registry,
            jobs: jobs(env),
            subjects: self.subjects,
        };
        if self.auto_reconcile {
            engine.reconcile()?;
        }
        Ok(engine)
    }
}

impl Engine {
    /// Starts from the built-in tasks, the default concurrency and a lookup
    /// that accepts every subject.
    pub fn builder(store: Arc<dyn WorkflowStore>) -> EngineBuilder {
        EngineBuilder {
            store,
            registry: TaskRegistry::with_builtins(),
            subjects: Arc::new(AnySubject),
            events: EventBus::builder(),
            concurrency: EngineConfig::default().worker_concurrency,
            auto_reconcile: true,
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// The bus, with the history recorders installed.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn jobs(&self) -> &Arc<dyn JobSystem> {
        &self.jobs
    }

    /// Syncs the registry with the job system and the stored task
    /// definitions. Run by `build` unless auto-reconcile is off.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let report = self.registry.reconcile(self.store.as_ref(), self.jobs.as_ref())?;
        info!(
            registered = report.registered.len(),
            created = report.created.len(),
            pruned = report.pruned.len(),
            "task registry reconciled"
        );
        Ok(report)
    }

    /// Attaches `subject` to a graph, starting in the graph's initial state.
    pub fn initialize(&self, subject: &SubjectRef, graph_id: GraphId) -> Result<StateController> {
        let graph = self
            .store
            .graph(graph_id)?
            .ok_or_else(|| EngineError::GraphNotFound(graph_id.to_string()))?;
        let initial_id = graph
            .initial_state
            .ok_or(EngineError::MissingInitialState(graph.id))?;
        let initial_state = self
            .store
            .state(initial_id)?
            .ok_or_else(|| EngineError::StateNotFound(initial_id.to_string()))?;
        if !self.subjects.exists(subject) {
            return Err(EngineError::SubjectNotFound(subject.clone()));
        }
        if self.store.controller_for(subject)?.is_some() {
            return Err(EngineError::AlreadyInitialized(subject.clone()));
        }

        let failures = self.events.publish(&WorkflowEvent::Initialize {
            subject: subject.clone(),
            graph,
            initial_state,
        });
        // Another caller may have attached the subject since the check above.
        if let Some(failure) = failures
            .iter()
            .find(|f| f.subscriber == history::CONTROLLER_INITIALIZER)
        {
            return Err(match self.store.controller_for(subject)? {
                Some(_) => EngineError::AlreadyInitialized(subject.clone()),
                None => EngineError::Storage(format!(
                    "could not create a state controller for {subject}: {}",
                    failure.reason
                )),
            });
        }

        self.store.controller_for(subject)?.ok_or_else(|| {
            EngineError::Storage(format!("no state controller was created for {subject}"))
        })
    }

    /// Fails with [`EngineError::ControllerNotFound`] for an unknown id.
    pub fn controller(&self, id: ControllerId) -> Result<StateController> {
        self.store
            .controller(id)?
            .ok_or(EngineError::ControllerNotFound(id))
    }

    /// The controller attached to `subject`, if it was initialized.
    pub fn controller_for(&self, subject: &SubjectRef) -> Result<Option<StateController>> {
        self.store.controller_for(subject)
    }

    pub fn current_state(&self, subject: &SubjectRef) -> Result<State> {
        let controller = self.require_controller(subject)?;
        self.load_state(controller.current_state)
    }

    /// Latest data snapshot recorded for the subject's current state.
    pub fn current_data(&self, subject: &SubjectRef) -> Result<StateSnapshot> {
        let controller = self.require_controller(subject)?;
        history::current_data(self.store.as_ref(), &controller)
    }

    /// Records a new data payload for the subject's current state.
    pub fn record_data(
        &self,
        subject: &SubjectRef,
        data: serde_json::Value,
    ) -> Result<StateSnapshot> {
        let controller = self.require_controller(subject)?;
        let snapshot = StateSnapshot::new(controller.id, controller.current_state, data);
        self.store.append_snapshot(snapshot.clone())?;
        Ok(snapshot)
    }

    /// Transitions leaving the subject's current state.
    pub fn next(&self, subject: &SubjectRef) -> Result<Vec<Transition>> {
        let controller = self.require_controller(subject)?;
        self.store
            .transitions_from(controller.graph_id, controller.current_state)
    }

    /// Like [`Engine::next`], keeping only transitions `actor` may take.
    pub fn next_for_user(
        &self,
        subject: &SubjectRef,
        actor: &dyn Actor,
    ) -> Result<Vec<Transition>> {
        Ok(self
            .next(subject)?
            .into_iter()
            .filter(|t| t.is_available(actor))
            .collect())
    }

    /// True when the subject has no transition in flight.
    pub fn can_change_to(&self, subject: &SubjectRef, next: &State) -> Result<bool> {
        Ok(self.require_controller(subject)?.can_change_to(next))
    }

    /// Requests a transition with the engine's registry as task loader.
    pub fn change_to(
        &self,
        controller_id: ControllerId,
        next_state_id: StateId,
    ) -> Result<JobHandle> {
        self.change_to_with_loader(controller_id, next_state_id, &self.registry)
    }

    /// Publishes `BeforeChange`, builds the plan and submits it. Returns as
    /// soon as the job is submitted; the outcome is observed through the
    /// handle or the controller afterwards.
    pub fn change_to_with_loader(
        &self,
        controller_id: ControllerId,
        next_state_id: StateId,
        loader: &dyn TaskLoader,
    ) -> Result<JobHandle> {
        let controller = self.controller(controller_id)?;
        let next = self.load_state(next_state_id)?;
        if !controller.can_change_to(&next) {
            debug!(controller = %controller.id, to = %next, "controller busy, change refused");
            return Err(EngineError::ControllerBusy(controller.id));
        }
        let current = self.load_state(controller.current_state)?;

        self.events.publish(&WorkflowEvent::BeforeChange {
            subject: controller.subject.clone(),
            controller: controller.clone(),
            current,
            next: next.clone(),
        });

        TaskRunner::new(Arc::clone(&self.store), Some(controller), Some(next), loader)?
            .run(self.jobs.as_ref())
    }

    /// Transition log of a controller, newest first.
    /// Transition log of a controller, newest first.
    pub fn history(&self, controller_id: ControllerId) -> Result<Vec<TransitionLog>> {
        self.store.transition_logs(controller_id)
    }

    fn require_controller(&self, subject: &SubjectRef) -> Result<StateController> {
        self.store
            .controller_for(subject)?
            .ok_or_else(|| EngineError::SubjectNotFound(subject.clone()))
    }

    fn load_state(&self, id: StateId) -> Result<State> {
        self.store
            .state(id)?
            .ok_or_else(|| EngineError::StateNotFound(id.to_string()))
    }
}
