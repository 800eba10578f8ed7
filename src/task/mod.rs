//! The pluggable unit of work attached to transitions.
//!
//! A [`Task`] is resolved from a stable string identifier by a
//! [`TaskLoader`] (normally the [`TaskRegistry`]) while a plan is being built,
//! and executed later by the job system with a [`TaskRequest`]: the job id
//! plus the `{controller_id, next_state_id}` payload shared by every unit of
//! a job.

mod builtin;
mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::controller::{ControllerId, StateController};
use crate::error::{EngineError, TaskError};
use crate::events::EventBus;
use crate::history::{self, StateSnapshot};
use crate::job::JobId;
use crate::store::WorkflowStore;
use crate::workflow::{State, StateId};

pub use builtin::{CHANGE_STATE, ChangeStateTask, NOOP, NoopTask, ValidateSchemaTask};
pub use registry::{ReconcileReport, TaskLoader, TaskRegistry};

/// Arguments every unit of a job receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub controller_id: ControllerId,
    pub next_state_id: StateId,
}

/// One invocation of a task inside a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub job_id: JobId,
    pub identifier: String,
    pub payload: TaskPayload,
}

/// Shared services available to tasks on the worker side.
#[derive(Clone)]
pub struct TaskEnv {
    pub store: Arc<dyn WorkflowStore>,
    pub events: Arc<EventBus>,
}

impl TaskEnv {
    pub fn new(store: Arc<dyn WorkflowStore>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }
}

/// Bookkeeping metadata used when cataloguing tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMetadata {
    pub name: String,
    pub description: String,
    /// Public tasks get a task definition row and can be attached to
    /// transitions.
    pub public: bool,
}

impl TaskMetadata {
    pub fn public(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            public: true,
        }
    }

    pub fn internal(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            public: false,
        }
    }
}

/// Everything a task body sees: the controller and both ends of the
/// transition, loaded fresh when the unit starts.
pub struct TaskContext {
    pub request: TaskRequest,
    pub controller: StateController,
    pub previous: State,
    pub next: State,
    pub env: TaskEnv,
}

impl TaskContext {
    pub fn load(request: TaskRequest, env: TaskEnv) -> Result<Self, EngineError> {
        let payload = request.payload;
        let controller = env
            .store
            .controller(payload.controller_id)?
            .ok_or(EngineError::ControllerNotFound(payload.controller_id))?;
        let previous = env
            .store
            .state(controller.current_state)?
            .ok_or_else(|| EngineError::StateNotFound(controller.current_state.to_string()))?;
        let next = env
            .store
            .state(payload.next_state_id)?
            .ok_or_else(|| EngineError::StateNotFound(payload.next_state_id.to_string()))?;
        Ok(Self {
            request,
            controller,
            previous,
            next,
            env,
        })
    }

    /// Latest data snapshot for the controller's current state.
    pub fn current_data(&self) -> Result<StateSnapshot, EngineError> {
        history::current_data(self.env.store.as_ref(), &self.controller)
    }
}

#[async_trait]
pub trait Task: Send + Sync {
    fn metadata(&self) -> TaskMetadata;

    /// Identifier of a task that must run and pass before any task of the
    /// same job starts.
    fn validation_class(&self) -> Option<&str> {
        None
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError>;

    /// Called by the executor when `run` fails. Releases the controller so the
    /// subject is not left stuck in `Running`.
    async fn on_failure(&self, error: &TaskError, request: &TaskRequest, env: &TaskEnv) {
        error!(
            task = %request.identifier,
            job = %request.job_id,
            kind = %error.kind(),
            %error,
            "task failed"
        );
        release_controller(request, env);
    }
}

/// Resets the controller named by `request` to idle and clears its job id,
/// provided the controller is still held by `request`'s job.
pub fn release_controller(request: &TaskRequest, env: &TaskEnv) {
    let controller = request.payload.controller_id;
    match env.store.finish_run(controller, request.job_id) {
        Ok(true) => info!(%controller, job = %request.job_id, "controller released after failure"),
        Ok(false) => warn!(
            %controller,
            job = %request.job_id,
            "controller is held by another job, leaving it untouched"
        ),
        Err(err) => error!(%controller, %err, "could not release controller"),
    }
}

/// Runs one unit on the worker side: load the context, run the body, and on
/// any failure hand over to the task's failure hook.
pub async fn execute(
    task: Arc<dyn Task>,
    request: TaskRequest,
    env: TaskEnv,
) -> Result<(), TaskError> {
    debug!(task = %request.identifier, job = %request.job_id, "task started");
    let outcome = match TaskContext::load(request.clone(), env.clone()) {
        Ok(ctx) => task.run(&ctx).await,
        Err(err) => Err(TaskError::Engine(err)),
    };
    match outcome {
        Ok(()) => {
            debug!(task = %request.identifier, job = %request.job_id, "task succeeded");
            Ok(())
        }
        Err(err) => {
            task.on_failure(&err, &request, &env).await;
            Err(err)
        }
    }
}
