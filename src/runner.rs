//! Turns a requested transition into a submitted job.
//!
//! [`TaskRunner::new`] does all the checking up front: the controller and
//! target exist, exactly one transition matches, and every task (and every
//! validation task) resolves. Only then can [`TaskRunner::run`] flip the
//! controller to `Running` and submit.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::controller::StateController;
use crate::error::{EngineError, Result};
use crate::job::{Chain, Group, Job, JobHandle, JobSystem, JobUnit, Pipeline};
use crate::store::WorkflowStore;
use crate::task::{CHANGE_STATE, ChangeStateTask, TaskLoader, TaskPayload};
use crate::workflow::{State, Transition};

/// Tasks of a single transition, ready for submission.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Distinct validation tasks, in the order they were first referenced.
    pub validation: Vec<JobUnit>,
    /// Configured tasks in stored order, then the commit task.
    pub chain: Vec<JobUnit>,
}

impl ExecutionPlan {
    pub fn chain_identifiers(&self) -> Vec<&str> {
        self.chain.iter().map(|u| u.identifier.as_str()).collect()
    }

    pub fn validation_identifiers(&self) -> Vec<&str> {
        self.validation.iter().map(|u| u.identifier.as_str()).collect()
    }
}

pub struct TaskRunner {
    store: Arc<dyn WorkflowStore>,
    controller: StateController,
    next: State,
    transition: Transition,
    plan: ExecutionPlan,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        controller: Option<StateController>,
        next: Option<State>,
        loader: &dyn TaskLoader,
    ) -> Result<Self> {
        let controller = controller.ok_or(EngineError::MissingController)?;
        let next = next.ok_or(EngineError::MissingNextState)?;

        let transition = resolve_transition(
            store.transitions_between(controller.graph_id, controller.current_state, next.id)?,
            &controller,
            &next,
        )?;
        let plan = build_plan(store.as_ref(), &transition, loader)?;
        debug!(
            controller = %controller.id,
            transition = %transition.name,
            tasks = plan.chain.len(),
            validations = plan.validation.len(),
            "execution plan built"
        );

        Ok(Self {
            store,
            controller,
            next,
            transition,
            plan,
        })
    }

    /// Controller as loaded when the plan was built.
    pub fn controller(&self) -> &StateController {
        &self.controller
    }

    /// The single transition joining the current state to the target.
    pub fn transition(&self) -> &Transition {
        &self.transition
    }

    /// Resolved units that [`TaskRunner::run`] will submit.
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Marks the controller `Running` and submits the plan. Never waits for
    /// the job itself.
    pub fn run(self, jobs: &dyn JobSystem) -> Result<JobHandle> {
        let job_id = Uuid::new_v4();
        let controller_id = self.controller.id;

        if !self.store.try_begin_run(controller_id, job_id)? {
            warn!(controller = %controller_id, "transition already in flight, nothing submitted");
            return Err(EngineError::ControllerBusy(controller_id));
        }

        let payload = TaskPayload {
            controller_id,
            next_state_id: self.next.id,
        };
        let ExecutionPlan { validation, chain } = self.plan;
        let pipeline = if validation.is_empty() {
            Pipeline::Chain(Chain(chain))
        } else {
            Pipeline::GroupThenChain(Group(validation), Chain(chain))
        };

        match jobs.submit(Job {
            id: job_id,
            payload,
            pipeline,
        }) {
            Ok(handle) => {
                info!(
                    controller = %controller_id,
                    job = %job_id,
                    transition = %self.transition.name,
                    to = %self.next,
                    "transition submitted"
                );
                Ok(handle)
            }
            Err(err) => {
                self.store.finish_run(controller_id, job_id)?;
                Err(err)
            }
        }
    }
}

fn resolve_transition(
    mut candidates: Vec<Transition>,
    controller: &StateController,
    next: &State,
) -> Result<Transition> {
    match candidates.len() {
        1 => Ok(candidates.remove(0)),
        0 => Err(EngineError::TransitionNotFound {
            graph: controller.graph_id,
            from: controller.current_state,
            to: next.id,
        }),
        count => Err(EngineError::AmbiguousTransition {
            graph: controller.graph_id,
            from: controller.current_state,
            to: next.id,
            count,
        }),
    }
}

fn build_plan(
    store: &dyn WorkflowStore,
    transition: &Transition,
    loader: &dyn TaskLoader,
) -> Result<ExecutionPlan> {
    let mut chain = Vec::new();
    for definition in store.transition_tasks(transition.id)? {
        let task = loader.load_task(&definition.identifier)?;
        chain.push(JobUnit::new(definition.identifier, task));
    }
    chain.push(JobUnit::new(CHANGE_STATE, Arc::new(ChangeStateTask)));

    let mut validation: Vec<JobUnit> = Vec::new();
    for unit in &chain {
        let Some(identifier) = unit.task.validation_class() else {
            continue;
        };
        if identifier.is_empty() || validation.iter().any(|v| v.identifier == identifier) {
            continue;
        }
        let task = loader.load_task(identifier)?;
        validation.push(JobUnit::new(identifier, task));
    }

    Ok(ExecutionPlan { validation, chain })
}
