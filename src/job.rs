//! Job submission boundary and the in-process job system.
//!
//! A [`Job`] is either an ordered [`Chain`] of units, or a parallel [`Group`]
//! that must fully succeed before the chain starts. Every unit receives the
//! same [`TaskPayload`]. Submission returns a [`JobHandle`] immediately; the
//! outcome is observed by polling or awaiting the handle.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, FailureKind, Result};
use crate::task::{self, Task, TaskEnv, TaskPayload, TaskRequest};

pub type JobId = Uuid;

/// A resolved task together with the identifier it was resolved from.
#[derive(Clone)]
pub struct JobUnit {
    pub identifier: String,
    pub task: Arc<dyn Task>,
}

impl JobUnit {
    pub fn new(identifier: impl Into<String>, task: Arc<dyn Task>) -> Self {
        Self {
            identifier: identifier.into(),
            task,
        }
    }
}

impl fmt::Debug for JobUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobUnit")
            .field("identifier", &self.identifier)
            .finish()
    }
}

/// Units that may run concurrently; succeeds only if all of them do.
#[derive(Debug, Clone, Default)]
pub struct Group(pub Vec<JobUnit>);

/// Units that run one after the other; stops at the first failure.
#[derive(Debug, Clone, Default)]
pub struct Chain(pub Vec<JobUnit>);

#[derive(Debug, Clone)]
pub enum Pipeline {
    Chain(Chain),
    GroupThenChain(Group, Chain),
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub payload: TaskPayload,
    pub pipeline: Pipeline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed {
        unit: String,
        kind: FailureKind,
        reason: String,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed { .. })
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Succeeded => write!(f, "SUCCESS"),
            JobStatus::Failed { unit, kind, reason } => {
                write!(f, "FAILURE in {unit} ({kind}): {reason}")
            }
        }
    }
}

/// Reference to a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    status: watch::Receiver<JobStatus>,
}

impl JobHandle {
    pub fn new(id: JobId, status: watch::Receiver<JobStatus>) -> Self {
        Self { id, status }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.status.borrow().is_terminal()
    }

    /// Waits until the job reaches a terminal status. If the executor went
    /// away first, returns the last status it reported.
    pub async fn wait(&self) -> JobStatus {
        let mut rx = self.status.clone();
        loop {
            let status = rx.borrow_and_update().clone();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }
}

pub trait JobSystem: Send + Sync {
    /// Makes an identifier known to the workers.
    fn register_task(&self, identifier: &str);

    /// Identifiers passed to [`JobSystem::register_task`], sorted and
    /// without duplicates.
    fn registered(&self) -> Vec<String>;

    /// Hands the job over for execution and returns without waiting for it.
    fn submit(&self, job: Job) -> Result<JobHandle>;
}

/// Runs jobs on the current tokio runtime, with at most `concurrency` units
/// executing at once across all jobs.
pub struct LocalJobSystem {
    env: TaskEnv,
    permits: Arc<Semaphore>,
    registered: Mutex<BTreeSet<String>>,
}

impl LocalJobSystem {
    pub fn new(env: TaskEnv, concurrency: usize) -> Self {
        Self {
            env,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            registered: Mutex::new(BTreeSet::new()),
        }
    }
}

impl JobSystem for LocalJobSystem {
    fn register_task(&self, identifier: &str) {
        if let Ok(mut registered) = self.registered.lock() {
            registered.insert(identifier.to_string());
        }
    }

    fn registered(&self) -> Vec<String> {
        self.registered
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn submit(&self, job: Job) -> Result<JobHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::JobSubmission(e.to_string()))?;
        let (tx, rx) = watch::channel(JobStatus::Pending);
        let handle = JobHandle::new(job.id, rx);
        runtime.spawn(drive(job, self.env.clone(), Arc::clone(&self.permits), tx));
        Ok(handle)
    }
}

async fn drive(job: Job, env: TaskEnv, permits: Arc<Semaphore>, tx: watch::Sender<JobStatus>) {
    tx.send_replace(JobStatus::Running);
    let Job {
        id,
        payload,
        pipeline,
    } = job;

    let (group, chain) = match pipeline {
        Pipeline::Chain(chain) => (None, chain),
        Pipeline::GroupThenChain(group, chain) => (Some(group), chain),
    };

    if let Some(group) = group {
        if let Err(status) = run_group(group, id, payload, &env, &permits).await {
            error!(job = %id, %status, "validation group failed, chain not started");
            tx.send_replace(status);
            return;
        }
    }

    for unit in chain.0 {
        if let Err(status) = run_unit(unit, id, payload, env.clone(), Arc::clone(&permits)).await {
            error!(job = %id, %status, "chain halted");
            tx.send_replace(status);
            return;
        }
    }

    info!(job = %id, "job succeeded");
    tx.send_replace(JobStatus::Succeeded);
}

/// Runs every unit of the group to completion and reports the first failure.
async fn run_group(
    group: Group,
    job_id: JobId,
    payload: TaskPayload,
    env: &TaskEnv,
    permits: &Arc<Semaphore>,
) -> std::result::Result<(), JobStatus> {
    let mut set = JoinSet::new();
    for unit in group.0 {
        set.spawn(run_unit(unit, job_id, payload, env.clone(), Arc::clone(permits)));
    }

    let mut first_failure = None;
    while let Some(joined) = set.join_next().await {
        let outcome = joined.unwrap_or_else(|err| {
            Err(JobStatus::Failed {
                unit: "validation".into(),
                kind: FailureKind::System,
                reason: err.to_string(),
            })
        });
        if let Err(status) = outcome {
            first_failure.get_or_insert(status);
        }
    }
    match first_failure {
        Some(status) => Err(status),
        None => Ok(()),
    }
}

async fn run_unit(
    unit: JobUnit,
    job_id: JobId,
    payload: TaskPayload,
    env: TaskEnv,
    permits: Arc<Semaphore>,
) -> std::result::Result<(), JobStatus> {
    let request = TaskRequest {
        job_id,
        identifier: unit.identifier.clone(),
        payload,
    };
    let failed = |kind, reason: String| JobStatus::Failed {
        unit: unit.identifier.clone(),
        kind,
        reason,
    };

    let _permit = permits
        .acquire_owned()
        .await
        .map_err(|e| failed(FailureKind::System, e.to_string()))?;

    let execution = task::execute(Arc::clone(&unit.task), request.clone(), env.clone());
    let joined = tokio::spawn(execution).await;
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(failed(err.kind(), err.to_string())),
        Err(join_err) => {
            // The body panicked, so its failure hook never ran.
            warn!(task = %unit.identifier, job = %job_id, "task panicked");
            task::release_controller(&request, &env);
            Err(failed(FailureKind::System, join_err.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{InnerState, StateController, SubjectRef};
    use crate::error::TaskError;
    use crate::events::EventBus;
    use crate::store::{InMemoryStore, WorkflowStore};
    use crate::task::{TaskContext, TaskMetadata};
    use crate::workflow::{State, WorkflowGraph};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Appends its label to a shared journal, optionally after a delay.
    struct Journal {
        label: &'static str,
        delay_ms: u64,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Task for Journal {
        fn metadata(&self) -> TaskMetadata {
            TaskMetadata::internal(self.label, "")
        }

        async fn run(&self, _ctx: &TaskContext) -> std::result::Result<(), TaskError> {
            self.log.lock().unwrap().push(format!("{}:start", self.label));
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.log.lock().unwrap().push(format!("{}:end", self.label));
            if self.fail {
                Err(TaskError::Rejected(format!("{} said no", self.label)))
            } else {
                Ok(())
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl Task for Panics {
        fn metadata(&self) -> TaskMetadata {
            TaskMetadata::internal("panics", "")
        }

        async fn run(&self, _ctx: &TaskContext) -> std::result::Result<(), TaskError> {
            panic!("task body blew up");
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        jobs: LocalJobSystem,
        payload: TaskPayload,
        job_id: JobId,
        log: Arc<Mutex<Vec<String>>>,
    }

    fn fixture(concurrency: usize) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let a = State::new("a", "");
        let b = State::new("b", "");
        store.insert_state(a.clone()).unwrap();
        store.insert_state(b.clone()).unwrap();
        let graph = WorkflowGraph::new("g", Some(a.id));
        store.insert_graph(graph.clone()).unwrap();
        let controller = StateController::new(SubjectRef::new("ticket", "1"), graph.id, a.id);
        store.create_controller(controller.clone()).unwrap();
        let job_id = Uuid::new_v4();
        store.try_begin_run(controller.id, job_id).unwrap();

        let env = TaskEnv::new(store.clone(), Arc::new(EventBus::default()));
        Fixture {
            store,
            jobs: LocalJobSystem::new(env, concurrency),
            payload: TaskPayload {
                controller_id: controller.id,
                next_state_id: b.id,
            },
            job_id,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn unit(f: &Fixture, label: &'static str, delay_ms: u64, fail: bool) -> JobUnit {
        JobUnit::new(
            format!("tests.{label}"),
            Arc::new(Journal {
                label,
                delay_ms,
                fail,
                log: Arc::clone(&f.log),
            }),
        )
    }

    #[tokio::test]
    async fn chain_runs_in_order() {
        let f = fixture(4);
        let chain = Chain(vec![unit(&f, "a", 20, false), unit(&f, "b", 0, false)]);
        let handle = f
            .jobs
            .submit(Job {
                id: f.job_id,
                payload: f.payload,
                pipeline: Pipeline::Chain(chain),
            })
            .unwrap();

        assert_eq!(handle.wait().await, JobStatus::Succeeded);
        assert!(handle.is_finished());
        assert_eq!(
            *f.log.lock().unwrap(),
            vec!["a:start", "a:end", "b:start", "b:end"]
        );
    }

    #[tokio::test]
    async fn group_is_a_barrier_before_the_chain() {
        let f = fixture(4);
        let group = Group(vec![unit(&f, "v1", 30, false), unit(&f, "v2", 10, false)]);
        let chain = Chain(vec![unit(&f, "main", 0, false)]);
        let handle = f
            .jobs
            .submit(Job {
                id: f.job_id,
                payload: f.payload,
                pipeline: Pipeline::GroupThenChain(group, chain),
            })
            .unwrap();

        assert_eq!(handle.wait().await, JobStatus::Succeeded);
        let log = f.log.lock().unwrap().clone();
        let main_start = log.iter().position(|e| e == "main:start").unwrap();
        let v1_end = log.iter().position(|e| e == "v1:end").unwrap();
        let v2_end = log.iter().position(|e| e == "v2:end").unwrap();
        assert!(main_start > v1_end && main_start > v2_end);
        // both validations were in flight together
        let v2_start = log.iter().position(|e| e == "v2:start").unwrap();
        assert!(v2_start < v1_end);
    }

    #[tokio::test]
    async fn failed_group_skips_chain_and_releases_controller() {
        let f = fixture(4);
        let group = Group(vec![unit(&f, "v1", 0, true), unit(&f, "v2", 10, false)]);
        let chain = Chain(vec![unit(&f, "main", 0, false)]);
        let handle = f
            .jobs
            .submit(Job {
                id: f.job_id,
                payload: f.payload,
                pipeline: Pipeline::GroupThenChain(group, chain),
            })
            .unwrap();

        let status = handle.wait().await;
        assert!(matches!(
            status,
            JobStatus::Failed { ref unit, kind: FailureKind::Business, .. } if unit == "tests.v1"
        ));
        let log = f.log.lock().unwrap().clone();
        assert!(!log.iter().any(|e| e.starts_with("main")));
        assert!(log.contains(&"v2:end".to_string()));

        let controller = f.store.controller(f.payload.controller_id).unwrap().unwrap();
        assert_eq!(controller.inner_state, InnerState::Idle);
        assert!(controller.job_id.is_none());
    }

    #[tokio::test]
    async fn chain_stops_at_first_failure() {
        let f = fixture(1);
        let chain = Chain(vec![
            unit(&f, "a", 0, false),
            unit(&f, "b", 0, true),
            unit(&f, "c", 0, false),
        ]);
        let handle = f
            .jobs
            .submit(Job {
                id: f.job_id,
                payload: f.payload,
                pipeline: Pipeline::Chain(chain),
            })
            .unwrap();

        assert!(matches!(handle.wait().await, JobStatus::Failed { .. }));
        assert!(!f.log.lock().unwrap().iter().any(|e| e.starts_with("c:")));
    }

    #[tokio::test]
    async fn panicking_unit_fails_the_job_and_releases_controller() {
        let f = fixture(2);
        let chain = Chain(vec![JobUnit::new("tests.Panics", Arc::new(Panics))]);
        let handle = f
            .jobs
            .submit(Job {
                id: f.job_id,
                payload: f.payload,
                pipeline: Pipeline::Chain(chain),
            })
            .unwrap();

        let status = handle.wait().await;
        assert!(matches!(status, JobStatus::Failed { kind: FailureKind::System, .. }));
        let controller = f.store.controller(f.payload.controller_id).unwrap().unwrap();
        assert!(!controller.is_running());
    }

    #[test]
    fn submit_outside_a_runtime_fails() {
        let f = fixture(1);
        let err = f
            .jobs
            .submit(Job {
                id: f.job_id,
                payload: f.payload,
                pipeline: Pipeline::Chain(Chain::default()),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::JobSubmission(_)));
    }

    #[test]
    fn registered_identifiers_are_sorted_and_unique() {
        let f = fixture(1);
        f.jobs.register_task("b.Task");
        f.jobs.register_task("a.Task");
        f.jobs.register_task("b.Task");
        assert_eq!(f.jobs.registered(), vec!["a.Task", "b.Task"]);
    }
}
