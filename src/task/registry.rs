use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::builtin::{CHANGE_STATE, ChangeStateTask, NOOP, NoopTask};
use super::Task;
use crate::error::{EngineError, Result};
use crate::job::JobSystem;
use crate::store::WorkflowStore;
use crate::workflow::TaskDefinition;

/// Resolves a task identifier into an instance ready to be scheduled.
pub trait TaskLoader: Send + Sync {
    fn load_task(&self, identifier: &str) -> Result<Arc<dyn Task>>;
}

type TaskFactory = Arc<dyn Fn() -> Arc<dyn Task> + Send + Sync>;

/// String-keyed table of task factories, filled at start-up.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    factories: BTreeMap<String, TaskFactory>,
}

/// Outcome of [`TaskRegistry::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Every installed identifier handed to the job system.
    pub registered: Vec<String>,
    /// Task definitions created for public tasks.
    pub created: Vec<String>,
    /// Task definitions removed because nothing installed backs them.
    pub pruned: Vec<String>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the commit task and the no-op task.
    pub fn with_builtins() -> Self {
        Self::new()
            .register(CHANGE_STATE, || ChangeStateTask)
            .register(NOOP, || NoopTask)
    }

    pub fn register<T, F>(mut self, identifier: impl Into<String>, factory: F) -> Self
    where
        T: Task + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let factory: TaskFactory = Arc::new(move || Arc::new(factory()) as Arc<dyn Task>);
        self.factories.insert(identifier.into(), factory);
        self
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.factories.contains_key(identifier)
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Brings the task definition table in line with what is installed:
    /// every installed task is registered with the job system, public ones
    /// get a definition row, and rows naming uninstalled tasks are deleted
    /// together with their transition links.
    pub fn reconcile(
        &self,
        store: &dyn WorkflowStore,
        jobs: &dyn JobSystem,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for (identifier, factory) in &self.factories {
            jobs.register_task(identifier);
            report.registered.push(identifier.clone());

            let metadata = factory().metadata();
            if !metadata.public {
                continue;
            }
            let definition =
                TaskDefinition::new(metadata.name, identifier.clone(), metadata.description);
            match store.upsert_task_definition(definition) {
                Ok((_, true)) => {
                    info!(task = %identifier, "task definition created");
                    report.created.push(identifier.clone());
                }
                Ok((_, false)) => {}
                Err(err) => warn!(task = %identifier, %err, "could not create task definition"),
            }
        }

        for definition in store.task_definitions()? {
            if self.contains(&definition.identifier) {
                continue;
            }
            if store.delete_task_definition(&definition.identifier)? {
                info!(task = %definition.identifier, "stale task definition pruned");
                report.pruned.push(definition.identifier);
            }
        }

        Ok(report)
    }
}

impl TaskLoader for TaskRegistry {
    fn load_task(&self, identifier: &str) -> Result<Arc<dyn Task>> {
        self.factories
            .get(identifier)
            .map(|factory| factory())
            .ok_or_else(|| EngineError::TaskNotResolvable(identifier.to_string()))
    }
}
