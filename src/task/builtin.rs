use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{Task, TaskContext, TaskMetadata};
use crate::error::TaskError;
use crate::events::WorkflowEvent;

pub const CHANGE_STATE: &str = "statewright.tasks.ChangeState";
pub const NOOP: &str = "statewright.tasks.Noop";

/// Final unit of every chain. Moves the controller to the target state,
/// flips it back to idle and announces the change.
pub struct ChangeStateTask;

#[async_trait]
impl Task for ChangeStateTask {
    fn metadata(&self) -> TaskMetadata {
        TaskMetadata::internal("Change State", "Changes the current state to the next.")
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let job = ctx.request.job_id;
        let controller = ctx
            .env
            .store
            .commit_transition(ctx.controller.id, job, ctx.next.id)?
            .ok_or_else(|| {
                TaskError::Failed(format!(
                    "job {job} no longer holds controller {}",
                    ctx.controller.id
                ))
            })?;
        info!(
            controller = %controller.id,
            from = %ctx.previous,
            to = %ctx.next,
            %job,
            "state changed"
        );

        ctx.env.events.publish(&WorkflowEvent::AfterChange {
            subject: controller.subject.clone(),
            controller,
            previous: Some(ctx.previous.clone()),
            current: ctx.next.clone(),
        });
        Ok(())
    }
}

/// Does nothing and succeeds.
pub struct NoopTask;

#[async_trait]
impl Task for NoopTask {
    fn metadata(&self) -> TaskMetadata {
        TaskMetadata::public("Noop", "Succeeds without doing anything.")
    }

    async fn run(&self, _ctx: &TaskContext) -> Result<(), TaskError> {
        Ok(())
    }
}

/// Rejects the transition unless the controller's current data satisfies a
/// JSON schema. Meant to be registered under a host identifier and used as a
/// `validation_class`.
pub struct ValidateSchemaTask {
    name: String,
    schema: Value,
}

impl ValidateSchemaTask {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

#[async_trait]
impl Task for ValidateSchemaTask {
    fn metadata(&self) -> TaskMetadata {
        TaskMetadata::public(
            self.name.clone(),
            "Validates the current data against a JSON schema.",
        )
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let validator = jsonschema::validator_for(&self.schema)
            .map_err(|e| TaskError::Failed(format!("invalid schema for {}: {e}", self.name)))?;
        let snapshot = ctx.current_data()?;
        let errors: Vec<String> = validator
            .iter_errors(&snapshot.data)
            .map(|e| format!("{}: {e}", e.instance_path))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TaskError::Rejected(format!(
                "data for {} does not match schema: {}",
                ctx.previous,
                errors.join("; ")
            )))
        }
    }
}
