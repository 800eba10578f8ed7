//! Workflow state controller and task orchestration.
//!
//! Subjects (any business object, referenced by [`SubjectRef`]) are attached
//! to a [`WorkflowGraph`] and move between its states. Every move runs the
//! tasks configured on the transition through a [`JobSystem`]: validation
//! tasks first, as a concurrent group, then the ordered chain of main tasks,
//! closed by the commit task that advances the state. History is recorded by
//! subscribers of the [`EventBus`].

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod history;
pub mod job;
pub mod runner;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod workflow;

pub use config::EngineConfig;
pub use controller::{
    AnySubject, ControllerId, InnerState, StateController, SubjectLookup, SubjectRef,
};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, FailureKind, Result, TaskError};
pub use events::{DeliveryFailure, EventBus, EventBusBuilder, EventKind, Subscriber, WorkflowEvent};
pub use history::{StateSnapshot, TransitionLog};
pub use job::{Job, JobHandle, JobId, JobStatus, JobSystem, LocalJobSystem};
pub use runner::{ExecutionPlan, TaskRunner};
pub use store::{InMemoryStore, WorkflowStore};
pub use task::{
    Task, TaskContext, TaskEnv, TaskLoader, TaskMetadata, TaskPayload, TaskRegistry, TaskRequest,
};
pub use workflow::{
    Action, Actor, State, StateId, TaskDefinition, Transition, WorkflowDocument, WorkflowGraph,
};
