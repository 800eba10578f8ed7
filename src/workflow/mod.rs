//! Static definition of workflows: states, graphs, transitions and the tasks
//! attached to them.

mod document;
mod graph;

pub use document::{DocumentState, DocumentTask, DocumentTransition, WorkflowDocument};
pub use graph::{
    Action, Actor, GraphId, State, StateId, TaskDefinition, TaskDefinitionId, Transition,
    TransitionId, TransitionTask, WorkflowGraph,
};
