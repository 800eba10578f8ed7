//! Transition log and per-state data snapshots, kept up to date by event
//! subscribers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::controller::{ControllerId, StateController};
use crate::error::{EngineError, Result};
use crate::events::{EventBus, EventBusBuilder, EventKind, Subscriber, WorkflowEvent};
use crate::store::WorkflowStore;
use crate::workflow::StateId;

/// Append-only audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionLog {
    pub id: Uuid,
    pub controller_id: ControllerId,
    pub from_state: Option<StateId>,
    pub to_state: StateId,
    pub created_at: DateTime<Utc>,
}

impl TransitionLog {
    pub fn new(
        controller_id: ControllerId,
        from_state: Option<StateId>,
        to_state: StateId,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            controller_id,
            from_state,
            to_state,
            created_at: Utc::now(),
        }
    }
}

/// Structured payload attached to a controller while it sits in a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub id: Uuid,
    pub controller_id: ControllerId,
    pub state_id: StateId,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl StateSnapshot {
    pub fn new(controller_id: ControllerId, state_id: StateId, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            controller_id,
            state_id,
            data,
            created_at: Utc::now(),
        }
    }
}

/// Name under which [`ControllerInitializer`] reports delivery failures.
pub const CONTROLLER_INITIALIZER: &str = "history.controller_initializer";

/// Creates the controller row when a subject is attached to a graph, then
/// announces the initial state as an `AfterChange` with no previous state.
pub struct ControllerInitializer {
    store: Arc<dyn WorkflowStore>,
}

impl Subscriber for ControllerInitializer {
    fn name(&self) -> &str {
        CONTROLLER_INITIALIZER
    }

    fn on_event(&self, event: &WorkflowEvent, bus: &EventBus) -> Result<()> {
        let WorkflowEvent::Initialize {
            subject,
            graph,
            initial_state,
        } = event
        else {
            return Ok(());
        };

        let controller = StateController::new(subject.clone(), graph.id, initial_state.id);
        self.store.create_controller(controller.clone())?;
        info!(
            controller = %controller.id,
            subject = %subject,
            state = %initial_state,
            "state controller created"
        );

        bus.publish(&WorkflowEvent::AfterChange {
            subject: subject.clone(),
            controller,
            previous: None,
            current: initial_state.clone(),
        });
        Ok(())
    }
}

pub struct TransitionLogRecorder {
    store: Arc<dyn WorkflowStore>,
}

impl Subscriber for TransitionLogRecorder {
    fn name(&self) -> &str {
        "history.transition_log"
    }

    fn on_event(&self, event: &WorkflowEvent, _bus: &EventBus) -> Result<()> {
        let WorkflowEvent::AfterChange {
            controller,
            previous,
            current,
            ..
        } = event
        else {
            return Ok(());
        };
        self.store.append_log(TransitionLog::new(
            controller.id,
            previous.as_ref().map(|s| s.id),
            current.id,
        ))
    }
}

/// Seeds the snapshot for the new state with the latest payload recorded for
/// the previous state, or `{}` when there is none.
pub struct SnapshotRecorder {
    store: Arc<dyn WorkflowStore>,
}

impl Subscriber for SnapshotRecorder {
    fn name(&self) -> &str {
        "history.snapshot"
    }

    fn on_event(&self, event: &WorkflowEvent, _bus: &EventBus) -> Result<()> {
        let WorkflowEvent::AfterChange {
            controller,
            previous,
            current,
            ..
        } = event
        else {
            return Ok(());
        };

        let carried = match previous {
            Some(prev) => self.store.latest_snapshot(controller.id, prev.id)?,
            None => None,
        };
        let data = match carried {
            Some(snapshot) => snapshot.data,
            None => {
                if previous.is_some() {
                    warn!(
                        controller = %controller.id,
                        "no snapshot for previous state, starting empty"
                    );
                }
                serde_json::Value::Object(Default::default())
            }
        };
        self.store
            .append_snapshot(StateSnapshot::new(controller.id, current.id, data))
    }
}

/// Registers the history subscribers on `builder`.
pub fn install(builder: EventBusBuilder, store: Arc<dyn WorkflowStore>) -> EventBusBuilder {
    builder
        .subscribe(
            &[EventKind::Initialize],
            Arc::new(ControllerInitializer {
                store: Arc::clone(&store),
            }),
        )
        .subscribe(
            &[EventKind::AfterChange],
            Arc::new(TransitionLogRecorder {
                store: Arc::clone(&store),
            }),
        )
        .subscribe(&[EventKind::AfterChange], Arc::new(SnapshotRecorder { store }))
}

/// Latest snapshot recorded for the controller's current state.
pub fn current_data(
    store: &dyn WorkflowStore,
    controller: &StateController,
) -> Result<StateSnapshot> {
    store
        .latest_snapshot(controller.id, controller.current_state)?
        .ok_or_else(|| {
            EngineError::Storage(format!(
                "controller {} has no data for its current state",
                controller.id
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::SubjectRef;
    use crate::store::InMemoryStore;
    use crate::workflow::{State, WorkflowGraph};
    use serde_json::json;

    fn setup() -> (Arc<InMemoryStore>, EventBus, State, WorkflowGraph) {
        let store = Arc::new(InMemoryStore::new());
        let state = State::new("foo", "foo");
        store.insert_state(state.clone()).unwrap();
        let graph = WorkflowGraph::new("machine", Some(state.id));
        store.insert_graph(graph.clone()).unwrap();
        let bus = install(EventBus::builder(), store.clone()).build();
        (store, bus, state, graph)
    }

    #[test]
    fn initialize_creates_controller_log_and_empty_snapshot() {
        let (store, bus, state, graph) = setup();
        let subject = SubjectRef::new("ticket", "1");

        let failures = bus.publish(&WorkflowEvent::Initialize {
            subject: subject.clone(),
            graph: graph.clone(),
            initial_state: state.clone(),
        });
        assert!(failures.is_empty());

        let controller = store.controller_for(&subject).unwrap().unwrap();
        assert_eq!(controller.graph_id, graph.id);
        assert_eq!(controller.current_state, state.id);

        let logs = store.transition_logs(controller.id).unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].from_state.is_none());
        assert_eq!(logs[0].to_state, state.id);

        let data = current_data(&*store, &controller).unwrap();
        assert_eq!(data.state_id, state.id);
        assert_eq!(data.data, json!({}));
    }

    #[test]
    fn after_change_carries_previous_payload_forward() {
        let (store, bus, state, graph) = setup();
        let next = State::new("bar", "bar");
        store.insert_state(next.clone()).unwrap();
        let subject = SubjectRef::new("ticket", "2");
        bus.publish(&WorkflowEvent::Initialize {
            subject: subject.clone(),
            graph,
            initial_state: state.clone(),
        });
        let controller = store.controller_for(&subject).unwrap().unwrap();
        store
            .append_snapshot(StateSnapshot::new(controller.id, state.id, json!({"owner": "ana"})))
            .unwrap();

        bus.publish(&WorkflowEvent::AfterChange {
            subject,
            controller: controller.clone(),
            previous: Some(state.clone()),
            current: next.clone(),
        });

        let snapshot = store.latest_snapshot(controller.id, next.id).unwrap().unwrap();
        assert_eq!(snapshot.data, json!({"owner": "ana"}));

        let logs = store.transition_logs(controller.id).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].from_state, Some(state.id));
        assert_eq!(logs[0].to_state, next.id);
    }

    #[test]
    fn duplicate_initialize_is_isolated() {
        let (store, bus, state, graph) = setup();
        let subject = SubjectRef::new("ticket", "3");
        let event = WorkflowEvent::Initialize {
            subject: subject.clone(),
            graph,
            initial_state: state,
        };
        assert!(bus.publish(&event).is_empty());

        let failures = bus.publish(&event);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].subscriber, "history.controller_initializer");

        let controller = store.controller_for(&subject).unwrap().unwrap();
        assert_eq!(store.transition_logs(controller.id).unwrap().len(), 1);
    }
}
