//! In-process lifecycle event bus.
//!
//! Subscribers are registered once, while the bus is being built, for the
//! event kinds they care about. [`EventBus::publish`] delivers an event to
//! every matching subscriber; a subscriber that returns an error or panics is
//! logged and skipped, and delivery carries on with the rest. Publishers never
//! see subscriber failures as errors.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error};

use crate::controller::{StateController, SubjectRef};
use crate::error::Result;
use crate::workflow::{State, WorkflowGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Initialize,
    BeforeChange,
    AfterChange,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Initialize => write!(f, "initialize"),
            EventKind::BeforeChange => write!(f, "before_change"),
            EventKind::AfterChange => write!(f, "after_change"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// A subject was attached to a workflow graph for the first time.
    Initialize {
        subject: SubjectRef,
        graph: WorkflowGraph,
        initial_state: State,
    },
    /// A transition was requested and is about to be planned.
    BeforeChange {
        subject: SubjectRef,
        controller: StateController,
        current: State,
        next: State,
    },
    /// The controller now sits in `current`. `previous` is `None` for the
    /// synthetic event fired on initialization.
    AfterChange {
        subject: SubjectRef,
        controller: StateController,
        previous: Option<State>,
        current: State,
    },
}

impl WorkflowEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WorkflowEvent::Initialize { .. } => EventKind::Initialize,
            WorkflowEvent::BeforeChange { .. } => EventKind::BeforeChange,
            WorkflowEvent::AfterChange { .. } => EventKind::AfterChange,
        }
    }

    pub fn subject(&self) -> &SubjectRef {
        match self {
            WorkflowEvent::Initialize { subject, .. }
            | WorkflowEvent::BeforeChange { subject, .. }
            | WorkflowEvent::AfterChange { subject, .. } => subject,
        }
    }
}

pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str;

    /// Handles one event. `bus` lets a subscriber publish follow-up events.
    fn on_event(&self, event: &WorkflowEvent, bus: &EventBus) -> Result<()>;
}

struct FnSubscriber<F> {
    name: String,
    f: F,
}

impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn(&WorkflowEvent, &EventBus) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, event: &WorkflowEvent, bus: &EventBus) -> Result<()> {
        (self.f)(event, bus)
    }
}

/// One subscriber that did not handle an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub subscriber: String,
    pub reason: String,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: HashMap<EventKind, Vec<Arc<dyn Subscriber>>>,
}

impl EventBus {
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::default()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.get(&kind).map_or(0, Vec::len)
    }

    /// Delivers `event` to every subscriber registered for its kind and
    /// returns the failures, which have already been logged.
    pub fn publish(&self, event: &WorkflowEvent) -> Vec<DeliveryFailure> {
        let kind = event.kind();
        let Some(subscribers) = self.subscribers.get(&kind) else {
            return Vec::new();
        };
        debug!(
            event = %kind,
            subject = %event.subject(),
            receivers = subscribers.len(),
            "publishing event"
        );

        let mut failures = Vec::new();
        for subscriber in subscribers {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| subscriber.on_event(event, self)));
            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };
            error!(
                subscriber = subscriber.name(),
                event = %kind,
                subject = %event.subject(),
                %reason,
                "event subscriber failed"
            );
            failures.push(DeliveryFailure {
                subscriber: subscriber.name().to_string(),
                reason,
            });
        }
        failures
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[derive(Default)]
pub struct EventBusBuilder {
    subscribers: HashMap<EventKind, Vec<Arc<dyn Subscriber>>>,
}

impl EventBusBuilder {
    pub fn subscribe(mut self, kinds: &[EventKind], subscriber: Arc<dyn Subscriber>) -> Self {
        for kind in kinds {
            self.subscribers
                .entry(*kind)
                .or_default()
                .push(Arc::clone(&subscriber));
        }
        self
    }

    pub fn subscribe_fn<F>(self, name: impl Into<String>, kinds: &[EventKind], f: F) -> Self
    where
        F: Fn(&WorkflowEvent, &EventBus) -> Result<()> + Send + Sync + 'static,
    {
        let subscriber = Arc::new(FnSubscriber {
            name: name.into(),
            f,
        });
        self.subscribe(kinds, subscriber)
    }

    pub fn build(self) -> EventBus {
        EventBus {
            subscribers: self.subscribers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn initialize_event() -> WorkflowEvent {
        let state = State::new("new", "New");
        WorkflowEvent::Initialize {
            subject: SubjectRef::new("ticket", "1"),
            graph: WorkflowGraph::new("tickets", Some(state.id)),
            initial_state: state,
        }
    }

    #[test]
    fn delivers_to_every_subscriber_of_the_kind() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&seen);
        let b = Arc::clone(&seen);
        let bus = EventBus::builder()
            .subscribe_fn("a", &[EventKind::Initialize], move |_, _| {
                a.lock().unwrap().push("a");
                Ok(())
            })
            .subscribe_fn("b", &[EventKind::Initialize, EventKind::AfterChange], move |_, _| {
                b.lock().unwrap().push("b");
                Ok(())
            })
            .build();

        let failures = bus.publish(&initialize_event());
        assert!(failures.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(bus.subscriber_count(EventKind::AfterChange), 1);
        assert_eq!(bus.subscriber_count(EventKind::BeforeChange), 0);
    }

    #[test]
    fn failing_subscriber_does_not_stop_delivery() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let after = Arc::clone(&seen);
        let bus = EventBus::builder()
            .subscribe_fn("errors", &[EventKind::Initialize], |_, _| {
                Err(EngineError::ControllerNotFound(Uuid::nil()))
            })
            .subscribe_fn("panics", &[EventKind::Initialize], |_, _| panic!("boom"))
            .subscribe_fn("healthy", &[EventKind::Initialize], move |_, _| {
                after.lock().unwrap().push("healthy");
                Ok(())
            })
            .build();

        let failures = bus.publish(&initialize_event());
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].subscriber, "errors");
        assert_eq!(failures[1].subscriber, "panics");
        assert!(failures[1].reason.contains("boom"));
        assert_eq!(*seen.lock().unwrap(), vec!["healthy"]);
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::default();
        assert!(bus.publish(&initialize_event()).is_empty());
    }

    #[test]
    fn subscriber_can_publish_follow_up_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let bus = EventBus::builder()
            .subscribe_fn("relay", &[EventKind::Initialize], |event, bus| {
                if let WorkflowEvent::Initialize { subject, graph, initial_state } = event {
                    let controller =
                        StateController::new(subject.clone(), graph.id, initial_state.id);
                    bus.publish(&WorkflowEvent::AfterChange {
                        subject: subject.clone(),
                        controller,
                        previous: None,
                        current: initial_state.clone(),
                    });
                }
                Ok(())
            })
            .subscribe_fn("sink", &[EventKind::AfterChange], move |event, _| {
                sink.lock().unwrap().push(event.kind());
                Ok(())
            })
            .build();

        bus.publish(&initialize_event());
        assert_eq!(*seen.lock().unwrap(), vec![EventKind::AfterChange]);
    }
}
