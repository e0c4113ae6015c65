//! Lifecycle events published by the bindings registry.

use crate::types::{ModelId, ModuleId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::mpsc::{channel, Receiver, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingEventKind {
    Added,
    Removed,
    Activated,
}

/// Identity of a binding, independent of the binding object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindingRef {
    Model(ModelId),
    Module(ModuleId),
}

impl fmt::Display for BindingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingRef::Model(id) => write!(f, "model {id}"),
            BindingRef::Module(id) => write!(f, "module {id}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingEvent {
    pub seq: u64,
    pub kind: BindingEventKind,
    pub binding: BindingRef,
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct EventLogState {
    next_seq: u64,
    events: Vec<BindingEvent>,
    subscribers: Vec<Sender<BindingEvent>>,
}

/// Append-only log of lifecycle transitions.
#[derive(Default)]
pub(crate) struct EventLog {
    state: Mutex<EventLogState>,
}

impl EventLog {
    pub(crate) fn publish(&self, kind: BindingEventKind, binding: BindingRef, name: &str) -> u64 {
        let mut state = self.state.lock();
        state.next_seq += 1;
        let event = BindingEvent {
            seq: state.next_seq,
            kind,
            binding,
            name: name.to_string(),
            timestamp: Utc::now(),
        };
        // receivers that went away are dropped on the next publish
        state
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
        state.events.push(event);
        state.next_seq
    }

    /// Events with a sequence number greater than `seq`.
    pub(crate) fn since(&self, seq: u64) -> Vec<BindingEvent> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|event| event.seq > seq)
            .cloned()
            .collect()
    }

    pub(crate) fn subscribe(&self) -> Receiver<BindingEvent> {
        let (sender, receiver) = channel();
        self.state.lock().subscribers.push(sender);
        receiver
    }

    pub(crate) fn last_seq(&self) -> u64 {
        self.state.lock().next_seq
    }
}
