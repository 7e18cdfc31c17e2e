//! Minimal model of an event the harness can send
//!
//! Only the sending side needs a type here; received events stay untyped
//! inside the sync envelope. State events are addressed by
//! `(type, state_key)` and replaced idempotently by the server, while
//! non-state events are addressed by the client's private transaction
//! counter.

use serde_json::Value;

/// An event to be sent into a room.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: String,
    pub state_key: Option<String>,
    pub content: Value,
}

impl Event {
    /// A non-state event, addressed by transaction ID when sent.
    pub fn new(event_type: impl Into<String>, content: Value) -> Self {
        Self {
            event_type: event_type.into(),
            state_key: None,
            content,
        }
    }

    /// A state event. An empty `state_key` is valid and common
    /// (`m.room.name`, `m.room.topic`).
    pub fn state(
        event_type: impl Into<String>,
        state_key: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            state_key: Some(state_key.into()),
            content,
        }
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }
}
