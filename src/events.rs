//! ABCI events.

use serde::Serialize;
use std::collections::BTreeSet;

/// Event type emitted for every dispatched message.
pub const EVENT_TYPE_MESSAGE: &str = "message";
pub const ATTRIBUTE_KEY_ACTION: &str = "action";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attribute {
    pub key: String,
    pub value: String,
    pub index: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub attributes: Vec<Attribute>,
}

impl Event {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute {
            key: key.into(),
            value: value.into(),
            index: false,
        });
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.key == key)
            .map(|attr| attr.value.as_str())
    }
}

/// Collects events emitted while executing against a context.
#[derive(Debug, Clone, Default)]
pub struct EventManager {
    events: Vec<Event>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn emit_all(&mut self, events: impl IntoIterator<Item = Event>) {
        self.events.extend(events);
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn take(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

/// Flags attributes for indexing.
///
/// An empty index set indexes everything; otherwise only `type.key` pairs in
/// the set are flagged.
pub fn mark_events_to_index(events: Vec<Event>, index_set: &BTreeSet<String>) -> Vec<Event> {
    events
        .into_iter()
        .map(|mut event| {
            for attr in &mut event.attributes {
                attr.index = index_set.is_empty()
                    || index_set.contains(&format!("{}.{}", event.kind, attr.key));
            }
            event
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_events_to_index() {
        let events = vec![Event::new("transfer")
            .with_attribute("sender", "a")
            .with_attribute("amount", "1")];

        let all = mark_events_to_index(events.clone(), &BTreeSet::new());
        assert!(all[0].attributes.iter().all(|attr| attr.index));

        let only_sender = mark_events_to_index(events, &BTreeSet::from(["transfer.sender".to_string()]));
        assert!(only_sender[0].attributes[0].index);
        assert!(!only_sender[0].attributes[1].index);
    }
}
