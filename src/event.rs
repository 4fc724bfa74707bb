//! Committed and uncommitted aggregate events and their wire encoding.
//!
//! Pure data and conversion functions; no network I/O occurs here.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifacts::{AggregateRootId, EventSourceId, EventType};
use crate::error::EventStoreError;
use crate::execution_context::ExecutionContext;
use crate::proto;

/// Number of events an aggregate root instance has applied. Starts at 0.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AggregateRootVersion(u64);

impl AggregateRootVersion {
    /// The version of an aggregate with no events.
    pub const INITIAL: AggregateRootVersion = AggregateRootVersion(0);

    /// Wrap a raw version number.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw version number.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The version after one more event.
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for AggregateRootVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An event committed to an aggregate root's event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedAggregateEvent {
    pub event_source_id: EventSourceId,
    pub aggregate_root_id: AggregateRootId,
    /// The aggregate root version *before* this event was applied.
    pub aggregate_root_version: AggregateRootVersion,
    pub event_log_sequence_number: u64,
    /// Milliseconds since the Unix epoch.
    pub occurred: u64,
    pub event_type: EventType,
    pub content: Value,
    pub is_public: bool,
    pub execution_context: ExecutionContext,
}

/// A batch of committed events belonging to one aggregate root instance.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedAggregateEvents {
    event_source_id: EventSourceId,
    aggregate_root_id: AggregateRootId,
    events: Vec<CommittedAggregateEvent>,
}

impl CommittedAggregateEvents {
    /// A batch from its parts. Events are expected in version order.
    pub fn new(
        event_source_id: EventSourceId,
        aggregate_root_id: AggregateRootId,
        events: Vec<CommittedAggregateEvent>,
    ) -> Self {
        Self {
            event_source_id,
            aggregate_root_id,
            events,
        }
    }

    /// A batch with no events.
    pub fn empty(event_source_id: EventSourceId, aggregate_root_id: AggregateRootId) -> Self {
        Self::new(event_source_id, aggregate_root_id, Vec::new())
    }

    /// The event source every event in the batch belongs to.
    pub fn event_source_id(&self) -> &EventSourceId {
        &self.event_source_id
    }

    /// The aggregate root type every event in the batch belongs to.
    pub fn aggregate_root_id(&self) -> AggregateRootId {
        self.aggregate_root_id
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events in the batch.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Iterate the events in version order.
    pub fn iter(&self) -> std::slice::Iter<'_, CommittedAggregateEvent> {
        self.events.iter()
    }
}

impl IntoIterator for CommittedAggregateEvents {
    type Item = CommittedAggregateEvent;
    type IntoIter = std::vec::IntoIter<CommittedAggregateEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

impl<'a> IntoIterator for &'a CommittedAggregateEvents {
    type Item = &'a CommittedAggregateEvent;
    type IntoIter = std::slice::Iter<'a, CommittedAggregateEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

/// An event about to be committed.
#[derive(Debug, Clone, PartialEq)]
pub struct UncommittedAggregateEvent {
    pub event_type: EventType,
    pub content: Value,
    pub is_public: bool,
}

/// A commit request: the events applied by one unit of work together with
/// the version the aggregate root was at before they were applied.
#[derive(Debug, Clone, PartialEq)]
pub struct UncommittedAggregateEvents {
    pub event_source_id: EventSourceId,
    pub aggregate_root_id: AggregateRootId,
    pub expected_aggregate_root_version: AggregateRootVersion,
    pub events: Vec<UncommittedAggregateEvent>,
}

/// Build the wire commit request for `events` under `execution_context`.
pub(crate) fn encode_uncommitted_events(
    events: &UncommittedAggregateEvents,
    execution_context: &ExecutionContext,
) -> proto::CommitAggregateEventsRequest {
    proto::CommitAggregateEventsRequest {
        execution_context: Some(execution_context.to_proto()),
        aggregate_root_id: events.aggregate_root_id.to_string(),
        event_source_id: events.event_source_id.to_string(),
        expected_aggregate_root_version: events.expected_aggregate_root_version.value(),
        events: events
            .events
            .iter()
            .map(|event| proto::UncommittedAggregateEvent {
                event_type: Some(event.event_type.to_proto()),
                public: event.is_public,
                content: event.content.to_string(),
            })
            .collect(),
    }
}

/// Decode a wire batch of committed aggregate events.
///
/// # Errors
///
/// [`EventStoreError::Malformed`] if an id, event type, execution context or
/// content cannot be decoded.
pub(crate) fn decode_committed_events(
    events: &proto::CommittedAggregateEvents,
) -> Result<CommittedAggregateEvents, EventStoreError> {
    let event_source_id = EventSourceId::from(events.event_source_id.as_str());
    let aggregate_root_id: AggregateRootId = events.aggregate_root_id.parse().map_err(|_| {
        EventStoreError::Malformed(format!(
            "invalid aggregate root id {:?}",
            events.aggregate_root_id
        ))
    })?;

    let decoded = events
        .events
        .iter()
        .map(|event| decode_committed_event(event, &event_source_id, aggregate_root_id))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CommittedAggregateEvents::new(
        event_source_id,
        aggregate_root_id,
        decoded,
    ))
}

fn decode_committed_event(
    event: &proto::CommittedAggregateEvent,
    event_source_id: &EventSourceId,
    aggregate_root_id: AggregateRootId,
) -> Result<CommittedAggregateEvent, EventStoreError> {
    let sequence_number = event.event_log_sequence_number;
    let malformed = |what: &str| {
        EventStoreError::Malformed(format!("event {sequence_number} has {what}"))
    };

    let event_type = event
        .event_type
        .as_ref()
        .and_then(EventType::from_proto)
        .ok_or_else(|| malformed("a missing or invalid event type"))?;
    let execution_context = event
        .execution_context
        .as_ref()
        .and_then(ExecutionContext::from_proto)
        .ok_or_else(|| malformed("a missing or invalid execution context"))?;
    let content: Value =
        serde_json::from_str(&event.content).map_err(|_| malformed("content that is not JSON"))?;

    Ok(CommittedAggregateEvent {
        event_source_id: event_source_id.clone(),
        aggregate_root_id,
        aggregate_root_version: AggregateRootVersion::new(event.aggregate_root_version),
        event_log_sequence_number: sequence_number,
        occurred: event.occurred,
        event_type,
        content,
        is_public: event.public,
        execution_context,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::artifacts::Generation;

    fn dish_prepared() -> EventType {
        EventType::new(Uuid::from_u128(0xd15), Generation::FIRST)
    }

    fn wire_event(version: u64) -> proto::CommittedAggregateEvent {
        proto::CommittedAggregateEvent {
            event_log_sequence_number: 10 + version,
            occurred: 1_700_000_000_000,
            event_type: Some(dish_prepared().to_proto()),
            public: version % 2 == 0,
            content: json!({"dish": "taco", "chef": "mrs tex mex"}).to_string(),
            execution_context: Some(ExecutionContext::default().to_proto()),
            aggregate_root_version: version,
        }
    }

    fn wire_batch(events: Vec<proto::CommittedAggregateEvent>) -> proto::CommittedAggregateEvents {
        proto::CommittedAggregateEvents {
            event_source_id: "kitchen-1".into(),
            aggregate_root_id: Uuid::from_u128(0xa66).to_string(),
            current_aggregate_root_version: events.len() as u64,
            events,
        }
    }

    #[test]
    fn version_next_advances_by_one() {
        assert_eq!(AggregateRootVersion::INITIAL.next(), AggregateRootVersion::new(1));
        assert_eq!(
            AggregateRootVersion::new(u64::MAX).next(),
            AggregateRootVersion::new(u64::MAX)
        );
    }

    #[test]
    fn decode_committed_events_maps_every_field() {
        let decoded = decode_committed_events(&wire_batch(vec![wire_event(0), wire_event(1)]))
            .expect("batch should decode");

        assert_eq!(decoded.event_source_id(), &EventSourceId::from("kitchen-1"));
        assert_eq!(
            decoded.aggregate_root_id(),
            AggregateRootId::from_uuid(Uuid::from_u128(0xa66))
        );
        assert_eq!(decoded.len(), 2);

        let first = decoded.iter().next().unwrap();
        assert_eq!(first.aggregate_root_version, AggregateRootVersion::INITIAL);
        assert_eq!(first.event_log_sequence_number, 10);
        assert_eq!(first.event_type, dish_prepared());
        assert_eq!(first.content["dish"], "taco");
        assert!(first.is_public);
        assert_eq!(first.event_source_id, EventSourceId::from("kitchen-1"));
    }

    #[test]
    fn decode_rejects_non_json_content() {
        let mut event = wire_event(0);
        event.content = "{not json".into();
        let err = decode_committed_events(&wire_batch(vec![event])).unwrap_err();
        assert!(matches!(err, EventStoreError::Malformed(_)));
    }

    #[test]
    fn decode_rejects_missing_event_type() {
        let mut event = wire_event(0);
        event.event_type = None;
        assert!(decode_committed_events(&wire_batch(vec![event])).is_err());
    }

    #[test]
    fn decode_rejects_invalid_aggregate_root_id() {
        let mut batch = wire_batch(vec![]);
        batch.aggregate_root_id = "kitchen".into();
        assert!(decode_committed_events(&batch).is_err());
    }

    #[test]
    fn encode_uncommitted_events_preserves_order_and_expected_version() {
        let events = UncommittedAggregateEvents {
            event_source_id: EventSourceId::from("kitchen-1"),
            aggregate_root_id: AggregateRootId::from_uuid(Uuid::from_u128(0xa66)),
            expected_aggregate_root_version: AggregateRootVersion::new(3),
            events: vec![
                UncommittedAggregateEvent {
                    event_type: dish_prepared(),
                    content: json!({"dish": "taco"}),
                    is_public: false,
                },
                UncommittedAggregateEvent {
                    event_type: dish_prepared(),
                    content: json!({"dish": "burrito"}),
                    is_public: true,
                },
            ],
        };
        let request = encode_uncommitted_events(&events, &ExecutionContext::default());

        assert_eq!(request.expected_aggregate_root_version, 3);
        assert_eq!(request.event_source_id, "kitchen-1");
        assert_eq!(request.events.len(), 2);
        assert!(request.events[0].content.contains("taco"));
        assert!(request.events[1].public);
        assert!(request.execution_context.is_some());
    }
}
