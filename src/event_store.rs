//! The event store collaborator used by aggregate root operations.

use std::sync::Arc;

use uuid::Uuid;

use crate::artifacts::{AggregateRootId, EventSourceId};
use crate::cancellation::Cancellation;
use crate::error::EventStoreError;
use crate::event::{CommittedAggregateEvents, UncommittedAggregateEvents};

/// Failure id the Runtime uses to report that the expected aggregate root
/// version did not match the stored one.
pub const AGGREGATE_ROOT_CONCURRENCY_CONFLICT: Uuid =
    Uuid::from_u128(0xf25cccfb_3ab6_4b6a_8a0f_5e2e8e3d0d53);

/// Reads and appends the events of aggregate root instances.
///
/// Implementations must honour the commit precondition: the commit succeeds
/// only if the stored version equals
/// [`expected_aggregate_root_version`](UncommittedAggregateEvents::expected_aggregate_root_version),
/// and fails with [`EventStoreError::ConcurrencyConflict`] otherwise.
#[tonic::async_trait]
pub trait EventStore: Send + Sync {
    /// Fetch every committed event of one aggregate root instance, in order.
    async fn fetch_for_aggregate(
        &self,
        aggregate_root_id: AggregateRootId,
        event_source_id: &EventSourceId,
        cancellation: &Cancellation,
    ) -> Result<CommittedAggregateEvents, EventStoreError>;

    /// Atomically append `events` if the stored version matches.
    async fn commit_for_aggregate(
        &self,
        events: UncommittedAggregateEvents,
        cancellation: &Cancellation,
    ) -> Result<CommittedAggregateEvents, EventStoreError>;
}

#[tonic::async_trait]
impl<T: EventStore + ?Sized> EventStore for Arc<T> {
    async fn fetch_for_aggregate(
        &self,
        aggregate_root_id: AggregateRootId,
        event_source_id: &EventSourceId,
        cancellation: &Cancellation,
    ) -> Result<CommittedAggregateEvents, EventStoreError> {
        (**self)
            .fetch_for_aggregate(aggregate_root_id, event_source_id, cancellation)
            .await
    }

    async fn commit_for_aggregate(
        &self,
        events: UncommittedAggregateEvents,
        cancellation: &Cancellation,
    ) -> Result<CommittedAggregateEvents, EventStoreError> {
        (**self).commit_for_aggregate(events, cancellation).await
    }
}
