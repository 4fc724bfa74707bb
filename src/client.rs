//! Typed gRPC access to the Runtime.
//!
//! [`RuntimeClient`] speaks the wire protocol. [`RuntimeEventStore`] and
//! [`EventHandlersConnection`] adapt it to the [`EventStore`] and
//! [`ReverseCallConnection`] seams, so the aggregate and reverse-call
//! modules never touch tonic directly.

use std::fmt;

use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Channel, Endpoint};

use crate::artifacts::{AggregateRootId, EventSourceId};
use crate::auth::{AccessToken, BearerInterceptor};
use crate::cancellation::Cancellation;
use crate::error::{EventStoreError, Failure};
use crate::event::{
    CommittedAggregateEvents, UncommittedAggregateEvents, decode_committed_events,
    encode_uncommitted_events,
};
use crate::event_store::{AGGREGATE_ROOT_CONCURRENCY_CONFLICT, EventStore};
use crate::execution_context::ExecutionContext;
use crate::proto;
use crate::proto::aggregates_client::AggregatesClient;
use crate::proto::event_handlers_client::EventHandlersClient;
use crate::proto::event_store_client::EventStoreClient;
use crate::reverse_call::{ReverseCallConnection, ServerStream};

/// Authenticated channel shared by every generated client.
type Transport = InterceptedService<Channel, BearerInterceptor>;

/// gRPC client for the Runtime's services.
///
/// Wraps the generated `Aggregates`, `EventStore` and `EventHandlers` clients
/// over one authenticated channel. Clone is cheap: clones share the channel.
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// use eventfold_sdk::{AccessToken, RuntimeClient};
///
/// let client = RuntimeClient::connect("http://127.0.0.1:50053", AccessToken::default()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RuntimeClient {
    aggregates: AggregatesClient<Transport>,
    event_store: EventStoreClient<Transport>,
    event_handlers: EventHandlersClient<Transport>,
}

impl fmt::Debug for RuntimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeClient").finish_non_exhaustive()
    }
}

impl RuntimeClient {
    /// Connect to the Runtime at `endpoint`.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - The URI of the Runtime (e.g. `"http://127.0.0.1:50053"`).
    /// * `token` - Bearer token sent with every call. Keep a clone to rotate it.
    ///
    /// # Errors
    ///
    /// Returns [`tonic::transport::Error`] if the endpoint is invalid or the
    /// channel cannot be established.
    pub async fn connect(
        endpoint: impl Into<String>,
        token: AccessToken,
    ) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(endpoint.into())?.connect().await?;
        Ok(Self::new(channel, &token))
    }

    /// Use an existing channel, e.g. one created with `connect_lazy`.
    pub fn new(channel: Channel, token: &AccessToken) -> Self {
        Self {
            aggregates: AggregatesClient::with_interceptor(channel.clone(), token.interceptor()),
            event_store: EventStoreClient::with_interceptor(channel.clone(), token.interceptor()),
            event_handlers: EventHandlersClient::with_interceptor(channel, token.interceptor()),
        }
    }

    /// Fetch the committed events of one aggregate root instance.
    ///
    /// # Errors
    ///
    /// Returns [`tonic::Status`] on transport errors. Runtime failures travel
    /// in the response's `failure` field.
    pub async fn fetch_for_aggregate(
        &self,
        request: proto::FetchForAggregateRequest,
    ) -> Result<proto::FetchForAggregateResponse, Status> {
        // Generated clients take `&mut self`; clones share the channel.
        let response = self.aggregates.clone().fetch_for_aggregate(request).await?;
        Ok(response.into_inner())
    }

    /// Commit events for one aggregate root instance at an expected version.
    ///
    /// # Errors
    ///
    /// Returns [`tonic::Status`] on transport errors. Concurrency conflicts
    /// and other Runtime failures travel in the response's `failure` field.
    pub async fn commit_for_aggregate(
        &self,
        request: proto::CommitAggregateEventsRequest,
    ) -> Result<proto::CommitAggregateEventsResponse, Status> {
        let response = self.event_store.clone().commit_for_aggregate(request).await?;
        Ok(response.into_inner())
    }

    /// Open the event handler reverse call. Every message yielded by
    /// `outgoing` is written to the Runtime; the call ends when it closes.
    pub async fn connect_event_handler(
        &self,
        outgoing: ReceiverStream<proto::EventHandlerClientMessage>,
    ) -> Result<tonic::Streaming<proto::EventHandlerRuntimeMessage>, Status> {
        let response = self.event_handlers.clone().connect(outgoing).await?;
        Ok(response.into_inner())
    }
}

/// Turn a failure carried by a response into an error.
fn check_failure(failure: Option<&proto::Failure>) -> Result<(), EventStoreError> {
    let Some(failure) = failure else {
        return Ok(());
    };
    let failure = Failure::from_proto(failure);
    if failure.id == AGGREGATE_ROOT_CONCURRENCY_CONFLICT {
        return Err(EventStoreError::ConcurrencyConflict {
            reason: failure.reason,
        });
    }
    Err(EventStoreError::Failure(failure))
}

/// The Runtime's event store, acting for one tenant.
#[derive(Debug, Clone)]
pub struct RuntimeEventStore {
    client: RuntimeClient,
    execution_context: ExecutionContext,
}

impl RuntimeEventStore {
    /// An event store committing and fetching on behalf of `execution_context`,
    /// usually the client's context narrowed to one tenant.
    pub fn new(client: RuntimeClient, execution_context: ExecutionContext) -> Self {
        Self {
            client,
            execution_context,
        }
    }

    /// The context sent with every fetch and commit.
    pub fn execution_context(&self) -> &ExecutionContext {
        &self.execution_context
    }
}

#[tonic::async_trait]
impl EventStore for RuntimeEventStore {
    async fn fetch_for_aggregate(
        &self,
        aggregate_root_id: AggregateRootId,
        event_source_id: &EventSourceId,
        cancellation: &Cancellation,
    ) -> Result<CommittedAggregateEvents, EventStoreError> {
        let request = proto::FetchForAggregateRequest {
            execution_context: Some(self.execution_context.to_proto()),
            aggregate_root_id: aggregate_root_id.to_string(),
            event_source_id: event_source_id.to_string(),
        };
        let response = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(EventStoreError::Cancelled),
            response = self.client.fetch_for_aggregate(request) => response?,
        };

        check_failure(response.failure.as_ref())?;
        let events = response.events.ok_or_else(|| {
            EventStoreError::Malformed("fetch response carried no events".into())
        })?;
        decode_committed_events(&events)
    }

    async fn commit_for_aggregate(
        &self,
        events: UncommittedAggregateEvents,
        cancellation: &Cancellation,
    ) -> Result<CommittedAggregateEvents, EventStoreError> {
        let request = encode_uncommitted_events(&events, &self.execution_context);
        let response = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(EventStoreError::Cancelled),
            response = self.client.commit_for_aggregate(request) => response?,
        };

        check_failure(response.failure.as_ref())?;
        let committed = response.events.ok_or_else(|| {
            EventStoreError::Malformed("commit response carried no events".into())
        })?;
        decode_committed_events(&committed)
    }
}

/// Opens event handler reverse calls on the Runtime.
#[derive(Debug, Clone)]
pub struct EventHandlersConnection {
    client: RuntimeClient,
}

impl EventHandlersConnection {
    /// Open event handler calls over `client`.
    pub fn new(client: RuntimeClient) -> Self {
        Self { client }
    }
}

#[tonic::async_trait]
impl ReverseCallConnection<proto::EventHandlerClientMessage, proto::EventHandlerRuntimeMessage>
    for EventHandlersConnection
{
    /// Open the `EventHandlers/Connect` stream.
    ///
    /// `cancellation` is only watched while the call is being opened. Once
    /// the stream is returned, the call is torn down by dropping it together
    /// with the outgoing sender, which [`ReverseCall`](crate::ReverseCall)
    /// does whenever it ends.
    async fn establish(
        &self,
        outgoing: ReceiverStream<proto::EventHandlerClientMessage>,
        cancellation: Cancellation,
    ) -> Result<ServerStream<proto::EventHandlerRuntimeMessage>, Status> {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(Status::cancelled("event handler connection was cancelled")),
            incoming = self.client.connect_event_handler(outgoing) => {
                Ok(Box::pin(incoming?) as ServerStream<_>)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::cancellation::CancellationSource;
    use crate::event::AggregateRootVersion;

    /// A client whose channel connects on first use, to an address nothing
    /// listens on.
    fn lazy_client() -> RuntimeClient {
        let channel = Endpoint::from_static("http://[::1]:1").connect_lazy();
        RuntimeClient::new(channel, &AccessToken::new("secret"))
    }

    fn cancelled() -> Cancellation {
        let source = CancellationSource::new();
        source.cancel();
        source.token()
    }

    #[test]
    fn concurrency_failure_maps_to_conflict() {
        let failure = proto::Failure {
            id: AGGREGATE_ROOT_CONCURRENCY_CONFLICT.to_string(),
            reason: "expected version 2 but was 3".into(),
        };
        let err = check_failure(Some(&failure)).unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::ConcurrencyConflict { reason } if reason == "expected version 2 but was 3"
        ));
    }

    #[test]
    fn other_failures_map_to_runtime_failure() {
        let id = Uuid::new_v4();
        let failure = proto::Failure {
            id: id.to_string(),
            reason: "tenant not found".into(),
        };
        let err = check_failure(Some(&failure)).unwrap_err();
        assert!(matches!(err, EventStoreError::Failure(failure) if failure.id == id));
        assert!(check_failure(None).is_ok());
    }

    #[tokio::test]
    async fn cancelled_fetch_returns_without_calling_the_runtime() {
        let store = RuntimeEventStore::new(lazy_client(), ExecutionContext::default());
        let err = store
            .fetch_for_aggregate(
                AggregateRootId::new_random(),
                &EventSourceId::from("kitchen-1"),
                &cancelled(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Cancelled));
    }

    #[tokio::test]
    async fn cancelled_commit_returns_without_calling_the_runtime() {
        let store = RuntimeEventStore::new(lazy_client(), ExecutionContext::default());
        let events = UncommittedAggregateEvents {
            event_source_id: EventSourceId::from("kitchen-1"),
            aggregate_root_id: AggregateRootId::new_random(),
            expected_aggregate_root_version: AggregateRootVersion::INITIAL,
            events: Vec::new(),
        };
        let err = store
            .commit_for_aggregate(events, &cancelled())
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Cancelled));
    }

    #[tokio::test]
    async fn cancelled_establish_fails_with_cancelled_status() {
        let connection = EventHandlersConnection::new(lazy_client());
        let (_outgoing, outgoing_rx) = tokio::sync::mpsc::channel(1);
        let result = connection
            .establish(ReceiverStream::new(outgoing_rx), cancelled())
            .await;
        let Err(status) = result else {
            panic!("establish should fail when cancelled");
        };
        assert_eq!(status.code(), tonic::Code::Cancelled);
    }

    #[tokio::test]
    async fn unreachable_runtime_surfaces_as_transport_error() {
        let store = RuntimeEventStore::new(lazy_client(), ExecutionContext::default());
        let err = store
            .fetch_for_aggregate(
                AggregateRootId::new_random(),
                &EventSourceId::from("kitchen-1"),
                &Cancellation::after(std::time::Duration::from_secs(5)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Transport(_)));
    }

    #[tokio::test]
    async fn runtime_event_store_debug_hides_transport() {
        let store = RuntimeEventStore::new(lazy_client(), ExecutionContext::default());
        let debug = format!("{store:?}");
        assert!(debug.contains("RuntimeClient"));
        assert!(!debug.contains("secret"));
    }
}
