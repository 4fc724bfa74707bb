//! Client SDK for an event-sourced Runtime.
//!
//! Aggregate roots are rebuilt from their committed events and commit new
//! ones with an expected-version check ([`AggregateRootOperations`]). Event
//! handlers register with the Runtime over long-lived reverse calls and are
//! kept registered under a [`RetryPolicy`]. [`ClientBuilder`] wires both to
//! a Runtime over gRPC.

mod aggregate;
pub use aggregate::{AggregateRoot, AggregateState, AppliedEvent, OnHandlers};
mod aggregate_operations;
pub use aggregate_operations::{ActionFuture, AggregateOf, AggregateRootOperations};
mod artifacts;
mod auth;
mod cancellation;
mod client;
mod error;
mod event;
mod event_handler;
mod event_processor;
mod event_store;
mod execution_context;
pub mod proto;
mod retry;
mod reverse_call;
mod sdk;

pub use artifacts::{
    AggregateRootId, AggregateRootTypes, EventHandlerId, EventSourceId, EventType, EventTypeId,
    EventTypes, Generation, PartitionId, PayloadType, ScopeId,
};
pub use auth::AccessToken;
pub use cancellation::{Cancellation, CancellationSource};
pub use client::{EventHandlersConnection, RuntimeClient, RuntimeEventStore};
pub use error::{
    AggregateRootError, ClientError, EventHandlerError, EventProcessorError, EventStoreError,
    EventTypesError, Failure, PerformError, RetryError, ReverseCallError,
};
pub use event::{
    AggregateRootVersion, CommittedAggregateEvent, CommittedAggregateEvents,
    UncommittedAggregateEvent, UncommittedAggregateEvents,
};
pub use event_handler::{EventContext, EventHandler, EventHandlerBuilder, EventHandlerProtocol};
pub use event_processor::{
    ClientMessageOf, ConnectArgumentsOf, ConnectResponseOf, EventProcessor,
    EventProcessorRegistration, ProcessorFailure, RequestOf, ResponseOf, ServerMessageOf,
    catching_handle, retry_timeout,
};
pub use event_store::{AGGREGATE_ROOT_CONCURRENCY_CONFLICT, EventStore};
pub use execution_context::{
    Claim, Claims, CorrelationId, Environment, ExecutionContext, MicroserviceId, TenantId, Version,
};
pub use retry::{
    ExponentialBackoff, FixedDelay, Immediate, MaxAttempts, RetryIf, RetryPolicy, RetryPolicyExt,
    RetryReset, retry_with_policy, retry_with_reset,
};
pub use reverse_call::{
    DEFAULT_PING_INTERVAL, HandlerError, ReverseCall, ReverseCallArgumentsContext,
    ReverseCallClient, ReverseCallConfig, ReverseCallConnection, ReverseCallHandler,
    ReverseCallProtocol, ReverseCallRequestContext, ReverseCallResponseContext, ServerMessage,
    ServerStream,
};
pub use sdk::{Client, ClientBuilder, EventHandlersHandle};
