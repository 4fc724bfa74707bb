//! Crate-level error types.
//!
//! Every fallible operation in the SDK returns one of the enums below.
//! Per-event handler errors are not represented here: they are converted
//! into retryable failure responses sent back to the Runtime.

use std::fmt;

use uuid::Uuid;

use crate::artifacts::{AggregateRootId, EventSourceId, EventType};
use crate::event::AggregateRootVersion;
use crate::proto;

/// A failure reported by the Runtime: a well-known id and a human reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Identifies the kind of failure.
    pub id: Uuid,
    /// Human-readable explanation.
    pub reason: String,
}

impl Failure {
    /// Create a failure with the given id and reason.
    pub fn new(id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
        }
    }

    /// Decode a wire failure. An unparseable id decodes as the nil id.
    pub(crate) fn from_proto(failure: &proto::Failure) -> Self {
        Self {
            id: failure.id.parse().unwrap_or_else(|_| Uuid::nil()),
            reason: failure.reason.clone(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (failure {})", self.reason, self.id)
    }
}

/// Error returned by [`retry_with_policy`](crate::retry_with_policy) and the
/// forever-retrying registration of event processors.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    /// The surrounding cancellation fired. Always wins over other outcomes.
    #[error("retrying was cancelled")]
    Cancelled,

    /// The retry policy gave up. Carries the last error observed.
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        /// Number of failed attempts.
        attempts: u32,
        /// The error of the last attempt.
        #[source]
        source: E,
    },
}

/// Error returned by the [`EventTypes`](crate::EventTypes) and
/// [`AggregateRootTypes`](crate::AggregateRootTypes) registries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventTypesError {
    /// No artifact has been associated with the Rust type.
    #[error("no {kind} is associated with type {type_name}")]
    NotAssociated {
        /// What kind of artifact was looked up, e.g. "event type".
        kind: &'static str,
        /// `std::any::type_name` of the Rust type.
        type_name: &'static str,
    },

    /// The Rust type is already associated with an artifact.
    #[error("type {type_name} is already associated with a {kind}")]
    AlreadyAssociated {
        /// What kind of artifact was associated.
        kind: &'static str,
        /// `std::any::type_name` of the Rust type.
        type_name: &'static str,
    },

    /// The same artifact was declared twice where it must be unique.
    #[error("{kind} {artifact} is declared more than once")]
    Duplicate {
        /// What kind of declaration is duplicated.
        kind: &'static str,
        /// Display form of the duplicated artifact.
        artifact: String,
    },
}

/// Invariant violations raised by an [`AggregateRoot`](crate::AggregateRoot).
#[derive(Debug, thiserror::Error)]
pub enum AggregateRootError {
    /// The applied event serialized to JSON `null`.
    #[error("event content must be defined")]
    EventContentMustBeDefined,

    /// The aggregate declares `on` handlers but has no event types registry.
    #[error("event types have not been set on the aggregate root")]
    EventTypesNotSet,

    /// The aggregate root id was requested before it was assigned.
    #[error("aggregate root id has not been set")]
    AggregateRootIdNotSet,

    /// Replayed history belongs to another event source.
    #[error("event source {actual} does not match the aggregate root's event source {expected}")]
    EventSourceMismatch {
        /// This aggregate's event source id.
        expected: EventSourceId,
        /// The event source id found in the history.
        actual: EventSourceId,
    },

    /// Replayed history belongs to another aggregate root type.
    #[error("aggregate root {actual} does not match the aggregate root {expected}")]
    AggregateRootMismatch {
        /// This aggregate's root id.
        expected: AggregateRootId,
        /// The aggregate root id found in the history.
        actual: AggregateRootId,
    },

    /// A replayed event's version did not equal the current version.
    #[error("event with aggregate root version {actual} is out of order, expected version {expected}")]
    VersionOutOfOrder {
        /// The version the aggregate was at.
        expected: AggregateRootVersion,
        /// The version carried by the event.
        actual: AggregateRootVersion,
    },

    /// The event type could not be resolved.
    #[error(transparent)]
    EventTypes(#[from] EventTypesError),

    /// The event could not be serialized to JSON.
    #[error("failed to serialize event content: {0}")]
    Serialization(#[source] serde_json::Error),

    /// An `on` handler could not decode the event content.
    #[error("on handler for event type {event_type} could not decode the event content: {source}")]
    OnHandlerFailed {
        /// The event type being dispatched.
        event_type: EventType,
        /// The decoding error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from an [`EventStore`](crate::EventStore).
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// The expected aggregate root version did not match the stored one.
    #[error("aggregate root concurrency conflict: {reason}")]
    ConcurrencyConflict {
        /// The Runtime's explanation.
        reason: String,
    },

    /// The Runtime rejected the request.
    #[error("runtime failure: {0}")]
    Failure(Failure),

    /// The gRPC call failed.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::Status),

    /// The request was cancelled before a response arrived.
    #[error("event store request was cancelled")]
    Cancelled,

    /// The Runtime sent a response the SDK could not interpret.
    #[error("malformed response from runtime: {0}")]
    Malformed(String),
}

/// Terminal errors of a reverse call. The connection is closed when any of
/// these is returned.
#[derive(Debug, thiserror::Error)]
pub enum ReverseCallError {
    /// The first server message was not a connect response, or the stream
    /// ended before one arrived.
    #[error("did not receive a connect response from the runtime")]
    DidNotReceiveConnectResponse,

    /// No message arrived within the ping timeout.
    #[error("no message received from the runtime within {0:?}")]
    PingTimeout(std::time::Duration),

    /// The transport failed.
    #[error("reverse call transport error: {0}")]
    Transport(#[from] tonic::Status),

    /// Messages could no longer be written to the transport.
    #[error("reverse call connection closed")]
    ConnectionClosed,

    /// The surrounding cancellation fired.
    #[error("reverse call was cancelled")]
    Cancelled,

    /// The request handler failed.
    #[error("reverse call handler failed: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors from registering and running an [`EventProcessor`](crate::EventProcessor).
#[derive(Debug, thiserror::Error)]
pub enum EventProcessorError {
    /// The Runtime refused the registration.
    #[error("failed to register {kind} {identifier}: {failure}")]
    RegistrationFailed {
        /// The processor kind, e.g. "event handler".
        kind: &'static str,
        /// Human-readable identifier of the processor.
        identifier: String,
        /// The Runtime's failure.
        failure: Failure,
    },

    /// The reverse call failed.
    #[error(transparent)]
    ReverseCall(#[from] ReverseCallError),

    /// The Runtime completed the connection without being asked to.
    #[error("the runtime completed the connection")]
    ConnectionCompleted,
}

/// Per-event errors raised while an event handler processes an event.
///
/// These never terminate the connection; they become retryable failures.
#[derive(Debug, thiserror::Error)]
pub enum EventHandlerError {
    /// The request carried no event.
    #[error("handle request did not contain an event")]
    MissingEvent,

    /// The event could not be decoded.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// The handler has no method for the event type.
    #[error("no handle method for event type {0}")]
    NoHandleMethod(EventType),
}

/// Error returned by [`AggregateRootOperations::perform`](crate::AggregateRootOperations::perform).
///
/// Generic over `E`, the domain error the caller's action may return.
#[derive(Debug, thiserror::Error)]
pub enum PerformError<E: std::error::Error + Send + Sync + 'static> {
    /// The action rejected the operation.
    #[error(transparent)]
    Domain(E),

    /// An aggregate root invariant was violated.
    #[error(transparent)]
    Aggregate(#[from] AggregateRootError),

    /// Fetching or committing events failed.
    #[error(transparent)]
    EventStore(#[from] EventStoreError),
}

/// Errors from building or running a [`Client`](crate::Client).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No endpoint was configured.
    #[error("no runtime endpoint configured")]
    MissingEndpoint,

    /// The gRPC channel could not be created.
    #[error("failed to connect to the runtime: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// A registry lookup or declaration failed.
    #[error(transparent)]
    EventTypes(#[from] EventTypesError),

    /// Event handlers were started twice.
    #[error("event handlers have already been started")]
    AlreadyStarted,

    /// An event handler task panicked or was aborted.
    #[error("event handler task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}
