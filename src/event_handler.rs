//! Event handlers: processors that react to committed events.
//!
//! An [`EventHandler`] is declared with an [`EventHandlerBuilder`] by
//! registering one handle method per event type, and is then served by an
//! [`EventProcessorRegistration`](crate::EventProcessorRegistration) over
//! the Runtime's event handler reverse call.
//!
//! ```rust,ignore
//! use eventfold_sdk::{EventHandlerBuilder, EventHandlerId};
//!
//! let kitchen_log = EventHandlerBuilder::new(EventHandlerId::new_random())
//!     .with_alias("KitchenLog")
//!     .handle(|event: DishPrepared, context| async move {
//!         tracing::info!(dish = %event.dish, sequence = context.sequence_number, "dish prepared");
//!         Ok(())
//!     })
//!     .build(&event_types)?;
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::artifacts::{
    EventHandlerId, EventSourceId, EventType, EventTypes, PartitionId, PayloadType, ScopeId,
};
use crate::error::{EventHandlerError, EventTypesError, Failure};
use crate::event_processor::{EventProcessor, ProcessorFailure};
use crate::execution_context::ExecutionContext;
use crate::proto::{self, event_handler_client_message, event_handler_runtime_message};
use crate::reverse_call::{
    HandlerError, ReverseCallArgumentsContext, ReverseCallProtocol, ReverseCallRequestContext,
    ReverseCallResponseContext, ServerMessage,
};

/// Metadata about the event being handled.
#[derive(Debug, Clone, PartialEq)]
pub struct EventContext {
    /// Position of the event in the event log.
    pub sequence_number: u64,
    pub event_source_id: EventSourceId,
    /// Milliseconds since the Unix epoch.
    pub occurred: u64,
    pub event_type: EventType,
    pub is_public: bool,
    /// Set when the handler is partitioned.
    pub partition_id: Option<PartitionId>,
    /// The context the event was committed in, or the handling context if
    /// the Runtime did not send one.
    pub execution_context: ExecutionContext,
}

type HandleFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;
type HandleMethod = Box<dyn Fn(Value, EventContext) -> HandleFuture + Send + Sync>;

enum HandleTarget {
    Payload(PayloadType),
    EventType(EventType),
}

/// Declares an [`EventHandler`].
///
/// Handlers are partitioned and live in the default scope unless told
/// otherwise.
pub struct EventHandlerBuilder {
    id: EventHandlerId,
    scope_id: ScopeId,
    partitioned: bool,
    alias: Option<String>,
    methods: Vec<(HandleTarget, HandleMethod)>,
}

impl fmt::Debug for EventHandlerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlerBuilder")
            .field("id", &self.id)
            .field("scope_id", &self.scope_id)
            .field("partitioned", &self.partitioned)
            .field("alias", &self.alias)
            .field("methods", &self.methods.len())
            .finish()
    }
}

impl EventHandlerBuilder {
    /// Start declaring the handler registered under `id`.
    ///
    /// # Arguments
    ///
    /// * `id` - Stable id of the handler. The Runtime keeps the handler's
    ///   position in the event log under it, so it must not change between
    ///   deployments.
    pub fn new(id: impl Into<EventHandlerId>) -> Self {
        Self {
            id: id.into(),
            scope_id: ScopeId::DEFAULT,
            partitioned: true,
            alias: None,
            methods: Vec::new(),
        }
    }

    /// Handle events from `scope_id` instead of the default scope.
    pub fn in_scope(mut self, scope_id: impl Into<ScopeId>) -> Self {
        self.scope_id = scope_id.into();
        self
    }

    /// Process each partition independently, so a failing event only holds
    /// up its own partition. This is the default.
    pub fn partitioned(mut self) -> Self {
        self.partitioned = true;
        self
    }

    /// Process all events in a single sequence.
    pub fn unpartitioned(mut self) -> Self {
        self.partitioned = false;
        self
    }

    /// A readable name, shown by the Runtime and in logs next to the id.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Handle events whose type is associated with `T`.
    ///
    /// The event type is looked up in [`EventTypes`] when the handler is
    /// built. The content is decoded into `T` before `method` runs.
    pub fn handle<T, F, Fut>(self, method: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.push(HandleTarget::Payload(PayloadType::of::<T>()), method)
    }

    /// Handle events of exactly `event_type`, decoding the content into `T`.
    ///
    /// Use [`serde_json::Value`] as `T` to receive the raw content.
    pub fn handle_event_type<T, F, Fut>(self, event_type: EventType, method: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.push(HandleTarget::EventType(event_type), method)
    }

    fn push<T, F, Fut>(mut self, target: HandleTarget, method: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let method = Arc::new(method);
        let boxed: HandleMethod = Box::new(move |content: Value, context: EventContext| {
            let method = Arc::clone(&method);
            Box::pin(async move {
                let event = T::deserialize(content)?;
                method(event, context).await
            }) as HandleFuture
        });
        self.methods.push((target, boxed));
        self
    }

    /// Resolve every handle method's event type.
    ///
    /// # Errors
    ///
    /// [`EventTypesError::NotAssociated`] if a typed method's payload type
    /// has no event type, [`EventTypesError::Duplicate`] if two methods
    /// handle the same event type.
    pub fn build(self, event_types: &EventTypes) -> Result<EventHandler, EventTypesError> {
        let mut methods: Vec<(EventType, HandleMethod)> = Vec::with_capacity(self.methods.len());
        for (target, method) in self.methods {
            let event_type = match target {
                HandleTarget::Payload(payload) => event_types.get_for_payload(&payload)?,
                HandleTarget::EventType(event_type) => event_type,
            };
            if methods.iter().any(|(handled, _)| handled.id() == event_type.id()) {
                return Err(EventTypesError::Duplicate {
                    kind: "handle method for event type",
                    artifact: event_type.to_string(),
                });
            }
            methods.push((event_type, method));
        }

        Ok(EventHandler {
            id: self.id,
            scope_id: self.scope_id,
            partitioned: self.partitioned,
            alias: self.alias,
            methods,
        })
    }
}

/// A built event handler, ready to be registered with the Runtime.
pub struct EventHandler {
    id: EventHandlerId,
    scope_id: ScopeId,
    partitioned: bool,
    alias: Option<String>,
    methods: Vec<(EventType, HandleMethod)>,
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandler")
            .field("id", &self.id)
            .field("scope_id", &self.scope_id)
            .field("partitioned", &self.partitioned)
            .field("alias", &self.alias)
            .field("event_types", &self.event_types().collect::<Vec<_>>())
            .finish()
    }
}

impl EventHandler {
    /// The id the handler registers under.
    pub fn id(&self) -> EventHandlerId {
        self.id
    }

    /// The scope the handler reads events from.
    pub fn scope_id(&self) -> ScopeId {
        self.scope_id
    }

    /// Whether the handler processes partitions independently.
    pub fn is_partitioned(&self) -> bool {
        self.partitioned
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// The event types this handler has methods for.
    pub fn event_types(&self) -> impl Iterator<Item = &EventType> {
        self.methods.iter().map(|(event_type, _)| event_type)
    }

    async fn handle_event(
        &self,
        event: proto::StreamEvent,
        execution_context: ExecutionContext,
    ) -> Result<(), HandlerError> {
        let partition_id = event.partitioned.then(|| PartitionId(event.partition_id));
        let event = event.event.ok_or(EventHandlerError::MissingEvent)?;
        let event_type = event
            .event_type
            .as_ref()
            .and_then(EventType::from_proto)
            .ok_or_else(|| {
                EventHandlerError::MalformedEvent("missing or invalid event type".into())
            })?;
        let content: Value = serde_json::from_str(&event.content).map_err(|error| {
            EventHandlerError::MalformedEvent(format!("content is not JSON: {error}"))
        })?;

        let Some((_, method)) = self
            .methods
            .iter()
            .find(|(handled, _)| handled.id() == event_type.id())
        else {
            return Err(EventHandlerError::NoHandleMethod(event_type).into());
        };

        let context = EventContext {
            sequence_number: event.event_log_sequence_number,
            event_source_id: EventSourceId::from(event.event_source_id),
            occurred: event.occurred,
            event_type,
            is_public: event.public,
            partition_id,
            execution_context: event
                .execution_context
                .as_ref()
                .and_then(ExecutionContext::from_proto)
                .unwrap_or(execution_context),
        };
        tracing::debug!(
            event_handler = %self.id,
            sequence_number = context.sequence_number,
            event_type = %context.event_type,
            "handling event"
        );
        method(content, context).await
    }
}

/// The envelope conversions of the Runtime's event handler service.
#[derive(Debug)]
pub struct EventHandlerProtocol;

impl ReverseCallProtocol for EventHandlerProtocol {
    type ClientMessage = proto::EventHandlerClientMessage;
    type ServerMessage = proto::EventHandlerRuntimeMessage;
    type ConnectArguments = proto::EventHandlerRegistrationRequest;
    type ConnectResponse = proto::EventHandlerRegistrationResponse;
    type Request = proto::HandleEventRequest;
    type Response = proto::EventHandlerResponse;

    fn with_connect_arguments(
        arguments: proto::EventHandlerRegistrationRequest,
    ) -> proto::EventHandlerClientMessage {
        proto::EventHandlerClientMessage {
            message: Some(event_handler_client_message::Message::RegistrationRequest(
                arguments,
            )),
        }
    }

    fn with_response(response: proto::EventHandlerResponse) -> proto::EventHandlerClientMessage {
        proto::EventHandlerClientMessage {
            message: Some(event_handler_client_message::Message::HandleResult(response)),
        }
    }

    fn pong() -> proto::EventHandlerClientMessage {
        proto::EventHandlerClientMessage {
            message: Some(event_handler_client_message::Message::Pong(proto::Pong {})),
        }
    }

    fn classify(
        message: proto::EventHandlerRuntimeMessage,
    ) -> ServerMessage<proto::EventHandlerRegistrationResponse, proto::HandleEventRequest> {
        use event_handler_runtime_message::Message;

        match message.message {
            Some(Message::RegistrationResponse(response)) => ServerMessage::ConnectResponse(response),
            Some(Message::HandleRequest(request)) => ServerMessage::Request(request),
            Some(Message::Ping(_)) => ServerMessage::Ping,
            None => ServerMessage::Unknown,
        }
    }

    fn set_arguments_context(
        arguments: &mut proto::EventHandlerRegistrationRequest,
        context: ReverseCallArgumentsContext,
    ) {
        arguments.call_context = Some(context.to_proto());
    }

    fn request_context(request: &proto::HandleEventRequest) -> Option<ReverseCallRequestContext> {
        request
            .call_context
            .as_ref()
            .and_then(ReverseCallRequestContext::from_proto)
    }

    fn set_response_context(
        response: &mut proto::EventHandlerResponse,
        context: ReverseCallResponseContext,
    ) {
        response.call_context = Some(context.to_proto());
    }
}

#[tonic::async_trait]
impl EventProcessor for EventHandler {
    type Protocol = EventHandlerProtocol;

    const KIND: &'static str = "event handler";

    fn identifier(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{alias} ({})", self.id),
            None => self.id.to_string(),
        }
    }

    fn registration_arguments(&self) -> proto::EventHandlerRegistrationRequest {
        proto::EventHandlerRegistrationRequest {
            call_context: None,
            event_handler_id: self.id.to_string(),
            scope_id: self.scope_id.to_string(),
            partitioned: self.partitioned,
            types: self.event_types().map(EventType::to_proto).collect(),
            alias: self.alias.clone().unwrap_or_default(),
        }
    }

    fn registration_failure(response: &proto::EventHandlerRegistrationResponse) -> Option<Failure> {
        response.failure.as_ref().map(Failure::from_proto)
    }

    fn retry_count(request: &proto::HandleEventRequest) -> Option<u32> {
        request
            .retry_processing_state
            .as_ref()
            .map(|state| state.retry_count)
    }

    fn failure_response(failure: ProcessorFailure) -> proto::EventHandlerResponse {
        proto::EventHandlerResponse {
            call_context: None,
            failure: Some(failure.to_proto()),
        }
    }

    async fn handle(
        &self,
        request: proto::HandleEventRequest,
        execution_context: ExecutionContext,
    ) -> Result<proto::EventHandlerResponse, HandlerError> {
        let event = request.event.ok_or(EventHandlerError::MissingEvent)?;
        self.handle_event(event, execution_context).await?;
        Ok(proto::EventHandlerResponse::default())
    }
}
