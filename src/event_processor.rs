//! Registering event processors with the Runtime.
//!
//! An [`EventProcessor`] is something the Runtime pushes work to over a
//! reverse call: it registers under an identifier and then handles one
//! request at a time. [`EventProcessorRegistration`] owns the connect,
//! register and serve cycle and can keep it alive forever under a
//! [`RetryPolicy`].
//!
//! Two levels of failure are kept apart. A processor whose `handle` fails
//! does *not* lose its connection: the error is turned into a retryable
//! failure response and the Runtime redelivers the event later. Only
//! connection-level failures (transport, ping timeout, refused
//! registration) end the reverse call and go through the retry policy.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::cancellation::Cancellation;
use crate::error::{EventProcessorError, Failure, RetryError};
use crate::execution_context::ExecutionContext;
use crate::proto;
use crate::retry::{RetryPolicy, retry_with_reset};
use crate::reverse_call::{
    HandlerError, ReverseCall, ReverseCallClient, ReverseCallConfig, ReverseCallConnection,
    ReverseCallHandler, ReverseCallProtocol,
};

/// Per-failure increment of the suggested retry timeout.
const RETRY_TIMEOUT_STEP: Duration = Duration::from_secs(5);

/// Upper bound of the suggested retry timeout.
const MAX_RETRY_TIMEOUT: Duration = Duration::from_secs(60);

/// How long the Runtime should wait before redelivering an event that has
/// already failed `prior_retry_count` times: 5 seconds per failure, capped
/// at one minute.
pub fn retry_timeout(prior_retry_count: u32) -> Duration {
    RETRY_TIMEOUT_STEP
        .saturating_mul(prior_retry_count.saturating_add(1))
        .min(MAX_RETRY_TIMEOUT)
}

/// A per-event failure reported back to the Runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorFailure {
    pub reason: String,
    /// Whether the Runtime should redeliver the event.
    pub retry: bool,
    /// How long the Runtime should wait before redelivering.
    pub retry_timeout: Duration,
}

impl ProcessorFailure {
    /// A failure the Runtime should retry after [`retry_timeout`].
    pub fn retryable(reason: impl Into<String>, prior_retry_count: u32) -> Self {
        Self {
            reason: reason.into(),
            retry: true,
            retry_timeout: retry_timeout(prior_retry_count),
        }
    }

    pub(crate) fn to_proto(&self) -> proto::ProcessorFailure {
        proto::ProcessorFailure {
            reason: self.reason.clone(),
            retry: self.retry,
            retry_timeout: Some(proto::duration(self.retry_timeout)),
        }
    }
}

// Shorthands for the wire types of a processor's protocol.

/// Messages a processor writes to the Runtime.
pub type ClientMessageOf<E> = <<E as EventProcessor>::Protocol as ReverseCallProtocol>::ClientMessage;
/// Messages the Runtime writes to a processor.
pub type ServerMessageOf<E> = <<E as EventProcessor>::Protocol as ReverseCallProtocol>::ServerMessage;
/// A processor's registration arguments.
pub type ConnectArgumentsOf<E> =
    <<E as EventProcessor>::Protocol as ReverseCallProtocol>::ConnectArguments;
/// The Runtime's answer to a registration.
pub type ConnectResponseOf<E> =
    <<E as EventProcessor>::Protocol as ReverseCallProtocol>::ConnectResponse;
/// A unit of work pushed to a processor.
pub type RequestOf<E> = <<E as EventProcessor>::Protocol as ReverseCallProtocol>::Request;
/// A processor's answer to a request.
pub type ResponseOf<E> = <<E as EventProcessor>::Protocol as ReverseCallProtocol>::Response;

/// A processor the Runtime pushes requests to.
#[tonic::async_trait]
pub trait EventProcessor: Send + Sync + 'static {
    /// The reverse-call service this processor registers on.
    type Protocol: ReverseCallProtocol;

    /// Human-readable kind, e.g. `"event handler"`. Used in logs and errors.
    const KIND: &'static str;

    /// Human-readable identifier of this processor.
    fn identifier(&self) -> String;

    /// The registration request sent when connecting.
    fn registration_arguments(&self) -> ConnectArgumentsOf<Self>;

    /// The failure carried by the Runtime's registration response, if any.
    fn registration_failure(response: &ConnectResponseOf<Self>) -> Option<Failure>;

    /// How many times the Runtime has already retried this request.
    fn retry_count(request: &RequestOf<Self>) -> Option<u32>;

    /// A response reporting `failure` for the request being handled.
    fn failure_response(failure: ProcessorFailure) -> ResponseOf<Self>;

    /// Handle one request.
    async fn handle(
        &self,
        request: RequestOf<Self>,
        execution_context: ExecutionContext,
    ) -> Result<ResponseOf<Self>, HandlerError>;
}

/// Handle `request`, turning a handler error into a retryable failure
/// response instead of failing the reverse call.
pub async fn catching_handle<E: EventProcessor>(
    processor: &E,
    request: RequestOf<E>,
    execution_context: ExecutionContext,
) -> ResponseOf<E> {
    let prior_retry_count = E::retry_count(&request).unwrap_or(0);
    match processor.handle(request, execution_context).await {
        Ok(response) => response,
        Err(error) => {
            let failure = ProcessorFailure::retryable(error.to_string(), prior_retry_count);
            tracing::warn!(
                kind = E::KIND,
                identifier = %processor.identifier(),
                error = %error,
                retry_count = prior_retry_count,
                retry_timeout_ms = failure.retry_timeout.as_millis() as u64,
                "processing failed, asking the runtime to retry"
            );
            E::failure_response(failure)
        }
    }
}

struct CatchingHandler<'a, E>(&'a E);

#[tonic::async_trait]
impl<'a, E: EventProcessor> ReverseCallHandler<RequestOf<E>, ResponseOf<E>>
    for CatchingHandler<'a, E>
{
    async fn handle(
        &self,
        request: RequestOf<E>,
        execution_context: ExecutionContext,
    ) -> Result<ResponseOf<E>, HandlerError> {
        Ok(catching_handle(self.0, request, execution_context).await)
    }
}

/// Connects an [`EventProcessor`] to the Runtime and serves it.
pub struct EventProcessorRegistration<E: EventProcessor> {
    processor: Arc<E>,
    connection: Arc<dyn ReverseCallConnection<ClientMessageOf<E>, ServerMessageOf<E>>>,
    execution_context: ExecutionContext,
    config: ReverseCallConfig,
}

impl<E: EventProcessor> fmt::Debug for EventProcessorRegistration<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventProcessorRegistration")
            .field("kind", &E::KIND)
            .field("identifier", &self.processor.identifier())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<E: EventProcessor> EventProcessorRegistration<E> {
    /// Prepare the registration of `processor`.
    ///
    /// # Arguments
    ///
    /// * `processor` - The processor requests are dispatched to.
    /// * `connection` - Opens the duplex stream for each connect attempt.
    /// * `execution_context` - Sent with the registration; requests carry their own.
    /// * `config` - Ping interval requested from the Runtime.
    pub fn new(
        processor: Arc<E>,
        connection: Arc<dyn ReverseCallConnection<ClientMessageOf<E>, ServerMessageOf<E>>>,
        execution_context: ExecutionContext,
        config: ReverseCallConfig,
    ) -> Self {
        Self {
            processor,
            connection,
            execution_context,
            config,
        }
    }

    /// The processor being registered.
    pub fn processor(&self) -> &Arc<E> {
        &self.processor
    }

    /// Connect, register and serve until the reverse call ends.
    ///
    /// Returns `Ok(())` if the Runtime completes the call.
    ///
    /// # Errors
    ///
    /// [`EventProcessorError::RegistrationFailed`] if the Runtime refuses the
    /// registration, [`EventProcessorError::ReverseCall`] if the reverse call
    /// fails.
    pub async fn register_once(&self, cancellation: &Cancellation) -> Result<(), EventProcessorError> {
        let call = self.register(cancellation).await?;
        self.serve(call).await
    }

    /// Keep the processor registered until `cancellation` fires or `policy`
    /// gives up.
    ///
    /// Every failed cycle is passed to the policy, including the Runtime
    /// completing the call ([`EventProcessorError::ConnectionCompleted`]).
    /// The policy is reset whenever a registration succeeds, so a processor
    /// that served for a while starts its backoff afresh.
    ///
    /// Never returns successfully: the result is [`RetryError::Cancelled`]
    /// or [`RetryError::Exhausted`] with the last failure.
    pub async fn register_forever_with_policy<P: RetryPolicy>(
        &self,
        policy: P,
        cancellation: &Cancellation,
    ) -> RetryError<EventProcessorError> {
        let identifier = self.processor.identifier();
        let span = tracing::info_span!("register_forever", kind = E::KIND, %identifier);
        let result = retry_with_reset(policy, cancellation, |progress| async move {
            let call = self.register(cancellation).await?;
            progress.reset();
            self.serve(call).await?;
            Err::<Infallible, _>(EventProcessorError::ConnectionCompleted)
        })
        .instrument(span)
        .await;

        let error = match result {
            Ok(never) => match never {},
            Err(error) => error,
        };
        if let RetryError::Exhausted { attempts, source } = &error {
            tracing::error!(
                kind = E::KIND,
                %identifier,
                attempts,
                error = %source,
                "giving up on registration"
            );
        }
        error
    }

    async fn register(
        &self,
        cancellation: &Cancellation,
    ) -> Result<ReverseCall<E::Protocol>, EventProcessorError> {
        let identifier = self.processor.identifier();
        tracing::debug!(kind = E::KIND, %identifier, "registering");

        let client = ReverseCallClient::<E::Protocol>::new(
            Arc::clone(&self.connection),
            self.processor.registration_arguments(),
            self.execution_context.clone(),
            self.config.clone(),
            cancellation.clone(),
        );
        let (response, call) = client.connect().await?;
        if let Some(failure) = E::registration_failure(&response) {
            return Err(EventProcessorError::RegistrationFailed {
                kind: E::KIND,
                identifier,
                failure,
            });
        }

        tracing::info!(kind = E::KIND, %identifier, head_id = %call.head_id(), "registered");
        Ok(call)
    }

    async fn serve(&self, call: ReverseCall<E::Protocol>) -> Result<(), EventProcessorError> {
        call.serve(&CatchingHandler(&*self.processor)).await?;
        Ok(())
    }
}
