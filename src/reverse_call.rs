//! Client side of the Runtime's reverse-call protocol.
//!
//! A reverse call is a long-lived bidirectional stream on which the
//! *Runtime* sends requests and the *client* answers them. The lifecycle is
//! expressed as two types:
//!
//! 1. [`ReverseCallClient::connect`] opens the stream, sends the connect
//!    arguments and waits for the Runtime's connect response.
//! 2. The returned [`ReverseCall`] is then [`serve`](ReverseCall::serve)d:
//!    pings are answered with pongs, requests are passed to a handler one at
//!    a time and the responses are written back tagged with the request's
//!    call id.
//!
//! The Runtime must send *something* (a ping at least) every ping interval.
//! If nothing arrives within three intervals the call fails with
//! [`ReverseCallError::PingTimeout`]. However the call ends, the
//! [`Cancellation`] handed to the transport fires so it can tear the stream
//! down.
//!
//! Concrete reverse calls plug in through [`ReverseCallProtocol`], which
//! knows how to wrap and unwrap the envelope messages of one service.

use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::Instrument;
use uuid::Uuid;

use crate::cancellation::{Cancellation, CancellationSource};
use crate::error::ReverseCallError;
use crate::execution_context::ExecutionContext;
use crate::proto;

/// Default interval at which the Runtime is asked to ping.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Missed ping intervals tolerated before the call is considered dead.
const PING_TIMEOUT_FACTOR: u32 = 3;

/// Capacity of the outgoing message buffer.
const OUTGOING_BUFFER: usize = 32;

/// Configuration for reverse calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseCallConfig {
    /// How often the Runtime should ping. Defaults to 5 seconds.
    pub ping_interval: Duration,
}

impl Default for ReverseCallConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

impl ReverseCallConfig {
    /// How long to wait for any message before giving up.
    pub fn ping_timeout(&self) -> Duration {
        self.ping_interval.saturating_mul(PING_TIMEOUT_FACTOR)
    }
}

/// Call context attached to the connect arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ReverseCallArgumentsContext {
    /// Random id of this connection.
    pub head_id: Uuid,
    pub ping_interval: Duration,
    pub execution_context: ExecutionContext,
}

impl ReverseCallArgumentsContext {
    pub(crate) fn to_proto(&self) -> proto::ReverseCallArgumentsContext {
        proto::ReverseCallArgumentsContext {
            head_id: self.head_id.to_string(),
            ping_interval: Some(proto::duration(self.ping_interval)),
            execution_context: Some(self.execution_context.to_proto()),
        }
    }
}

/// Call context carried by a request.
#[derive(Debug, Clone, PartialEq)]
pub struct ReverseCallRequestContext {
    /// Id the response must be tagged with.
    pub call_id: Uuid,
    /// Context the Runtime wants the request handled in.
    pub execution_context: Option<ExecutionContext>,
}

impl ReverseCallRequestContext {
    /// Decode a wire request context. Returns `None` if the call id is not a
    /// valid UUID. An undecodable execution context decodes as absent.
    pub(crate) fn from_proto(context: &proto::ReverseCallRequestContext) -> Option<Self> {
        Some(Self {
            call_id: context.call_id.parse().ok()?,
            execution_context: context
                .execution_context
                .as_ref()
                .and_then(ExecutionContext::from_proto),
        })
    }
}

/// Call context attached to a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReverseCallResponseContext {
    pub call_id: Uuid,
}

impl ReverseCallResponseContext {
    pub(crate) fn to_proto(self) -> proto::ReverseCallResponseContext {
        proto::ReverseCallResponseContext {
            call_id: self.call_id.to_string(),
        }
    }
}

/// What a server message turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage<C, R> {
    ConnectResponse(C),
    Request(R),
    Ping,
    /// Anything else; logged and dropped.
    Unknown,
}

/// The envelope conversions of one reverse-call service.
pub trait ReverseCallProtocol: Send + Sync + 'static {
    /// Messages written by the client.
    type ClientMessage: Send + 'static;
    /// Messages written by the Runtime.
    type ServerMessage: Send + 'static;
    type ConnectArguments: Send + 'static;
    type ConnectResponse: Send + 'static;
    type Request: Send + 'static;
    type Response: Send + 'static;

    fn with_connect_arguments(arguments: Self::ConnectArguments) -> Self::ClientMessage;
    fn with_response(response: Self::Response) -> Self::ClientMessage;
    fn pong() -> Self::ClientMessage;

    fn classify(
        message: Self::ServerMessage,
    ) -> ServerMessage<Self::ConnectResponse, Self::Request>;

    fn set_arguments_context(
        arguments: &mut Self::ConnectArguments,
        context: ReverseCallArgumentsContext,
    );
    /// `None` if the request carries no (valid) call context.
    fn request_context(request: &Self::Request) -> Option<ReverseCallRequestContext>;
    fn set_response_context(response: &mut Self::Response, context: ReverseCallResponseContext);
}

/// Messages arriving from the Runtime.
pub type ServerStream<M> = Pin<Box<dyn Stream<Item = Result<M, tonic::Status>> + Send>>;

/// Opens the duplex stream of a reverse call.
#[tonic::async_trait]
pub trait ReverseCallConnection<C, S>: Send + Sync
where
    C: Send + 'static,
    S: Send + 'static,
{
    /// Start the call. `outgoing` yields every message the client writes;
    /// `cancellation` fires once the client is done with the stream.
    async fn establish(
        &self,
        outgoing: ReceiverStream<C>,
        cancellation: Cancellation,
    ) -> Result<ServerStream<S>, tonic::Status>;
}

/// Error type request handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handles the requests of a reverse call.
#[tonic::async_trait]
pub trait ReverseCallHandler<Req, Resp>: Send + Sync
where
    Req: Send + 'static,
{
    /// Handle one request in the given execution context. An error ends the
    /// reverse call.
    async fn handle(
        &self,
        request: Req,
        execution_context: ExecutionContext,
    ) -> Result<Resp, HandlerError>;
}

/// Fires the wrapped source when dropped.
struct CancelOnDrop(CancellationSource);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// A reverse call that has not been connected yet.
pub struct ReverseCallClient<P: ReverseCallProtocol> {
    connection: Arc<dyn ReverseCallConnection<P::ClientMessage, P::ServerMessage>>,
    arguments: P::ConnectArguments,
    execution_context: ExecutionContext,
    config: ReverseCallConfig,
    cancellation: Cancellation,
}

impl<P: ReverseCallProtocol> fmt::Debug for ReverseCallClient<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReverseCallClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<P: ReverseCallProtocol> ReverseCallClient<P> {
    /// Prepare a reverse call. Nothing is sent until [`connect`](ReverseCallClient::connect).
    ///
    /// # Arguments
    ///
    /// * `connection` - Opens the duplex stream.
    /// * `arguments` - Connect arguments; their call context is filled in on connect.
    /// * `execution_context` - Base context for the call and for every request.
    /// * `config` - Ping interval requested from the Runtime.
    /// * `cancellation` - Ends the call, during the handshake or while serving.
    pub fn new(
        connection: Arc<dyn ReverseCallConnection<P::ClientMessage, P::ServerMessage>>,
        arguments: P::ConnectArguments,
        execution_context: ExecutionContext,
        config: ReverseCallConfig,
        cancellation: Cancellation,
    ) -> Self {
        Self {
            connection,
            arguments,
            execution_context,
            config,
            cancellation,
        }
    }

    /// Open the stream and perform the handshake.
    ///
    /// Returns the Runtime's connect response together with the connected
    /// call, ready to be served.
    ///
    /// # Errors
    ///
    /// - [`ReverseCallError::DidNotReceiveConnectResponse`] if the first
    ///   message is not a connect response or the stream ends first.
    /// - [`ReverseCallError::PingTimeout`] if nothing arrives in time.
    /// - [`ReverseCallError::Transport`] if the stream cannot be opened or fails.
    /// - [`ReverseCallError::Cancelled`] if the cancellation fires.
    pub async fn connect(
        self,
    ) -> Result<(P::ConnectResponse, ReverseCall<P>), ReverseCallError> {
        let head_id = Uuid::new_v4();
        let span = tracing::debug_span!("reverse_call", %head_id);
        self.handshake(head_id).instrument(span).await
    }

    async fn handshake(
        self,
        head_id: Uuid,
    ) -> Result<(P::ConnectResponse, ReverseCall<P>), ReverseCallError> {
        if self.cancellation.is_cancelled() {
            return Err(ReverseCallError::Cancelled);
        }

        let mut arguments = self.arguments;
        P::set_arguments_context(
            &mut arguments,
            ReverseCallArgumentsContext {
                head_id,
                ping_interval: self.config.ping_interval,
                execution_context: self.execution_context.clone(),
            },
        );

        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_BUFFER);
        outgoing
            .send(P::with_connect_arguments(arguments))
            .await
            .map_err(|_| ReverseCallError::ConnectionClosed)?;

        let teardown = CancelOnDrop(CancellationSource::new());
        let connection_cancellation = self.cancellation.or(&teardown.0.token());
        let mut incoming = self
            .connection
            .establish(ReceiverStream::new(outgoing_rx), connection_cancellation)
            .await?;
        tracing::debug!("reverse call established, waiting for connect response");

        let ping_timeout = self.config.ping_timeout();
        let first = tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => return Err(ReverseCallError::Cancelled),
            first = tokio::time::timeout(ping_timeout, incoming.next()) => first,
        };
        let message = match first {
            Err(_elapsed) => return Err(ReverseCallError::PingTimeout(ping_timeout)),
            Ok(None) => return Err(ReverseCallError::DidNotReceiveConnectResponse),
            Ok(Some(Err(status))) => return Err(ReverseCallError::Transport(status)),
            Ok(Some(Ok(message))) => message,
        };
        let ServerMessage::ConnectResponse(response) = P::classify(message) else {
            return Err(ReverseCallError::DidNotReceiveConnectResponse);
        };
        tracing::debug!("received connect response");

        Ok((
            response,
            ReverseCall {
                outgoing,
                incoming,
                _teardown: teardown,
                cancellation: self.cancellation,
                execution_context: self.execution_context,
                ping_timeout,
                head_id,
                _protocol: PhantomData,
            },
        ))
    }
}

/// A connected reverse call.
///
/// Dropping it, or [`serve`](ReverseCall::serve) returning, closes the
/// outgoing stream and fires the transport's cancellation.
pub struct ReverseCall<P: ReverseCallProtocol> {
    outgoing: mpsc::Sender<P::ClientMessage>,
    incoming: ServerStream<P::ServerMessage>,
    _teardown: CancelOnDrop,
    cancellation: Cancellation,
    execution_context: ExecutionContext,
    ping_timeout: Duration,
    head_id: Uuid,
    _protocol: PhantomData<fn() -> P>,
}

impl<P: ReverseCallProtocol> fmt::Debug for ReverseCall<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReverseCall")
            .field("head_id", &self.head_id)
            .field("ping_timeout", &self.ping_timeout)
            .finish_non_exhaustive()
    }
}

impl<P: ReverseCallProtocol> ReverseCall<P> {
    /// Random id identifying this connection to the Runtime.
    pub fn head_id(&self) -> Uuid {
        self.head_id
    }

    /// Answer pings and handle requests until the call ends.
    ///
    /// Requests are handled strictly one at a time, in arrival order.
    /// Returns `Ok(())` when the Runtime completes the stream.
    ///
    /// # Errors
    ///
    /// - [`ReverseCallError::PingTimeout`] if the Runtime goes quiet.
    /// - [`ReverseCallError::Transport`] if the stream fails.
    /// - [`ReverseCallError::Handler`] if the handler fails.
    /// - [`ReverseCallError::ConnectionClosed`] if responses can no longer be written.
    /// - [`ReverseCallError::Cancelled`] if the cancellation fires.
    pub async fn serve<H>(self, handler: &H) -> Result<(), ReverseCallError>
    where
        H: ReverseCallHandler<P::Request, P::Response> + ?Sized,
    {
        let span = tracing::debug_span!("reverse_call", head_id = %self.head_id);
        self.serve_inner(handler).instrument(span).await
    }

    async fn serve_inner<H>(self, handler: &H) -> Result<(), ReverseCallError>
    where
        H: ReverseCallHandler<P::Request, P::Response> + ?Sized,
    {
        let ReverseCall {
            outgoing,
            mut incoming,
            _teardown,
            cancellation,
            execution_context,
            ping_timeout,
            ..
        } = self;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancellation.cancelled() => return Err(ReverseCallError::Cancelled),
                next = tokio::time::timeout(ping_timeout, incoming.next()) => next,
            };
            let message = match next {
                Err(_elapsed) => {
                    tracing::warn!(
                        timeout_ms = ping_timeout.as_millis() as u64,
                        "no message from the runtime within the ping timeout"
                    );
                    return Err(ReverseCallError::PingTimeout(ping_timeout));
                }
                Ok(None) => {
                    tracing::debug!("runtime completed the reverse call");
                    return Ok(());
                }
                Ok(Some(Err(status))) => return Err(ReverseCallError::Transport(status)),
                Ok(Some(Ok(message))) => message,
            };

            match P::classify(message) {
                ServerMessage::Ping => send(&outgoing, P::pong()).await?,
                ServerMessage::Request(request) => {
                    let Some(response) =
                        handle_request::<P, H>(request, &execution_context, handler).await?
                    else {
                        continue;
                    };
                    send(&outgoing, P::with_response(response)).await?;
                }
                ServerMessage::ConnectResponse(_) => {
                    tracing::warn!("received a second connect response, ignoring it");
                }
                ServerMessage::Unknown => {
                    tracing::warn!("received an unexpected message, ignoring it");
                }
            }
        }
    }
}

/// Handle one request in the execution context it asks for.
///
/// Returns `None` for requests that cannot be answered because they lack a
/// call context or an execution context.
async fn handle_request<P, H>(
    request: P::Request,
    base: &ExecutionContext,
    handler: &H,
) -> Result<Option<P::Response>, ReverseCallError>
where
    P: ReverseCallProtocol,
    H: ReverseCallHandler<P::Request, P::Response> + ?Sized,
{
    let Some(context) = P::request_context(&request) else {
        tracing::warn!("received a request without a call context, ignoring it");
        return Ok(None);
    };
    let Some(requested) = context.execution_context else {
        tracing::warn!(
            call_id = %context.call_id,
            "received a request without an execution context, ignoring it"
        );
        return Ok(None);
    };

    let execution_context = base
        .for_tenant(requested.tenant_id())
        .for_claims(requested.claims().clone());
    tracing::debug!(
        call_id = %context.call_id,
        tenant_id = %requested.tenant_id(),
        "handling request"
    );

    let mut response = handler
        .handle(request, execution_context)
        .await
        .map_err(ReverseCallError::Handler)?;
    P::set_response_context(
        &mut response,
        ReverseCallResponseContext {
            call_id: context.call_id,
        },
    );
    Ok(Some(response))
}

async fn send<M>(outgoing: &mpsc::Sender<M>, message: M) -> Result<(), ReverseCallError> {
    outgoing
        .send(message)
        .await
        .map_err(|_| ReverseCallError::ConnectionClosed)
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;
    use crate::execution_context::TenantId;

    fn client(
        connection: ScriptedConnection,
        ping_interval: Duration,
        cancellation: Cancellation,
    ) -> ReverseCallClient<TestProtocol> {
        ReverseCallClient::new(
            Arc::new(connection),
            TestArguments::named("kitchen"),
            ExecutionContext::default(),
            ReverseCallConfig { ping_interval },
            cancellation,
        )
    }

    #[test]
    fn ping_timeout_is_three_intervals() {
        assert_eq!(
            ReverseCallConfig::default().ping_timeout(),
            Duration::from_secs(15)
        );
    }

    #[tokio::test]
    async fn handshake_then_request_then_completion() {
        let (connection, server, mut script) = ScriptedConnection::single();
        let tenant = TenantId::new_random();
        let (call_id, request) = request_for(tenant, "taco?");
        server.send(Ok(connected())).await.unwrap();
        server.send(Ok(request)).await.unwrap();
        drop(server);

        let (response, call) = client(connection, Duration::from_secs(1), Cancellation::none())
            .connect()
            .await
            .expect("handshake should succeed");
        assert_eq!(response, TestConnectResponse { failure: None });

        let handler = EchoHandler::default();
        call.serve(&handler).await.expect("serve completes cleanly");
        assert_eq!(*handler.tenants.lock().unwrap(), vec![tenant]);

        let established = script.next_call().await;
        let sent: Vec<_> = established.outgoing.collect().await;
        assert_eq!(sent.len(), 2, "connect arguments and exactly one response");

        match &sent[0] {
            TestClientMessage::Connect(arguments) => {
                let context = arguments.context.as_ref().expect("arguments context set");
                assert_eq!(context.ping_interval, Duration::from_secs(1));
                assert_eq!(arguments.name, "kitchen");
            }
            other => panic!("expected connect arguments first, got: {other:?}"),
        }
        match &sent[1] {
            TestClientMessage::Response(response) => {
                assert_eq!(response.context, Some(ReverseCallResponseContext { call_id }));
                assert_eq!(response.payload, "echo: taco?");
            }
            other => panic!("expected a response, got: {other:?}"),
        }
        assert!(established.cancellation.is_cancelled());
    }

    #[tokio::test]
    async fn pings_are_answered_with_pongs() {
        let (connection, server, mut script) = ScriptedConnection::single();
        server.send(Ok(connected())).await.unwrap();
        server.send(Ok(TestServerMessage::Ping)).await.unwrap();
        server.send(Ok(TestServerMessage::Garbage)).await.unwrap();
        server.send(Ok(TestServerMessage::Ping)).await.unwrap();
        drop(server);

        let (_, call) = client(connection, Duration::from_secs(1), Cancellation::none())
            .connect()
            .await
            .unwrap();
        call.serve(&EchoHandler::default()).await.unwrap();

        let sent: Vec<_> = script.next_call().await.outgoing.collect().await;
        assert_eq!(
            sent[1..].to_vec(),
            vec![TestClientMessage::Pong, TestClientMessage::Pong]
        );
    }

    #[tokio::test]
    async fn silence_fails_with_ping_timeout_and_cancels_the_channel() {
        let (connection, server, mut script) = ScriptedConnection::single();
        server.send(Ok(connected())).await.unwrap();

        let (_, call) = client(connection, Duration::from_millis(20), Cancellation::none())
            .connect()
            .await
            .unwrap();
        let established = script.next_call().await;
        assert!(!established.cancellation.is_cancelled());

        let started = tokio::time::Instant::now();
        let err = call.serve(&EchoHandler::default()).await.unwrap_err();
        assert!(matches!(err, ReverseCallError::PingTimeout(timeout) if timeout == Duration::from_millis(60)));
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert!(established.cancellation.is_cancelled());
        drop(server);
    }

    #[tokio::test]
    async fn missing_connect_response_times_out_and_cancels_the_channel() {
        let (connection, server, mut script) = ScriptedConnection::single();

        let started = tokio::time::Instant::now();
        let err = client(connection, Duration::from_millis(20), Cancellation::none())
            .connect()
            .await
            .unwrap_err();
        assert!(matches!(err, ReverseCallError::PingTimeout(timeout) if timeout == Duration::from_millis(60)));
        assert!(started.elapsed() >= Duration::from_millis(60));

        let established = script.next_call().await;
        assert!(established.cancellation.is_cancelled());
        drop(server);
    }

    #[tokio::test]
    async fn first_message_must_be_connect_response() {
        let (connection, server, _script) = ScriptedConnection::single();
        server.send(Ok(TestServerMessage::Ping)).await.unwrap();

        let err = client(connection, Duration::from_secs(1), Cancellation::none())
            .connect()
            .await
            .unwrap_err();
        assert!(matches!(err, ReverseCallError::DidNotReceiveConnectResponse));
    }

    #[tokio::test]
    async fn stream_ending_before_handshake_fails() {
        let (connection, server, mut script) = ScriptedConnection::single();
        drop(server);

        let err = client(connection, Duration::from_secs(1), Cancellation::none())
            .connect()
            .await
            .unwrap_err();
        assert!(matches!(err, ReverseCallError::DidNotReceiveConnectResponse));
        assert!(script.next_call().await.cancellation.is_cancelled());
    }

    #[tokio::test]
    async fn requests_without_execution_context_are_dropped() {
        let (connection, server, mut script) = ScriptedConnection::single();
        server.send(Ok(connected())).await.unwrap();
        server
            .send(Ok(TestServerMessage::Request(TestRequest {
                context: Some(ReverseCallRequestContext {
                    call_id: Uuid::new_v4(),
                    execution_context: None,
                }),
                payload: "lost".into(),
                retry_count: None,
            })))
            .await
            .unwrap();
        server
            .send(Ok(TestServerMessage::Request(TestRequest {
                context: None,
                payload: "also lost".into(),
                retry_count: None,
            })))
            .await
            .unwrap();
        let (call_id, request) = request_for(TenantId::DEVELOPMENT, "kept");
        server.send(Ok(request)).await.unwrap();
        drop(server);

        let (_, call) = client(connection, Duration::from_secs(1), Cancellation::none())
            .connect()
            .await
            .unwrap();
        call.serve(&EchoHandler::default()).await.unwrap();

        let sent: Vec<_> = script.next_call().await.outgoing.collect().await;
        assert_eq!(sent.len(), 2);
        assert!(matches!(
            &sent[1],
            TestClientMessage::Response(response)
                if response.context == Some(ReverseCallResponseContext { call_id })
        ));
    }

    #[tokio::test]
    async fn handler_error_terminates_the_call() {
        struct Failing;

        #[tonic::async_trait]
        impl ReverseCallHandler<TestRequest, TestResponse> for Failing {
            async fn handle(
                &self,
                _request: TestRequest,
                _execution_context: ExecutionContext,
            ) -> Result<TestResponse, HandlerError> {
                Err("kitchen on fire".into())
            }
        }

        let (connection, server, _script) = ScriptedConnection::single();
        server.send(Ok(connected())).await.unwrap();
        let (_, request) = request_for(TenantId::DEVELOPMENT, "taco?");
        server.send(Ok(request)).await.unwrap();

        let (_, call) = client(connection, Duration::from_secs(1), Cancellation::none())
            .connect()
            .await
            .unwrap();
        let err = call.serve(&Failing).await.unwrap_err();
        assert!(matches!(err, ReverseCallError::Handler(_)));
        assert!(err.to_string().contains("kitchen on fire"));
    }

    #[tokio::test]
    async fn transport_error_terminates_the_call() {
        let (connection, server, _script) = ScriptedConnection::single();
        server.send(Ok(connected())).await.unwrap();
        server
            .send(Err(tonic::Status::internal("boom")))
            .await
            .unwrap();

        let (_, call) = client(connection, Duration::from_secs(1), Cancellation::none())
            .connect()
            .await
            .unwrap();
        let err = call.serve(&EchoHandler::default()).await.unwrap_err();
        assert!(matches!(err, ReverseCallError::Transport(status) if status.message() == "boom"));
    }

    #[tokio::test]
    async fn outer_cancellation_stops_serving() {
        let (connection, server, mut script) = ScriptedConnection::single();
        server.send(Ok(connected())).await.unwrap();
        let source = CancellationSource::new();

        let (_, call) = client(connection, Duration::from_secs(10), source.token())
            .connect()
            .await
            .unwrap();
        let established = script.next_call().await;

        let serving = tokio::spawn(async move { call.serve(&EchoHandler::default()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        source.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .expect("serve should stop promptly")
            .expect("task should not panic");
        assert!(matches!(result, Err(ReverseCallError::Cancelled)));
        assert!(established.cancellation.is_cancelled());
        drop(server);
    }

    #[tokio::test]
    async fn already_cancelled_never_establishes() {
        let (connection, _server, _script) = ScriptedConnection::single();
        let source = CancellationSource::new();
        source.cancel();
        let connection = Arc::new(connection);
        let shared: Arc<dyn ReverseCallConnection<TestClientMessage, TestServerMessage>> =
            connection.clone();

        let err = ReverseCallClient::<TestProtocol>::new(
            shared,
            TestArguments::named("kitchen"),
            ExecutionContext::default(),
            ReverseCallConfig::default(),
            source.token(),
        )
        .connect()
        .await
        .unwrap_err();
        assert!(matches!(err, ReverseCallError::Cancelled));
        assert_eq!(connection.establish_count(), 0);
    }

    #[test]
    fn request_context_from_proto_requires_valid_call_id() {
        let valid = proto::ReverseCallRequestContext {
            call_id: Uuid::nil().to_string(),
            execution_context: Some(ExecutionContext::default().to_proto()),
        };
        let decoded = ReverseCallRequestContext::from_proto(&valid).unwrap();
        assert_eq!(decoded.call_id, Uuid::nil());
        assert!(decoded.execution_context.is_some());

        let invalid = proto::ReverseCallRequestContext {
            call_id: "call-1".into(),
            execution_context: None,
        };
        assert!(ReverseCallRequestContext::from_proto(&invalid).is_none());
    }

    #[test]
    fn arguments_context_splits_ping_interval() {
        let context = ReverseCallArgumentsContext {
            head_id: Uuid::nil(),
            ping_interval: Duration::from_millis(2_500),
            execution_context: ExecutionContext::default(),
        };
        let wire = context.to_proto();
        let interval = wire.ping_interval.unwrap();
        assert_eq!((interval.seconds, interval.nanos), (2, 500_000_000));
    }
}
