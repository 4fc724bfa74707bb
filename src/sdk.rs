//! The entry point: configure, connect, and hand out aggregates and event
//! handlers bound to one Runtime.
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use eventfold_sdk::{ClientBuilder, MicroserviceId, TenantId, Version};
//!
//! let client = ClientBuilder::new()
//!     .endpoint("http://127.0.0.1:50053")
//!     .microservice(MicroserviceId::new_random())
//!     .version(Version::new(1, 0, 0))
//!     .connect()
//!     .await?;
//! let handlers = client.start_event_handlers()?;
//! // ...
//! handlers.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tonic::transport::Endpoint;
use uuid::Uuid;

use crate::aggregate::AggregateState;
use crate::aggregate_operations::AggregateOf;
use crate::artifacts::{AggregateRootTypes, EventTypes};
use crate::auth::AccessToken;
use crate::cancellation::CancellationSource;
use crate::client::{EventHandlersConnection, RuntimeClient, RuntimeEventStore};
use crate::error::{ClientError, EventProcessorError, EventTypesError, RetryError};
use crate::event_handler::{EventHandler, EventHandlerBuilder};
use crate::event_processor::EventProcessorRegistration;
use crate::execution_context::{Environment, ExecutionContext, MicroserviceId, TenantId, Version};
use crate::proto;
use crate::retry::ExponentialBackoff;
use crate::reverse_call::{ReverseCallConfig, ReverseCallConnection};

/// Builder for a [`Client`].
///
/// Only the endpoint is required. Everything else has a default: the nil
/// microservice id, version 0.0.0, the development environment, a 5 second
/// ping interval and exponential reconnect backoff from 1 to 30 seconds.
pub struct ClientBuilder {
    endpoint: Option<String>,
    access_token: AccessToken,
    microservice_id: MicroserviceId,
    version: Version,
    environment: Environment,
    reverse_call: ReverseCallConfig,
    reconnect: ExponentialBackoff,
    event_types: EventTypes,
    aggregate_roots: AggregateRootTypes,
    event_handlers: Vec<EventHandlerBuilder>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            endpoint: None,
            access_token: AccessToken::default(),
            microservice_id: MicroserviceId::from_uuid(Uuid::nil()),
            version: Version::default(),
            environment: Environment::default(),
            reverse_call: ReverseCallConfig::default(),
            reconnect: ExponentialBackoff::default(),
            event_types: EventTypes::new(),
            aggregate_roots: AggregateRootTypes::new(),
            event_handlers: Vec::new(),
        }
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("endpoint", &self.endpoint)
            .field("microservice_id", &self.microservice_id)
            .field("version", &self.version)
            .field("environment", &self.environment)
            .field("reverse_call", &self.reverse_call)
            .field("reconnect", &self.reconnect)
            .field("event_handlers", &self.event_handlers.len())
            .finish_non_exhaustive()
    }
}

impl ClientBuilder {
    /// A builder with every setting at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// The Runtime's gRPC endpoint, e.g. `"http://127.0.0.1:50053"`.
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    /// Authenticate every call with `token`. Keep a clone to rotate it.
    pub fn access_token(mut self, token: AccessToken) -> Self {
        self.access_token = token;
        self
    }

    /// The microservice every call is made on behalf of.
    pub fn microservice(mut self, microservice_id: MicroserviceId) -> Self {
        self.microservice_id = microservice_id;
        self
    }

    /// Version of this microservice, sent in the execution context.
    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// How often the Runtime should ping event handler connections.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.reverse_call.ping_interval = interval;
        self
    }

    /// Backoff between event handler reconnects.
    pub fn reconnect(mut self, backoff: ExponentialBackoff) -> Self {
        self.reconnect = backoff;
        self
    }

    /// The registry of event types used by aggregates and event handlers.
    pub fn event_types(mut self, event_types: EventTypes) -> Self {
        self.event_types = event_types;
        self
    }

    /// The registry mapping aggregate state types to aggregate root ids.
    pub fn aggregate_roots(mut self, aggregate_roots: AggregateRootTypes) -> Self {
        self.aggregate_roots = aggregate_roots;
        self
    }

    /// Register an event handler. It is built against the event types when
    /// the client connects.
    pub fn event_handler(mut self, handler: EventHandlerBuilder) -> Self {
        self.event_handlers.push(handler);
        self
    }

    /// Connect to the Runtime.
    ///
    /// # Errors
    ///
    /// - [`ClientError::MissingEndpoint`] if no endpoint was set.
    /// - [`ClientError::EventTypes`] if an event handler cannot be built.
    /// - [`ClientError::Transport`] if the Runtime cannot be reached.
    pub async fn connect(self) -> Result<Client, ClientError> {
        let (endpoint, parts) = self.into_parts()?;
        let channel = endpoint.connect().await?;
        tracing::info!(
            microservice_id = %parts.execution_context.microservice_id(),
            "connected to runtime"
        );
        Ok(parts.into_client(channel))
    }

    /// Like [`connect`](ClientBuilder::connect), but the connection is made
    /// on first use so the Runtime may start later.
    pub fn connect_lazy(self) -> Result<Client, ClientError> {
        let (endpoint, parts) = self.into_parts()?;
        Ok(parts.into_client(endpoint.connect_lazy()))
    }

    fn into_parts(self) -> Result<(Endpoint, ClientParts), ClientError> {
        let url = self.endpoint.ok_or(ClientError::MissingEndpoint)?;
        let endpoint = Endpoint::from_shared(url)?;

        let event_handlers = self
            .event_handlers
            .into_iter()
            .map(|builder| builder.build(&self.event_types).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let parts = ClientParts {
            access_token: self.access_token,
            execution_context: ExecutionContext::for_microservice(
                self.microservice_id,
                self.version,
                self.environment,
            ),
            reverse_call: self.reverse_call,
            reconnect: self.reconnect,
            event_types: Arc::new(self.event_types),
            aggregate_roots: Arc::new(self.aggregate_roots),
            event_handlers,
        };
        Ok((endpoint, parts))
    }
}

struct ClientParts {
    access_token: AccessToken,
    execution_context: ExecutionContext,
    reverse_call: ReverseCallConfig,
    reconnect: ExponentialBackoff,
    event_types: Arc<EventTypes>,
    aggregate_roots: Arc<AggregateRootTypes>,
    event_handlers: Vec<Arc<EventHandler>>,
}

impl ClientParts {
    fn into_client(self, channel: tonic::transport::Channel) -> Client {
        Client {
            runtime: RuntimeClient::new(channel, &self.access_token),
            execution_context: self.execution_context,
            reverse_call: self.reverse_call,
            reconnect: self.reconnect,
            event_types: self.event_types,
            aggregate_roots: self.aggregate_roots,
            pending_handlers: Mutex::new(Some(self.event_handlers)),
        }
    }
}

/// A client connected to one Runtime.
pub struct Client {
    runtime: RuntimeClient,
    execution_context: ExecutionContext,
    reverse_call: ReverseCallConfig,
    reconnect: ExponentialBackoff,
    event_types: Arc<EventTypes>,
    aggregate_roots: Arc<AggregateRootTypes>,
    pending_handlers: Mutex<Option<Vec<Arc<EventHandler>>>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("execution_context", &self.execution_context)
            .field("reverse_call", &self.reverse_call)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// The context of this microservice, in the system tenant.
    pub fn execution_context(&self) -> &ExecutionContext {
        &self.execution_context
    }

    /// The event types registry the client was built with.
    pub fn event_types(&self) -> &Arc<EventTypes> {
        &self.event_types
    }

    /// Direct access to the Runtime's gRPC services.
    pub fn runtime(&self) -> &RuntimeClient {
        &self.runtime
    }

    /// The event store acting for `tenant`.
    pub fn event_store(&self, tenant: TenantId) -> RuntimeEventStore {
        RuntimeEventStore::new(
            self.runtime.clone(),
            self.execution_context.for_tenant(tenant),
        )
    }

    /// Aggregates of type `S` in `tenant`.
    ///
    /// # Errors
    ///
    /// [`EventTypesError::NotAssociated`] if `S` has no aggregate root id.
    pub fn aggregate_of<S: AggregateState>(
        &self,
        tenant: TenantId,
    ) -> Result<AggregateOf<S>, EventTypesError> {
        let aggregate_root_id = self.aggregate_roots.get_for::<S>()?;
        Ok(AggregateOf::new(
            Arc::new(self.event_store(tenant)),
            Arc::clone(&self.event_types),
            aggregate_root_id,
        ))
    }

    /// Register every event handler with the Runtime, each on its own task,
    /// reconnecting with the configured backoff until shut down.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`ClientError::AlreadyStarted`] on every call after the first.
    pub fn start_event_handlers(&self) -> Result<EventHandlersHandle, ClientError> {
        let handlers = self
            .pending_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ClientError::AlreadyStarted)?;

        let shutdown = CancellationSource::new();
        let connection: Arc<
            dyn ReverseCallConnection<
                    proto::EventHandlerClientMessage,
                    proto::EventHandlerRuntimeMessage,
                >,
        > = Arc::new(EventHandlersConnection::new(self.runtime.clone()));
        let tasks = handlers
            .into_iter()
            .map(|handler| {
                let registration = EventProcessorRegistration::new(
                    handler,
                    Arc::clone(&connection),
                    self.execution_context.clone(),
                    self.reverse_call.clone(),
                );
                let policy = self.reconnect.clone();
                let cancellation = shutdown.token();
                tokio::spawn(async move {
                    registration
                        .register_forever_with_policy(policy, &cancellation)
                        .await
                })
            })
            .collect::<Vec<_>>();
        tracing::info!(count = tasks.len(), "started event handlers");

        Ok(EventHandlersHandle {
            shutdown,
            tasks: tokio::sync::Mutex::new(tasks),
        })
    }
}

/// Running event handlers. Dropping the handle does not stop them; call
/// [`shutdown`](EventHandlersHandle::shutdown).
pub struct EventHandlersHandle {
    shutdown: CancellationSource,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<RetryError<EventProcessorError>>>>,
}

impl fmt::Debug for EventHandlersHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlersHandle")
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl EventHandlersHandle {
    /// Stop every event handler and wait for its task to end.
    ///
    /// Calling `shutdown` more than once is safe; later calls return
    /// `Ok(())` straight away.
    ///
    /// # Errors
    ///
    /// [`ClientError::TaskFailed`] if a handler task panicked.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            match task.await? {
                RetryError::Cancelled => {}
                RetryError::Exhausted { attempts, source } => {
                    tracing::error!(attempts, error = %source, "event handler had already stopped");
                }
            }
        }
        tracing::info!("event handlers stopped");
        Ok(())
    }
}
