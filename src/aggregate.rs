//! Aggregate roots: event-sourced entities rebuilt from their history.
//!
//! An [`AggregateRoot<S>`] owns a state `S` that is mutated only through
//! `on` handlers declared by [`AggregateState::on_handlers`]. New events are
//! recorded with the `apply*` methods; history fetched from the event store
//! is replayed with [`AggregateRoot::re_apply`].

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::artifacts::{AggregateRootId, EventSourceId, EventType, EventTypes, PayloadType};
use crate::error::AggregateRootError;
use crate::event::{AggregateRootVersion, CommittedAggregateEvents};

/// The state of an aggregate root.
///
/// The implementing type is the aggregate's in-memory state. It starts from
/// [`Default`] and changes only through the handlers registered in
/// [`on_handlers`](AggregateState::on_handlers).
///
/// # Examples
///
/// ```
/// use eventfold_sdk::{AggregateState, OnHandlers};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct DishPrepared { dish: String }
///
/// #[derive(Default)]
/// struct Kitchen { dishes: Vec<String> }
///
/// impl AggregateState for Kitchen {
///     fn on_handlers(handlers: &mut OnHandlers<Self>) {
///         handlers.on(|kitchen: &mut Kitchen, event: DishPrepared| {
///             kitchen.dishes.push(event.dish);
///         });
///     }
/// }
/// ```
pub trait AggregateState: Default + Send + 'static {
    /// Declare how events change the state. Declares nothing by default.
    fn on_handlers(handlers: &mut OnHandlers<Self>) {
        let _ = handlers;
    }
}

type OnMethod<S> = Box<dyn Fn(&mut S, &Value) -> serde_json::Result<()> + Send + Sync>;

/// Which events an `on` handler applies to.
enum OnTarget {
    /// Events whose type is associated with this Rust type.
    Payload(PayloadType),
    /// Events of exactly this event type.
    EventType(EventType),
}

struct OnHandler<S> {
    target: OnTarget,
    method: OnMethod<S>,
}

/// The `on` handlers of an aggregate state type.
///
/// Handlers are matched against an event in declaration order, on the event
/// type id alone. A handler declared with [`on`](OnHandlers::on) needs its
/// Rust type associated in the [`EventTypes`] registry. An unassociated
/// handler never matches; it only surfaces as an error when no other handler
/// matches the event, so one misconfigured handler does not block the rest.
pub struct OnHandlers<S> {
    handlers: Vec<OnHandler<S>>,
}

impl<S> Default for OnHandlers<S> {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }
}

impl<S: 'static> OnHandlers<S> {
    /// Handle events whose event type is associated with `E`.
    ///
    /// The event content is decoded into `E` before `method` runs.
    pub fn on<E, F>(&mut self, method: F) -> &mut Self
    where
        E: DeserializeOwned + 'static,
        F: Fn(&mut S, E) + Send + Sync + 'static,
    {
        self.push(OnTarget::Payload(PayloadType::of::<E>()), method)
    }

    /// Handle events of exactly `event_type`, decoding the content into `E`.
    pub fn on_event_type<E, F>(&mut self, event_type: EventType, method: F) -> &mut Self
    where
        E: DeserializeOwned + 'static,
        F: Fn(&mut S, E) + Send + Sync + 'static,
    {
        self.push(OnTarget::EventType(event_type), method)
    }

    fn push<E, F>(&mut self, target: OnTarget, method: F) -> &mut Self
    where
        E: DeserializeOwned + 'static,
        F: Fn(&mut S, E) + Send + Sync + 'static,
    {
        self.handlers.push(OnHandler {
            target,
            method: Box::new(move |state: &mut S, content: &Value| {
                let event = E::deserialize(content)?;
                method(state, event);
                Ok(())
            }),
        });
        self
    }

    /// Returns `true` if no handler has been declared. Such an aggregate
    /// records events without looking up their types.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Number of declared handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// The handler declared for `event_type`, matched on the event type id.
    ///
    /// Handlers whose Rust type has no event type are skipped; the first such
    /// lookup error is returned only if nothing matched.
    fn find(
        &self,
        event_type: &EventType,
        event_types: &EventTypes,
    ) -> Result<Option<&OnMethod<S>>, AggregateRootError> {
        let mut unresolved = None;
        for handler in &self.handlers {
            let declared = match &handler.target {
                OnTarget::Payload(payload) => match event_types.get_for_payload(payload) {
                    Ok(declared) => declared,
                    Err(error) => {
                        unresolved.get_or_insert(error);
                        continue;
                    }
                },
                OnTarget::EventType(declared) => declared.clone(),
            };
            if declared.id() == event_type.id() {
                return Ok(Some(&handler.method));
            }
        }
        match unresolved {
            Some(error) => Err(error.into()),
            None => Ok(None),
        }
    }
}

/// An event applied during the current unit of work, not yet committed.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedEvent {
    content: Value,
    payload_type: PayloadType,
    event_type: Option<EventType>,
    is_public: bool,
}

impl AppliedEvent {
    /// The event serialized to JSON, as it will be committed.
    pub fn content(&self) -> &Value {
        &self.content
    }

    /// Rust type of the applied payload.
    pub fn payload_type(&self) -> &PayloadType {
        &self.payload_type
    }

    /// The event type given explicitly when applying, if any.
    pub fn event_type(&self) -> Option<&EventType> {
        self.event_type.as_ref()
    }

    /// Whether the event is committed as public.
    pub fn is_public(&self) -> bool {
        self.is_public
    }
}

/// An event-sourced entity identified by an event source id and an
/// aggregate root id.
///
/// The version counts every event replayed or applied: after replaying N
/// events and applying M it is N + M.
pub struct AggregateRoot<S: AggregateState> {
    event_source_id: EventSourceId,
    aggregate_root_id: Option<AggregateRootId>,
    event_types: Option<Arc<EventTypes>>,
    version: AggregateRootVersion,
    applied_events: Vec<AppliedEvent>,
    handlers: OnHandlers<S>,
    state: S,
}

impl<S: AggregateState> fmt::Debug for AggregateRoot<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateRoot")
            .field("event_source_id", &self.event_source_id)
            .field("aggregate_root_id", &self.aggregate_root_id)
            .field("version", &self.version)
            .field("applied_events", &self.applied_events.len())
            .finish_non_exhaustive()
    }
}

impl<S: AggregateState> AggregateRoot<S> {
    /// A fresh aggregate root at version 0 with default state.
    pub fn new(event_source_id: impl Into<EventSourceId>) -> Self {
        let mut handlers = OnHandlers::default();
        S::on_handlers(&mut handlers);
        Self {
            event_source_id: event_source_id.into(),
            aggregate_root_id: None,
            event_types: None,
            version: AggregateRootVersion::INITIAL,
            applied_events: Vec::new(),
            handlers,
            state: S::default(),
        }
    }

    /// The event source this instance was created for.
    pub fn event_source_id(&self) -> &EventSourceId {
        &self.event_source_id
    }

    /// The aggregate root type id assigned by the hosting client.
    ///
    /// # Errors
    ///
    /// [`AggregateRootError::AggregateRootIdNotSet`] until
    /// [`set_aggregate_root_id`](AggregateRoot::set_aggregate_root_id) is called.
    pub fn aggregate_root_id(&self) -> Result<AggregateRootId, AggregateRootError> {
        self.aggregate_root_id
            .ok_or(AggregateRootError::AggregateRootIdNotSet)
    }

    /// Assign the aggregate root type id, normally from
    /// [`AggregateRootTypes`](crate::AggregateRootTypes).
    pub fn set_aggregate_root_id(&mut self, aggregate_root_id: AggregateRootId) {
        self.aggregate_root_id = Some(aggregate_root_id);
    }

    /// Attach the registry used to match events with `on` handlers.
    pub fn set_event_types(&mut self, event_types: Arc<EventTypes>) {
        self.event_types = Some(event_types);
    }

    /// The number of events replayed and applied so far.
    ///
    /// # Returns
    ///
    /// [`AggregateRootVersion::INITIAL`] for a fresh instance; after replaying
    /// N committed events and applying M new ones, N + M.
    pub fn version(&self) -> AggregateRootVersion {
        self.version
    }

    /// Events applied since this instance was created, in order.
    pub fn applied_events(&self) -> &[AppliedEvent] {
        &self.applied_events
    }

    /// The state folded from every replayed and applied event.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Apply a private event whose type is looked up from `E`.
    pub fn apply<E: Serialize + 'static>(&mut self, event: E) -> Result<(), AggregateRootError> {
        self.record(event, None, false)
    }

    /// Apply a private event of an explicit type.
    pub fn apply_with_type<E: Serialize + 'static>(
        &mut self,
        event: E,
        event_type: EventType,
    ) -> Result<(), AggregateRootError> {
        self.record(event, Some(event_type), false)
    }

    /// Apply a public event whose type is looked up from `E`.
    pub fn apply_public<E: Serialize + 'static>(
        &mut self,
        event: E,
    ) -> Result<(), AggregateRootError> {
        self.record(event, None, true)
    }

    /// Apply a public event of an explicit type.
    pub fn apply_public_with_type<E: Serialize + 'static>(
        &mut self,
        event: E,
        event_type: EventType,
    ) -> Result<(), AggregateRootError> {
        self.record(event, Some(event_type), true)
    }

    fn record<E: Serialize + 'static>(
        &mut self,
        event: E,
        event_type: Option<EventType>,
        is_public: bool,
    ) -> Result<(), AggregateRootError> {
        let content = serde_json::to_value(&event).map_err(AggregateRootError::Serialization)?;
        if content.is_null() {
            return Err(AggregateRootError::EventContentMustBeDefined);
        }
        let payload_type = PayloadType::of::<E>();

        if !self.handlers.is_empty() {
            let resolved = self
                .event_types
                .as_deref()
                .ok_or(AggregateRootError::EventTypesNotSet)?
                .resolve_from(&payload_type, event_type.as_ref())?;
            self.dispatch(&resolved, &content)?;
        }

        self.applied_events.push(AppliedEvent {
            content,
            payload_type,
            event_type,
            is_public,
        });
        self.version = self.version.next();
        Ok(())
    }

    /// Replay committed history onto this instance.
    ///
    /// The whole batch must belong to this aggregate root instance; this is
    /// checked before anything changes. Events are then replayed in order,
    /// each one carrying exactly the current version. Replayed events are
    /// not recorded as applied.
    ///
    /// # Errors
    ///
    /// - [`AggregateRootError::EventSourceMismatch`] or
    ///   [`AggregateRootError::AggregateRootMismatch`] for foreign history.
    /// - [`AggregateRootError::VersionOutOfOrder`] at the first gap or
    ///   reversal; events before it stay replayed.
    pub fn re_apply(&mut self, events: &CommittedAggregateEvents) -> Result<(), AggregateRootError> {
        let aggregate_root_id = self.aggregate_root_id()?;
        self.ensure_belongs(events.event_source_id(), events.aggregate_root_id(), aggregate_root_id)?;
        for event in events {
            self.ensure_belongs(&event.event_source_id, event.aggregate_root_id, aggregate_root_id)?;
        }

        for event in events {
            if event.aggregate_root_version != self.version {
                return Err(AggregateRootError::VersionOutOfOrder {
                    expected: self.version,
                    actual: event.aggregate_root_version,
                });
            }
            if !self.handlers.is_empty() {
                self.dispatch(&event.event_type, &event.content)?;
            }
            self.version = self.version.next();
        }
        Ok(())
    }

    fn ensure_belongs(
        &self,
        event_source_id: &EventSourceId,
        actual: AggregateRootId,
        expected: AggregateRootId,
    ) -> Result<(), AggregateRootError> {
        if *event_source_id != self.event_source_id {
            return Err(AggregateRootError::EventSourceMismatch {
                expected: self.event_source_id.clone(),
                actual: event_source_id.clone(),
            });
        }
        if actual != expected {
            return Err(AggregateRootError::AggregateRootMismatch { expected, actual });
        }
        Ok(())
    }

    /// Run the `on` handler matching `event_type`, if any.
    fn dispatch(&mut self, event_type: &EventType, content: &Value) -> Result<(), AggregateRootError> {
        let event_types = self
            .event_types
            .as_deref()
            .ok_or(AggregateRootError::EventTypesNotSet)?;
        if let Some(method) = self.handlers.find(event_type, event_types)? {
            method(&mut self.state, content).map_err(|source| {
                AggregateRootError::OnHandlerFailed {
                    event_type: event_type.clone(),
                    source,
                }
            })?;
        }
        Ok(())
    }
}
