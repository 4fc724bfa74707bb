//! Identifiers and the registries mapping Rust types to Runtime artifacts.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EventTypesError;
use crate::proto;

/// Declare a `Copy` newtype over [`Uuid`] with the usual conversions.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Wrap an existing UUID.
            pub const fn from_uuid(value: uuid::Uuid) -> Self {
                Self(value)
            }

            /// A fresh random (v4) id.
            pub fn new_random() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// The underlying UUID.
            pub fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl From<uuid::Uuid> for $name {
            fn from(value: uuid::Uuid) -> Self {
                Self(value)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                uuid::Uuid::parse_str(value).map(Self)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}
pub(crate) use uuid_id;

uuid_id! {
    /// Identifies an aggregate root type.
    AggregateRootId
}

uuid_id! {
    /// Identifies an event type, independent of its generation.
    EventTypeId
}

uuid_id! {
    /// Identifies an event handler.
    EventHandlerId
}

uuid_id! {
    /// Identifies a scope of events. [`ScopeId::DEFAULT`] is the default scope.
    ScopeId
}

impl ScopeId {
    /// The default scope.
    pub const DEFAULT: ScopeId = ScopeId(Uuid::nil());
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Identifies an event source, the stream an aggregate instance lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventSourceId(String);

impl EventSourceId {
    /// A fresh random event source id.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventSourceId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for EventSourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<Uuid> for EventSourceId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for EventSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies the partition an event was handled in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub String);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generation of an artifact. Starts at [`Generation::FIRST`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Generation(pub u32);

impl Generation {
    /// The first generation of an artifact.
    pub const FIRST: Generation = Generation(1);
}

impl Default for Generation {
    fn default() -> Self {
        Self::FIRST
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An event type: id, generation and an optional human-readable alias.
///
/// Equality and hashing ignore the alias.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventType {
    id: EventTypeId,
    generation: Generation,
    alias: Option<String>,
}

impl EventType {
    /// An event type with the given id and generation and no alias.
    pub fn new(id: impl Into<EventTypeId>, generation: Generation) -> Self {
        Self {
            id: id.into(),
            generation,
            alias: None,
        }
    }

    /// Attach an alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// The event type id, shared by every generation.
    pub fn id(&self) -> EventTypeId {
        self.id
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// A readable name, if one was given.
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }
}

impl EventType {
    pub(crate) fn to_proto(&self) -> proto::Artifact {
        proto::Artifact {
            id: self.id.to_string(),
            generation: self.generation.0,
        }
    }

    /// Decode a wire artifact. Returns `None` if the id is not a valid UUID.
    pub(crate) fn from_proto(artifact: &proto::Artifact) -> Option<Self> {
        Some(Self::new(
            artifact.id.parse::<EventTypeId>().ok()?,
            Generation(artifact.generation),
        ))
    }
}

impl PartialEq for EventType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.generation == other.generation
    }
}

impl Eq for EventType {}

impl Hash for EventType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.generation.hash(state);
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{alias} ({}:{})", self.id, self.generation),
            None => write!(f, "{}:{}", self.id, self.generation),
        }
    }
}

/// The runtime type of an event payload, used to look up its event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PayloadType {
    id: TypeId,
    name: &'static str,
}

impl PayloadType {
    /// The payload type of `T`.
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// `std::any::type_name` of the payload.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Registry associating Rust event types with [`EventType`]s.
///
/// # Examples
///
/// ```
/// use eventfold_sdk::{EventType, EventTypeId, EventTypes, Generation};
/// use uuid::Uuid;
///
/// struct DishPrepared;
///
/// let dish_prepared = EventType::new(EventTypeId::from_uuid(Uuid::new_v4()), Generation::FIRST);
/// let mut event_types = EventTypes::new();
/// event_types.associate::<DishPrepared>(dish_prepared.clone()).unwrap();
/// assert_eq!(event_types.get_for::<DishPrepared>().unwrap(), dish_prepared);
/// ```
#[derive(Debug, Clone, Default)]
pub struct EventTypes {
    by_payload: HashMap<TypeId, EventType>,
}

impl EventTypes {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `T` with `event_type`.
    ///
    /// # Errors
    ///
    /// [`EventTypesError::AlreadyAssociated`] if `T` already has an event type.
    pub fn associate<T: 'static>(&mut self, event_type: EventType) -> Result<(), EventTypesError> {
        let payload = PayloadType::of::<T>();
        if self.by_payload.contains_key(&payload.id) {
            return Err(EventTypesError::AlreadyAssociated {
                kind: "event type",
                type_name: payload.name,
            });
        }
        self.by_payload.insert(payload.id, event_type);
        Ok(())
    }

    /// Builder-style [`associate`](EventTypes::associate).
    pub fn with<T: 'static>(mut self, event_type: EventType) -> Result<Self, EventTypesError> {
        self.associate::<T>(event_type)?;
        Ok(self)
    }

    /// The event type associated with `T`.
    pub fn get_for<T: 'static>(&self) -> Result<EventType, EventTypesError> {
        self.get_for_payload(&PayloadType::of::<T>())
    }

    /// The event type associated with a payload type.
    pub fn get_for_payload(&self, payload: &PayloadType) -> Result<EventType, EventTypesError> {
        self.by_payload
            .get(&payload.id)
            .cloned()
            .ok_or(EventTypesError::NotAssociated {
                kind: "event type",
                type_name: payload.name,
            })
    }

    /// Returns `true` if `T` has an associated event type.
    pub fn has_for<T: 'static>(&self) -> bool {
        self.by_payload.contains_key(&TypeId::of::<T>())
    }

    /// The explicit event type when given, otherwise the one associated with
    /// the payload type.
    pub fn resolve_from(
        &self,
        payload: &PayloadType,
        explicit: Option<&EventType>,
    ) -> Result<EventType, EventTypesError> {
        match explicit {
            Some(event_type) => Ok(event_type.clone()),
            None => self.get_for_payload(payload),
        }
    }

    /// Every registered event type.
    pub fn all(&self) -> impl Iterator<Item = &EventType> {
        self.by_payload.values()
    }
}

/// Registry associating aggregate state types with [`AggregateRootId`]s.
#[derive(Debug, Clone, Default)]
pub struct AggregateRootTypes {
    by_state: HashMap<TypeId, (AggregateRootId, Option<String>)>,
}

impl AggregateRootTypes {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate the aggregate state type `S` with `id`.
    pub fn associate<S: 'static>(&mut self, id: AggregateRootId) -> Result<(), EventTypesError> {
        self.insert::<S>(id, None)
    }

    /// Associate `S` with `id` and an alias used in logs.
    pub fn associate_with_alias<S: 'static>(
        &mut self,
        id: AggregateRootId,
        alias: impl Into<String>,
    ) -> Result<(), EventTypesError> {
        self.insert::<S>(id, Some(alias.into()))
    }

    fn insert<S: 'static>(
        &mut self,
        id: AggregateRootId,
        alias: Option<String>,
    ) -> Result<(), EventTypesError> {
        let payload = PayloadType::of::<S>();
        if self.by_state.contains_key(&payload.id) {
            return Err(EventTypesError::AlreadyAssociated {
                kind: "aggregate root",
                type_name: payload.name,
            });
        }
        self.by_state.insert(payload.id, (id, alias));
        Ok(())
    }

    /// The aggregate root id associated with `S`.
    pub fn get_for<S: 'static>(&self) -> Result<AggregateRootId, EventTypesError> {
        self.by_state
            .get(&TypeId::of::<S>())
            .map(|(id, _)| *id)
            .ok_or(EventTypesError::NotAssociated {
                kind: "aggregate root",
                type_name: std::any::type_name::<S>(),
            })
    }

    /// The alias associated with `S`, if any.
    pub fn alias_for<S: 'static>(&self) -> Option<&str> {
        self.by_state
            .get(&TypeId::of::<S>())
            .and_then(|(_, alias)| alias.as_deref())
    }
}
