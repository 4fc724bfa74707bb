//! Units of work on aggregate roots: fetch, replay, act, commit.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use crate::aggregate::{AggregateRoot, AggregateState};
use crate::artifacts::{AggregateRootId, EventSourceId, EventTypes};
use crate::cancellation::Cancellation;
use crate::error::{AggregateRootError, PerformError};
use crate::event::{
    AggregateRootVersion, CommittedAggregateEvents, UncommittedAggregateEvent,
    UncommittedAggregateEvents,
};
use crate::event_store::EventStore;

/// The future an aggregate action returns. Borrows the aggregate root.
pub type ActionFuture<'a, E> =
    Pin<Box<dyn Future<Output = Result<(), PerformError<E>>> + Send + 'a>>;

/// Performs actions on one aggregate root instance.
///
/// Every [`perform`](AggregateRootOperations::perform) works on a fresh
/// [`AggregateRoot`]: the history is fetched and replayed, the action runs,
/// and the events it applied are committed with the version the aggregate
/// was at before the action as the expected version. A concurrent writer
/// makes the commit fail with
/// [`EventStoreError::ConcurrencyConflict`](crate::EventStoreError::ConcurrencyConflict);
/// no retry happens at this layer.
pub struct AggregateRootOperations<S> {
    event_store: Arc<dyn EventStore>,
    event_types: Arc<EventTypes>,
    aggregate_root_id: AggregateRootId,
    event_source_id: EventSourceId,
    _state: PhantomData<fn() -> S>,
}

impl<S> fmt::Debug for AggregateRootOperations<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateRootOperations")
            .field("aggregate_root_id", &self.aggregate_root_id)
            .field("event_source_id", &self.event_source_id)
            .finish_non_exhaustive()
    }
}

impl<S: AggregateState> AggregateRootOperations<S> {
    /// Operations on the instance `event_source_id` of aggregate `S`.
    ///
    /// # Arguments
    ///
    /// * `event_store` - Where history is fetched from and new events are committed.
    /// * `event_types` - Resolves applied payloads to event types at commit time.
    /// * `aggregate_root_id` - The aggregate root type id of `S`.
    /// * `event_source_id` - The instance to act on.
    pub fn new(
        event_store: Arc<dyn EventStore>,
        event_types: Arc<EventTypes>,
        aggregate_root_id: AggregateRootId,
        event_source_id: EventSourceId,
    ) -> Self {
        Self {
            event_store,
            event_types,
            aggregate_root_id,
            event_source_id,
            _state: PhantomData,
        }
    }

    /// The instance these operations act on.
    pub fn event_source_id(&self) -> &EventSourceId {
        &self.event_source_id
    }

    /// Run `action` against the current state of the aggregate root and
    /// commit the events it applies.
    ///
    /// Returns the committed events, or an empty batch without contacting
    /// the event store if the action applied nothing.
    ///
    /// # Errors
    ///
    /// - [`PerformError::Domain`] when the action rejects the operation.
    /// - [`PerformError::Aggregate`] for invariant violations during replay
    ///   or apply, including event types that cannot be resolved.
    /// - [`PerformError::EventStore`] when fetching or committing fails.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// kitchen
    ///     .perform(
    ///         |kitchen| Box::pin(async move {
    ///             kitchen.apply(DishPrepared { dish: "taco".into() })?;
    ///             Ok(())
    ///         }),
    ///         &Cancellation::none(),
    ///     )
    ///     .await?;
    /// ```
    pub async fn perform<E, F>(
        &self,
        action: F,
        cancellation: &Cancellation,
    ) -> Result<CommittedAggregateEvents, PerformError<E>>
    where
        E: std::error::Error + Send + Sync + 'static,
        F: for<'a> FnOnce(&'a mut AggregateRoot<S>) -> ActionFuture<'a, E>,
    {
        let mut aggregate_root = AggregateRoot::<S>::new(self.event_source_id.clone());
        aggregate_root.set_aggregate_root_id(self.aggregate_root_id);
        aggregate_root.set_event_types(Arc::clone(&self.event_types));

        let history = self
            .event_store
            .fetch_for_aggregate(self.aggregate_root_id, &self.event_source_id, cancellation)
            .await?;
        if !history.is_empty() {
            tracing::debug!(
                aggregate_root_id = %self.aggregate_root_id,
                event_source_id = %self.event_source_id,
                events = history.len(),
                "re-applying aggregate root history"
            );
            aggregate_root.re_apply(&history)?;
        }

        action(&mut aggregate_root).await?;

        let Some(uncommitted) = self.uncommitted_events(&aggregate_root)? else {
            tracing::debug!(
                aggregate_root_id = %self.aggregate_root_id,
                event_source_id = %self.event_source_id,
                "no events applied, nothing to commit"
            );
            return Ok(CommittedAggregateEvents::empty(
                self.event_source_id.clone(),
                self.aggregate_root_id,
            ));
        };

        let expected_version = uncommitted.expected_aggregate_root_version;
        let committed = self
            .event_store
            .commit_for_aggregate(uncommitted, cancellation)
            .await?;
        tracing::info!(
            aggregate_root_id = %self.aggregate_root_id,
            event_source_id = %self.event_source_id,
            %expected_version,
            events = committed.len(),
            "committed aggregate events"
        );
        Ok(committed)
    }

    /// The commit request for everything applied to `aggregate_root`, or
    /// `None` if nothing was applied.
    fn uncommitted_events(
        &self,
        aggregate_root: &AggregateRoot<S>,
    ) -> Result<Option<UncommittedAggregateEvents>, AggregateRootError> {
        let applied = aggregate_root.applied_events();
        if applied.is_empty() {
            return Ok(None);
        }

        let events = applied
            .iter()
            .map(|event| {
                Ok(UncommittedAggregateEvent {
                    event_type: self
                        .event_types
                        .resolve_from(event.payload_type(), event.event_type())?,
                    content: event.content().clone(),
                    is_public: event.is_public(),
                })
            })
            .collect::<Result<Vec<_>, AggregateRootError>>()?;

        let expected_aggregate_root_version = AggregateRootVersion::new(
            aggregate_root
                .version()
                .value()
                .saturating_sub(applied.len() as u64),
        );
        Ok(Some(UncommittedAggregateEvents {
            event_source_id: self.event_source_id.clone(),
            aggregate_root_id: self.aggregate_root_id,
            expected_aggregate_root_version,
            events,
        }))
    }
}

/// Hands out [`AggregateRootOperations`] for one aggregate root type.
pub struct AggregateOf<S> {
    event_store: Arc<dyn EventStore>,
    event_types: Arc<EventTypes>,
    aggregate_root_id: AggregateRootId,
    _state: PhantomData<fn() -> S>,
}

impl<S> Clone for AggregateOf<S> {
    fn clone(&self) -> Self {
        Self {
            event_store: Arc::clone(&self.event_store),
            event_types: Arc::clone(&self.event_types),
            aggregate_root_id: self.aggregate_root_id,
            _state: PhantomData,
        }
    }
}

impl<S> fmt::Debug for AggregateOf<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateOf")
            .field("aggregate_root_id", &self.aggregate_root_id)
            .finish_non_exhaustive()
    }
}

impl<S: AggregateState> AggregateOf<S> {
    /// Hand out operations on aggregates of type `S` stored in `event_store`.
    pub fn new(
        event_store: Arc<dyn EventStore>,
        event_types: Arc<EventTypes>,
        aggregate_root_id: AggregateRootId,
    ) -> Self {
        Self {
            event_store,
            event_types,
            aggregate_root_id,
            _state: PhantomData,
        }
    }

    /// The aggregate root type id every handed-out instance is assigned.
    pub fn aggregate_root_id(&self) -> AggregateRootId {
        self.aggregate_root_id
    }

    /// Operations on the instance living in `event_source_id`.
    pub fn get(&self, event_source_id: impl Into<EventSourceId>) -> AggregateRootOperations<S> {
        AggregateRootOperations::new(
            Arc::clone(&self.event_store),
            Arc::clone(&self.event_types),
            self.aggregate_root_id,
            event_source_id.into(),
        )
    }

    /// Operations on a new instance with a random event source id.
    pub fn create(&self) -> AggregateRootOperations<S> {
        self.get(EventSourceId::new_random())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::*;
    use crate::error::EventStoreError;
    use crate::event_store::test_fixtures::InMemoryEventStore;

    #[derive(Debug, thiserror::Error)]
    #[error("out of ingredients")]
    struct OutOfIngredients;

    fn taco() -> DishPrepared {
        DishPrepared {
            dish: "taco".into(),
            chef: "mrs tex mex".into(),
        }
    }

    fn kitchens(store: &Arc<InMemoryEventStore>) -> AggregateOf<Kitchen> {
        AggregateOf::new(
            Arc::clone(store) as Arc<dyn EventStore>,
            kitchen_event_types(),
            kitchen_id(),
        )
    }

    fn seeded_store(replayed: u64) -> Arc<InMemoryEventStore> {
        let events = (0..replayed)
            .map(|v| committed_dish("kitchen-1", kitchen_id(), v, "taco"))
            .collect();
        Arc::new(InMemoryEventStore::default().with_history(&history("kitchen-1", events)))
    }

    #[tokio::test]
    async fn commit_carries_expected_version_and_applied_events_in_order() {
        let store = seeded_store(3);
        let committed = kitchens(&store)
            .get("kitchen-1")
            .perform(
                |kitchen| {
                    Box::pin(async move {
                        assert_eq!(kitchen.state().dishes.len(), 3);
                        kitchen.apply(taco())?;
                        kitchen.apply_public(IngredientsRestocked { amount: 5 })?;
                        Ok::<_, PerformError<OutOfIngredients>>(())
                    })
                },
                &Cancellation::none(),
            )
            .await
            .expect("perform should succeed");

        assert_eq!(committed.len(), 2);
        let commits = store.commits();
        assert_eq!(commits.len(), 1);
        let commit = &commits[0];
        assert_eq!(
            commit.expected_aggregate_root_version,
            AggregateRootVersion::new(3)
        );
        assert_eq!(commit.event_source_id, EventSourceId::from("kitchen-1"));
        assert_eq!(commit.aggregate_root_id, kitchen_id());
        assert_eq!(commit.events[0].event_type, dish_prepared_type());
        assert_eq!(commit.events[1].event_type, ingredients_restocked_type());
        assert!(commit.events[1].is_public);
    }

    #[tokio::test]
    async fn no_applied_events_means_no_commit() {
        let store = seeded_store(2);
        let committed = kitchens(&store)
            .get("kitchen-1")
            .perform(
                |_kitchen| Box::pin(async { Ok::<_, PerformError<OutOfIngredients>>(()) }),
                &Cancellation::none(),
            )
            .await
            .unwrap();

        assert!(committed.is_empty());
        assert_eq!(store.fetch_count(), 1);
        assert!(store.commits().is_empty());
    }

    #[tokio::test]
    async fn domain_error_aborts_without_commit() {
        let store = seeded_store(0);
        let err = kitchens(&store)
            .get("kitchen-1")
            .perform(
                |kitchen| {
                    Box::pin(async move {
                        kitchen.apply(taco())?;
                        Err::<(), _>(PerformError::Domain(OutOfIngredients))
                    })
                },
                &Cancellation::none(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PerformError::Domain(OutOfIngredients)));
        assert!(store.commits().is_empty());
    }

    #[tokio::test]
    async fn unregistered_event_type_is_a_hard_error() {
        #[derive(serde::Serialize)]
        struct Unregistered {
            note: &'static str,
        }
        let store = seeded_store(0);
        let ledgers: AggregateOf<Ledger> = AggregateOf::new(
            Arc::clone(&store) as Arc<dyn EventStore>,
            kitchen_event_types(),
            kitchen_id(),
        );
        let err = ledgers
            .get("kitchen-1")
            .perform(
                |ledger| {
                    Box::pin(async move {
                        ledger.apply(Unregistered { note: "cash" })?;
                        Ok::<_, PerformError<OutOfIngredients>>(())
                    })
                },
                &Cancellation::none(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PerformError::Aggregate(AggregateRootError::EventTypes(_))
        ));
        assert!(store.commits().is_empty());
    }

    #[tokio::test]
    async fn concurrency_conflict_propagates() {
        let store = seeded_store(1);
        let kitchen = kitchens(&store).get("kitchen-1");
        let racing_store = Arc::clone(&store);

        let err = kitchen
            .perform(
                move |kitchen| {
                    Box::pin(async move {
                        // Another writer commits after our fetch.
                        racing_store
                            .commit_for_aggregate(
                                UncommittedAggregateEvents {
                                    event_source_id: EventSourceId::from("kitchen-1"),
                                    aggregate_root_id: kitchen_id(),
                                    expected_aggregate_root_version: AggregateRootVersion::new(1),
                                    events: vec![UncommittedAggregateEvent {
                                        event_type: dish_prepared_type(),
                                        content: serde_json::json!({"dish": "nachos", "chef": "x"}),
                                        is_public: false,
                                    }],
                                },
                                &Cancellation::none(),
                            )
                            .await?;
                        kitchen.apply(taco())?;
                        Ok::<_, PerformError<OutOfIngredients>>(())
                    })
                },
                &Cancellation::none(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PerformError::EventStore(EventStoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn foreign_history_fails_the_operation() {
        let foreign = history(
            "kitchen-1",
            vec![committed_dish("kitchen-2", kitchen_id(), 0, "taco")],
        );
        let store = Arc::new(InMemoryEventStore::default().with_history(&foreign));
        let err = kitchens(&store)
            .get("kitchen-1")
            .perform(
                |kitchen| {
                    Box::pin(async move {
                        kitchen.apply(taco())?;
                        Ok::<_, PerformError<OutOfIngredients>>(())
                    })
                },
                &Cancellation::none(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PerformError::Aggregate(AggregateRootError::EventSourceMismatch { .. })
        ));
        assert!(store.commits().is_empty());
    }

    #[tokio::test]
    async fn create_uses_fresh_event_sources() {
        let store = seeded_store(0);
        let kitchens = kitchens(&store);
        assert_ne!(
            kitchens.create().event_source_id(),
            kitchens.create().event_source_id()
        );
    }
}
