//! The in-memory resource store.
//!
//! Collections are keyed by `(namespace, type)` and guarded by their own
//! read/write lock; list operations snapshot under the read lock, mutations
//! commit and publish watch events under the write lock. No operation blocks
//! on a subscriber.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::debug;

use crate::error::StateError;
use crate::query::Query;
use crate::resource::{Owner, Phase, Resource, ResourceRef, ResourceSpec, Version};
use crate::watch::{Event, Sink, WatchStream};

/// Identity performing a store mutation.
///
/// External actors (users, admission) carry no owner and may only mutate
/// unowned resources. Controllers mutate resources they own. Internal actors
/// (e.g. a durability adapter replaying a log) bypass ownership checks and
/// preserve owners already present on created resources.
#[derive(Debug, Clone)]
pub struct Actor {
    owner: Option<Owner>,
    internal: bool,
}

impl Actor {
    pub fn external() -> Self {
        Self {
            owner: None,
            internal: false,
        }
    }

    pub fn controller(name: &str) -> Self {
        Self {
            owner: Some(Owner::new(name)),
            internal: false,
        }
    }

    pub fn internal() -> Self {
        Self {
            owner: None,
            internal: true,
        }
    }

    fn may_mutate(&self, stored: Option<&Owner>) -> bool {
        match stored {
            None => true,
            Some(owner) => self.internal || self.owner.as_ref() == Some(owner),
        }
    }
}

type CollectionKey = (String, &'static str);

struct Collection<S> {
    resources: BTreeMap<String, Resource<S>>,
    // label key -> label value -> ids, kept in sync with every commit
    label_index: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    sinks: Vec<Sink<S>>,
}

impl<S: ResourceSpec> Collection<S> {
    fn new() -> Self {
        Self {
            resources: BTreeMap::new(),
            label_index: BTreeMap::new(),
            sinks: Vec::new(),
        }
    }

    fn publish(&mut self, event: Event<S>) {
        self.sinks.retain_mut(|sink| sink.publish(event.clone()));
    }

    fn index_insert(&mut self, id: &str, labels: &BTreeMap<String, String>) {
        for (key, value) in labels {
            self.label_index
                .entry(key.clone())
                .or_default()
                .entry(value.clone())
                .or_default()
                .insert(id.to_string());
        }
    }

    fn index_remove(&mut self, id: &str, labels: &BTreeMap<String, String>) {
        for (key, value) in labels {
            if let Some(by_value) = self.label_index.get_mut(key) {
                if let Some(ids) = by_value.get_mut(value) {
                    ids.remove(id);
                    if ids.is_empty() {
                        by_value.remove(value);
                    }
                }
                if by_value.is_empty() {
                    self.label_index.remove(key);
                }
            }
        }
    }

    /// Candidate ids for a query, seeded from the label index when possible.
    fn candidates(&self, query: &Query) -> Vec<String> {
        match query.first_equal() {
            Some((key, value)) => self
                .label_index
                .get(key)
                .and_then(|by_value| by_value.get(value))
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default(),
            None => self.resources.keys().cloned().collect(),
        }
    }
}

/// The in-memory resource store.
///
/// Cheap to clone; clones share the same state.
pub struct Store<S: ResourceSpec> {
    collections: Arc<RwLock<HashMap<CollectionKey, Arc<RwLock<Collection<S>>>>>>,
}

impl<S: ResourceSpec> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            collections: Arc::clone(&self.collections),
        }
    }
}

impl<S: ResourceSpec> Default for Store<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ResourceSpec> Store<S> {
    pub fn new() -> Self {
        Self {
            collections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn collection(&self, namespace: &str, resource_type: &'static str) -> Arc<RwLock<Collection<S>>> {
        {
            let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
            if let Some(collection) = collections.get(&(namespace.to_string(), resource_type)) {
                return Arc::clone(collection);
            }
        }

        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            collections
                .entry((namespace.to_string(), resource_type))
                .or_insert_with(|| Arc::new(RwLock::new(Collection::new()))),
        )
    }

    /// Fetch a resource.
    pub fn get(&self, reference: &ResourceRef) -> Result<Resource<S>, StateError> {
        self.find(reference)
            .ok_or_else(|| StateError::NotFound(reference.clone()))
    }

    /// Fetch a resource, `None` when absent.
    pub fn find(&self, reference: &ResourceRef) -> Option<Resource<S>> {
        let collection = self.collection(&reference.namespace, reference.resource_type);
        let collection = collection.read().unwrap_or_else(|e| e.into_inner());

        collection.resources.get(&reference.id).cloned()
    }

    /// List resources in a collection matching a query.
    pub fn list(&self, namespace: &str, resource_type: &'static str, query: &Query) -> Vec<Resource<S>> {
        let collection = self.collection(namespace, resource_type);
        let collection = collection.read().unwrap_or_else(|e| e.into_inner());

        collection
            .candidates(query)
            .into_iter()
            .filter_map(|id| collection.resources.get(&id))
            .filter(|res| query.matches(res.metadata()))
            .cloned()
            .collect()
    }

    /// Create a resource.
    ///
    /// The owner is taken from the actor; internal actors preserve an owner
    /// already present on the resource (log replay).
    pub fn create(&self, mut resource: Resource<S>, actor: &Actor) -> Result<Resource<S>, StateError> {
        let reference = resource.reference();
        let collection = self.collection(&reference.namespace, reference.resource_type);
        let mut collection = collection.write().unwrap_or_else(|e| e.into_inner());

        if collection.resources.contains_key(&reference.id) {
            return Err(StateError::Conflict {
                reference,
                details: "already exists".into(),
            });
        }

        let now = Utc::now();
        let metadata = resource.metadata_mut();
        metadata.version = Version::initial();
        metadata.phase = Phase::Running;
        metadata.created = now;
        metadata.updated = now;
        if !actor.internal {
            metadata.owner = actor.owner.clone();
        }

        collection.index_insert(&reference.id, &resource.metadata().labels);
        collection
            .resources
            .insert(reference.id.clone(), resource.clone());
        collection.publish(Event::Created(resource.clone()));

        Ok(resource)
    }

    /// Update a resource through a mutator closure.
    ///
    /// `expected` is compared against the stored version unless it is
    /// [`Version::UNDEFINED`]. The mutator receives a mutable copy; identity,
    /// version, owner, and phase changes made by the mutator are discarded.
    pub fn update<F>(
        &self,
        reference: &ResourceRef,
        expected: Version,
        actor: &Actor,
        mutate: F,
    ) -> Result<Resource<S>, StateError>
    where
        F: FnOnce(&mut Resource<S>) -> Result<(), StateError>,
    {
        let collection = self.collection(&reference.namespace, reference.resource_type);
        let mut collection = collection.write().unwrap_or_else(|e| e.into_inner());

        let stored = collection
            .resources
            .get(&reference.id)
            .ok_or_else(|| StateError::NotFound(reference.clone()))?;

        if !expected.is_undefined() && stored.metadata().version != expected {
            return Err(StateError::version_conflict(
                reference.clone(),
                expected,
                stored.metadata().version,
            ));
        }

        if !actor.may_mutate(stored.metadata().owner.as_ref()) {
            return Err(StateError::OwnerConflict {
                reference: reference.clone(),
                owner: stored
                    .metadata()
                    .owner
                    .clone()
                    .unwrap_or_else(|| Owner::new("")),
            });
        }

        let old = stored.clone();
        let mut new = old.clone();
        mutate(&mut new)?;

        if new.spec().resource_type() != old.metadata().resource_type {
            return Err(StateError::InvalidArgument(format!(
                "mutator changed spec type of {reference}"
            )));
        }

        // Identity and bookkeeping fields are store-managed.
        {
            let metadata = new.metadata_mut();
            metadata.namespace = old.metadata().namespace.clone();
            metadata.resource_type = old.metadata().resource_type;
            metadata.id = old.metadata().id.clone();
            metadata.owner = old.metadata().owner.clone();
            metadata.phase = old.metadata().phase;
            metadata.created = old.metadata().created;
            metadata.version = old.metadata().version.next();
            metadata.updated = Utc::now();
        }

        collection.index_remove(&reference.id, &old.metadata().labels);
        collection.index_insert(&reference.id, &new.metadata().labels);
        collection
            .resources
            .insert(reference.id.clone(), new.clone());
        collection.publish(Event::Updated {
            old,
            new: new.clone(),
        });

        Ok(new)
    }

    /// Update with conflict retries: re-reads and re-applies the mutator
    /// until the compare-and-swap succeeds.
    pub fn update_with_retry<F>(
        &self,
        reference: &ResourceRef,
        actor: &Actor,
        mut mutate: F,
    ) -> Result<Resource<S>, StateError>
    where
        F: FnMut(&mut Resource<S>) -> Result<(), StateError>,
    {
        loop {
            let current = self.get(reference)?;

            match self.update(reference, current.metadata().version, actor, &mut mutate) {
                Err(e) if e.is_conflict() => continue,
                other => return other,
            }
        }
    }

    /// Destroy a resource.
    ///
    /// While finalizers are attached the resource instead enters the
    /// tearing-down phase and `PreconditionFailed` is returned; the destroy
    /// completes when the last finalizer is removed.
    pub fn destroy(&self, reference: &ResourceRef, actor: &Actor) -> Result<(), StateError> {
        let collection = self.collection(&reference.namespace, reference.resource_type);
        let mut collection = collection.write().unwrap_or_else(|e| e.into_inner());

        let stored = collection
            .resources
            .get(&reference.id)
            .ok_or_else(|| StateError::NotFound(reference.clone()))?;

        if !actor.may_mutate(stored.metadata().owner.as_ref()) {
            return Err(StateError::OwnerConflict {
                reference: reference.clone(),
                owner: stored
                    .metadata()
                    .owner
                    .clone()
                    .unwrap_or_else(|| Owner::new("")),
            });
        }

        if !stored.metadata().finalizers.is_empty() {
            if stored.metadata().phase != Phase::TearingDown {
                let old = stored.clone();
                let mut new = old.clone();
                {
                    let metadata = new.metadata_mut();
                    metadata.phase = Phase::TearingDown;
                    metadata.version = metadata.version.next();
                    metadata.updated = Utc::now();
                }

                debug!(resource = %reference, "destroy deferred, tearing down");

                collection
                    .resources
                    .insert(reference.id.clone(), new.clone());
                collection.publish(Event::Updated { old, new });
            }

            return Err(StateError::PreconditionFailed {
                reference: reference.clone(),
                reason: "finalizers present".into(),
            });
        }

        let removed = collection
            .resources
            .remove(&reference.id)
            .ok_or_else(|| StateError::NotFound(reference.clone()))?;
        collection.index_remove(&reference.id, &removed.metadata().labels);
        collection.publish(Event::Destroyed(removed));

        Ok(())
    }

    /// Attach a finalizer.
    ///
    /// Finalizer bookkeeping is runtime machinery and is exempt from
    /// ownership checks.
    pub fn add_finalizer(&self, reference: &ResourceRef, finalizer: &str) -> Result<(), StateError> {
        self.update(reference, Version::UNDEFINED, &Actor::internal(), |res| {
            res.metadata_mut().finalizers.insert(finalizer.to_string());
            Ok(())
        })
        .map(|_| ())
    }

    /// Remove a finalizer; completes a deferred destroy when it was the last
    /// one on a tearing-down resource.
    pub fn remove_finalizer(&self, reference: &ResourceRef, finalizer: &str) -> Result<(), StateError> {
        let updated = self.update(reference, Version::UNDEFINED, &Actor::internal(), |res| {
            res.metadata_mut().finalizers.remove(finalizer);
            Ok(())
        })?;

        if updated.metadata().phase == Phase::TearingDown && updated.metadata().finalizers.is_empty() {
            let collection = self.collection(&reference.namespace, reference.resource_type);
            let mut collection = collection.write().unwrap_or_else(|e| e.into_inner());

            if let Some(removed) = collection.resources.remove(&reference.id) {
                collection.index_remove(&reference.id, &removed.metadata().labels);
                collection.publish(Event::Destroyed(removed));
            }
        }

        Ok(())
    }

    /// Subscribe to a collection.
    ///
    /// Current state is delivered first as `Created` events followed by a
    /// `Bootstrapped` marker, then live events in commit order.
    pub fn watch(&self, namespace: &str, resource_type: &'static str) -> WatchStream<S> {
        let collection = self.collection(namespace, resource_type);
        let mut collection = collection.write().unwrap_or_else(|e| e.into_inner());

        let (mut sink, stream) = Sink::new(
            format!("{namespace}/{resource_type}"),
            collection.resources.len() + 1,
        );

        for resource in collection.resources.values() {
            sink.publish(Event::Created(resource.clone()));
        }
        sink.publish(Event::Bootstrapped);

        collection.sinks.push(sink);

        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum TestSpec {
        Widget(u64),
    }

    impl ResourceSpec for TestSpec {
        fn resource_type(&self) -> &'static str {
            match self {
                TestSpec::Widget(_) => "Widgets",
            }
        }
    }

    fn widget(id: &str, value: u64) -> Resource<TestSpec> {
        Resource::new("default", id, TestSpec::Widget(value))
    }

    fn widget_ref(id: &str) -> ResourceRef {
        ResourceRef::new("default", "Widgets", id)
    }

    #[test]
    fn test_create_get_destroy() {
        let store = Store::new();

        store.create(widget("a", 1), &Actor::external()).unwrap();

        let fetched = store.get(&widget_ref("a")).unwrap();
        assert_eq!(fetched.spec(), &TestSpec::Widget(1));
        assert_eq!(fetched.metadata().version.get(), 1);

        store.destroy(&widget_ref("a"), &Actor::external()).unwrap();
        assert!(store.get(&widget_ref("a")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_create_conflict() {
        let store = Store::new();

        store.create(widget("a", 1), &Actor::external()).unwrap();
        let err = store.create(widget("a", 2), &Actor::external()).unwrap_err();

        assert!(err.is_conflict());
    }

    #[test]
    fn test_update_bumps_version() {
        let store = Store::new();
        store.create(widget("a", 1), &Actor::external()).unwrap();

        let updated = store
            .update(&widget_ref("a"), Version::UNDEFINED, &Actor::external(), |res| {
                *res.spec_mut() = TestSpec::Widget(2);
                Ok(())
            })
            .unwrap();

        assert_eq!(updated.metadata().version.get(), 2);
        assert_eq!(updated.spec(), &TestSpec::Widget(2));
    }

    #[test]
    fn test_update_version_conflict() {
        let store = Store::new();
        let created = store.create(widget("a", 1), &Actor::external()).unwrap();

        let stale = created.metadata().version;
        store
            .update(&widget_ref("a"), stale, &Actor::external(), |_| Ok(()))
            .unwrap();

        let err = store
            .update(&widget_ref("a"), stale, &Actor::external(), |_| Ok(()))
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_update_with_retry_applies() {
        let store = Store::new();
        store.create(widget("a", 1), &Actor::external()).unwrap();

        store
            .update_with_retry(&widget_ref("a"), &Actor::external(), |res| {
                *res.spec_mut() = TestSpec::Widget(5);
                Ok(())
            })
            .unwrap();

        assert_eq!(store.get(&widget_ref("a")).unwrap().spec(), &TestSpec::Widget(5));
    }

    #[test]
    fn test_mutator_cannot_change_identity() {
        let store = Store::new();
        store.create(widget("a", 1), &Actor::controller("ctrl")).unwrap();

        let updated = store
            .update(&widget_ref("a"), Version::UNDEFINED, &Actor::controller("ctrl"), |res| {
                res.metadata_mut().id = "b".into();
                res.metadata_mut().owner = None;
                res.metadata_mut().version = Version::UNDEFINED;
                Ok(())
            })
            .unwrap();

        assert_eq!(updated.metadata().id, "a");
        assert_eq!(updated.metadata().owner, Some(Owner::new("ctrl")));
        assert_eq!(updated.metadata().version.get(), 2);
    }

    #[test]
    fn test_owner_enforcement() {
        let store = Store::new();
        store.create(widget("a", 1), &Actor::controller("ctrl")).unwrap();

        // Foreign controller and external actor are both rejected.
        for actor in [Actor::controller("other"), Actor::external()] {
            let err = store
                .update(&widget_ref("a"), Version::UNDEFINED, &actor, |_| Ok(()))
                .unwrap_err();
            assert!(matches!(err, StateError::OwnerConflict { .. }));
        }

        // The owner and an internal actor may mutate.
        store
            .update(&widget_ref("a"), Version::UNDEFINED, &Actor::controller("ctrl"), |_| Ok(()))
            .unwrap();
        store
            .update(&widget_ref("a"), Version::UNDEFINED, &Actor::internal(), |_| Ok(()))
            .unwrap();
    }

    #[test]
    fn test_internal_create_preserves_owner() {
        let store = Store::new();

        let mut res = widget("a", 1);
        res.metadata_mut().owner = Some(Owner::new("ctrl"));
        store.create(res, &Actor::internal()).unwrap();

        assert_eq!(
            store.get(&widget_ref("a")).unwrap().metadata().owner,
            Some(Owner::new("ctrl"))
        );
    }

    #[test]
    fn test_destroy_deferred_by_finalizers() {
        let store = Store::new();
        store.create(widget("a", 1), &Actor::external()).unwrap();
        store.add_finalizer(&widget_ref("a"), "cleanup").unwrap();

        let err = store.destroy(&widget_ref("a"), &Actor::external()).unwrap_err();
        assert!(matches!(err, StateError::PreconditionFailed { .. }));

        let stored = store.get(&widget_ref("a")).unwrap();
        assert_eq!(stored.metadata().phase, Phase::TearingDown);

        // Removing the last finalizer completes the destroy.
        store.remove_finalizer(&widget_ref("a"), "cleanup").unwrap();
        assert!(store.get(&widget_ref("a")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_list_with_label_query() {
        let store = Store::new();

        let mut a = widget("a", 1);
        a.metadata_mut().labels.insert("role".into(), "worker".into());
        let mut b = widget("b", 2);
        b.metadata_mut().labels.insert("role".into(), "control".into());

        store.create(a, &Actor::external()).unwrap();
        store.create(b, &Actor::external()).unwrap();

        let workers = store.list("default", "Widgets", &Query::all().equal("role", "worker"));
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].metadata().id, "a");

        let all = store.list("default", "Widgets", &Query::all());
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_label_index_follows_updates() {
        let store = Store::new();

        let mut a = widget("a", 1);
        a.metadata_mut().labels.insert("role".into(), "worker".into());
        store.create(a, &Actor::external()).unwrap();

        store
            .update(&widget_ref("a"), Version::UNDEFINED, &Actor::external(), |res| {
                res.metadata_mut().labels.insert("role".into(), "control".into());
                Ok(())
            })
            .unwrap();

        assert!(store
            .list("default", "Widgets", &Query::all().equal("role", "worker"))
            .is_empty());
        assert_eq!(
            store
                .list("default", "Widgets", &Query::all().equal("role", "control"))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_watch_bootstrap_and_live_events() {
        let store = Store::new();
        store.create(widget("a", 1), &Actor::external()).unwrap();

        let mut stream = store.watch("default", "Widgets");

        match stream.recv().await {
            Some(Event::Created(res)) => assert_eq!(res.metadata().id, "a"),
            other => panic!("expected initial Created, got {other:?}"),
        }
        assert!(matches!(stream.recv().await, Some(Event::Bootstrapped)));

        store.create(widget("b", 2), &Actor::external()).unwrap();
        match stream.recv().await {
            Some(Event::Created(res)) => assert_eq!(res.metadata().id, "b"),
            other => panic!("expected live Created, got {other:?}"),
        }

        store
            .update(&widget_ref("b"), Version::UNDEFINED, &Actor::external(), |res| {
                *res.spec_mut() = TestSpec::Widget(3);
                Ok(())
            })
            .unwrap();
        match stream.recv().await {
            Some(Event::Updated { old, new }) => {
                assert_eq!(old.spec(), &TestSpec::Widget(2));
                assert_eq!(new.spec(), &TestSpec::Widget(3));
            }
            other => panic!("expected Updated, got {other:?}"),
        }

        store.destroy(&widget_ref("b"), &Actor::external()).unwrap();
        match stream.recv().await {
            Some(Event::Destroyed(res)) => assert_eq!(res.metadata().id, "b"),
            other => panic!("expected Destroyed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_watcher_resynced_without_blocking() {
        let store = Store::new();
        let mut stream = store.watch("default", "Widgets");

        assert!(matches!(stream.recv().await, Some(Event::Bootstrapped)));

        // Overflow the live queue; writes never block.
        for i in 0..(crate::watch::WATCH_QUEUE_DEPTH as u64 + 8) {
            store
                .create(widget(&format!("w{i}"), i), &Actor::external())
                .unwrap();
        }

        let mut last = None;
        while let Some(event) = stream.recv().await {
            last = Some(event);
        }
        assert!(matches!(last, Some(Event::Resync)));
    }
}
