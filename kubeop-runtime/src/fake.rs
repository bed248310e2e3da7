//! In-memory implementations of the API client boundary.
//!
//! [`FakeClient`] behaves like the list/watch/replace endpoints of a single kind and
//! [`FakeLeases`] like a lease store. Both can inject the failures the runtime has to
//! cope with: failed lists, dropped or broken watches, expired watch positions and
//! network partitions.
use crate::client::{self, LeaseClient, ResourceClient, WatchStream};
use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use futures::{channel::mpsc, future, StreamExt};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use kubeop_core::{
    metadata::{ObjectMeta, TypeMeta},
    watch::{Bookmark, BookmarkMeta},
    ObjectList, Resource, ResourceExt, ResourceKey, WatchEvent,
};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{sync::watch, time::Instant};

struct Watcher<K> {
    namespace: Option<String>,
    tx: mpsc::UnboundedSender<client::Result<WatchEvent<K>>>,
}

impl<K: Resource> Watcher<K> {
    fn wants(&self, event: &WatchEvent<K>) -> bool {
        match (&self.namespace, event.object()) {
            (Some(ns), Some(obj)) => obj.namespace().as_deref() == Some(ns.as_str()),
            _ => true,
        }
    }
}

struct State<K> {
    objects: BTreeMap<ResourceKey, K>,
    resource_version: u64,
    watchers: Vec<Watcher<K>>,
    failing_lists: usize,
    stalled_lists: bool,
    lists: usize,
    watches: usize,
    last_watch_version: Option<String>,
    replaced: Vec<K>,
}

/// An in-memory [`ResourceClient`] for a single kind
///
/// Cloning produces another handle to the same objects. Every write bumps a global
/// resource version and is delivered to open watches, the way an API server would.
pub struct FakeClient<K> {
    state: Arc<Mutex<State<K>>>,
    open_watches: Arc<watch::Sender<usize>>,
}

impl<K> Clone for FakeClient<K> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            open_watches: self.open_watches.clone(),
        }
    }
}

impl<K> Default for FakeClient<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> FakeClient<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Creates an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                objects: BTreeMap::new(),
                resource_version: 0,
                watchers: Vec::new(),
                failing_lists: 0,
                stalled_lists: false,
                lists: 0,
                watches: 0,
                last_watch_version: None,
                replaced: Vec::new(),
            })),
            open_watches: Arc::new(watch::channel(0).0),
        }
    }

    /// Store an object without notifying watches
    pub fn seed(&self, mut obj: K) {
        let mut state = self.state.lock();
        state.bump(&mut obj);
        state.objects.insert(ResourceKey::from_obj(&obj), obj);
    }

    /// Create or update an object and notify watches
    pub fn apply(&self, mut obj: K) -> K {
        let mut state = self.state.lock();
        state.bump(&mut obj);
        let event = match state.objects.insert(ResourceKey::from_obj(&obj), obj.clone()) {
            None => WatchEvent::Added(obj.clone()),
            Some(_) => WatchEvent::Modified(obj.clone()),
        };
        state.send(event);
        drop(state);
        self.publish_open_watches();
        obj
    }

    /// Delete an object and notify watches
    pub fn delete(&self, namespace: &str, name: &str) -> Option<K> {
        let mut state = self.state.lock();
        let mut obj = state.objects.remove(&ResourceKey::new(name, Some(namespace)))?;
        state.bump(&mut obj);
        state.send(WatchEvent::Deleted(obj.clone()));
        drop(state);
        self.publish_open_watches();
        Some(obj)
    }

    /// Delete an object without notifying watches
    pub fn remove_silently(&self, namespace: &str, name: &str) -> Option<K> {
        self.state
            .lock()
            .objects
            .remove(&ResourceKey::new(name, Some(namespace)))
    }

    /// Send a raw event to every open watch, leaving the stored objects alone
    pub fn push(&self, event: WatchEvent<K>) {
        self.state.lock().send(event);
        self.publish_open_watches();
    }

    /// Send a bookmark at `resource_version` to every open watch
    pub fn push_bookmark(&self, resource_version: &str) {
        self.push(WatchEvent::Bookmark(Bookmark {
            types: TypeMeta {
                api_version: K::api_version().into_owned(),
                kind: K::kind().into_owned(),
            },
            metadata: BookmarkMeta {
                resource_version: resource_version.to_string(),
            },
        }));
    }

    /// End every open watch, as the server does when a watch times out
    pub fn close_watches(&self) {
        self.state.lock().watchers.clear();
        self.open_watches.send_replace(0);
    }

    /// Break every open watch with a transport error
    pub fn fail_watches(&self, reason: &str) {
        let mut state = self.state.lock();
        for watcher in state.watchers.drain(..) {
            let _ = watcher
                .tx
                .unbounded_send(Err(client::Error::Transport(reason.to_string())));
        }
        drop(state);
        self.open_watches.send_replace(0);
    }

    /// Make the next `n` list calls fail
    pub fn fail_next_lists(&self, n: usize) {
        self.state.lock().failing_lists = n;
    }

    /// Make every following list call hang forever
    pub fn stall_lists(&self) {
        self.state.lock().stalled_lists = true;
    }

    /// Wait until at least `n` watches are open
    pub async fn wait_for_watchers(&self, n: usize) {
        let mut open = self.open_watches.subscribe();
        // the sender lives in `self`
        let _ = open.wait_for(|open| *open >= n).await;
    }

    /// The number of list calls made so far
    #[must_use]
    pub fn list_count(&self) -> usize {
        self.state.lock().lists
    }

    /// The number of watch calls made so far
    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.state.lock().watches
    }

    /// The resource version the most recent watch started from
    #[must_use]
    pub fn last_watch_version(&self) -> Option<String> {
        self.state.lock().last_watch_version.clone()
    }

    /// Every object written through `replace` or `replace_status`, in order
    #[must_use]
    pub fn replaced(&self) -> Vec<K> {
        self.state.lock().replaced.clone()
    }

    /// The stored copy of an object
    #[must_use]
    pub fn get(&self, namespace: &str, name: &str) -> Option<K> {
        self.state
            .lock()
            .objects
            .get(&ResourceKey::new(name, Some(namespace)))
            .cloned()
    }

    fn publish_open_watches(&self) {
        let open = self.state.lock().watchers.len();
        self.open_watches.send_replace(open);
    }

    fn write(&self, obj: &K) -> client::Result<K> {
        let mut state = self.state.lock();
        let key = ResourceKey::from_obj(obj);
        let stored = state
            .objects
            .get(&key)
            .ok_or_else(|| client::Error::Api(not_found(&key)))?;
        if obj.resource_version().is_some() && obj.resource_version() != stored.resource_version() {
            return Err(client::Error::Conflict(format!(
                "{} {key} has been modified",
                K::kind()
            )));
        }
        let mut obj = obj.clone();
        state.bump(&mut obj);
        state.objects.insert(key, obj.clone());
        state.replaced.push(obj.clone());
        state.send(WatchEvent::Modified(obj.clone()));
        Ok(obj)
    }
}

impl<K: Resource> State<K> {
    fn bump(&mut self, obj: &mut K) {
        self.resource_version += 1;
        obj.meta_mut().resource_version = Some(self.resource_version.to_string());
    }

    fn send(&mut self, event: WatchEvent<K>)
    where
        K: Clone,
    {
        self.watchers.retain(|w| !w.tx.is_closed());
        for watcher in self.watchers.iter().filter(|w| w.wants(&event)) {
            let _ = watcher.tx.unbounded_send(Ok(event.clone()));
        }
    }
}

fn not_found(key: &ResourceKey) -> kubeop_core::ErrorResponse {
    kubeop_core::ErrorResponse {
        status: "Failure".into(),
        message: format!("{key} not found"),
        reason: "NotFound".into(),
        code: 404,
    }
}

#[async_trait]
impl<K> ResourceClient<K> for FakeClient<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn list(&self, namespace: Option<&str>) -> client::Result<ObjectList<K>> {
        let stalled = {
            let mut state = self.state.lock();
            state.lists += 1;
            state.stalled_lists
        };
        if stalled {
            future::pending::<()>().await;
        }
        let mut state = self.state.lock();
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(client::Error::Transport("connection refused".into()));
        }
        let items = state
            .objects
            .values()
            .filter(|obj| namespace.is_none() || obj.namespace().as_deref() == namespace)
            .cloned()
            .collect();
        Ok(ObjectList::new(items, Some(state.resource_version.to_string())))
    }

    async fn watch(
        &self,
        namespace: Option<&str>,
        resource_version: &str,
        _timeout: Duration,
    ) -> client::Result<WatchStream<K>> {
        let (tx, rx) = mpsc::unbounded();
        {
            let mut state = self.state.lock();
            state.watches += 1;
            state.last_watch_version = Some(resource_version.to_string());
            state.watchers.retain(|w| !w.tx.is_closed());
            state.watchers.push(Watcher {
                namespace: namespace.map(String::from),
                tx,
            });
        }
        self.publish_open_watches();
        Ok(rx.boxed())
    }

    async fn replace(&self, obj: &K) -> client::Result<K> {
        self.write(obj)
    }

    async fn replace_status(&self, obj: &K) -> client::Result<K> {
        self.write(obj)
    }
}

// -------------------------------------------------------

struct StoredLease {
    lease: Lease,
    expires: Instant,
}

#[derive(Default)]
struct LeaseState {
    leases: AHashMap<(String, String), StoredLease>,
    partitioned: AHashSet<String>,
}

/// An in-memory [`LeaseClient`]
///
/// Leases expire on the tokio clock, so tests can drive them with paused time.
/// Cloning produces another handle to the same leases.
#[derive(Clone, Default)]
pub struct FakeLeases {
    state: Arc<Mutex<LeaseState>>,
}

impl FakeLeases {
    /// Creates an empty lease store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call from `holder` fail, as if it lost its connection
    pub fn partition(&self, holder: &str) {
        self.state.lock().partitioned.insert(holder.to_string());
    }

    /// Undo [`partition`](Self::partition)
    pub fn heal(&self, holder: &str) {
        self.state.lock().partitioned.remove(holder);
    }

    /// The holder of an unexpired lease
    #[must_use]
    pub fn holder(&self, lease: &str, namespace: &str) -> Option<String> {
        let state = self.state.lock();
        let stored = state.leases.get(&(namespace.to_string(), lease.to_string()))?;
        if stored.expires <= Instant::now() {
            return None;
        }
        stored.lease.spec.as_ref()?.holder_identity.clone()
    }

    /// How many times the lease changed hands
    #[must_use]
    pub fn transitions(&self, lease: &str, namespace: &str) -> i32 {
        self.state
            .lock()
            .leases
            .get(&(namespace.to_string(), lease.to_string()))
            .and_then(|stored| stored.lease.spec.as_ref()?.lease_transitions)
            .unwrap_or(0)
    }

    fn check_reachable(state: &LeaseState, holder: &str) -> client::Result<()> {
        if state.partitioned.contains(holder) {
            return Err(client::Error::Transport(format!("{holder} is partitioned")));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseClient for FakeLeases {
    async fn try_acquire_or_renew(
        &self,
        lease: &str,
        namespace: &str,
        holder: &str,
        lease_duration: Duration,
    ) -> client::Result<bool> {
        let mut state = self.state.lock();
        Self::check_reachable(&state, holder)?;
        let now = Instant::now();
        let stored = state
            .leases
            .entry((namespace.to_string(), lease.to_string()))
            .or_insert_with(|| StoredLease {
                lease: Lease {
                    metadata: ObjectMeta {
                        name: Some(lease.to_string()),
                        namespace: Some(namespace.to_string()),
                        ..ObjectMeta::default()
                    },
                    spec: Some(LeaseSpec::default()),
                },
                expires: now,
            });
        let spec = stored.lease.spec.get_or_insert_with(LeaseSpec::default);
        let current = spec.holder_identity.as_deref();
        if current.is_some_and(|h| h != holder) && stored.expires > now {
            return Ok(false);
        }
        if current != Some(holder) {
            spec.holder_identity = Some(holder.to_string());
            spec.lease_transitions = Some(spec.lease_transitions.map_or(0, |n| n + 1));
        }
        spec.lease_duration_seconds = Some(i32::try_from(lease_duration.as_secs()).unwrap_or(i32::MAX));
        stored.expires = now + lease_duration;
        Ok(true)
    }

    async fn release(&self, lease: &str, namespace: &str, holder: &str) -> client::Result<()> {
        let mut state = self.state.lock();
        Self::check_reachable(&state, holder)?;
        if let Some(stored) = state.leases.get_mut(&(namespace.to_string(), lease.to_string())) {
            if let Some(spec) = stored.lease.spec.as_mut() {
                if spec.holder_identity.as_deref() == Some(holder) {
                    spec.holder_identity = None;
                    stored.expires = Instant::now();
                }
            }
        }
        Ok(())
    }
}
