//! Keeps a [`ResourceCache`] in sync with the API server and publishes the changes.
//!
//! An [`Informer`] performs one initial list, marks itself as synced and then follows a
//! watch from the listed resource version. Every change is applied to the cache and
//! forwarded to subscribers as an [`Event`].
use crate::{
    cache::ResourceCache,
    client::{self, ResourceClient},
    config::interval,
};
use async_broadcast::{InactiveReceiver, Receiver, Sender};
use futures::{Stream, StreamExt};
use kubeop_core::{ApiResource, ErrorResponse, Resource, ResourceExt, ResourceKey, WatchEvent};
use pin_project::pin_project;
use serde::{Deserialize, Serialize};
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("failed to perform initial object list: {0}")]
    InitialListFailed(#[source] client::Error),
    #[error("failed to re-list objects: {0}")]
    RelistFailed(#[source] client::Error),
    #[error("failed to start watching object: {0}")]
    WatchStartFailed(#[source] client::Error),
    #[error("error returned by apiserver during watch: {0}")]
    WatchError(#[source] ErrorResponse),
    #[error("watch stream failed: {0}")]
    WatchFailed(#[source] client::Error),
    #[error("watch position expired")]
    Expired,
    #[error("cancelled before the initial list completed")]
    Cancelled,
}

/// Informer result type
pub type Result<T, E = Error> = std::result::Result<T, E>;

// a watch that ends sooner is reopened only after this much time has passed
const MIN_WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// A change observed by an [`Informer`]
#[derive(Debug)]
pub enum Event<K> {
    /// An object was observed for the first time
    Added(Arc<K>),
    /// An object changed
    Modified(Arc<K>),
    /// An object was deleted; this carries its last observed state
    Deleted(Arc<K>),
}

impl<K> Clone for Event<K> {
    fn clone(&self) -> Self {
        match self {
            Event::Added(obj) => Event::Added(obj.clone()),
            Event::Modified(obj) => Event::Modified(obj.clone()),
            Event::Deleted(obj) => Event::Deleted(obj.clone()),
        }
    }
}

impl<K> Event<K> {
    /// The object this event is about
    pub fn object(&self) -> &Arc<K> {
        match self {
            Event::Added(obj) | Event::Modified(obj) | Event::Deleted(obj) => obj,
        }
    }
}

/// Configuration for an [`Informer`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InformerConfig {
    /// Restrict the informer to one namespace
    ///
    /// Defaults to watching across all namespaces.
    pub namespace: Option<String>,

    /// Server side timeout for a single watch call
    ///
    /// The watch is reopened from the last seen resource version once it runs out.
    #[serde(with = "interval")]
    pub watch_timeout: Duration,

    /// How long to wait before reopening a failed watch
    #[serde(with = "interval")]
    pub retry_delay: Duration,

    /// Apply `Modified` events that leave the generation unchanged without publishing them
    ///
    /// Such events are status or metadata writes, typically made by the controller itself.
    pub skip_status_updates: bool,

    /// Number of events buffered per subscriber before the informer waits for it
    pub event_buffer: usize,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            watch_timeout: Duration::from_secs(60 * 60),
            retry_delay: Duration::from_secs(5),
            skip_status_updates: true,
            event_buffer: 1024,
        }
    }
}

impl InformerConfig {
    /// Only watch objects in `namespace`
    #[must_use]
    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Set the server side timeout of each watch call
    #[must_use]
    pub fn watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }

    /// Set the delay before a failed watch is reopened
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Publish every `Modified` event, including status-only updates
    #[must_use]
    pub fn publish_status_updates(mut self) -> Self {
        self.skip_status_updates = false;
        self
    }
}

/// Watches one kind and keeps a [`ResourceCache`] of it
///
/// `start` lists every object and then spawns the watch task, so that
/// [`has_synced`](Self::has_synced) only becomes true once the cache reflects a full list.
/// Subscribers created through [`subscribe`](Self::subscribe) see every published event
/// from their creation on, including a synthetic `Added` for each initially listed object.
///
/// Slow subscribers apply backpressure: the watch task waits for room in their buffer.
/// Events are only discarded when nobody is subscribed at all.
pub struct Informer<K> {
    client: Arc<dyn ResourceClient<K>>,
    config: InformerConfig,
    cache: ResourceCache<K>,
    synced: watch::Sender<bool>,
    events: Sender<Event<K>>,
    // keeps the channel open while nobody is subscribed
    _events_rx: InactiveReceiver<Event<K>>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Creates an informer that has not started yet
    #[must_use]
    pub fn new(client: Arc<dyn ResourceClient<K>>, config: InformerConfig) -> Self {
        let (mut events, events_rx) = async_broadcast::broadcast(config.event_buffer.max(1));
        events.set_await_active(false);
        Self {
            client,
            config,
            cache: ResourceCache::new(),
            synced: watch::channel(false).0,
            events,
            _events_rx: events_rx.deactivate(),
        }
    }

    /// Perform the initial list and spawn the watch task
    ///
    /// The returned handle completes once `token` is cancelled.
    ///
    /// # Errors
    /// Fails with [`Error::InitialListFailed`] when the initial list fails, or with
    /// [`Error::Cancelled`] when `token` is cancelled before it completes; the informer
    /// then never becomes synced.
    #[tracing::instrument(skip_all, fields(api = %ApiResource::erase::<K>()))]
    pub async fn start(&self, token: CancellationToken) -> Result<JoinHandle<()>> {
        let namespace = self.config.namespace.as_deref();
        let list = tokio::select! {
            list = self.client.list(namespace) => list.map_err(Error::InitialListFailed)?,
            () = token.cancelled() => return Err(Error::Cancelled),
        };
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let initial = list.items.into_iter().map(Arc::new).collect::<Vec<_>>();
        self.cache.swap(initial.iter().cloned());
        self.synced.send_replace(true);
        info!(
            objects = initial.len(),
            %resource_version,
            "cache synced"
        );

        let mut task = WatchTask {
            client: self.client.clone(),
            config: self.config.clone(),
            cache: self.cache.clone(),
            events: self.events.clone(),
            resource_version,
        };
        Ok(tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = task.run(initial) => {}
            }
            debug!(kind = %K::kind(), "informer stopped");
        }))
    }

    /// Whether the initial list has completed
    #[must_use]
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the initial list has completed
    ///
    /// Returns `false` if `token` was cancelled first.
    pub async fn wait_for_sync(&self, token: &CancellationToken) -> bool {
        let mut synced = self.synced.subscribe();
        tokio::select! {
            res = synced.wait_for(|synced| *synced) => res.is_ok(),
            () = token.cancelled() => false,
        }
    }

    /// Subscribe to every event published from now on
    #[must_use]
    pub fn subscribe(&self) -> EventStream<K> {
        EventStream {
            rx: self.events.new_receiver(),
        }
    }

    /// Retrieve a cached object
    #[must_use]
    pub fn get(&self, name: &str, namespace: Option<&str>) -> Option<Arc<K>> {
        self.cache.get(name, namespace)
    }

    /// Return every cached object
    #[must_use]
    pub fn list(&self) -> Vec<Arc<K>> {
        self.cache.list()
    }

    /// Return a read handle to the cache
    #[must_use]
    pub fn store(&self) -> ResourceCache<K> {
        self.cache.clone()
    }
}

/// A stream of [`Event`]s from an [`Informer`]
///
/// Ends when the informer is dropped.
#[pin_project]
pub struct EventStream<K> {
    #[pin]
    rx: Receiver<Event<K>>,
}

impl<K> Stream for EventStream<K> {
    type Item = Event<K>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().rx.poll_next(cx)
    }
}

/// The state owned by the spawned watch loop
struct WatchTask<K> {
    client: Arc<dyn ResourceClient<K>>,
    config: InformerConfig,
    cache: ResourceCache<K>,
    events: Sender<Event<K>>,
    resource_version: String,
}

impl<K> WatchTask<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn run(&mut self, initial: Vec<Arc<K>>) {
        for obj in initial {
            self.publish(Event::Added(obj)).await;
        }
        loop {
            let opened = Instant::now();
            match self.watch().await {
                Ok(()) => {
                    debug!(kind = %K::kind(), "watch ended, reopening");
                    tokio::time::sleep_until(opened + MIN_WATCH_INTERVAL).await;
                }
                Err(Error::Expired) => {
                    info!(kind = %K::kind(), "watch position expired, re-listing");
                    if let Err(err) = self.relist().await {
                        warn!(kind = %K::kind(), error = %err, "re-list failed");
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
                Err(err) => {
                    warn!(
                        kind = %K::kind(),
                        error = %err,
                        resource_version = %self.resource_version,
                        "watch failed, retrying in {:?}",
                        self.config.retry_delay
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    /// Follow one watch call until it ends
    async fn watch(&mut self) -> Result<()> {
        let mut stream = self
            .client
            .watch(
                self.config.namespace.as_deref(),
                &self.resource_version,
                self.config.watch_timeout,
            )
            .await
            .map_err(|err| {
                if err.is_gone() {
                    Error::Expired
                } else {
                    Error::WatchStartFailed(err)
                }
            })?;
        while let Some(event) = stream.next().await {
            let event = event.map_err(|err| {
                if err.is_gone() {
                    Error::Expired
                } else {
                    Error::WatchFailed(err)
                }
            })?;
            self.handle(event).await?;
        }
        Ok(())
    }

    async fn handle(&mut self, event: WatchEvent<K>) -> Result<()> {
        match event {
            WatchEvent::Added(obj) => {
                self.bookmark(&obj);
                let obj = Arc::new(obj);
                self.cache.upsert(obj.clone());
                self.publish(Event::Added(obj)).await;
            }
            WatchEvent::Modified(obj) => {
                self.bookmark(&obj);
                let obj = Arc::new(obj);
                let previous = self.cache.upsert(obj.clone());
                let unchanged = previous.is_some_and(|prev| prev.generation() == obj.generation());
                if self.config.skip_status_updates && unchanged {
                    debug!(
                        kind = %K::kind(),
                        key = %ResourceKey::from_obj(obj.as_ref()),
                        "generation unchanged, not publishing"
                    );
                } else {
                    self.publish(Event::Modified(obj)).await;
                }
            }
            WatchEvent::Deleted(obj) => {
                self.bookmark(&obj);
                let key = ResourceKey::from_obj(&obj);
                let last = self.cache.remove(&key).unwrap_or_else(|| Arc::new(obj));
                self.publish(Event::Deleted(last)).await;
            }
            WatchEvent::Bookmark(bm) => self.resource_version = bm.metadata.resource_version,
            WatchEvent::Error(err) if err.is_gone() => return Err(Error::Expired),
            WatchEvent::Error(err) => return Err(Error::WatchError(err)),
        }
        Ok(())
    }

    /// Replace the cache from a fresh list and publish the difference
    async fn relist(&mut self) -> Result<()> {
        let list = self
            .client
            .list(self.config.namespace.as_deref())
            .await
            .map_err(Error::RelistFailed)?;
        self.resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let fresh = list.items.into_iter().map(Arc::new).collect::<Vec<_>>();
        let mut previous = self.cache.swap(fresh.iter().cloned());
        info!(kind = %K::kind(), objects = fresh.len(), "cache re-synced");

        for obj in fresh {
            match previous.remove(&ResourceKey::from_obj(obj.as_ref())) {
                None => self.publish(Event::Added(obj)).await,
                Some(prev) if prev.resource_version() != obj.resource_version() => {
                    self.publish(Event::Modified(obj)).await;
                }
                Some(_) => {}
            }
        }
        for (_, gone) in previous {
            self.publish(Event::Deleted(gone)).await;
        }
        Ok(())
    }

    fn bookmark(&mut self, obj: &K) {
        if let Some(rv) = obj.resource_version() {
            self.resource_version = rv;
        }
    }

    async fn publish(&self, event: Event<K>) {
        if self.events.receiver_count() == 0 {
            return;
        }
        // only fails once every receiver is gone
        let _ = self.events.broadcast_direct(event).await;
    }
}
