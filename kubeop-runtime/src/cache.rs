//! The local copy of every object of one kind.
use ahash::AHashMap;
use kubeop_core::{Resource, ResourceKey, WatchEvent};
use parking_lot::RwLock;
use std::sync::Arc;

type Cache<K> = Arc<RwLock<AHashMap<ResourceKey, Arc<K>>>>;

/// A readable cache of Kubernetes objects of kind `K`
///
/// Cloning will produce a new reference to the same backing store.
///
/// The cache only holds the last observed version of each object. Readers take a
/// short read lock and receive shared [`Arc`] handles, so they never block each other.
/// Writes are expected to come from a single writer per kind, the owning
/// [`Informer`](crate::Informer).
pub struct ResourceCache<K> {
    store: Cache<K>,
}

impl<K> Clone for ResourceCache<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<K> Default for ResourceCache<K> {
    fn default() -> Self {
        Self {
            store: Arc::default(),
        }
    }
}

impl<K: Resource> ResourceCache<K> {
    /// Creates an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieve the object with the given name and namespace, if it is in the cache.
    ///
    /// Note that this is a cache and may be stale. Deleted objects may still exist in the cache
    /// despite having been deleted in the cluster, and new objects may not yet exist in the cache.
    #[must_use]
    pub fn get(&self, name: &str, namespace: Option<&str>) -> Option<Arc<K>> {
        self.get_key(&ResourceKey::new(name, namespace))
    }

    /// Retrieve the object referred to by `key`, if it is in the cache.
    ///
    /// `key.namespace` is ignored for cluster-scoped resources.
    #[must_use]
    pub fn get_key(&self, key: &ResourceKey) -> Option<Arc<K>> {
        let store = self.store.read();
        store
            .get(key)
            // Try to erase the namespace and try again, in case the object is cluster-scoped
            .or_else(|| {
                if key.namespace.is_empty() {
                    return None;
                }
                store.get(&ResourceKey::new(&key.name, None))
            })
            .cloned()
    }

    /// Return a full snapshot of the current values
    #[must_use]
    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.read().values().cloned().collect()
    }

    /// Return the keys of every cached object
    #[must_use]
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.store.read().keys().cloned().collect()
    }

    /// The number of cached objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Whether the cache holds no objects
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    /// Replace the whole content of the cache
    ///
    /// The new content is built before it is swapped in under a single write lock,
    /// so readers either see the old set or the new one.
    pub fn replace(&self, items: impl IntoIterator<Item = K>) {
        self.swap(items.into_iter().map(Arc::new));
    }

    /// Applies a single watch event to the cache
    ///
    /// `Added` and `Modified` upsert the object, `Deleted` removes it.
    /// Bookmarks and errors carry no object and are ignored.
    pub fn apply(&self, event: &WatchEvent<K>)
    where
        K: Clone,
    {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                self.upsert(Arc::new(obj.clone()));
            }
            WatchEvent::Deleted(obj) => {
                self.remove(&ResourceKey::from_obj(obj));
            }
            WatchEvent::Bookmark(_) | WatchEvent::Error(_) => {}
        }
    }

    /// Store an object, returning the copy it replaced
    pub(crate) fn upsert(&self, obj: Arc<K>) -> Option<Arc<K>> {
        let key = ResourceKey::from_obj(obj.as_ref());
        self.store.write().insert(key, obj)
    }

    pub(crate) fn remove(&self, key: &ResourceKey) -> Option<Arc<K>> {
        self.store.write().remove(key)
    }

    /// Swap in a new content, returning the previous one
    pub(crate) fn swap(&self, items: impl IntoIterator<Item = Arc<K>>) -> AHashMap<ResourceKey, Arc<K>> {
        let fresh = items
            .into_iter()
            .map(|obj| (ResourceKey::from_obj(obj.as_ref()), obj))
            .collect::<AHashMap<_, _>>();
        std::mem::replace(&mut *self.store.write(), fresh)
    }
}
