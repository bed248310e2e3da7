use crate::resource::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// A namespaced (if relevant) reference to an object of a known kind
///
/// This is the identity used by caches, work queues and resync schedules.
/// Cluster-scoped objects have an empty `namespace`.
///
/// ```
/// use kubeop_core::ResourceKey;
/// assert_eq!(ResourceKey::new("a", None), ResourceKey::new("a", Some("")));
/// assert_ne!(ResourceKey::new("a", None), ResourceKey::new("a", Some("ns")));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// The name of the object
    pub name: String,
    /// The namespace of the object, empty for cluster-scoped kinds
    #[serde(default)]
    pub namespace: String,
}

impl ResourceKey {
    /// Creates a key, treating a missing namespace as cluster scope
    #[must_use]
    pub fn new(name: &str, namespace: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.unwrap_or_default().to_string(),
        }
    }

    /// Creates a key for a namespaced object
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Derives the key from an object's metadata
    #[must_use]
    pub fn from_obj<K: Resource>(obj: &K) -> Self {
        Self {
            name: obj.name_any(),
            namespace: obj.namespace().unwrap_or_default(),
        }
    }

    /// The namespace, or `None` for cluster-scoped keys
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(&self.namespace)
        }
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace() {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ResourceKey;
    use crate::object::{NotUsed, Object, ResourceSpec};
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    struct FooSpec {}

    impl ResourceSpec for FooSpec {
        const GROUP: &'static str = "example.com";
        const KIND: &'static str = "Foo";
        const PLURAL: &'static str = "foos";
        const VERSION: &'static str = "v1";
    }

    #[test]
    fn display_includes_namespace_when_present() {
        assert_eq!(ResourceKey::new("a", Some("ns")).to_string(), "ns/a");
        assert_eq!(ResourceKey::new("a", None).to_string(), "a");
    }

    #[test]
    fn key_from_object_metadata() {
        let foo = Object::<FooSpec, NotUsed>::new("a", FooSpec {}).within("ns");
        assert_eq!(ResourceKey::from_obj(&foo), ResourceKey::new("a", None).within("ns"));

        let cluster_foo = Object::<FooSpec, NotUsed>::new("b", FooSpec {});
        let key = ResourceKey::from_obj(&cluster_foo);
        assert_eq!(key.namespace, "");
        assert_eq!(key.namespace(), None);
    }
}
