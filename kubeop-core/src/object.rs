//! Generic object and objectlist wrappers.
use crate::{
    metadata::{ListMeta, ObjectMeta, TypeMeta},
    resource::Resource,
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// A generic Kubernetes object list
///
/// This is what a list call on a [`Resource`] produces: the items together with
/// the list-level `resourceVersion` a watch can resume from.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ObjectList<T> {
    /// ListMeta - only really used for its `resourceVersion`
    ///
    /// See [ListMeta](k8s_openapi::apimachinery::pkg::apis::meta::v1::ListMeta)
    #[serde(default)]
    pub metadata: ListMeta,

    /// The items we are actually interested in. In practice; `T := Object<P,U>`.
    #[serde(bound(deserialize = "Vec<T>: Deserialize<'de>"))]
    pub items: Vec<T>,
}

impl<T> ObjectList<T> {
    /// Creates a list with the given list-level resource version
    pub fn new(items: Vec<T>, resource_version: Option<String>) -> Self {
        Self {
            metadata: ListMeta {
                resource_version,
                ..ListMeta::default()
            },
            items,
        }
    }

    /// `iter` returns an Iterator over the elements of this ObjectList
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T> IntoIterator for ObjectList<T> {
    type IntoIter = ::std::vec::IntoIter<Self::Item>;
    type Item = T;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a ObjectList<T> {
    type IntoIter = ::std::slice::Iter<'a, T>;
    type Item = &'a T;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// A trait to access the `spec` of a Kubernetes resource.
///
/// Note: Not all Kubernetes resources have a spec (e.g. `ConfigMap`, `Secret`, ...).
pub trait HasSpec {
    /// The type of the `spec` of this resource
    type Spec;

    /// Returns a reference to the `spec` of the object
    fn spec(&self) -> &Self::Spec;

    /// Returns a mutable reference to the `spec` of the object
    fn spec_mut(&mut self) -> &mut Self::Spec;
}

/// A trait to access the `status` of a Kubernetes resource.
pub trait HasStatus {
    /// The type of the `status` object
    type Status;

    /// Returns an optional reference to the `status` of the object
    fn status(&self) -> Option<&Self::Status>;

    /// Returns an optional mutable reference to the `status` of the object
    fn status_mut(&mut self) -> &mut Option<Self::Status>;
}

/// Static type information declared by the spec type of a custom resource.
///
/// Implementing this for a spec struct makes [`Object<Spec, Status>`] a [`Resource`].
///
/// ```
/// use kubeop_core::{NotUsed, Object, Resource, ResourceSpec};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Debug, Serialize, Deserialize)]
/// struct DatabaseSpec { replicas: u32 }
///
/// impl ResourceSpec for DatabaseSpec {
///     const GROUP: &'static str = "example.com";
///     const VERSION: &'static str = "v1";
///     const KIND: &'static str = "Database";
///     const PLURAL: &'static str = "databases";
///     const RESYNC_INTERVAL: Option<&'static str> = Some("30s");
/// }
///
/// type Database = Object<DatabaseSpec, NotUsed>;
/// assert_eq!(Database::api_version(), "example.com/v1");
/// ```
pub trait ResourceSpec {
    /// API group, empty for the core group
    const GROUP: &'static str;
    /// API version within the group
    const VERSION: &'static str;
    /// Singular PascalCase kind
    const KIND: &'static str;
    /// Lowercase plural name
    const PLURAL: &'static str;
    /// Periodic reconcile interval, in the interval grammar
    const RESYNC_INTERVAL: Option<&'static str> = None;
}

// -------------------------------------------------------

/// A standard Kubernetes object with `.spec` and `.status`.
///
/// This is the envelope every custom resource handled by the runtime is stored in.
/// Use `U = NotUsed` when a status does not exist.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Object<P, U> {
    /// The type fields, not always present
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,

    /// Resource metadata
    ///
    /// Contains information common to most resources about the Resource,
    /// including the object name, annotations, labels and more.
    pub metadata: ObjectMeta,

    /// The desired state of the resource as specified by the user.
    pub spec: P,

    /// The state of the resource as observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<U>,
}

impl<P: ResourceSpec, U> Object<P, U> {
    /// Creates a named object with type information taken from the spec type
    pub fn new(name: &str, spec: P) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: Self::api_version().into_owned(),
                kind: P::KIND.to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    /// Attach a namespace to an Object
    #[must_use]
    pub fn within(mut self, ns: &str) -> Self {
        self.metadata.namespace = Some(ns.into());
        self
    }

    /// Set the generation of an Object
    #[must_use]
    pub fn with_generation(mut self, generation: i64) -> Self {
        self.metadata.generation = Some(generation);
        self
    }
}

impl<P: ResourceSpec, U> Resource for Object<P, U> {
    fn kind() -> Cow<'static, str> {
        P::KIND.into()
    }

    fn group() -> Cow<'static, str> {
        P::GROUP.into()
    }

    fn version() -> Cow<'static, str> {
        P::VERSION.into()
    }

    fn plural() -> Cow<'static, str> {
        P::PLURAL.into()
    }

    fn resync_interval() -> Option<Cow<'static, str>> {
        P::RESYNC_INTERVAL.map(Cow::Borrowed)
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl<P, U> HasSpec for Object<P, U> {
    type Spec = P;

    fn spec(&self) -> &Self::Spec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut Self::Spec {
        &mut self.spec
    }
}

impl<P, U> HasStatus for Object<P, U> {
    type Status = U;

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut Option<Self::Status> {
        &mut self.status
    }
}

/// Empty struct for when data should be discarded
///
/// Not using [`()`](https://doc.rust-lang.org/stable/std/primitive.unit.html), because serde's
/// [`Deserialize`](serde::Deserialize) `impl` is too strict.
#[derive(Clone, Deserialize, Serialize, Default, Debug)]
pub struct NotUsed {}
