//! The boundary to the Kubernetes API.
//!
//! The runtime never speaks HTTP itself. It is handed implementations of
//! [`ResourceClient`] (one per kind) and [`LeaseClient`], and only relies on the
//! semantics documented here. [`fake`](crate::fake) contains in-memory implementations.
use async_trait::async_trait;
use futures::stream::BoxStream;
use kubeop_core::{ErrorResponse, ObjectList, WatchEvent};
use std::time::Duration;
use thiserror::Error;

/// Errors returned by API client implementations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The server answered with a `Status` failure
    #[error("api error: {0}")]
    Api(#[source] ErrorResponse),

    /// An optimistic concurrency check failed
    ///
    /// The caller is expected to re-fetch, merge and retry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The request never produced a response
    #[error("transport error: {0}")]
    Transport(String),

    /// The request did not complete in time
    #[error("request timed out")]
    Timeout,
}

impl Error {
    /// Whether this error means a watch must restart from a fresh list
    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(self, Error::Api(status) if status.is_gone())
    }

    /// Whether this error is an optimistic concurrency failure
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Api(status) => status.is_conflict(),
            _ => false,
        }
    }
}

/// Client result type
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A stream of raw watch events
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>>>;

/// List, watch and replace objects of one kind
///
/// An implementation is bound to one `{group, apiVersion, plural}` triple,
/// see [`ApiResource`](kubeop_core::ApiResource).
#[async_trait]
pub trait ResourceClient<K>: Send + Sync + 'static
where
    K: Send + Sync + 'static,
{
    /// List every object, in `namespace` or across the cluster
    ///
    /// The list-level resource version is a position a watch can resume from.
    async fn list(&self, namespace: Option<&str>) -> Result<ObjectList<K>>;

    /// Watch for changes after `resource_version`
    ///
    /// The server terminates the stream once `timeout` has passed; the caller reopens it.
    async fn watch(
        &self,
        namespace: Option<&str>,
        resource_version: &str,
        timeout: Duration,
    ) -> Result<WatchStream<K>>;

    /// Replace an object, failing with a conflict if its resource version is stale
    async fn replace(&self, obj: &K) -> Result<K>;

    /// Replace the status subresource of an object
    async fn replace_status(&self, obj: &K) -> Result<K>;
}

/// A leased resource with compare-and-swap semantics
///
/// Only the current holder, or anyone once the lease has lapsed, may take it.
#[async_trait]
pub trait LeaseClient: Send + Sync + 'static {
    /// Acquire the lease for `holder`, or renew it if `holder` already has it
    ///
    /// Returns `Ok(false)` when somebody else holds an unexpired lease.
    async fn try_acquire_or_renew(
        &self,
        lease: &str,
        namespace: &str,
        holder: &str,
        lease_duration: Duration,
    ) -> Result<bool>;

    /// Give the lease up if `holder` still has it
    async fn release(&self, lease: &str, namespace: &str, holder: &str) -> Result<()>;
}
