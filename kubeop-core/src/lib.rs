//! Crate with types and traits necessary for building controllers against the Kubernetes API
//!
//! This crate is client-less: it holds the object model, the watch event wire types and
//! the pure helpers (such as resync interval parsing) that the runtime builds upon.
//! The same information here is always re-exported from `kubeop` under `kubeop::core`.
#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod api_resource;
pub use api_resource::ApiResource;

pub mod duration;
pub use duration::{parse_interval, Duration};

mod error;
pub use error::ErrorResponse;

mod key;
pub use key::ResourceKey;

pub mod metadata;

pub mod object;
pub use object::{HasSpec, HasStatus, NotUsed, Object, ObjectList, ResourceSpec};

mod resource;
pub use resource::{Resource, ResourceExt};

pub mod watch;
pub use watch::WatchEvent;
