//! Kubeop is an umbrella-crate for building Kubernetes style control loops in Rust.
//!
//! # Overview
//!
//! An operator keeps a local cache of the objects it manages up to date through list and
//! watch calls, and runs a reconciler for every object that changed or is due for a
//! periodic resync. With leader election enabled, only one replica runs the controllers.
//!
//! The main modules are:
//!
//! - [`core`] with the object model, watch events and the resync interval grammar
//! - [`runtime`] with the [`Informer`](runtime::Informer), [`WorkQueue`](runtime::WorkQueue),
//!   [`Controller`](runtime::Controller), leader election and the [`Operator`](runtime::Operator)
//!
//! The runtime talks to the cluster through the [`ResourceClient`](runtime::ResourceClient)
//! and [`LeaseClient`](runtime::LeaseClient) traits. In-memory implementations live in
//! [`runtime::fake`].
//!
//! # Running an operator
//!
//! ```no_run
//! use kubeop::prelude::*;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Clone, Debug, Default, Serialize, Deserialize)]
//! struct FooSpec {
//!     replicas: i32,
//! }
//!
//! impl ResourceSpec for FooSpec {
//!     const GROUP: &'static str = "clux.dev";
//!     const VERSION: &'static str = "v1";
//!     const KIND: &'static str = "Foo";
//!     const PLURAL: &'static str = "foos";
//!     const RESYNC_INTERVAL: Option<&'static str> = Some("10m");
//! }
//!
//! type Foo = Object<FooSpec, NotUsed>;
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("failed to reconcile")]
//! struct Error;
//!
//! async fn reconcile(req: ReconcileRequest<Foo>, _ctx: Arc<()>) -> Result<(), Error> {
//!     match &req.object {
//!         Some(foo) => println!("{} wants {} replicas", req.key, foo.spec.replicas),
//!         None => println!("{} is gone", req.key),
//!     }
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let foos: Arc<dyn ResourceClient<Foo>> = Arc::new(FakeClient::new());
//!     let registry = ControllerRegistry::new()
//!         .register(Registration::new(foos, reconcile, Arc::new(())));
//!
//!     let config = OperatorConfig::from_env();
//!     let operator = Operator::with_leases(registry, Arc::new(FakeLeases::new()), config)?;
//!     let token = CancellationToken::new();
//!     operator.run(token).await;
//!     Ok(())
//! }
//! ```
#![deny(unsafe_code)]

/// Re-exports from [`kubeop_core`]
#[doc(inline)]
pub use kubeop_core as core;

/// Re-exports from [`kubeop_runtime`]
#[doc(inline)]
pub use kubeop_runtime as runtime;

pub use crate::core::{Resource, ResourceExt, ResourceKey};
pub use crate::runtime::{ControllerRegistry, Operator, OperatorConfig, Registration};

/// A prelude for kubeop. Reduces the number of duplicated imports.
///
/// This prelude is similar to the standard library's prelude in that you'll
/// almost always want to import its entire contents, but unlike the
/// standard library's prelude you'll have to do so manually:
///
/// ```
/// use kubeop::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{NotUsed, Object, ObjectList, Resource, ResourceExt, ResourceKey, ResourceSpec};
    #[doc(no_inline)]
    pub use crate::runtime::{
        fake::{FakeClient, FakeLeases},
        CancellationToken, Controller, ControllerConfig, ControllerRegistry, Informer, InformerConfig,
        LeaderElection, LeaseClient, Operator, OperatorConfig, ReconcileRequest, Registration, ResourceClient,
        WorkQueue,
    };
}
