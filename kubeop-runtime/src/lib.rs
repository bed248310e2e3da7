//! Crate with the control-loop runtime for kubeop operators
//!
//! This crate contains the building blocks that keep a local view of the cluster in
//! sync and drive user reconcilers from it: the [`informer`] and its [`cache`],
//! the [`queue`] of pending keys, the per-kind [`controller`], the [`election`] gate and
//! the [`operator`] that ties them together.
//!
//! Newcomers should generally get started with [`Operator`] and a [`ControllerRegistry`],
//! which manage all of the internals above.
#![deny(unsafe_code)]

pub mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod election;
pub mod fake;
pub mod informer;
pub mod operator;
pub mod queue;

#[cfg(test)]
pub(crate) mod test_utils;

pub use cache::ResourceCache;
pub use client::{LeaseClient, ResourceClient};
pub use config::OperatorConfig;
pub use controller::{Controller, ControllerConfig, ReconcileRequest};
pub use election::{LeaderElection, LeaderElectionConfig, LeaseElector, NoopElection};
pub use informer::{Event, Informer, InformerConfig};
pub use operator::{ControllerRegistry, Operator, Registration};
pub use queue::WorkQueue;
pub use tokio_util::sync::CancellationToken;
