//! The KuberDock control-plane core.
//!
//! This library turns a Kubernetes cluster into a multi-tenant PaaS: it owns
//! user-facing pod specifications and their translation into Kubernetes
//! objects, public-IP pools, persistent-disk identity across storage
//! backends, and the reconciliation of cluster events back into the
//! control-plane database.
//!
//! The database is the ownership authority; Kubernetes is a materialized
//! view this library converges towards. Redis carries only locks, pub/sub
//! notifications and disposable caches.

#![deny(missing_docs)]

pub mod backoff;
pub mod config;
pub mod error;
pub mod images;
pub mod ippool;
pub mod kube_client;
pub mod lbpoll;
pub mod lock;
pub mod node;
pub mod pod;
pub mod pstorage;
pub mod reconciler;
pub mod sse;
pub mod store;
pub mod tasks;

pub use config::Config;
pub use error::Error;

/// A convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
