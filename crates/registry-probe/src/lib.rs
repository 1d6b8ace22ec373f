//! A minimal Docker registry client for probing image configuration.
//!
//! Unlike a full distribution client, this crate never pulls layers. It
//! resolves just enough of an image — Cmd, Entrypoint, exposed ports,
//! volumes, env and working dir — for a control plane to validate and
//! synthesize container specs. Resolution order is the v2 manifest plus
//! config blob, then the legacy v1 `images/<id>/json` endpoint, with
//! bearer-token (DockerHub-style) and HTTP Basic authentication.

pub mod client;
pub mod config;
pub mod errors;
pub mod reference;

pub use client::{Client, ClientConfig, RegistryAuth};
pub use config::ContainerConfig;
pub use errors::ProbeError;
pub use reference::Image;

/// The default public registry used when an image reference names no host.
pub const DEFAULT_REGISTRY: &str = "https://registry-1.docker.io";

/// DockerHub keeps the v1 index on a separate host.
pub const DOCKERHUB_V1_INDEX: &str = "https://index.docker.io";
