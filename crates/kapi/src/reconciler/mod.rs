//! The event reconciler.
//!
//! Three supervised loops watch the Kubernetes `pods`, `endpoints` and
//! `nodes` streams and project cluster state back into the control-plane
//! database and pub/sub channels. The loops share nothing but the
//! database and Redis; they are idempotent against redelivered events and
//! make no ordering assumptions relative to command handlers.
//!
//! A handler error never kills a loop: it is logged and the loop moves to
//! the next event. Transport failures restart the underlying watch with
//! backoff inside [`crate::kube_client::watch_stream`].

pub mod endpoints;
pub mod nodes;
pub mod pods;

use std::sync::Arc;

use futures::StreamExt;
use kube::api::{ListParams, WatchEvent};
use redis::aio::ConnectionManager;
use tokio::sync::watch;
use tracing::{error, info};

use crate::kube_client::{watch_stream, KubeClient};
use crate::node::{FsLimitSetter, NodeIpRouter};
use crate::sse::EventPublisher;
use crate::store::DbPool;
use crate::tasks::JobQueue;

/// Kubernetes' own service objects, present in every cluster and never
/// ours to manage.
const SYSTEM_OBJECT_NAMES: &[&str] = &["kubernetes", "kubernetes-ro"];

/// Shared context for all watcher loops.
#[derive(Clone)]
pub struct Reconciler {
    /// The database.
    pub db: DbPool,
    /// The cluster client.
    pub kube: KubeClient,
    /// Redis, for the state-vector caches.
    pub redis: ConnectionManager,
    /// Notification fan-out.
    pub publisher: EventPublisher,
    /// Public-IP routing on nodes.
    pub router: Arc<dyn NodeIpRouter>,
    /// Filesystem-limit plumbing on nodes.
    pub fs_limits: Arc<dyn FsLimitSetter>,
    /// Deferred-work queue (timeline repair and friends).
    pub jobs: JobQueue,
}

/// Whether an event concerns one of Kubernetes' own objects.
fn is_system_object<K: kube::Resource>(event: &WatchEvent<K>) -> bool {
    match event {
        WatchEvent::Added(object) | WatchEvent::Modified(object) | WatchEvent::Deleted(object) => {
            object
                .meta()
                .name
                .as_deref()
                .map_or(false, |name| SYSTEM_OBJECT_NAMES.contains(&name))
        }
        _ => false,
    }
}

impl Reconciler {
    /// Run all three watcher loops until the shutdown signal fires.
    ///
    /// Shutdown closes each stream at the next event boundary.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let pods = {
            let context = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let stream = watch_stream(context.kube.all_pods(), ListParams::default());
                futures::pin_mut!(stream);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        event = stream.next() => match event {
                            Some(event) if !is_system_object(&event) => {
                                if let Err(e) = pods::process_event(&context, event).await {
                                    error!(error = %e, "pods watcher: event dropped");
                                }
                            }
                            Some(_) => {}
                            None => break,
                        },
                    }
                }
                info!("pods watcher stopped");
            })
        };

        let endpoints = {
            let context = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let stream = watch_stream(context.kube.all_endpoints(), ListParams::default());
                futures::pin_mut!(stream);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        event = stream.next() => match event {
                            Some(event) if !is_system_object(&event) => {
                                if let Err(e) = endpoints::process_event(&context, event).await {
                                    error!(error = %e, "endpoints watcher: event dropped");
                                }
                            }
                            Some(_) => {}
                            None => break,
                        },
                    }
                }
                info!("endpoints watcher stopped");
            })
        };

        let nodes = {
            let context = self.clone();
            tokio::spawn(async move {
                let stream = watch_stream(context.kube.nodes(), ListParams::default());
                futures::pin_mut!(stream);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        event = stream.next() => match event {
                            Some(event) => {
                                if let Err(e) = nodes::process_event(&context, event).await {
                                    error!(error = %e, "nodes watcher: event dropped");
                                }
                            }
                            None => break,
                        },
                    }
                }
                info!("nodes watcher stopped");
            })
        };

        let _ = tokio::join!(pods, endpoints, nodes);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::Service;

    fn service_named(name: &str) -> Service {
        serde_json::from_value(serde_json::json!({
            "metadata": {"name": name, "namespace": "default"}
        }))
        .expect("decode")
    }

    #[test]
    fn kubernetes_system_objects_are_filtered() {
        assert!(is_system_object(&WatchEvent::Modified(service_named(
            "kubernetes"
        ))));
        assert!(is_system_object(&WatchEvent::Added(service_named(
            "kubernetes-ro"
        ))));
        assert!(!is_system_object(&WatchEvent::Modified(service_named(
            "service-x4tz"
        ))));
    }
}
