//! Typed access to the Kubernetes API.
//!
//! A thin wrapper around `kube::Client` scoped to the resources the control
//! plane touches, plus [`watch_stream`]: an infinite event stream that
//! resumes from the last observed resource version and backs off between
//! reconnects instead of ever ending.

use futures::{Stream, TryStreamExt};
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, Namespace, Node, Pod as KubePod, Service,
};
use k8s_openapi::api::core::v1::ReplicationController;
use kube::api::{Api, DeleteParams, ListParams, PostParams, WatchEvent};
use kube::error::ErrorResponse;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::backoff::{BackoffStrategy, ExponentialBackoffStrategy};
use crate::pod::build::POD_UID_LABEL;
use crate::Result;

/// The control plane's view of the Kubernetes API.
#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
}

impl KubeClient {
    /// Wrap an existing `kube::Client`.
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Connect using the ambient kubeconfig or in-cluster environment,
    /// with a 15 s read timeout on every request.
    pub async fn connect() -> Result<Self> {
        let mut config = kube::Config::infer()
            .await
            .map_err(|e| crate::Error::Internal(format!("kubeconfig inference failed: {}", e)))?;
        config.timeout = Some(std::time::Duration::from_secs(15));
        let client = kube::Client::try_from(config).map_err(crate::Error::from)?;
        Ok(Self::new(client))
    }

    /// The underlying client, for collaborators needing raw access.
    pub fn raw(&self) -> kube::Client {
        self.client.clone()
    }

    /// Pods in a pod's namespace.
    pub fn pods(&self, namespace: &str) -> Api<KubePod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Pods across all namespaces.
    pub fn all_pods(&self) -> Api<KubePod> {
        Api::all(self.client.clone())
    }

    /// Services in a pod's namespace.
    pub fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Endpoints across all namespaces.
    pub fn all_endpoints(&self) -> Api<Endpoints> {
        Api::all(self.client.clone())
    }

    /// ReplicationControllers in a pod's namespace.
    pub fn replication_controllers(&self, namespace: &str) -> Api<ReplicationController> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Cluster nodes.
    pub fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    /// Namespaces.
    pub fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    /// ConfigMaps in a namespace.
    pub fn configmaps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Create the pod's namespace if it does not exist yet.
    pub async fn ensure_namespace(&self, pod_id: &str) -> Result<()> {
        let api = self.namespaces();
        match api.get(pod_id).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
                let namespace: Namespace =
                    serde_json::from_value(crate::pod::build::namespace_object(pod_id))?;
                api.create(&PostParams::default(), &namespace).await?;
                debug!(%pod_id, "namespace created");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the pod's namespace, tolerating it being gone already.
    pub async fn delete_namespace(&self, pod_id: &str) -> Result<()> {
        match self
            .namespaces()
            .delete(pod_id, &DeleteParams::default())
            .await
        {
            Ok(_) | Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Post a synthesized ReplicationController.
    pub async fn create_replication_controller(
        &self,
        namespace: &str,
        object: Value,
    ) -> Result<ReplicationController> {
        let rc: ReplicationController = serde_json::from_value(object)?;
        Ok(self
            .replication_controllers(namespace)
            .create(&PostParams::default(), &rc)
            .await?)
    }

    /// Delete a ReplicationController, tolerating 404.
    pub async fn delete_replication_controller(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        match self
            .replication_controllers(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) | Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Post a synthesized Service.
    pub async fn create_service(&self, namespace: &str, object: Value) -> Result<Service> {
        let service: Service = serde_json::from_value(object)?;
        Ok(self
            .services(namespace)
            .create(&PostParams::default(), &service)
            .await?)
    }

    /// Replace a Service in full (used for annotation CAS writes).
    pub async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let name = service.name();
        Ok(self
            .services(namespace)
            .replace(&name, &PostParams::default(), service)
            .await?)
    }

    /// All Services labeled with a pod uid, across its namespace.
    pub async fn services_by_pod(&self, pod_id: &str) -> Result<Vec<Service>> {
        let params = ListParams::default().labels(&format!("{}={}", POD_UID_LABEL, pod_id));
        Ok(self.services(pod_id).list(&params).await?.items)
    }

    /// All live Kubernetes pods labeled with a pod uid.
    pub async fn pods_by_uid(&self, pod_id: &str) -> Result<Vec<KubePod>> {
        let params = ListParams::default().labels(&format!("{}={}", POD_UID_LABEL, pod_id));
        Ok(self.pods(pod_id).list(&params).await?.items)
    }

    /// Adjust an integer node annotation by `delta`, never below zero.
    ///
    /// Counter annotations have many writers, so a blind read-then-patch
    /// loses updates. The write replaces the node object carrying its
    /// resourceVersion; a stale write (409) refetches and retries once.
    /// Returns the value written.
    pub async fn increment_node_annotation(
        &self,
        node_name: &str,
        key: &str,
        delta: i64,
    ) -> Result<i64> {
        let api = self.nodes();
        let mut node = api.get(node_name).await?;
        for attempt in 0..2 {
            let current: i64 = node
                .annotations()
                .get(key)
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0);
            let next = (current + delta).max(0);
            node.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(key.to_owned(), next.to_string());
            match api.replace(node_name, &PostParams::default(), &node).await {
                Ok(_) => return Ok(next),
                Err(kube::Error::Api(ErrorResponse { code: 409, .. })) if attempt == 0 => {
                    // Someone raced us; recompute against the fresh object.
                    node = api.get(node_name).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(crate::Error::Conflict(format!(
            "annotation {} on node {} kept conflicting",
            key, node_name
        )))
    }
}

/// An infinite watch over one resource kind.
///
/// The stream reopens the server-side watch whenever it ends or errors,
/// resuming from the last resource version it saw; a 410 Gone resets the
/// version and replays current state. Consumers never observe the end of
/// the stream, only a pause while the backoff timer runs.
pub fn watch_stream<K>(
    api: Api<K>,
    params: ListParams,
) -> impl Stream<Item = WatchEvent<K>> + Send
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    async_stream::stream! {
        let mut backoff = ExponentialBackoffStrategy::default();
        let mut version = "0".to_owned();
        loop {
            let watch = match api.watch(&params, &version).await {
                Ok(watch) => watch,
                Err(e) => {
                    warn!(error = %e, "failed to open watch stream");
                    backoff.wait().await;
                    continue;
                }
            };
            futures::pin_mut!(watch);
            loop {
                match watch.try_next().await {
                    Ok(Some(WatchEvent::Error(response))) => {
                        if response.code == 410 {
                            // Our resource version expired server-side.
                            debug!("watch resource version expired, restarting from scratch");
                            version = "0".to_owned();
                        } else {
                            warn!(code = response.code, message = %response.message,
                                "watch stream reported an error");
                        }
                        break;
                    }
                    Ok(Some(event)) => {
                        if let Some(new_version) = event_resource_version(&event) {
                            version = new_version;
                        }
                        backoff.reset();
                        yield event;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "watch stream transport failure");
                        break;
                    }
                }
            }
            backoff.wait().await;
        }
    }
}

fn event_resource_version<K>(event: &WatchEvent<K>) -> Option<String>
where
    K: kube::Resource,
{
    match event {
        WatchEvent::Added(object)
        | WatchEvent::Modified(object)
        | WatchEvent::Deleted(object) => object.meta().resource_version.clone(),
        WatchEvent::Bookmark(bookmark) => Some(bookmark.metadata.resource_version.clone()),
        WatchEvent::Error(_) => None,
    }
}
