//! The endpoints watcher: public-IP binding and migration.
//!
//! Each Service with a public IP carries a `public-ip-state` annotation
//! naming the IP, the node currently routing it and the backing pod IP.
//! Endpoint events tell us where the backing pod actually runs; this
//! watcher converges the routing rules and the annotation, including the
//! migration case (pod rescheduled to another node).

use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::api::WatchEvent;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::node::IpRuleOp;
use crate::pod::build::PUBLIC_IP_STATE_ANNOTATION;
use crate::reconciler::Reconciler;
use crate::{Error, Result};

/// The `public-ip-state` annotation payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PublicIpState {
    /// The public IP assigned to the service's pod.
    #[serde(rename = "assigned-public-ip", default)]
    pub assigned_public_ip: Option<String>,
    /// The node currently routing the IP.
    #[serde(rename = "assigned-to", default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    /// The pod IP the routing points at.
    #[serde(
        rename = "assigned-pod-ip",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub assigned_pod_ip: Option<String>,
}

impl PublicIpState {
    /// Decode from a service's annotations.
    pub fn from_service(service: &Service) -> Option<PublicIpState> {
        let raw = service.annotations().get(PUBLIC_IP_STATE_ANNOTATION)?;
        serde_json::from_str(raw).ok()
    }
}

/// What the watcher decided to do about one endpoint event.
#[derive(Clone, Debug, PartialEq)]
pub enum BindingAction {
    /// Nothing to change.
    Keep,
    /// Install routing on a node and record it.
    Bind {
        /// Target node.
        host: String,
        /// Backing pod IP.
        pod_ip: String,
    },
    /// Remove routing from the recorded node and clear the record.
    Unbind {
        /// The node that was routing.
        host: String,
        /// The recorded pod IP.
        pod_ip: String,
    },
    /// Remove from the old node, install on the new one.
    Migrate {
        /// The node that was routing.
        from: String,
        /// The pod IP recorded for the old node.
        from_pod_ip: String,
        /// The node that should route now.
        to: String,
        /// The current pod IP.
        pod_ip: String,
    },
}

/// Decide the binding change for one event.
///
/// `backing` is the (node, pod IP) pair of the single backing pod, when
/// there is exactly one; `None` covers the empty-subsets case. More than
/// one backing pod is the replica case and out of scope — callers pass
/// the first.
pub fn decide(
    state: &PublicIpState,
    modified: bool,
    backing: Option<(&str, &str)>,
) -> BindingAction {
    match state.assigned_public_ip.as_deref() {
        Some(ip) if !ip.is_empty() => {}
        _ => return BindingAction::Keep,
    }

    match backing {
        None => match (&state.assigned_to, &state.assigned_pod_ip, modified) {
            (Some(host), Some(pod_ip), true) => BindingAction::Unbind {
                host: host.clone(),
                pod_ip: pod_ip.clone(),
            },
            _ => BindingAction::Keep,
        },
        Some((host, pod_ip)) => match (&state.assigned_to, &state.assigned_pod_ip) {
            (Some(current), Some(current_pod_ip)) if current != host => BindingAction::Migrate {
                from: current.clone(),
                from_pod_ip: current_pod_ip.clone(),
                to: host.to_owned(),
                pod_ip: pod_ip.to_owned(),
            },
            (Some(_), _) => BindingAction::Keep,
            (None, _) => BindingAction::Bind {
                host: host.to_owned(),
                pod_ip: pod_ip.to_owned(),
            },
        },
    }
}

/// Handle one endpoints-stream event.
pub async fn process_event(context: &Reconciler, event: WatchEvent<Endpoints>) -> Result<()> {
    let (endpoints, modified) = match event {
        WatchEvent::Modified(endpoints) => (endpoints, true),
        WatchEvent::Added(endpoints) => (endpoints, false),
        _ => return Ok(()),
    };
    let name = endpoints.name();
    let namespace = match endpoints.namespace() {
        Some(namespace) => namespace,
        None => return Ok(()),
    };

    let service = match context.kube.services(&namespace).get(&name).await {
        Ok(service) => service,
        Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut state = match PublicIpState::from_service(&service) {
        Some(state) => state,
        None => return Ok(()),
    };

    // Exactly-one backing pod case: its address and node.
    let backing = single_backing_pod(&endpoints);
    let backing_resolved = match &backing {
        Some((pod_name, pod_ip)) => {
            match node_of_pod(context, &namespace, pod_name).await? {
                // Not scheduled yet; a later event will carry the node.
                None => return Ok(()),
                Some(host) => Some((host, pod_ip.clone())),
            }
        }
        None => None,
    };

    let ports: Vec<Value> = service
        .spec
        .as_ref()
        .and_then(|s| serde_json::to_value(&s.ports).ok())
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();

    let action = decide(
        &state,
        modified,
        backing_resolved
            .as_ref()
            .map(|(host, pod_ip)| (host.as_str(), pod_ip.as_str())),
    );
    let public_ip = state.assigned_public_ip.clone().unwrap_or_default();

    match &action {
        BindingAction::Keep => return Ok(()),
        BindingAction::Unbind { host, pod_ip } => {
            context
                .router
                .modify_node_ips(&name, host, IpRuleOp::Del, pod_ip, &public_ip, &ports)
                .await?;
            state.assigned_to = None;
            state.assigned_pod_ip = None;
        }
        BindingAction::Bind { host, pod_ip } => {
            context
                .router
                .modify_node_ips(&name, host, IpRuleOp::Add, pod_ip, &public_ip, &ports)
                .await?;
            state.assigned_to = Some(host.clone());
            state.assigned_pod_ip = Some(pod_ip.clone());
        }
        BindingAction::Migrate {
            from,
            from_pod_ip,
            to,
            pod_ip,
        } => {
            debug!(service = %name, %from, %to, "migrating public IP binding");
            context
                .router
                .modify_node_ips(&name, from, IpRuleOp::Del, from_pod_ip, &public_ip, &ports)
                .await?;
            context
                .router
                .modify_node_ips(&name, to, IpRuleOp::Add, pod_ip, &public_ip, &ports)
                .await?;
            state.assigned_to = Some(to.clone());
            state.assigned_pod_ip = Some(pod_ip.clone());
        }
    }

    write_annotation(context, &namespace, service, &state).await
}

/// Write the annotation back, retrying once on a stale resource version.
async fn write_annotation(
    context: &Reconciler,
    namespace: &str,
    mut service: Service,
    state: &PublicIpState,
) -> Result<()> {
    for attempt in 0..2 {
        set_annotation(&mut service, state)?;
        match context.kube.replace_service(namespace, &service).await {
            Ok(_) => return Ok(()),
            Err(Error::KubeApi { status: 409, .. }) if attempt == 0 => {
                // Someone raced us; refetch and reapply once.
                service = context
                    .kube
                    .services(namespace)
                    .get(&service.name())
                    .await?;
            }
            Err(e) => {
                warn!(error = %e, service = %service.name(),
                    "public-ip-state annotation update dropped");
                return Ok(());
            }
        }
    }
    Ok(())
}

fn set_annotation(service: &mut Service, state: &PublicIpState) -> Result<()> {
    let encoded = serde_json::to_string(state)?;
    service
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(PUBLIC_IP_STATE_ANNOTATION.to_owned(), encoded);
    Ok(())
}

/// The (pod name, pod IP) of the single backing pod, when subsets carry
/// exactly one address.
fn single_backing_pod(endpoints: &Endpoints) -> Option<(String, String)> {
    let subsets = endpoints.subsets.as_ref()?;
    let addresses: Vec<_> = subsets
        .iter()
        .flat_map(|s| s.addresses.iter().flatten())
        .collect();
    match addresses.as_slice() {
        [address] => {
            let pod_name = address.target_ref.as_ref()?.name.clone()?;
            Some((pod_name, address.ip.clone()))
        }
        // Zero or replicas; the binding only tracks single-pod services.
        _ => None,
    }
}

/// The node a Kubernetes pod is scheduled on.
async fn node_of_pod(
    context: &Reconciler,
    namespace: &str,
    pod_name: &str,
) -> Result<Option<String>> {
    let pod = context.kube.pods(namespace).get(pod_name).await?;
    Ok(pod.spec.as_ref().and_then(|s| s.node_name.clone()))
}

#[cfg(test)]
mod test {
    use super::*;

    fn state(public: Option<&str>, to: Option<&str>, pod_ip: Option<&str>) -> PublicIpState {
        PublicIpState {
            assigned_public_ip: public.map(str::to_owned),
            assigned_to: to.map(str::to_owned),
            assigned_pod_ip: pod_ip.map(str::to_owned),
        }
    }

    #[test]
    fn no_public_ip_means_nothing_to_do() {
        let action = decide(&state(None, None, None), true, Some(("node1", "10.1.0.5")));
        assert_eq!(action, BindingAction::Keep);
    }

    #[test]
    fn first_endpoint_binds_the_ip() {
        let action = decide(
            &state(Some("192.0.2.10"), None, None),
            true,
            Some(("node1", "10.1.0.5")),
        );
        assert_eq!(
            action,
            BindingAction::Bind {
                host: "node1".to_owned(),
                pod_ip: "10.1.0.5".to_owned(),
            }
        );
    }

    #[test]
    fn stopping_pod_unbinds_the_ip() {
        let action = decide(
            &state(Some("192.0.2.10"), Some("node1"), Some("10.1.0.5")),
            true,
            None,
        );
        assert_eq!(
            action,
            BindingAction::Unbind {
                host: "node1".to_owned(),
                pod_ip: "10.1.0.5".to_owned(),
            }
        );
    }

    #[test]
    fn empty_subsets_on_added_event_keep_the_binding() {
        let action = decide(
            &state(Some("192.0.2.10"), Some("node1"), Some("10.1.0.5")),
            false,
            None,
        );
        assert_eq!(action, BindingAction::Keep);
    }

    #[test]
    fn rescheduled_pod_migrates_the_binding() {
        let action = decide(
            &state(Some("192.0.2.10"), Some("node1"), Some("10.1.0.5")),
            true,
            Some(("node2", "10.2.0.9")),
        );
        assert_eq!(
            action,
            BindingAction::Migrate {
                from: "node1".to_owned(),
                from_pod_ip: "10.1.0.5".to_owned(),
                to: "node2".to_owned(),
                pod_ip: "10.2.0.9".to_owned(),
            }
        );
    }

    #[test]
    fn same_node_keeps_the_binding() {
        let action = decide(
            &state(Some("192.0.2.10"), Some("node1"), Some("10.1.0.5")),
            true,
            Some(("node1", "10.1.0.5")),
        );
        assert_eq!(action, BindingAction::Keep);
    }

    #[test]
    fn annotation_round_trip() {
        let original = state(Some("192.0.2.10"), Some("node1"), Some("10.1.0.5"));
        let encoded = serde_json::to_string(&original).expect("encode");
        let decoded: PublicIpState = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, original);
        assert!(encoded.contains("assigned-public-ip"));
        assert!(encoded.contains("assigned-to"));
    }

    #[test]
    fn single_backing_pod_extraction() {
        let endpoints: Endpoints = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "service-x", "namespace": "ns"},
            "subsets": [{
                "addresses": [{"ip": "10.1.0.5", "targetRef": {"name": "pod-1"}}],
            }]
        }))
        .expect("decode");
        assert_eq!(
            single_backing_pod(&endpoints),
            Some(("pod-1".to_owned(), "10.1.0.5".to_owned()))
        );

        let replicas: Endpoints = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "service-x", "namespace": "ns"},
            "subsets": [{
                "addresses": [
                    {"ip": "10.1.0.5", "targetRef": {"name": "pod-1"}},
                    {"ip": "10.1.0.6", "targetRef": {"name": "pod-2"}}
                ],
            }]
        }))
        .expect("decode");
        assert_eq!(single_backing_pod(&replicas), None);
    }
}
