//! Public-identity lookup over Services.
//!
//! In AWS mode the cluster never binds local public IPs; the ELB hostname
//! surfaced in the Service's load-balancer status is the pod's public
//! identity. Everywhere else the identity is the first `externalIPs`
//! entry.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Service;
use uuid::Uuid;

use crate::kube_client::KubeClient;
use crate::Result;

/// The ELB hostname of a LoadBalancer service, once provisioned.
pub fn public_dns(service: &Service) -> Option<String> {
    let spec = service.spec.as_ref()?;
    if spec.type_.as_deref() != Some("LoadBalancer") {
        return None;
    }
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?
        .hostname
        .clone()
}

/// The first external IP of a service.
pub fn public_ip(service: &Service) -> Option<String> {
    service
        .spec
        .as_ref()?
        .external_ips
        .as_ref()?
        .first()
        .cloned()
}

/// Resolves pods' public identities from their Services.
#[derive(Clone)]
pub struct LoadBalanceService {
    kube: KubeClient,
}

impl LoadBalanceService {
    /// Build over the cluster client.
    pub fn new(kube: KubeClient) -> Self {
        Self { kube }
    }

    /// The ELB hostnames for the given pods, keyed by pod id. Pods whose
    /// balancer has not surfaced a hostname yet are absent.
    pub async fn dns_by_pods(&self, pods: &[Uuid]) -> Result<HashMap<Uuid, String>> {
        let mut result = HashMap::new();
        for pod_id in pods {
            for service in self.kube.services_by_pod(&pod_id.to_string()).await? {
                if let Some(hostname) = public_dns(&service) {
                    result.insert(*pod_id, hostname);
                    break;
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn service(value: serde_json::Value) -> Service {
        serde_json::from_value(value).expect("decode service")
    }

    #[test]
    fn elb_hostname_is_read_from_ingress() {
        let svc = service(serde_json::json!({
            "metadata": {},
            "spec": {"type": "LoadBalancer"},
            "status": {"loadBalancer": {"ingress": [
                {"hostname": "a1b2.elb.amazonaws.com"}
            ]}}
        }));
        assert_eq!(public_dns(&svc).as_deref(), Some("a1b2.elb.amazonaws.com"));
    }

    #[test]
    fn non_load_balancer_services_have_no_dns() {
        let svc = service(serde_json::json!({
            "metadata": {},
            "spec": {"type": "ClusterIP", "externalIPs": ["192.0.2.4"]},
        }));
        assert_eq!(public_dns(&svc), None);
        assert_eq!(public_ip(&svc).as_deref(), Some("192.0.2.4"));
    }

    #[test]
    fn unprovisioned_balancer_has_no_dns_yet() {
        let svc = service(serde_json::json!({
            "metadata": {},
            "spec": {"type": "LoadBalancer"},
            "status": {"loadBalancer": {}}
        }));
        assert_eq!(public_dns(&svc), None);
    }
}
