//! Synthesis of Kubernetes objects from a pod configuration.
//!
//! Objects are assembled as JSON values in exactly the shape the API server
//! expects and decoded into `k8s_openapi` types at the client boundary.
//! Everything here is pure: resources are resolved, nothing is created.

use serde_json::{json, Value};

use crate::config::IpMode;
use crate::pod::{ContainerSpec, PodConfig};
use crate::store::billing::Kube;

/// Label selecting every object belonging to one pod.
pub const POD_UID_LABEL: &str = "kuberdock-pod-uid";

/// Label carrying the owner's user id on pod templates.
pub const USER_UID_LABEL: &str = "kuberdock-user-uid";

/// Label present iff the pod holds a public IP.
pub const PUBLIC_IP_LABEL: &str = "kuberdock-public-ip";

/// Node label binding nodes to kube types.
pub const KUBE_TYPE_LABEL: &str = "kuberdock-kube-type";

/// Node label used to pin a pod to one host.
pub const NODE_HOSTNAME_LABEL: &str = "kuberdock-node-hostname";

/// Annotation keeping the user-form ports (including `isPublic`).
pub const POD_PORTS_ANNOTATION: &str = "kuberdock-pod-ports";

/// Annotation keeping volume annotations stripped from the k8s spec.
pub const VOLUME_ANNOTATIONS_ANNOTATION: &str = "kuberdock-volume-annotations";

/// Annotation on Services tracking the public-IP binding.
pub const PUBLIC_IP_STATE_ANNOTATION: &str = "public-ip-state";

/// Everything object synthesis needs to know about a pod.
pub struct PodView<'a> {
    /// Pod id; also its namespace.
    pub id: String,
    /// ReplicationController name (the pod's `sid`).
    pub sid: String,
    /// Owner's user id.
    pub owner_id: i32,
    /// Whether the owner is the internal infrastructure user.
    pub owner_is_internal: bool,
    /// The pod's kube shape.
    pub kube: &'a Kube,
    /// The canonical configuration.
    pub config: &'a PodConfig,
}

/// Build the ReplicationController object for a pod.
pub fn replication_controller(pod: &PodView<'_>) -> Value {
    let id = pod.id.as_str();
    let sid = pod.sid.as_str();
    let containers: Vec<Value> = pod
        .config
        .containers
        .iter()
        .map(|c| container_object(pod, c))
        .collect();

    let mut template_labels = json!({
        POD_UID_LABEL: id,
        USER_UID_LABEL: pod.owner_id.to_string(),
    });
    if let Some(ip) = &pod.config.public_ip {
        template_labels[PUBLIC_IP_LABEL] = json!(ip);
    }

    let mut spec = json!({
        "volumes": kubernetes_volumes(pod.config),
        "containers": containers,
        "restartPolicy": pod.config.restart_policy,
        "imagePullSecrets": pod
            .config
            .secrets
            .iter()
            .map(|s| json!({ "name": s }))
            .collect::<Vec<_>>(),
    });
    let selector = node_selector(pod);
    if !selector.as_object().map_or(true, |m| m.is_empty()) {
        spec["nodeSelector"] = selector;
    }

    json!({
        "kind": "ReplicationController",
        "apiVersion": "v1",
        "metadata": {
            "name": sid,
            "namespace": id,
            "labels": { POD_UID_LABEL: id },
        },
        "spec": {
            "replicas": pod.config.replicas.unwrap_or(1),
            "selector": { POD_UID_LABEL: id },
            "template": {
                "metadata": {
                    "labels": template_labels,
                    "annotations": {
                        POD_PORTS_ANNOTATION: pod_ports_annotation(pod.config),
                        VOLUME_ANNOTATIONS_ANNOTATION: volume_annotations(pod.config),
                    },
                },
                "spec": spec,
            },
        },
    })
}

/// Node placement for a pod: its kube-type label, except internal-service
/// pods which may run anywhere, plus the host pin when one exists.
fn node_selector(pod: &PodView<'_>) -> Value {
    let mut selector = serde_json::Map::new();
    if Kube::is_node_attachable(pod.kube.id) {
        selector.insert(
            KUBE_TYPE_LABEL.to_owned(),
            json!(format!("type_{}", pod.kube.id)),
        );
    }
    if let Some(node) = &pod.config.node {
        selector.insert(NODE_HOSTNAME_LABEL.to_owned(), json!(node));
    }
    Value::Object(selector)
}

/// Build one container object.
fn container_object(pod: &PodView<'_>, container: &ContainerSpec) -> Value {
    let limits = pod.kube.to_limits(container.kubes);
    let resources = json!({
        "limits": { "cpu": limits.cpu, "memory": limits.memory },
        "requests": { "cpu": limits.cpu, "memory": limits.memory },
    });

    let ports: Vec<Value> = container
        .ports
        .iter()
        .map(|p| {
            let mut port = json!({
                "containerPort": p.container_port,
                "protocol": p.protocol.to_uppercase(),
            });
            // hostPort is a node-level grab; only infrastructure pods get it.
            if pod.owner_is_internal {
                if let Some(host_port) = p.host_port {
                    port["hostPort"] = json!(host_port);
                }
            }
            port
        })
        .collect();

    let mounts: Vec<Value> = container
        .volume_mounts
        .iter()
        .map(|m| {
            let mut path = m.mount_path.clone();
            if volume_is_rbd(pod.config, &m.name) && !path.ends_with(":Z") && !path.ends_with(":z")
            {
                // SELinux relabel for shared RBD mounts.
                path.push_str(":Z");
            }
            json!({ "name": m.name, "mountPath": path })
        })
        .collect();

    let mut object = json!({
        "name": container.name,
        "image": container.image,
        "imagePullPolicy": "Always",
        "resources": resources,
        "ports": ports,
        "volumeMounts": mounts,
        "env": container
            .env
            .iter()
            .map(|e| json!({ "name": e.name, "value": e.value }))
            .collect::<Vec<_>>(),
    });
    if !container.command.is_empty() {
        object["command"] = json!(container.command);
    }
    if !container.args.is_empty() {
        object["args"] = json!(container.args);
    }
    if let Some(wd) = &container.working_dir {
        object["workingDir"] = json!(wd);
    }
    if let Some(lifecycle) = &container.lifecycle {
        object["lifecycle"] = lifecycle.clone();
        if lifecycle_mounts(lifecycle) {
            object["securityContext"] = json!({ "capabilities": { "add": ["SYS_ADMIN"] } });
        }
    }
    object
}

/// Whether any lifecycle hook command contains a `mount` invocation, which
/// needs SYS_ADMIN inside the container.
fn lifecycle_mounts(lifecycle: &Value) -> bool {
    lifecycle
        .as_object()
        .map(|hooks| {
            hooks.values().any(|hook| {
                hook.get("exec")
                    .and_then(|e| e.get("command"))
                    .and_then(Value::as_array)
                    .map(|commands| {
                        commands
                            .iter()
                            .filter_map(Value::as_str)
                            .any(|cmd| cmd.contains("mount"))
                    })
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// Whether the named volume is Ceph-RBD backed.
fn volume_is_rbd(config: &PodConfig, name: &str) -> bool {
    config
        .volumes
        .iter()
        .any(|v| v.get("name").and_then(Value::as_str) == Some(name) && v.get("rbd").is_some())
}

/// The k8s-form volumes, dropping any volume no container mounts.
fn kubernetes_volumes(config: &PodConfig) -> Vec<Value> {
    let mounted: std::collections::HashSet<&str> = config
        .containers
        .iter()
        .flat_map(|c| c.volume_mounts.iter())
        .map(|m| m.name.as_str())
        .collect();
    config
        .volumes
        .iter()
        .filter(|v| {
            v.get("name")
                .and_then(Value::as_str)
                .map_or(false, |name| mounted.contains(name))
        })
        .map(|v| {
            // The "annotation" key is ours, not Kubernetes'.
            let mut v = v.clone();
            if let Some(obj) = v.as_object_mut() {
                obj.remove("annotation");
            }
            v
        })
        .collect()
}

/// The user-form ports of every container, serialized for the
/// `kuberdock-pod-ports` annotation. Kept because the k8s spec loses
/// `isPublic` and (for ordinary users) `hostPort`.
fn pod_ports_annotation(config: &PodConfig) -> String {
    let ports: Vec<Vec<Value>> = config
        .containers
        .iter()
        .map(|c| {
            c.ports
                .iter()
                .map(|p| {
                    let mut port = json!({
                        "containerPort": p.container_port,
                        "protocol": p.protocol,
                        "isPublic": p.is_public,
                    });
                    if let Some(host_port) = p.host_port {
                        port["hostPort"] = json!(host_port);
                    }
                    port
                })
                .collect()
        })
        .collect();
    serde_json::to_string(&ports).expect("ports serialize")
}

/// The volume annotations stripped from the k8s spec, serialized for the
/// `kuberdock-volume-annotations` annotation.
fn volume_annotations(config: &PodConfig) -> String {
    let annotations: Vec<Value> = config
        .volumes
        .iter()
        .filter_map(|v| v.get("annotation").cloned())
        .collect();
    serde_json::to_string(&annotations).expect("annotations serialize")
}

/// Build the Service object for a pod, or `None` when no container exposes
/// a port.
pub fn service_object(pod: &PodView<'_>, ip_mode: IpMode) -> Option<Value> {
    if !pod.config.has_ports() {
        return None;
    }
    let id = pod.id.as_str();
    let mut ports = Vec::new();
    for (ci, container) in pod.config.containers.iter().enumerate() {
        for (pi, p) in container.ports.iter().enumerate() {
            let mut name = format!("c{}-p{}", ci, pi);
            if p.is_public {
                name.push_str("-public");
            }
            ports.push(json!({
                "name": name,
                "port": p.host_port.unwrap_or(p.container_port),
                "protocol": p.protocol,
                "targetPort": p.container_port,
            }));
        }
    }

    let mut spec = json!({
        "selector": { POD_UID_LABEL: id },
        "ports": ports,
    });
    match ip_mode {
        IpMode::Aws => {
            if pod.config.has_public_ports() {
                spec["type"] = json!("LoadBalancer");
            }
        }
        IpMode::Floating | IpMode::Fixed => {
            if let Some(ip) = &pod.config.public_ip {
                spec["externalIPs"] = json!([ip]);
            }
        }
    }

    Some(json!({
        "kind": "Service",
        "apiVersion": "v1",
        "metadata": {
            "generateName": "service-",
            "namespace": id,
            "labels": { POD_UID_LABEL: id },
            "annotations": {
                PUBLIC_IP_STATE_ANNOTATION: serde_json::to_string(&json!({
                    "assigned-public-ip": pod.config.public_ip,
                }))
                .expect("annotation serializes"),
            },
        },
        "spec": spec,
    }))
}

/// Build the pod's Namespace object.
pub fn namespace_object(pod_id: &str) -> Value {
    json!({
        "kind": "Namespace",
        "apiVersion": "v1",
        "metadata": {
            "name": pod_id,
            "labels": { "name": pod_id },
        },
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn kube() -> Kube {
        Kube {
            id: 0,
            name: Some("Standard".to_owned()),
            cpu: 0.25,
            cpu_units: "Cores".to_owned(),
            memory: 64,
            memory_units: "MB".to_owned(),
            disk_space: 1,
            disk_space_units: "GB".to_owned(),
            included_traffic: 0,
        }
    }

    fn config(value: serde_json::Value) -> PodConfig {
        serde_json::from_value(value).expect("decode config")
    }

    fn web_config() -> PodConfig {
        config(json!({
            "containers": [{
                "name": "web",
                "image": "nginx",
                "kubes": 2,
                "ports": [{"containerPort": 80, "isPublic": true},
                          {"containerPort": 443, "hostPort": 8443}],
            }],
            "restartPolicy": "Always",
        }))
    }

    fn view<'a>(config: &'a PodConfig, kube: &'a Kube, internal: bool) -> PodView<'a> {
        PodView {
            id: "6a811845-2afc-4ca1-9441-e3f93c9a9a0a".to_owned(),
            sid: "d6a5ba25-b284-4295-9b4a-5b72e7c6bbc1".to_owned(),
            owner_id: 3,
            owner_is_internal: internal,
            kube,
            config,
        }
    }

    #[test]
    fn rc_carries_pod_uid_label_and_selector() {
        let kube = kube();
        let config = web_config();
        let rc = replication_controller(&view(&config, &kube, false));
        assert_eq!(rc["metadata"]["labels"][POD_UID_LABEL], rc["spec"]["selector"][POD_UID_LABEL]);
        assert_eq!(rc["metadata"]["name"], "d6a5ba25-b284-4295-9b4a-5b72e7c6bbc1");
        assert_eq!(rc["metadata"]["namespace"], "6a811845-2afc-4ca1-9441-e3f93c9a9a0a");
        assert_eq!(rc["spec"]["replicas"], 1);
        assert_eq!(
            rc["spec"]["template"]["metadata"]["labels"][USER_UID_LABEL],
            "3"
        );
    }

    #[test]
    fn host_port_is_stripped_for_ordinary_users() {
        let kube = kube();
        let config = web_config();
        let rc = replication_controller(&view(&config, &kube, false));
        let ports = &rc["spec"]["template"]["spec"]["containers"][0]["ports"];
        assert!(ports[1].get("hostPort").is_none());

        let rc = replication_controller(&view(&config, &kube, true));
        let ports = &rc["spec"]["template"]["spec"]["containers"][0]["ports"];
        assert_eq!(ports[1]["hostPort"], 8443);
    }

    #[test]
    fn ports_annotation_keeps_is_public() {
        let kube = kube();
        let config = web_config();
        let rc = replication_controller(&view(&config, &kube, false));
        let annotation = rc["spec"]["template"]["metadata"]["annotations"]
            [POD_PORTS_ANNOTATION]
            .as_str()
            .expect("annotation string");
        let decoded: Vec<Vec<Value>> = serde_json::from_str(annotation).expect("decode");
        assert_eq!(decoded[0][0]["isPublic"], true);
        assert_eq!(decoded[0][1]["hostPort"], 8443);
    }

    #[test]
    fn limits_reflect_kube_count() {
        let kube = kube();
        let config = web_config();
        let rc = replication_controller(&view(&config, &kube, false));
        let resources = &rc["spec"]["template"]["spec"]["containers"][0]["resources"];
        assert_eq!(resources["limits"]["cpu"], "500m");
        assert_eq!(resources["limits"]["memory"], "128Mi");
    }

    #[test]
    fn node_selector_uses_kube_type_unless_internal() {
        let kube = kube();
        let config = web_config();
        let rc = replication_controller(&view(&config, &kube, false));
        assert_eq!(
            rc["spec"]["template"]["spec"]["nodeSelector"][KUBE_TYPE_LABEL],
            "type_0"
        );

        let internal_kube = Kube {
            id: crate::store::billing::INTERNAL_SERVICE_KUBE_TYPE,
            ..kube
        };
        let rc = replication_controller(&view(&config, &internal_kube, true));
        assert!(rc["spec"]["template"]["spec"].get("nodeSelector").is_none());
    }

    #[test]
    fn pinned_pod_gets_hostname_selector() {
        let kube = kube();
        let mut config = web_config();
        config.node = Some("node1.example.com".to_owned());
        let rc = replication_controller(&view(&config, &kube, false));
        assert_eq!(
            rc["spec"]["template"]["spec"]["nodeSelector"][NODE_HOSTNAME_LABEL],
            "node1.example.com"
        );
    }

    #[test]
    fn mount_lifecycle_hook_adds_sys_admin() {
        let kube = kube();
        let config = config(json!({
            "containers": [{
                "name": "web",
                "image": "nginx",
                "lifecycle": {
                    "postStart": {"exec": {"command": ["mount", "-t", "tmpfs"]}}
                },
            }],
            "restartPolicy": "Always",
        }));
        let rc = replication_controller(&view(&config, &kube, false));
        let container = &rc["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(
            container["securityContext"]["capabilities"]["add"][0],
            "SYS_ADMIN"
        );
    }

    #[test]
    fn rbd_mounts_get_selinux_relabel() {
        let kube = kube();
        let config = config(json!({
            "containers": [{
                "name": "db",
                "image": "mysql",
                "volumeMounts": [{"name": "data", "mountPath": "/var/lib/mysql"}],
            }],
            "restartPolicy": "Always",
            "volumes": [{"name": "data", "rbd": {"image": "x", "pool": "rbd"}}],
        }));
        let rc = replication_controller(&view(&config, &kube, false));
        let mounts = &rc["spec"]["template"]["spec"]["containers"][0]["volumeMounts"];
        assert_eq!(mounts[0]["mountPath"], "/var/lib/mysql:Z");
    }

    #[test]
    fn unmounted_volumes_are_dropped() {
        let kube = kube();
        let config = config(json!({
            "containers": [{
                "name": "db",
                "image": "mysql",
                "volumeMounts": [{"name": "data", "mountPath": "/var/lib/mysql"}],
            }],
            "restartPolicy": "Always",
            "volumes": [
                {"name": "data", "hostPath": {"path": "/x"}, "annotation": {"localStorage": {}}},
                {"name": "stray", "hostPath": {"path": "/y"}}
            ],
        }));
        let rc = replication_controller(&view(&config, &kube, false));
        let volumes = rc["spec"]["template"]["spec"]["volumes"]
            .as_array()
            .expect("volumes");
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0]["name"], "data");
        assert!(volumes[0].get("annotation").is_none());
    }

    #[test]
    fn service_ports_are_named_by_position() {
        let kube = kube();
        let config = web_config();
        let service =
            service_object(&view(&config, &kube, false), IpMode::Floating).expect("service");
        let ports = service["spec"]["ports"].as_array().expect("ports");
        assert_eq!(ports[0]["name"], "c0-p0-public");
        assert_eq!(ports[1]["name"], "c0-p1");
        assert_eq!(ports[1]["port"], 8443);
        assert_eq!(ports[1]["targetPort"], 443);
    }

    #[test]
    fn service_type_depends_on_ip_mode() {
        let kube = kube();
        let mut config = web_config();
        config.public_ip = Some("192.0.2.10".to_owned());

        let floating =
            service_object(&view(&config, &kube, false), IpMode::Floating).expect("service");
        assert_eq!(floating["spec"]["externalIPs"][0], "192.0.2.10");
        assert!(floating["spec"].get("type").is_none());

        let aws = service_object(&view(&config, &kube, false), IpMode::Aws).expect("service");
        assert_eq!(aws["spec"]["type"], "LoadBalancer");
        assert!(aws["spec"].get("externalIPs").is_none());
    }

    #[test]
    fn no_ports_means_no_service() {
        let kube = kube();
        let config = config(json!({
            "containers": [{"name": "job", "image": "worker"}],
            "restartPolicy": "Never",
        }));
        assert!(service_object(&view(&config, &kube, false), IpMode::Floating).is_none());
    }
}
