//! The user-facing pod model and its lifecycle.
//!
//! A pod's canonical form is the [`PodConfig`] blob stored on its database
//! row. [`spec`] normalizes and validates incoming specifications, [`build`]
//! synthesizes the Kubernetes objects, and [`controller`] drives the command
//! protocol under the per-pod lock.

pub mod build;
pub mod controller;
pub mod spec;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use controller::{PodCollection, PodCommand};

/// The canonical pod configuration, as stored in the `pods.config` column.
///
/// Anything we do not model explicitly rides along in `extra`, so configs
/// written by other components survive a read-modify-write cycle.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PodConfig {
    /// Container specifications.
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
    /// Kubernetes-form volumes (after backend enrichment).
    #[serde(default)]
    pub volumes: Vec<Value>,
    /// User-form volumes (persistentDisk / localStorage entries).
    #[serde(default)]
    pub volumes_public: Vec<Value>,
    /// Restart policy, `Always` / `OnFailure` / `Never`.
    #[serde(rename = "restartPolicy", default = "default_restart_policy")]
    pub restart_policy: String,
    /// Random UUID naming the ReplicationController.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Replica count; this control plane always runs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Node hostname the pod is pinned to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Assigned public IP, dotted form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    /// Whether the user asked for a public IP at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_public_ip: Option<bool>,
    /// Image-pull secret names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    /// A pending edited configuration awaiting `redeploy --applyEdit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_config: Option<Box<PodConfig>>,
    /// Free-form description shown after deploy.
    #[serde(
        rename = "postDescription",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub post_description: Option<String>,
    /// Passthrough for fields this version does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_restart_policy() -> String {
    "Always".to_owned()
}

/// One container within a pod.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name, unique within the pod.
    #[serde(default)]
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Kubes allocated to this container.
    #[serde(default = "default_kubes")]
    pub kubes: i32,
    /// Entrypoint override.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Command arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVarSpec>,
    /// Exposed ports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,
    /// Volume mounts.
    #[serde(rename = "volumeMounts", default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMountSpec>,
    /// Working directory. Old deploy forms sent this as a list.
    #[serde(
        rename = "workingDir",
        default,
        deserialize_with = "de_working_dir",
        skip_serializing_if = "Option::is_none"
    )]
    pub working_dir: Option<String>,
    /// Lifecycle hooks, passed through to Kubernetes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Value>,
    /// Where a predefined-app container came from; not a Kubernetes field.
    #[serde(rename = "sourceUrl", default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// Passthrough for unmodeled fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_kubes() -> i32 {
    1
}

/// Accept `workingDir` as a string or a list of path segments.
fn de_working_dir<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum WorkingDir {
        One(String),
        Many(Vec<String>),
    }
    Ok(Option::<WorkingDir>::deserialize(deserializer)?.map(|wd| match wd {
        WorkingDir::One(path) => path,
        WorkingDir::Many(parts) => parts.join(","),
    }))
}

/// An environment variable.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnvVarSpec {
    /// Variable name.
    pub name: String,
    /// Literal value.
    #[serde(default)]
    pub value: String,
}

/// A container port.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PortSpec {
    /// Port inside the container.
    #[serde(rename = "containerPort")]
    pub container_port: i32,
    /// Host port; stripped for non-internal owners.
    #[serde(rename = "hostPort", default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<i32>,
    /// `TCP` or `UDP`; normalized to uppercase.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Whether the port is reachable on the pod's public IP. Not a
    /// Kubernetes field; stripped from the object and kept in the
    /// `kuberdock-pod-ports` annotation.
    #[serde(rename = "isPublic", default)]
    pub is_public: bool,
}

fn default_protocol() -> String {
    "TCP".to_owned()
}

/// A volume mount.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VolumeMountSpec {
    /// Volume name this mount refers to.
    pub name: String,
    /// Mount path inside the container.
    #[serde(rename = "mountPath")]
    pub mount_path: String,
}

impl PodConfig {
    /// Total kubes over all containers.
    pub fn kube_count(&self) -> i64 {
        self.containers.iter().map(|c| c.kubes as i64).sum()
    }

    /// Whether any container exposes a port (and hence the pod gets a
    /// Service).
    pub fn has_ports(&self) -> bool {
        self.containers.iter().any(|c| !c.ports.is_empty())
    }

    /// Whether any exposed port is public.
    pub fn has_public_ports(&self) -> bool {
        self.containers
            .iter()
            .flat_map(|c| c.ports.iter())
            .any(|p| p.is_public)
    }

    /// Names of persistent disks referenced by the user-form volumes.
    pub fn persistent_disk_names(&self) -> Vec<String> {
        self.volumes_public
            .iter()
            .filter_map(|v| v.get("persistentDisk"))
            .filter_map(|pd| pd.get("pdName"))
            .filter_map(|name| name.as_str())
            .map(str::to_owned)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_round_trips_unknown_fields() {
        let raw = serde_json::json!({
            "containers": [{"name": "web", "image": "nginx", "kubes": 2}],
            "restartPolicy": "Always",
            "kuberdock_resolve": ["a", "b"],
            "custom-field": 42
        });
        let config: PodConfig = serde_json::from_value(raw).expect("decode");
        assert_eq!(config.containers[0].kubes, 2);
        let back = serde_json::to_value(&config).expect("encode");
        assert_eq!(back["custom-field"], 42);
        assert_eq!(back["kuberdock_resolve"][0], "a");
    }

    #[test]
    fn kubes_default_to_one() {
        let config: PodConfig = serde_json::from_value(serde_json::json!({
            "containers": [{"image": "nginx"}],
            "restartPolicy": "Always"
        }))
        .expect("decode");
        assert_eq!(config.containers[0].kubes, 1);
        assert_eq!(config.kube_count(), 1);
    }

    #[test]
    fn public_port_detection() {
        let config: PodConfig = serde_json::from_value(serde_json::json!({
            "containers": [
                {"image": "nginx", "ports": [{"containerPort": 80, "isPublic": true}]},
                {"image": "redis", "ports": [{"containerPort": 6379}]}
            ],
            "restartPolicy": "Always"
        }))
        .expect("decode");
        assert!(config.has_ports());
        assert!(config.has_public_ports());
        assert_eq!(config.containers[1].ports[0].protocol, "TCP");
        assert!(!config.containers[1].ports[0].is_public);
    }

    #[test]
    fn persistent_disk_names_come_from_public_volumes() {
        let config: PodConfig = serde_json::from_value(serde_json::json!({
            "containers": [],
            "restartPolicy": "Always",
            "volumes_public": [
                {"name": "v1", "persistentDisk": {"pdName": "data", "pdSize": 2}},
                {"name": "v2", "localStorage": true}
            ]
        }))
        .expect("decode");
        assert_eq!(config.persistent_disk_names(), vec!["data".to_owned()]);
    }
}
