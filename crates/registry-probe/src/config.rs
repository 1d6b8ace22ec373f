//! The decoded container configuration of an image.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The subset of a Docker image config consumed by the control plane.
///
/// Both the v2 config blob and the v1 `images/<id>/json` payload carry a
/// `config` (and, for images built by older daemons, a `container_config`)
/// object in this shape.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ContainerConfig {
    /// Default command arguments.
    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,
    /// Entrypoint, prepended to `cmd`.
    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Option<Vec<String>>,
    /// Environment variables as `NAME=value` pairs.
    #[serde(rename = "Env", default)]
    pub env: Option<Vec<String>>,
    /// Exposed ports keyed by `<port>/<proto>`.
    #[serde(rename = "ExposedPorts", default)]
    pub exposed_ports: Option<HashMap<String, serde_json::Value>>,
    /// Declared volume mount points.
    #[serde(rename = "Volumes", default)]
    pub volumes: Option<HashMap<String, serde_json::Value>>,
    /// Working directory for the command.
    #[serde(rename = "WorkingDir", default)]
    pub working_dir: Option<String>,
}

impl ContainerConfig {
    /// Whether the image provides any startup command at all.
    pub fn has_command(&self) -> bool {
        let non_empty = |v: &Option<Vec<String>>| v.as_ref().map_or(false, |c| !c.is_empty());
        non_empty(&self.cmd) || non_empty(&self.entrypoint)
    }

    /// Exposed ports as `(port, protocol)` pairs.
    pub fn ports(&self) -> Vec<(u16, String)> {
        self.exposed_ports
            .as_ref()
            .map(|ports| {
                ports
                    .keys()
                    .filter_map(|key| {
                        let mut parts = key.splitn(2, '/');
                        let port = parts.next()?.parse().ok()?;
                        let proto = parts.next().unwrap_or("tcp").to_owned();
                        Some((port, proto))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// An image payload holding the container config.
///
/// v2 config blobs nest it under `config`; v1 image JSON uses the same
/// layout. `container_config` is the legacy fallback written by old
/// builders when `config` is absent.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ImageConfigEnvelope {
    #[serde(default)]
    pub config: Option<ContainerConfig>,
    #[serde(default)]
    pub container_config: Option<ContainerConfig>,
}

impl ImageConfigEnvelope {
    pub fn into_config(self) -> ContainerConfig {
        match self.config {
            Some(config) if config.has_command() => config,
            Some(config) => match self.container_config {
                Some(legacy) if legacy.has_command() => legacy,
                _ => config,
            },
            None => self.container_config.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CONFIG_BLOB: &str = r##"{
        "architecture": "amd64",
        "config": {
            "Cmd": ["nginx", "-g", "daemon off;"],
            "Env": ["PATH=/usr/local/sbin:/usr/local/bin", "NGINX_VERSION=1.19"],
            "ExposedPorts": {"80/tcp": {}},
            "Volumes": {"/var/cache/nginx": {}},
            "WorkingDir": ""
        },
        "container_config": {
            "Cmd": ["/bin/sh", "-c", "#(nop) CMD [\"nginx\"]"]
        }
    }"##;

    #[test]
    fn decodes_v2_config_blob() {
        let envelope: ImageConfigEnvelope = serde_json::from_str(CONFIG_BLOB).expect("decode");
        let config = envelope.into_config();
        assert!(config.has_command());
        assert_eq!(config.ports(), vec![(80, "tcp".to_owned())]);
        assert_eq!(
            config.cmd,
            Some(vec![
                "nginx".to_owned(),
                "-g".to_owned(),
                "daemon off;".to_owned()
            ])
        );
    }

    #[test]
    fn falls_back_to_container_config() {
        let envelope: ImageConfigEnvelope = serde_json::from_str(
            r#"{"config": {"Cmd": null}, "container_config": {"Entrypoint": ["/entry.sh"]}}"#,
        )
        .expect("decode");
        let config = envelope.into_config();
        assert_eq!(config.entrypoint, Some(vec!["/entry.sh".to_owned()]));
        assert!(config.has_command());
    }

    #[test]
    fn empty_config_has_no_command() {
        let config = ContainerConfig::default();
        assert!(!config.has_command());
        assert!(config.ports().is_empty());
    }
}
