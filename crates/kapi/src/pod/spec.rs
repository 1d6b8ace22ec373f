//! Normalization and validation of incoming pod specifications.
//!
//! Validation returns errors as values; nothing here touches Kubernetes.
//! The controller runs `normalize` first, then `validate` against the
//! caller's package and the current system settings, and only then starts
//! spending resources.

use lazy_static::lazy_static;
use rand::seq::SliceRandom;
use regex::Regex;

use crate::config::SystemSettings;
use crate::pod::{ContainerSpec, PodConfig};
use crate::{Error, Result};

/// Kubernetes object names ride in DNS labels, so 64 chars is already too
/// long.
pub const MAX_POD_NAME_LENGTH: usize = 63;

lazy_static! {
    static ref POD_NAME_PATTERN: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 _\-.]*$").expect("hardcoded regex");
}

/// Restart policies Kubernetes accepts.
const RESTART_POLICIES: &[&str] = &["Always", "OnFailure", "Never"];

/// Normalize a decoded configuration in place.
///
/// - every container gets at least one kube;
/// - a single-element `args` that looks like a shell line is re-lexed;
/// - unnamed containers get a name derived from their image;
/// - protocols are uppercased.
pub fn normalize(config: &mut PodConfig) -> Result<()> {
    for container in &mut config.containers {
        if container.kubes < 1 {
            container.kubes = 1;
        }
        if container.args.len() == 1 && container.args[0].contains(' ') {
            container.args = parse_cmd_string(&container.args[0])?;
        }
        if container.name.is_empty() {
            container.name = make_name_from_image(&container.image);
        }
        for port in &mut container.ports {
            port.protocol = port.protocol.to_uppercase();
        }
    }
    if config.replicas.is_none() {
        config.replicas = Some(1);
    }
    Ok(())
}

/// Validate a normalized configuration.
pub fn validate(
    name: &str,
    config: &PodConfig,
    kube_type: i32,
    allowed_kube_ids: &[i32],
    kubes_limit: Option<i32>,
    settings: &SystemSettings,
) -> Result<()> {
    if name.is_empty() || name.len() > MAX_POD_NAME_LENGTH {
        return Err(Error::Validation(format!(
            "Pod name length must be between 1 and {} symbols",
            MAX_POD_NAME_LENGTH
        )));
    }
    if !POD_NAME_PATTERN.is_match(name) {
        return Err(Error::Validation(format!(
            "Invalid pod name '{}': only letters, digits, spaces, dashes, \
             underscores and dots are allowed",
            name
        )));
    }
    if config.containers.is_empty() {
        return Err(Error::Validation(
            "Pod must have at least one container".to_owned(),
        ));
    }
    if !RESTART_POLICIES.contains(&config.restart_policy.as_str()) {
        return Err(Error::Validation(format!(
            "Invalid restart policy '{}'",
            config.restart_policy
        )));
    }
    if !allowed_kube_ids.contains(&kube_type) {
        return Err(Error::Validation(format!(
            "Kube type {} is not allowed by the package",
            kube_type
        )));
    }

    let mut names = std::collections::HashSet::new();
    for container in &config.containers {
        if !names.insert(container.name.as_str()) {
            return Err(Error::Validation(format!(
                "Duplicate container name '{}'",
                container.name
            )));
        }
        if container.image.is_empty() {
            return Err(Error::Validation(format!(
                "Container '{}' has no image",
                container.name
            )));
        }
        if container.kubes > settings.max_kubes_per_container {
            return Err(Error::Validation(format!(
                "Container '{}' requests {} kubes, maximum is {}",
                container.name, container.kubes, settings.max_kubes_per_container
            )));
        }
        for port in &container.ports {
            if !(1..=65535).contains(&port.container_port) {
                return Err(Error::Validation(format!(
                    "Invalid container port {} in '{}'",
                    port.container_port, container.name
                )));
            }
            if port.protocol != "TCP" && port.protocol != "UDP" {
                return Err(Error::Validation(format!(
                    "Invalid protocol '{}' in '{}'",
                    port.protocol, container.name
                )));
            }
        }
    }

    if let Some(limit) = kubes_limit {
        let requested = config.kube_count();
        if requested > limit as i64 {
            return Err(Error::Validation(format!(
                "Pod requests {} kubes, package allows {}",
                requested, limit
            )));
        }
    }
    Ok(())
}

/// Split a shell-style command line into words.
///
/// Understands single and double quotes and backslash escapes, which is as
/// much as the deploy forms ever produce.
pub fn parse_cmd_string(cmd: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = cmd.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some('"') => match c {
                '"' => quote = None,
                '\\' => match chars.next() {
                    Some(escaped @ ('"' | '\\' | '$' | '`')) => current.push(escaped),
                    Some(other) => {
                        current.push('\\');
                        current.push(other);
                    }
                    None => return Err(Error::Validation("Incorrect cmd string".to_owned())),
                },
                _ => current.push(c),
            },
            _ => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                '\\' => match chars.next() {
                    Some(escaped) => {
                        current.push(escaped);
                        in_word = true;
                    }
                    None => return Err(Error::Validation("Incorrect cmd string".to_owned())),
                },
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if quote.is_some() {
        return Err(Error::Validation("Incorrect cmd string".to_owned()));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Derive a container name from its image, with a random tail so two
/// containers of the same image stay distinguishable.
pub fn make_name_from_image(image: &str) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let tail: String = (0..10)
        .map(|_| *ALPHABET.choose(&mut rng).expect("non-empty alphabet") as char)
        .collect();
    let base = image
        .split(':')
        .next()
        .unwrap_or(image)
        .split('/')
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-");
    format!("{}-{}", base, tail)
}

/// A container's effective command for the missing-command gate: the pod
/// spec wins, then the probed image config.
pub fn has_startup_command(
    container: &ContainerSpec,
    image_config: &registry_probe::ContainerConfig,
) -> bool {
    !container.command.is_empty() || !container.args.is_empty() || image_config.has_command()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pod::PortSpec;

    fn minimal_config() -> PodConfig {
        serde_json::from_value(serde_json::json!({
            "containers": [{"name": "web", "image": "nginx", "kubes": 2}],
            "restartPolicy": "Always"
        }))
        .expect("decode")
    }

    fn settings() -> SystemSettings {
        SystemSettings {
            max_kubes_per_container: 10,
            persistent_disk_max_size: 10,
        }
    }

    #[test]
    fn accepts_a_minimal_pod() {
        validate("web", &minimal_config(), 0, &[0], None, &settings()).expect("valid");
    }

    #[test]
    fn rejects_name_over_63_chars() {
        let name = "a".repeat(64);
        let err = validate(&name, &minimal_config(), 0, &[0], None, &settings()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        // 63 is still fine.
        validate(&"a".repeat(63), &minimal_config(), 0, &[0], None, &settings()).expect("valid");
    }

    #[test]
    fn rejects_kube_type_outside_package() {
        let err = validate("web", &minimal_config(), 5, &[0, 1], None, &settings()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn kube_limit_boundary() {
        let mut config = minimal_config();
        config.containers[0].kubes = 10;
        // Exactly at the limit passes.
        validate("web", &config, 0, &[0], Some(10), &settings()).expect("valid");
        // One over fails.
        config.containers[0].kubes = 11;
        let err = validate("web", &config, 0, &[0], Some(10), &settings()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn per_container_kube_ceiling() {
        let mut config = minimal_config();
        config.containers[0].kubes = 10;
        validate("web", &config, 0, &[0], None, &settings()).expect("at limit is fine");
        config.containers[0].kubes = 11;
        assert!(validate("web", &config, 0, &[0], None, &settings()).is_err());
    }

    #[test]
    fn rejects_bad_ports() {
        let mut config = minimal_config();
        config.containers[0].ports.push(PortSpec {
            container_port: 0,
            host_port: None,
            protocol: "TCP".to_owned(),
            is_public: false,
        });
        assert!(validate("web", &config, 0, &[0], None, &settings()).is_err());
    }

    #[test]
    fn normalize_fills_defaults() {
        let mut config: PodConfig = serde_json::from_value(serde_json::json!({
            "containers": [
                {"image": "nginx", "kubes": 0, "args": ["nginx -g 'daemon off;'"],
                 "ports": [{"containerPort": 80, "protocol": "udp"}]}
            ],
            "restartPolicy": "Always"
        }))
        .expect("decode");
        normalize(&mut config).expect("normalize");
        let container = &config.containers[0];
        assert_eq!(container.kubes, 1);
        assert_eq!(
            container.args,
            vec!["nginx".to_owned(), "-g".to_owned(), "daemon off;".to_owned()]
        );
        assert!(container.name.starts_with("nginx-"));
        assert_eq!(container.ports[0].protocol, "UDP");
        assert_eq!(config.replicas, Some(1));
    }

    #[test]
    fn cmd_string_lexing() {
        assert_eq!(
            parse_cmd_string("echo \"hello world\" 'a b' c\\ d").expect("lex"),
            vec!["echo", "hello world", "a b", "c d"]
        );
        assert!(parse_cmd_string("echo 'unterminated").is_err());
    }

    #[test]
    fn name_from_image_is_lowercase_and_salted() {
        let name = make_name_from_image("Library/Nginx:1.19");
        assert!(name.starts_with("library-nginx-"));
        assert_eq!(name.len(), "library-nginx-".len() + 10);
    }
}
