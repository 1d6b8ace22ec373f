//! Image reference parsing.
use lazy_static::lazy_static;
use regex::Regex;
use std::convert::TryFrom;
use std::fmt;

use crate::errors::ProbeError;
use crate::DEFAULT_REGISTRY;

lazy_static! {
    // <registry>/ is only recognized when it contains a dot, so that
    // "library/nginx" keeps pointing at DockerHub.
    static ref IMAGE_PATTERN: Regex =
        Regex::new(r"^(?:(.+(?:\..+?)+)/)?(.+?)(?::([^:/]+))?$").expect("hardcoded regex");
}

/// A parsed image reference.
///
/// Accepted forms, all defaulting the tag to `latest`:
/// - `nginx` — an official DockerHub image (repository `library/nginx`)
/// - `username/nginx` — a user image on DockerHub
/// - `some.hub.com/username/nginx` — an image on a third-party registry
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Image {
    registry: String,
    repository: String,
    tag: String,
}

impl Image {
    /// The registry host, e.g. `quay.io`.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// The registry with scheme and empty path, e.g. `https://quay.io`.
    pub fn full_registry(&self) -> String {
        if self.is_dockerhub() {
            DEFAULT_REGISTRY.to_owned()
        } else {
            format!("https://{}", self.registry)
        }
    }

    /// The repository, e.g. `library/nginx`.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The tag, e.g. `latest`.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Whether this reference points at the default public registry.
    pub fn is_dockerhub(&self) -> bool {
        self.registry == default_registry_host()
    }

    /// The v2 manifest URL for this reference.
    pub fn to_v2_manifest_url(&self) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.full_registry(),
            self.repository,
            self.tag
        )
    }

    /// The v2 blob URL for the given digest.
    pub fn to_v2_blob_url(&self, digest: &str) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.full_registry(),
            self.repository,
            digest
        )
    }
}

fn default_registry_host() -> &'static str {
    // "registry-1.docker.io"
    DEFAULT_REGISTRY
        .trim_start_matches("https://")
        .trim_end_matches('/')
}

impl TryFrom<&str> for Image {
    type Error = ProbeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let caps = IMAGE_PATTERN
            .captures(value)
            .ok_or_else(|| ProbeError::InvalidReference(value.to_owned()))?;
        let registry = caps.get(1).map(|m| m.as_str());
        let mut repository = caps
            .get(2)
            .map(|m| m.as_str().to_owned())
            .filter(|r| !r.is_empty())
            .ok_or_else(|| ProbeError::InvalidReference(value.to_owned()))?;
        let tag = caps.get(3).map_or("latest", |m| m.as_str()).to_owned();

        let registry = match registry {
            Some(host) if !host.ends_with("docker.io") => host.to_owned(),
            _ => {
                // Official images live in the "library" namespace.
                if !repository.contains('/') {
                    repository = format!("library/{}", repository);
                }
                default_registry_host().to_owned()
            }
        };
        Ok(Image {
            registry,
            repository,
            tag,
        })
    }
}

impl TryFrom<String> for Image {
    type Error = ProbeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Image::try_from(value.as_str())
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dockerhub() {
            write!(f, "{}:{}", self.repository, self.tag)
        } else {
            write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_official_image() {
        let image = Image::try_from("nginx").expect("parse");
        assert_eq!(image.registry(), "registry-1.docker.io");
        assert_eq!(image.repository(), "library/nginx");
        assert_eq!(image.tag(), "latest");
        assert!(image.is_dockerhub());
    }

    #[test]
    fn parses_user_image_with_tag() {
        let image = Image::try_from("someuser/app:1.4").expect("parse");
        assert_eq!(image.repository(), "someuser/app");
        assert_eq!(image.tag(), "1.4");
        assert!(image.is_dockerhub());
    }

    #[test]
    fn parses_third_party_registry() {
        let image = Image::try_from("quay.io/coreos/etcd:v3.3").expect("parse");
        assert_eq!(image.registry(), "quay.io");
        assert_eq!(image.repository(), "coreos/etcd");
        assert_eq!(image.tag(), "v3.3");
        assert!(!image.is_dockerhub());
        assert_eq!(image.full_registry(), "https://quay.io");
    }

    #[test]
    fn docker_io_aliases_to_default_registry() {
        let image = Image::try_from("docker.io/library/redis").expect("parse");
        assert!(image.is_dockerhub());
        assert_eq!(image.repository(), "library/redis");
    }

    #[test]
    fn manifest_url() {
        let image = Image::try_from("quay.io/coreos/etcd:v3.3").expect("parse");
        assert_eq!(
            image.to_v2_manifest_url(),
            "https://quay.io/v2/coreos/etcd/manifests/v3.3"
        );
    }
}
