//! Registry probe client.
//!
//! Resolution order mirrors what Docker itself does: try the v2 manifest and
//! config blob first, fall back to the v1 `images/<id>/json` endpoint for
//! registries that never moved on, authenticating with a bearer token
//! (DockerHub-style challenge) or HTTP Basic as the registry demands.

use std::collections::HashMap;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::config::{ContainerConfig, ImageConfigEnvelope};
use crate::errors::ProbeError;
use crate::reference::Image;
use crate::DOCKERHUB_V1_INDEX;

const MANIFEST_V2_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Timeout for ordinary registry requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for registry liveness pings.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

lazy_static! {
    static ref BEARER_PARAM: Regex =
        Regex::new(r#"(\w+)="([^"]*)""#).expect("hardcoded regex");
}

/// Credentials for a registry request.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum RegistryAuth {
    /// No credentials; public pull.
    #[default]
    Anonymous,
    /// HTTP Basic / token-service username and password.
    Basic(String, String),
}

impl RegistryAuth {
    fn credentials(&self) -> Option<(&str, &str)> {
        match self {
            RegistryAuth::Anonymous => None,
            RegistryAuth::Basic(user, pass) => Some((user, pass)),
        }
    }
}

/// Client configuration.
#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    /// Accept registries with self-signed certificates.
    pub accept_invalid_certificates: bool,
}

/// A probe client for one or more registries.
///
/// Bearer tokens are cached per (registry, repository) for the lifetime of
/// the client, so repeated probes of the same repository skip the token
/// round-trip.
pub struct Client {
    client: reqwest::Client,
    tokens: HashMap<(String, String), String>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

#[derive(Deserialize)]
struct TokenEnvelope {
    #[serde(default, alias = "access_token")]
    token: String,
}

#[derive(Deserialize)]
struct ManifestV2 {
    config: DescriptorV2,
}

#[derive(Deserialize)]
struct DescriptorV2 {
    digest: String,
}

#[derive(Deserialize)]
struct TaggedImageV1 {
    id: String,
}

impl Client {
    /// Create a new client with the supplied config.
    pub fn new(config: ClientConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(config.accept_invalid_certificates)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            client,
            tokens: HashMap::new(),
        }
    }

    /// Check that the registry answers its version endpoint at all.
    ///
    /// A 401 means the registry is alive but wants credentials, which is
    /// good enough for a liveness check.
    pub async fn ping(&self, registry_url: &str) -> Result<(), ProbeError> {
        let url = format!("{}/v2/", registry_url.trim_end_matches('/'));
        let res = self
            .client
            .get(&url)
            .timeout(PING_TIMEOUT)
            .send()
            .await?;
        let status = res.status();
        if status.is_success() || status == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(());
        }
        Err(ProbeError::registry(registry_url, status))
    }

    /// Resolve the container configuration of an image.
    ///
    /// Tries the v2 flow, falling back to v1 when the registry reports the
    /// manifest endpoint missing. Authorization failures surface as
    /// `ImageNotAvailable` so a caller can distinguish a broken registry
    /// from a missing or private image.
    pub async fn probe(
        &mut self,
        image: &Image,
        auth: &RegistryAuth,
    ) -> Result<ContainerConfig, ProbeError> {
        match self.probe_v2(image, auth).await {
            Ok(config) => Ok(config),
            Err(ProbeError::ImageNotAvailable { .. }) => {
                debug!(%image, "v2 probe failed, retrying against v1 endpoint");
                self.probe_v1(image, auth).await
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve the manifest digest of an image, without fetching the
    /// config blob. Useful for update checks: a changed digest under the
    /// same tag means a newer image.
    pub async fn manifest_digest(
        &mut self,
        image: &Image,
        auth: &RegistryAuth,
    ) -> Result<String, ProbeError> {
        let manifest_url = image.to_v2_manifest_url();
        let res = self
            .authorized_get(image, &manifest_url)
            .header(reqwest::header::ACCEPT, MANIFEST_V2_ACCEPT)
            .send()
            .await?;
        let res = self.authorized_response(image, auth, res, true).await?;
        res.headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| ProbeError::MalformedResponse {
                registry: image.registry().to_owned(),
                detail: "registry did not return a digest header".to_owned(),
            })
    }

    async fn probe_v2(
        &mut self,
        image: &Image,
        auth: &RegistryAuth,
    ) -> Result<ContainerConfig, ProbeError> {
        let manifest_url = image.to_v2_manifest_url();
        let res = self
            .authorized_get(image, &manifest_url)
            .header(reqwest::header::ACCEPT, MANIFEST_V2_ACCEPT)
            .send()
            .await?;
        let manifest: ManifestV2 = self.decode(image, auth, res, "manifest").await?;

        let blob_url = image.to_v2_blob_url(&manifest.config.digest);
        let res = self.authorized_get(image, &blob_url).send().await?;
        let envelope: ImageConfigEnvelope = self.decode(image, auth, res, "config blob").await?;
        Ok(envelope.into_config())
    }

    /// Legacy v1 flow: list tagged images, then fetch the image JSON.
    async fn probe_v1(
        &mut self,
        image: &Image,
        auth: &RegistryAuth,
    ) -> Result<ContainerConfig, ProbeError> {
        let index = if image.is_dockerhub() {
            DOCKERHUB_V1_INDEX.to_owned()
        } else {
            image.full_registry()
        };

        // The index login also hands back a session token for the repository.
        let url = format!("{}/v1/repositories/{}/images", index, image.repository());
        let mut req = self.client.get(&url).header("x-docker-token", "true");
        if let Some((user, pass)) = auth.credentials() {
            req = req.basic_auth(user, Some(pass));
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            return Err(ProbeError::ImageNotAvailable {
                image: image.to_string(),
            });
        }
        let token = res
            .headers()
            .get("x-docker-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let url = format!(
            "{}/v1/repositories/{}/tags/{}",
            index,
            image.repository(),
            image.tag()
        );
        let mut req = self.client.get(&url);
        if let Some(ref token) = token {
            req = req.header(reqwest::header::AUTHORIZATION, format!("Token {}", token));
        }
        let tagged: TaggedImageV1 = match req.send().await?.json().await {
            Ok(tagged) => tagged,
            Err(_) => {
                return Err(ProbeError::ImageNotAvailable {
                    image: image.to_string(),
                })
            }
        };

        let url = format!("{}/v1/images/{}/json", index, tagged.id);
        let mut req = self.client.get(&url);
        if let Some(ref token) = token {
            req = req.header(reqwest::header::AUTHORIZATION, format!("Token {}", token));
        }
        let res = req.send().await?;
        let envelope: ImageConfigEnvelope = self.decode(image, auth, res, "v1 image json").await?;
        Ok(envelope.into_config())
    }

    fn authorized_get(&self, image: &Image, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        let key = (image.registry().to_owned(), image.repository().to_owned());
        if let Some(token) = self.tokens.get(&key) {
            req = req.header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", token),
            );
        }
        req
    }

    /// Chase one bearer challenge on 401 and triage the final status,
    /// yielding the successful response.
    async fn authorized_response(
        &mut self,
        image: &Image,
        auth: &RegistryAuth,
        res: reqwest::Response,
        accept_manifest: bool,
    ) -> Result<reqwest::Response, ProbeError> {
        let res = match res.status() {
            reqwest::StatusCode::UNAUTHORIZED => {
                let challenge = res
                    .headers()
                    .get(reqwest::header::WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                let url = res.url().clone();
                match challenge {
                    Some(header) if header.to_lowercase().starts_with("bearer") => {
                        self.fetch_bearer_token(image, &header, auth).await?;
                        let req = self.authorized_get(image, url.as_str());
                        let req = if accept_manifest {
                            req.header(reqwest::header::ACCEPT, MANIFEST_V2_ACCEPT)
                        } else {
                            req
                        };
                        req.send().await?
                    }
                    _ => {
                        return Err(ProbeError::ImageNotAvailable {
                            image: image.to_string(),
                        })
                    }
                }
            }
            _ => res,
        };

        match res.status() {
            status if status.is_success() => Ok(res),
            status if status.is_client_error() => Err(ProbeError::ImageNotAvailable {
                image: image.to_string(),
            }),
            status => Err(ProbeError::registry(image.registry(), status)),
        }
    }

    /// Decode a 200 response, chasing one bearer challenge on 401.
    async fn decode<T: serde::de::DeserializeOwned>(
        &mut self,
        image: &Image,
        auth: &RegistryAuth,
        res: reqwest::Response,
        what: &str,
    ) -> Result<T, ProbeError> {
        let res = self
            .authorized_response(image, auth, res, what == "manifest")
            .await?;
        res.json().await.map_err(|e| ProbeError::MalformedResponse {
            registry: image.registry().to_owned(),
            detail: format!("{}: {}", what, e),
        })
    }

    /// Complete a bearer challenge against the token service it names.
    async fn fetch_bearer_token(
        &mut self,
        image: &Image,
        challenge: &str,
        auth: &RegistryAuth,
    ) -> Result<(), ProbeError> {
        let params: HashMap<&str, &str> = BEARER_PARAM
            .captures_iter(challenge)
            .filter_map(|caps| {
                Some((caps.get(1)?.as_str(), caps.get(2)?.as_str()))
            })
            .collect();
        let realm = params.get("realm").ok_or_else(|| {
            ProbeError::MalformedResponse {
                registry: image.registry().to_owned(),
                detail: format!("bearer challenge without realm: {}", challenge),
            }
        })?;

        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(service) = params.get("service") {
            query.push(("service", (*service).to_owned()));
        }
        query.push((
            "scope",
            params
                .get("scope")
                .map(|s| (*s).to_owned())
                .unwrap_or_else(|| format!("repository:{}:pull", image.repository())),
        ));

        let mut req = self.client.get(*realm).query(&query);
        if let Some((user, pass)) = auth.credentials() {
            req = req.basic_auth(user, Some(pass));
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            return Err(ProbeError::ImageNotAvailable {
                image: image.to_string(),
            });
        }
        let envelope: TokenEnvelope =
            res.json().await.map_err(|e| ProbeError::MalformedResponse {
                registry: image.registry().to_owned(),
                detail: format!("token response: {}", e),
            })?;
        debug!(registry = %image.registry(), "bearer token acquired");
        let key = (image.registry().to_owned(), image.repository().to_owned());
        self.tokens.insert(key, envelope.token);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn parses_bearer_challenge_fields() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#;
        let params: HashMap<&str, &str> = BEARER_PARAM
            .captures_iter(header)
            .filter_map(|caps| Some((caps.get(1)?.as_str(), caps.get(2)?.as_str())))
            .collect();
        assert_eq!(params["realm"], "https://auth.docker.io/token");
        assert_eq!(params["service"], "registry.docker.io");
        assert_eq!(params["scope"], "repository:library/nginx:pull");
    }

    #[test]
    fn anonymous_auth_has_no_credentials() {
        assert!(RegistryAuth::Anonymous.credentials().is_none());
        let basic = RegistryAuth::Basic("user".into(), "pass".into());
        assert_eq!(basic.credentials(), Some(("user", "pass")));
    }

    #[tokio::test]
    async fn probe_of_unknown_registry_reports_registry_error() {
        let mut client = Client::default();
        let image = Image::try_from("registry.invalid.example/none/none:latest").expect("parse");
        let err = client
            .probe(&image, &RegistryAuth::Anonymous)
            .await
            .expect_err("probe must fail");
        assert!(matches!(err, ProbeError::Registry { .. }));
    }
}
