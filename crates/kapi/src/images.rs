//! Image-configuration probing with caching and login rate-limiting.
//!
//! Pod validation needs to know whether an image ships a startup command
//! and which ports it exposes. Probing goes through `registry-probe`;
//! decoded configs are cached in the database for four hours, and failed
//! logins to private registries are throttled so repeated bad credentials
//! do not get the account blocked registry-side.

use std::convert::TryFrom;
use std::sync::Arc;

use chrono::Utc;
use registry_probe::{Client, ContainerConfig, Image, RegistryAuth};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::pod::ContainerSpec;
use crate::store::images as cache;
use crate::store::DbPool;
use crate::{Error, Result};

/// Minimum pause between authenticated attempts after a failed login.
pub const MIN_FAILED_LOGIN_PAUSE_SECS: i64 = 3;

/// The probe service.
#[derive(Clone)]
pub struct ImageProbe {
    db: DbPool,
    client: Arc<Mutex<Client>>,
}

impl ImageProbe {
    /// Build over the shared pool.
    pub fn new(db: DbPool) -> Self {
        Self {
            db,
            client: Arc::new(Mutex::new(Client::default())),
        }
    }

    /// Resolve the container config of an image, consulting the cache
    /// first.
    #[instrument(level = "debug", skip(self, auth))]
    pub async fn container_config(
        &self,
        image: &str,
        auth: &RegistryAuth,
    ) -> Result<ContainerConfig> {
        let reference = Image::try_from(image)?;

        if let Some(cached) = cache::ImageCacheRow::get(&self.db, image).await? {
            if !cached.outdated(Utc::now().naive_utc()) {
                debug!(%image, "image config served from cache");
                return Ok(serde_json::from_value(cached.data)?);
            }
        }

        if let RegistryAuth::Basic(username, _) = auth {
            self.enforce_login_pause(username, reference.registry())
                .await?;
        }

        let probed = {
            let mut client = self.client.lock().await;
            client.probe(&reference, auth).await
        };
        match probed {
            Ok(config) => {
                cache::ImageCacheRow::put(&self.db, image, &serde_json::to_value(&config)?)
                    .await?;
                Ok(config)
            }
            Err(e @ registry_probe::ProbeError::ImageNotAvailable { .. }) => {
                if let RegistryAuth::Basic(username, _) = auth {
                    warn!(%image, %username, "failed registry login recorded");
                    cache::save_failed_login(&self.db, username, reference.registry()).await?;
                }
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The digest the registry currently serves for an image tag.
    /// Uncached: update checks want the live answer.
    pub async fn manifest_digest(&self, image: &str, auth: &RegistryAuth) -> Result<String> {
        let reference = Image::try_from(image)?;
        let mut client = self.client.lock().await;
        Ok(client.manifest_digest(&reference, auth).await?)
    }

    /// Refuse an authenticated attempt while the per-(user, registry)
    /// pause from the last failed login is still running.
    async fn enforce_login_pause(&self, username: &str, registry: &str) -> Result<()> {
        if let Some(last) = cache::last_failed_login(&self.db, username, registry).await? {
            let elapsed = (Utc::now().naive_utc() - last).num_seconds();
            if elapsed < MIN_FAILED_LOGIN_PAUSE_SECS {
                return Err(Error::RegistryLoginPause {
                    seconds: MIN_FAILED_LOGIN_PAUSE_SECS - elapsed,
                });
            }
        }
        Ok(())
    }

    /// The missing-command gate: every container must get a startup
    /// command from its spec or its image, before anything is written to
    /// Kubernetes.
    pub async fn check_container_commands(
        &self,
        containers: &[ContainerSpec],
        auth: &RegistryAuth,
    ) -> Result<()> {
        for container in containers {
            if !container.command.is_empty() || !container.args.is_empty() {
                continue;
            }
            let config = self.container_config(&container.image, auth).await?;
            if !crate::pod::spec::has_startup_command(container, &config) {
                return Err(Error::CommandIsMissing {
                    container: container.name.clone(),
                    image: container.image.clone(),
                });
            }
        }
        Ok(())
    }
}
