//! The pod command protocol.
//!
//! Every mutating command runs under the pod's exclusive lock, so commands
//! on one pod are strictly serialized while different pods proceed
//! independently. The database row is written first, Kubernetes second; a
//! Kubernetes write that fails after a commit leaves the database ahead of
//! reality, which the reconciler (or a later `redeploy`) converges.

use std::time::Duration;

use rand::Rng;
use registry_probe::RegistryAuth;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::IpMode;
use crate::images::ImageProbe;
use crate::ippool::IpAddrPool;
use crate::kube_client::KubeClient;
use crate::lock::{pod_lock_name, ExclusiveLock, LockHandle};
use crate::pod::{build, spec, PodConfig};
use crate::pstorage::PersistentStorage;
use crate::store::billing::{Kube, Package};
use crate::store::disks::DiskRecord;
use crate::store::pods::{PodRecord, PodStatus};
use crate::store::timeline;
use crate::store::users::User;
use crate::store::{self, DbPool};
use crate::{Error, Result};

/// How long a command may hold the pod lock before it is presumed dead.
const COMMAND_LOCK_TTL: Duration = Duration::from_secs(120);

/// A command envelope, as accepted by the update API:
/// `{command, commandOptions, containers?}`.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PodCommand {
    /// Create resources and post the ReplicationController.
    Start,
    /// Delete the ReplicationController, keep the row.
    Stop,
    /// Stop then start, optionally applying a pending edit.
    Redeploy {
        /// Command options.
        #[serde(rename = "commandOptions", default)]
        options: RedeployOptions,
    },
    /// In-place metadata change.
    Set {
        /// Command options.
        #[serde(rename = "commandOptions", default)]
        options: SetOptions,
    },
    /// Per-container kube-count change.
    Resize {
        /// New kube counts per container name.
        #[serde(default)]
        containers: Vec<ResizeContainer>,
    },
    /// Internal: public-IP and node binding updates.
    ChangeConfig {
        /// New public IP.
        #[serde(default)]
        public_ip: Option<String>,
        /// New pinned node.
        #[serde(default)]
        node: Option<String>,
    },
    /// Reserved; currently a no-op.
    ContainerStart,
    /// Reserved; currently a no-op.
    ContainerStop,
    /// Reserved; currently a no-op.
    ContainerDelete,
}

/// Options for `redeploy`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RedeployOptions {
    /// Apply the stored edited configuration before starting.
    #[serde(rename = "applyEdit", default)]
    pub apply_edit: bool,
    /// Wipe persistent volumes during the redeploy.
    #[serde(rename = "wipeOut", default)]
    pub wipe_out: bool,
}

/// Options for `set`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SetOptions {
    /// New pod name.
    #[serde(default)]
    pub name: Option<String>,
    /// New post-deploy description.
    #[serde(rename = "postDescription", default)]
    pub post_description: Option<String>,
    /// New status; only `unpaid` and `stopped` may be set directly.
    #[serde(default)]
    pub status: Option<String>,
}

/// One entry of a `resize` command.
#[derive(Clone, Debug, Deserialize)]
pub struct ResizeContainer {
    /// Container name.
    pub name: String,
    /// New kube count.
    pub kubes: i32,
}

/// A request to create a pod.
#[derive(Clone, Debug, Deserialize)]
pub struct CreatePodRequest {
    /// Pod name, unique per owner.
    pub name: String,
    /// Kube type id.
    #[serde(default)]
    pub kube_type: i32,
    /// Restart policy.
    #[serde(rename = "restartPolicy", default)]
    pub restart_policy: Option<String>,
    /// Containers.
    pub containers: Vec<crate::pod::ContainerSpec>,
    /// User-form volumes.
    #[serde(default)]
    pub volumes: Vec<Value>,
    /// Whether to allocate a public IP for public ports.
    #[serde(rename = "setPublicIP", default)]
    pub set_public_ip: Option<bool>,
    /// Predefined-app template id.
    #[serde(default)]
    pub template_id: Option<i32>,
    /// Template version id.
    #[serde(default)]
    pub template_version_id: Option<i32>,
    /// Template plan name.
    #[serde(default)]
    pub template_plan_name: Option<String>,
}

/// The pod controller.
#[derive(Clone)]
pub struct PodCollection {
    db: DbPool,
    kube: KubeClient,
    ippool: IpAddrPool,
    pstorage: PersistentStorage,
    locks: ExclusiveLock,
    images: ImageProbe,
}

impl PodCollection {
    /// Wire the controller together.
    pub fn new(
        db: DbPool,
        kube: KubeClient,
        ippool: IpAddrPool,
        pstorage: PersistentStorage,
        locks: ExclusiveLock,
        images: ImageProbe,
    ) -> Self {
        Self {
            db,
            kube,
            ippool,
            pstorage,
            locks,
            images,
        }
    }

    /// Create a pod from a user specification.
    ///
    /// Validates everything — including that every container will have a
    /// startup command — before a single Kubernetes object is written.
    #[instrument(level = "info", skip(self, request), fields(name = %request.name))]
    pub async fn add(&self, owner: &User, request: CreatePodRequest) -> Result<PodRecord> {
        let settings = store::system_settings(&self.db).await?;
        let package = Package::by_id(&self.db, owner.package_id).await?;
        let allowed_kubes = Package::allowed_kube_ids(&self.db, owner.package_id).await?;

        let mut config = PodConfig {
            containers: request.containers,
            volumes: request.volumes.clone(),
            volumes_public: request.volumes,
            restart_policy: request
                .restart_policy
                .unwrap_or_else(|| "Always".to_owned()),
            set_public_ip: request.set_public_ip,
            ..PodConfig::default()
        };
        spec::normalize(&mut config)?;
        // Internal-service pods are exempt from quota.
        let (allowed, limit) = if owner.is_internal() {
            (vec![request.kube_type], None)
        } else {
            (allowed_kubes, package.kubes_limit)
        };
        spec::validate(
            &request.name,
            &config,
            request.kube_type,
            &allowed,
            limit,
            &settings,
        )?;
        for volume in &config.volumes_public {
            if !volume.is_object() || volume.get("name").and_then(Value::as_str).is_none() {
                return Err(Error::Validation(
                    "Every volume must be an object with a name".to_owned(),
                ));
            }
            if let Some(size) = volume
                .get("persistentDisk")
                .and_then(|pd| pd.get("pdSize"))
                .and_then(Value::as_i64)
            {
                if size < 1 || size > settings.persistent_disk_max_size {
                    return Err(Error::PdSizeLimit {
                        max_size: settings.persistent_disk_max_size,
                    });
                }
            }
        }
        PodRecord::check_name(&self.db, &request.name, owner.id).await?;
        self.images
            .check_container_commands(&config.containers, &RegistryAuth::Anonymous)
            .await?;

        config.sid = Some(Uuid::new_v4().to_string());
        let record = PodRecord {
            id: Uuid::new_v4(),
            name: request.name,
            owner_id: owner.id,
            kube_id: request.kube_type,
            template_id: request.template_id,
            template_version_id: request.template_version_id,
            template_plan_name: request.template_plan_name,
            config: serde_json::to_value(&config)?,
            direct_access: None,
            status: PodStatus::Stopped.as_str().to_owned(),
            unpaid: false,
        };
        PodRecord::insert(&self.db, &record).await?;
        info!(pod = %record.id, "pod created");
        Ok(record)
    }

    /// Fetch a pod, enforcing ownership, with its status projected from
    /// Kubernetes when the pod exists there.
    pub async fn get(&self, pod_id: Uuid, caller: &User) -> Result<Value> {
        let record = PodRecord::by_id(&self.db, pod_id).await?;
        check_access(caller, &record)?;
        let status = self.projected_status(&record).await;
        Ok(self.render(&record, status).await?)
    }

    /// List a user's live pods.
    pub async fn list(&self, owner_id: i32) -> Result<Vec<Value>> {
        let mut result = Vec::new();
        for record in PodRecord::live_by_owner(&self.db, owner_id).await? {
            let status = self.projected_status(&record).await;
            result.push(self.render(&record, status).await?);
        }
        Ok(result)
    }

    /// Dispatch a command, serialized by the pod lock.
    ///
    /// A concurrent command on the same pod observes the held lock and
    /// returns `Conflict` immediately instead of queueing.
    #[instrument(level = "info", skip(self, caller), fields(caller = %caller.username))]
    pub async fn update(&self, pod_id: Uuid, caller: &User, command: PodCommand) -> Result<Value> {
        let record = PodRecord::by_id(&self.db, pod_id).await?;
        check_access(caller, &record)?;

        let handle = self.acquire_pod_lock(pod_id, &command).await?;
        let result = self.dispatch(&record, caller, command).await;
        self.locks.release(&handle).await?;
        result
    }

    async fn acquire_pod_lock(&self, pod_id: Uuid, command: &PodCommand) -> Result<LockHandle> {
        let payload = json!({ "operation": command_name(command) });
        self.locks
            .acquire(&pod_lock_name(&pod_id), Some(COMMAND_LOCK_TTL), Some(payload))
            .await?
            .ok_or_else(|| {
                Error::Conflict(
                    "Another operation on this pod is already in progress".to_owned(),
                )
            })
    }

    async fn dispatch(
        &self,
        record: &PodRecord,
        caller: &User,
        command: PodCommand,
    ) -> Result<Value> {
        match command {
            PodCommand::Start => {
                self.forbid_fix_price(caller)?;
                self.start_pod(record).await
            }
            PodCommand::Stop => self.stop_pod(record).await,
            PodCommand::Redeploy { options } => {
                self.forbid_fix_price(caller)?;
                self.redeploy(record, options).await
            }
            PodCommand::Set { options } => self.apply_set(record, caller, options).await,
            PodCommand::Resize { containers } => self.resize(record, caller, containers).await,
            PodCommand::ChangeConfig { public_ip, node } => {
                self.change_config(record, public_ip, node).await
            }
            PodCommand::ContainerStart
            | PodCommand::ContainerStop
            | PodCommand::ContainerDelete => Ok(json!({"status": "OK"})),
        }
    }

    /// Fix-price users drive pods through the billing collaborator only.
    fn forbid_fix_price(&self, caller: &User) -> Result<()> {
        if caller.fix_price && !caller.is_admin {
            return Err(Error::PermissionDenied(
                "Direct pod control is not available on fixed-price billing; \
                 use your billing panel"
                    .to_owned(),
            ));
        }
        Ok(())
    }

    /// Start a pod: namespace, disks, service, public IP, then the RC.
    async fn start_pod(&self, record: &PodRecord) -> Result<Value> {
        if record.unpaid {
            return Err(Error::PermissionDenied(
                "Pod is suspended for non-payment".to_owned(),
            ));
        }
        let owner = User::by_id(&self.db, record.owner_id).await?;
        let mut config = record.config()?;
        let namespace = record.namespace();

        PodRecord::set_status(&self.db, record.id, PodStatus::Pending).await?;
        self.kube.ensure_namespace(&namespace).await?;

        // Disks: create/recycle rows and physical drives, rewrite volume
        // stanzas, then bind every named drive to this pod atomically.
        let drives = self
            .pstorage
            .prepare_volumes(record.id, record.owner_id, &mut config)
            .await?;
        if !drives.is_empty() {
            let mut tx = self.db.begin().await?;
            self.pstorage.take(&mut tx, record.id, &drives).await?;
            tx.commit().await?;
        }

        let kube = Kube::by_id(&self.db, record.kube_id).await?;
        if config.has_ports() && self.kube.services_by_pod(&namespace).await?.is_empty() {
            let view = self.view(record, &owner, &kube, &config);
            if let Some(service) = build::service_object(&view, self.ippool.mode()) {
                self.kube.create_service(&namespace, service).await?;
            }
        }

        let wants_ip = config.set_public_ip.unwrap_or(false) || config.has_public_ports();
        if wants_ip && config.public_ip.is_none() && self.ippool.mode() != IpMode::Aws {
            let ip = self
                .ippool
                .assign_ip_to_pod(record.id, config.node.as_deref(), None)
                .await?;
            config.public_ip = Some(ip);
        }

        // Persist the enriched config before the RC goes out, so a crash
        // between the two leaves a restartable state.
        if config.sid.is_none() {
            config.sid = Some(Uuid::new_v4().to_string());
        }
        PodRecord::set_config(&self.db, record.id, &config).await?;

        let view = self.view(record, &owner, &kube, &config);
        let rc = build::replication_controller(&view);
        match self.kube.create_replication_controller(&namespace, rc).await {
            Ok(_) => {
                info!(pod = %record.id, "pod started");
                Ok(json!({ "status": PodStatus::Pending.as_str() }))
            }
            Err(Error::KubeApi { status: 409, .. }) => {
                // The RC survived an earlier crash; treat as started.
                warn!(pod = %record.id, "replication controller already exists");
                Ok(json!({ "status": PodStatus::Pending.as_str() }))
            }
            Err(e) => {
                PodRecord::set_status(&self.db, record.id, PodStatus::Stopped).await?;
                Err(e)
            }
        }
    }

    /// Stop a pod: delete the RC, release disks, keep everything else.
    async fn stop_pod(&self, record: &PodRecord) -> Result<Value> {
        let config = record.config()?;
        PodRecord::set_status(&self.db, record.id, PodStatus::Stopping).await?;
        if let Some(sid) = &config.sid {
            self.kube
                .delete_replication_controller(&record.namespace(), sid)
                .await?;
        }
        self.pstorage.detach_all(record.id).await?;
        PodRecord::set_status(&self.db, record.id, PodStatus::Stopped).await?;
        info!(pod = %record.id, "pod stopped");
        Ok(json!({ "status": PodStatus::Stopped.as_str() }))
    }

    /// Stop then start, optionally swapping in the pending edit.
    async fn redeploy(&self, record: &PodRecord, options: RedeployOptions) -> Result<Value> {
        self.stop_pod(record).await?;

        let mut config = record.config()?;
        if options.apply_edit {
            if let Some(edited) = config.edited_config.take() {
                let mut applied = *edited;
                // The edit replaces the spec but never identity or bindings.
                applied.sid = Some(Uuid::new_v4().to_string());
                applied.public_ip = config.public_ip.clone();
                applied.node = config.node.clone();
                config = applied;
            }
        } else {
            // A fresh RC name per deployment generation.
            config.sid = Some(Uuid::new_v4().to_string());
        }
        if options.wipe_out {
            for name in config.persistent_disk_names() {
                if let Some(disk) =
                    DiskRecord::by_name_owner(&self.db, &name, record.owner_id).await?
                {
                    self.pstorage.mark_todelete(&disk.id).await?;
                }
            }
        }
        PodRecord::set_config(&self.db, record.id, &config).await?;

        let record = PodRecord::by_id(&self.db, record.id).await?;
        self.start_pod(&record).await
    }

    /// In-place metadata changes.
    async fn apply_set(
        &self,
        record: &PodRecord,
        caller: &User,
        options: SetOptions,
    ) -> Result<Value> {
        if let Some(name) = &options.name {
            PodRecord::check_name(&self.db, name, record.owner_id).await?;
            PodRecord::set_name(&self.db, record.id, name).await?;
        }
        if let Some(description) = options.post_description {
            let mut config = record.config()?;
            config.post_description = Some(description);
            PodRecord::set_config(&self.db, record.id, &config).await?;
        }
        if let Some(status) = options.status {
            match status.as_str() {
                "unpaid" => {
                    self.forbid_fix_price(caller)?;
                    self.stop_pod(record).await?;
                    PodRecord::set_unpaid(&self.db, record.id, true).await?;
                    PodRecord::set_status(&self.db, record.id, PodStatus::Unpaid).await?;
                }
                "stopped" => {
                    self.forbid_fix_price(caller)?;
                    PodRecord::set_unpaid(&self.db, record.id, false).await?;
                    self.stop_pod(record).await?;
                }
                other => {
                    return Err(Error::Validation(format!(
                        "Status '{}' cannot be set directly",
                        other
                    )))
                }
            }
        }
        Ok(json!({"status": "OK"}))
    }

    /// Change per-container kube counts and roll the RC when running.
    async fn resize(
        &self,
        record: &PodRecord,
        caller: &User,
        containers: Vec<ResizeContainer>,
    ) -> Result<Value> {
        let settings = store::system_settings(&self.db).await?;
        let owner = User::by_id(&self.db, record.owner_id).await?;
        let package = Package::by_id(&self.db, owner.package_id).await?;
        let allowed = Package::allowed_kube_ids(&self.db, owner.package_id).await?;

        let mut config = record.config()?;
        for resize in &containers {
            let container = config
                .containers
                .iter_mut()
                .find(|c| c.name == resize.name)
                .ok_or_else(|| {
                    Error::NotFound(format!("Container '{}' does not exist", resize.name))
                })?;
            container.kubes = resize.kubes;
        }
        let limit = if owner.is_internal() || caller.is_admin {
            None
        } else {
            package.kubes_limit
        };
        spec::validate(&record.name, &config, record.kube_id, &allowed, limit, &settings)?;
        PodRecord::set_config(&self.db, record.id, &config).await?;

        let was_running = matches!(
            self.projected_status(record).await,
            PodStatus::Running | PodStatus::Pending
        );
        if was_running {
            let record = PodRecord::by_id(&self.db, record.id).await?;
            self.stop_pod(&record).await?;
            let record = PodRecord::by_id(&self.db, record.id).await?;
            return self.start_pod(&record).await;
        }
        Ok(json!({"status": "OK"}))
    }

    /// Internal command updating resource bindings.
    async fn change_config(
        &self,
        record: &PodRecord,
        public_ip: Option<String>,
        node: Option<String>,
    ) -> Result<Value> {
        let mut config = record.config()?;
        if public_ip.is_some() {
            config.public_ip = public_ip;
        }
        if node.is_some() {
            config.node = node;
        }
        PodRecord::set_config(&self.db, record.id, &config).await?;
        Ok(json!({"status": "OK"}))
    }

    /// Delete a pod and everything it owns.
    ///
    /// The namespace delete cascades over the RC, pods and services; the
    /// database keeps a salted tombstone for billing history.
    #[instrument(level = "info", skip(self, caller))]
    pub async fn delete(&self, pod_id: Uuid, caller: &User) -> Result<()> {
        let record = PodRecord::by_id(&self.db, pod_id).await?;
        check_access(caller, &record)?;
        let owner = User::by_id(&self.db, record.owner_id).await?;
        if owner.is_internal() {
            return Err(Error::PermissionDenied(
                "Service pod cannot be removed".to_owned(),
            ));
        }

        let handle = self.acquire_pod_lock(pod_id, &PodCommand::Stop).await?;
        let result = self.delete_locked(&record).await;
        self.locks.release(&handle).await?;
        result
    }

    async fn delete_locked(&self, record: &PodRecord) -> Result<()> {
        PodRecord::set_status(&self.db, record.id, PodStatus::Deleting).await?;
        self.ippool.release_pod_ip(record.id).await?;
        self.kube.delete_namespace(&record.namespace()).await?;
        self.pstorage.detach_all(record.id).await?;
        // The namespace takes the pod objects with it, so the reconciler
        // may never see their final events.
        timeline::close_open_rows(&self.db, record.id, chrono::Utc::now().naive_utc()).await?;

        let mut tx = self.db.begin().await?;
        PodRecord::mark_deleted(&mut tx, record.id).await?;
        tx.commit().await?;
        info!(pod = %record.id, "pod deleted");
        Ok(())
    }

    /// Accept a raw YAML pod specification, as submitted to the YAML API.
    pub async fn add_from_yaml(&self, owner: &User, yaml: &str) -> Result<PodRecord> {
        let request: CreatePodRequest = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Validation(format!("Invalid pod specification: {}", e)))?;
        self.add(owner, request).await
    }

    /// Whether the registry serves a newer image for one container.
    pub async fn check_container_update(
        &self,
        pod_id: Uuid,
        container_name: &str,
        caller: &User,
    ) -> Result<Value> {
        let record = PodRecord::by_id(&self.db, pod_id).await?;
        check_access(caller, &record)?;
        let config = record.config()?;
        let container = config
            .containers
            .iter()
            .find(|c| c.name == container_name)
            .ok_or_else(|| {
                Error::NotFound(format!("Container '{}' does not exist", container_name))
            })?;

        let digest = self
            .images
            .manifest_digest(&container.image, &RegistryAuth::Anonymous)
            .await?;
        let running_image_id = self
            .kube
            .pods_by_uid(&record.namespace())
            .await?
            .first()
            .and_then(|pod| pod.status.as_ref())
            .and_then(|status| status.container_statuses.as_ref())
            .and_then(|statuses| {
                statuses
                    .iter()
                    .find(|s| s.name == container_name)
                    .map(|s| s.image_id.clone())
            })
            .ok_or_else(|| {
                Error::Conflict(format!(
                    "Container '{}' is not running, nothing to compare",
                    container_name
                ))
            })?;

        Ok(json!({
            "updateAvailable": !image_matches_digest(&running_image_id, &digest)
        }))
    }

    /// Pull and roll to the latest image of the pod's containers.
    ///
    /// Containers pull with `imagePullPolicy: Always`, so a redeploy picks
    /// up whatever the registry serves for the tag.
    pub async fn apply_container_update(&self, pod_id: Uuid, caller: &User) -> Result<Value> {
        self.update(
            pod_id,
            caller,
            PodCommand::Redeploy {
                options: RedeployOptions::default(),
            },
        )
        .await
    }

    /// Issue (or return) direct-access credentials for a pod.
    ///
    /// Only the credential record lives here; provisioning the SSH user on
    /// the node is the installer's business.
    pub async fn direct_access(&self, pod_id: Uuid, caller: &User) -> Result<Value> {
        let record = PodRecord::by_id(&self.db, pod_id).await?;
        check_access(caller, &record)?;
        if let Some(existing) = &record.direct_access {
            if let Ok(decoded) = serde_json::from_str::<Value>(existing) {
                return Ok(decoded);
            }
        }
        let password: String = {
            let mut rng = rand::thread_rng();
            (0..12).map(|_| rng.gen_range('a'..='z')).collect()
        };
        let credentials = json!({
            "auth": format!("pod-{}", &pod_id.to_string()[..8]),
            "password": password,
        });
        PodRecord::set_direct_access(&self.db, pod_id, Some(&credentials.to_string())).await?;
        Ok(credentials)
    }

    /// The pod's effective status: Kubernetes wins while the pod exists
    /// there, the database otherwise.
    pub async fn projected_status(&self, record: &PodRecord) -> PodStatus {
        match self.kube.pods_by_uid(&record.namespace()).await {
            Ok(pods) if !pods.is_empty() => {
                let phase = pods[0]
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .unwrap_or("pending");
                PodStatus::parse(&phase.to_lowercase())
            }
            Ok(_) => record.status(),
            Err(e) => {
                warn!(pod = %record.id, error = %e,
                    "status projection fell back to the database");
                record.status()
            }
        }
    }

    async fn render(&self, record: &PodRecord, status: PodStatus) -> Result<Value> {
        let mut config = record.config()?;
        strip_mount_relabel(&mut config);
        let mut rendered = json!({
            "id": record.id,
            "name": record.name,
            "owner_id": record.owner_id,
            "kube_type": record.kube_id,
            "status": status.as_str(),
            "unpaid": record.unpaid,
            "containers": config.containers,
            "volumes": config.volumes_public,
            "restartPolicy": config.restart_policy,
            "kubes": record.kubes(),
        });
        if let Some(ip) = &config.public_ip {
            rendered["public_ip"] = json!(ip);
        }
        if let Some(description) = &config.post_description {
            rendered["postDescription"] = json!(description);
        }
        if record.template_id.is_some() {
            rendered["template_id"] = json!(record.template_id);
        }
        Ok(rendered)
    }

    fn view<'a>(
        &self,
        record: &PodRecord,
        owner: &User,
        kube: &'a Kube,
        config: &'a PodConfig,
    ) -> build::PodView<'a> {
        build::PodView {
            id: record.namespace(),
            sid: config.sid.clone().unwrap_or_default(),
            owner_id: record.owner_id,
            owner_is_internal: owner.is_internal(),
            kube,
            config,
        }
    }
}

/// Ownership gate: admins see everything, users their own pods.
fn check_access(caller: &User, record: &PodRecord) -> Result<()> {
    if caller.is_admin || caller.id == record.owner_id {
        Ok(())
    } else {
        Err(Error::PermissionDenied(
            "You are not allowed to operate on this pod".to_owned(),
        ))
    }
}

fn command_name(command: &PodCommand) -> &'static str {
    match command {
        PodCommand::Start => "start",
        PodCommand::Stop => "stop",
        PodCommand::Redeploy { .. } => "redeploy",
        PodCommand::Set { .. } => "set",
        PodCommand::Resize { .. } => "resize",
        PodCommand::ChangeConfig { .. } => "change_config",
        PodCommand::ContainerStart => "container_start",
        PodCommand::ContainerStop => "container_stop",
        PodCommand::ContainerDelete => "container_delete",
    }
}

/// Whether a running container's image id already carries the registry's
/// current digest. Kubernetes reports ids like
/// `docker-pullable://nginx@sha256:<hex>`.
fn image_matches_digest(image_id: &str, digest: &str) -> bool {
    image_id.ends_with(digest)
}

/// API responses show mount paths without the SELinux `:Z` suffix.
fn strip_mount_relabel(config: &mut PodConfig) {
    for container in &mut config.containers {
        for mount in &mut container.volume_mounts {
            if let Some(stripped) = mount
                .mount_path
                .strip_suffix(":Z")
                .or_else(|| mount.mount_path.strip_suffix(":z"))
            {
                mount.mount_path = stripped.to_owned();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_envelope_decoding() {
        let command: PodCommand =
            serde_json::from_value(json!({"command": "start"})).expect("decode");
        assert!(matches!(command, PodCommand::Start));

        let command: PodCommand = serde_json::from_value(json!({
            "command": "redeploy",
            "commandOptions": {"applyEdit": true}
        }))
        .expect("decode");
        match command {
            PodCommand::Redeploy { options } => assert!(options.apply_edit),
            _ => panic!("wrong command"),
        }

        let command: PodCommand = serde_json::from_value(json!({
            "command": "resize",
            "containers": [{"name": "web", "kubes": 3}]
        }))
        .expect("decode");
        match command {
            PodCommand::Resize { containers } => {
                assert_eq!(containers[0].name, "web");
                assert_eq!(containers[0].kubes, 3);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert!(serde_json::from_value::<PodCommand>(json!({"command": "explode"})).is_err());
    }

    #[test]
    fn command_names_match_the_wire_protocol() {
        assert_eq!(command_name(&PodCommand::Start), "start");
        assert_eq!(
            command_name(&PodCommand::ChangeConfig {
                public_ip: None,
                node: None
            }),
            "change_config"
        );
    }

    #[test]
    fn image_digest_comparison() {
        let digest = "sha256:51d9b231d5129e3ffc267c9d455c49d789bf3167b611a07ab6e4b3304c96b0e7";
        let image_id = format!("docker-pullable://nginx@{}", digest);
        assert!(image_matches_digest(&image_id, digest));
        assert!(!image_matches_digest(
            "docker-pullable://nginx@sha256:0000",
            digest
        ));
    }

    #[test]
    fn yaml_specification_decodes_like_json() {
        let yaml = "
name: web
kube_type: 0
restartPolicy: Always
containers:
  - image: nginx
    kubes: 2
    ports:
      - containerPort: 80
        isPublic: true
";
        let request: CreatePodRequest = serde_yaml::from_str(yaml).expect("decode");
        assert_eq!(request.name, "web");
        assert_eq!(request.containers[0].kubes, 2);
        assert!(request.containers[0].ports[0].is_public);
    }

    #[test]
    fn create_request_decoding_defaults() {
        let request: CreatePodRequest = serde_json::from_value(json!({
            "name": "web",
            "containers": [{"image": "nginx", "kubes": 2,
                            "ports": [{"containerPort": 80, "isPublic": true}]}],
            "kube_type": 0,
            "restartPolicy": "Always"
        }))
        .expect("decode");
        assert_eq!(request.kube_type, 0);
        assert_eq!(request.restart_policy.as_deref(), Some("Always"));
        assert!(request.volumes.is_empty());
    }
}
