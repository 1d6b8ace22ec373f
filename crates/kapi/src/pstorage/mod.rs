//! Persistent-disk management.
//!
//! The control plane owns disk identity and lifecycle; the storage
//! backend (Ceph RBD, AWS EBS or node-local directories) only ever sees
//! physical drive names. Backends rewrite pod volume stanzas into whatever
//! Kubernetes volume type they map to, and perform physical create/delete
//! through the node-command seam.
//!
//! Deletion is asynchronous: `mark_todelete` renames the dying disk and
//! plants a companion row (state `Deleted`) under the original name, so a
//! user can reuse the name immediately while the GC removes the old drive
//! in the background.

pub mod names;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{Config, StorageKind};
use crate::node::NodeCommandRunner;
use crate::store::disks::{DiskRecord, DiskState};
use crate::store::pods::PodRecord;
use crate::store::{DbPool, Tx};
use crate::{Error, Result};

/// A storage backend.
///
/// Implementations translate drive identity into backend operations; they
/// never touch the database.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Create the physical drive. Size is GB.
    async fn create_physical(&self, drive_name: &str, size: i64) -> Result<()>;

    /// Delete the physical drive.
    async fn delete_physical(&self, drive_name: &str) -> Result<()>;

    /// Rewrite a pod volume stanza to mount the drive.
    fn enrich_volume_info(&self, volume: &mut Value, drive_name: &str, pod_id: &Uuid);

    /// Enumerate all physical drives the backend knows about, name → size.
    async fn list_all(&self) -> Result<HashMap<String, i64>>;
}

/// Ceph RBD images in a configured pool.
pub struct CephStorage {
    runner: Arc<dyn NodeCommandRunner>,
    pool: String,
    monitors: Vec<String>,
    keyring: String,
    user: String,
}

impl CephStorage {
    /// Build from configuration.
    pub fn new(runner: Arc<dyn NodeCommandRunner>, config: &Config) -> Self {
        Self {
            runner,
            pool: config.ceph_pool.clone(),
            monitors: config.ceph_monitors.clone(),
            keyring: config.ceph_keyring.clone(),
            user: config.ceph_user.clone(),
        }
    }

    fn credentials(&self) -> String {
        format!("-n client.{} --keyring={}", self.user, self.keyring)
    }
}

#[async_trait]
impl StorageBackend for CephStorage {
    async fn create_physical(&self, drive_name: &str, size: i64) -> Result<()> {
        let command = format!(
            "rbd {} create {}/{} --size {}G",
            self.credentials(),
            self.pool,
            drive_name,
            size
        );
        self.runner.run_on_first_node(&command).await.map(|_| ())
    }

    async fn delete_physical(&self, drive_name: &str) -> Result<()> {
        let command = format!(
            "rbd {} rm {}/{}",
            self.credentials(),
            self.pool,
            drive_name
        );
        self.runner.run_on_first_node(&command).await.map(|_| ())
    }

    fn enrich_volume_info(&self, volume: &mut Value, drive_name: &str, _pod_id: &Uuid) {
        volume["rbd"] = json!({
            "image": drive_name,
            "pool": self.pool,
            "monitors": self.monitors,
            "keyring": self.keyring,
            "user": self.user,
            "fsType": "xfs",
        });
    }

    async fn list_all(&self) -> Result<HashMap<String, i64>> {
        let output = self
            .runner
            .run_on_first_node(&format!(
                "rbd {} list --long --format=json",
                self.credentials()
            ))
            .await?;
        let entries = output
            .as_array()
            .ok_or_else(|| Error::Internal("unexpected rbd list output".to_owned()))?;
        let mut drives = HashMap::new();
        for entry in entries {
            if let (Some(image), Some(size)) = (
                entry.get("image").and_then(Value::as_str),
                entry.get("size").and_then(Value::as_i64),
            ) {
                drives.insert(image.to_owned(), size);
            }
        }
        Ok(drives)
    }
}

/// AWS Elastic Block Store volumes.
pub struct AwsStorage {
    runner: Arc<dyn NodeCommandRunner>,
}

impl AwsStorage {
    /// Build over the node-command seam.
    pub fn new(runner: Arc<dyn NodeCommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl StorageBackend for AwsStorage {
    async fn create_physical(&self, drive_name: &str, size: i64) -> Result<()> {
        let command = format!(
            "aws ec2 create-volume --size {} --tag-specifications \
             'ResourceType=volume,Tags=[{{Key=Name,Value={}}}]' --output json",
            size, drive_name
        );
        self.runner.run_on_first_node(&command).await.map(|_| ())
    }

    async fn delete_physical(&self, drive_name: &str) -> Result<()> {
        let command = format!(
            "aws ec2 delete-volume --volume-name {} --output json",
            drive_name
        );
        self.runner.run_on_first_node(&command).await.map(|_| ())
    }

    fn enrich_volume_info(&self, volume: &mut Value, drive_name: &str, _pod_id: &Uuid) {
        volume["awsElasticBlockStore"] = json!({
            "volumeID": format!("aws://{}", drive_name),
            "fsType": "xfs",
        });
    }

    async fn list_all(&self) -> Result<HashMap<String, i64>> {
        let output = self
            .runner
            .run_on_first_node("aws ec2 describe-volumes --output json")
            .await?;
        let mut drives = HashMap::new();
        if let Some(volumes) = output.get("Volumes").and_then(Value::as_array) {
            for volume in volumes {
                if let (Some(name), Some(size)) = (
                    volume.get("VolumeId").and_then(Value::as_str),
                    volume.get("Size").and_then(Value::as_i64),
                ) {
                    drives.insert(name.to_owned(), size);
                }
            }
        }
        Ok(drives)
    }
}

/// Node-local directories under the storage prefix.
///
/// Disks are additionally node-bound: once a pod using one lands on a
/// node, the disk (and every later pod using it) stays there.
pub struct LocalStorage {
    runner: Arc<dyn NodeCommandRunner>,
    prefix: String,
}

impl LocalStorage {
    /// Build from configuration.
    pub fn new(runner: Arc<dyn NodeCommandRunner>, config: &Config) -> Self {
        Self {
            runner,
            prefix: config.node_local_storage_prefix.clone(),
        }
    }

    fn drive_path(&self, drive_name: &str) -> String {
        format!("{}/{}", self.prefix, drive_name)
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn create_physical(&self, drive_name: &str, size: i64) -> Result<()> {
        let command = format!(
            "PYTHONPATH=/var/lib/kuberdock/scripts python2 -m node_storage_manage.manage \
             create-volume --path {} --quota {}",
            self.drive_path(drive_name),
            size
        );
        self.runner.run_on_first_node(&command).await.map(|_| ())
    }

    async fn delete_physical(&self, drive_name: &str) -> Result<()> {
        let command = format!(
            "PYTHONPATH=/var/lib/kuberdock/scripts python2 -m node_storage_manage.manage \
             remove-volume --path {}",
            self.drive_path(drive_name)
        );
        self.runner.run_on_first_node(&command).await.map(|_| ())
    }

    fn enrich_volume_info(&self, volume: &mut Value, drive_name: &str, _pod_id: &Uuid) {
        volume["hostPath"] = json!({ "path": self.drive_path(drive_name) });
    }

    async fn list_all(&self) -> Result<HashMap<String, i64>> {
        let output = self
            .runner
            .run_on_first_node(
                "PYTHONPATH=/var/lib/kuberdock/scripts python2 -m node_storage_manage.manage \
                 list-volumes",
            )
            .await?;
        let mut drives = HashMap::new();
        if let Some(volumes) = output.as_array() {
            for volume in volumes {
                if let (Some(path), Some(size)) = (
                    volume.get("path").and_then(Value::as_str),
                    volume.get("size").and_then(Value::as_i64),
                ) {
                    if let Some(name) = path.strip_prefix(&format!("{}/", self.prefix)) {
                        drives.insert(name.to_owned(), size);
                    }
                }
            }
        }
        Ok(drives)
    }
}

/// Build the configured backend.
pub fn storage_backend(
    config: &Config,
    runner: Arc<dyn NodeCommandRunner>,
) -> Arc<dyn StorageBackend> {
    match config.storage {
        StorageKind::Ceph => Arc::new(CephStorage::new(runner, config)),
        StorageKind::Aws => Arc::new(AwsStorage::new(runner)),
        StorageKind::Local => Arc::new(LocalStorage::new(runner, config)),
    }
}

/// The persistent-disk manager.
#[derive(Clone)]
pub struct PersistentStorage {
    db: DbPool,
    backend: Arc<dyn StorageBackend>,
    max_size: i64,
    local: bool,
    local_prefix: String,
}

impl PersistentStorage {
    /// Build the manager.
    pub fn new(db: DbPool, backend: Arc<dyn StorageBackend>, config: &Config, max_size: i64) -> Self {
        Self {
            db,
            backend,
            max_size,
            local: config.storage == StorageKind::Local,
            local_prefix: config.node_local_storage_prefix.clone(),
        }
    }

    /// The active backend.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Create a disk for an owner.
    ///
    /// A leftover companion row in state `Deleted` (planted by an earlier
    /// deletion) is recycled: the physical drive is created under its
    /// already-incremented drive name. A row in any other state is a name
    /// conflict. A failed physical create removes the pending row again so
    /// no orphan is left behind.
    #[instrument(level = "info", skip(self))]
    pub async fn create(&self, name: &str, owner_id: i32, size: i64) -> Result<DiskRecord> {
        if size < 1 || size > self.max_size {
            return Err(Error::PdSizeLimit {
                max_size: self.max_size,
            });
        }
        let existing = DiskRecord::by_name_owner(&self.db, name, owner_id).await?;
        let (record, recycled) = match existing {
            Some(row) if row.state() == DiskState::Deleted => (row, true),
            Some(_) => {
                return Err(Error::Conflict(format!(
                    "Persistent disk \"{}\" already exists",
                    name
                )))
            }
            None => {
                let record = DiskRecord::new(name, owner_id, size);
                DiskRecord::insert(&self.db, &record).await?;
                (record, false)
            }
        };

        match self
            .backend
            .create_physical(&record.drive_name, record.size)
            .await
        {
            Ok(()) => {
                DiskRecord::set_state(&self.db, &record.id, DiskState::Created).await?;
                info!(drive = %record.drive_name, "persistent disk created");
                DiskRecord::by_id(&self.db, &record.id).await
            }
            Err(e) => {
                if recycled {
                    // The companion row survives; only a fresh row rolls back.
                    warn!(drive = %record.drive_name, error = %e,
                        "physical create failed for recycled disk");
                } else {
                    DiskRecord::delete_row(&self.db, &record.id).await?;
                }
                Err(e)
            }
        }
    }

    /// Ensure a row exists for a pod volume, creating a pending one when
    /// the name is unknown. Pod start performs the physical create.
    pub async fn ensure_for_pod(
        &self,
        name: &str,
        owner_id: i32,
        size: i64,
    ) -> Result<DiskRecord> {
        match DiskRecord::by_name_owner(&self.db, name, owner_id).await? {
            Some(existing) => Ok(existing),
            None => {
                let record = DiskRecord::new(name, owner_id, size);
                DiskRecord::insert(&self.db, &record).await?;
                Ok(record)
            }
        }
    }

    /// Attach one disk to a pod; fails with `PdIsUsed` when another pod
    /// holds it.
    pub async fn attach(&self, disk_id: &str, pod_id: Uuid) -> Result<()> {
        DiskRecord::attach(&self.db, disk_id, pod_id).await
    }

    /// Lock and bind all named drives to a pod, all-or-nothing.
    pub async fn take(
        &self,
        tx: &mut Tx<'_>,
        pod_id: Uuid,
        drives: &[String],
    ) -> Result<Vec<DiskRecord>> {
        let (taken, held) = DiskRecord::take(tx, pod_id, drives).await?;
        if !held.is_empty() {
            let holder = held[0].pod_id.map(|id| id.to_string()).unwrap_or_default();
            return Err(Error::PdIsUsed { pod: holder });
        }
        Ok(taken)
    }

    /// Detach every disk a pod holds.
    pub async fn detach_all(&self, pod_id: Uuid) -> Result<u64> {
        DiskRecord::free(&self.db, pod_id).await
    }

    /// Whether a disk may be physically deleted right now, with a
    /// diagnostic when not.
    ///
    /// Node-local drives cannot go while a live pod of the same owner
    /// still references the name.
    pub async fn drive_can_be_deleted(&self, disk_id: &str) -> Result<(bool, Option<String>)> {
        let disk = DiskRecord::by_id(&self.db, disk_id).await?;
        if disk.in_use() {
            return Ok((
                false,
                Some(format!("Persistent disk '{}' is attached to a pod", disk.name)),
            ));
        }
        if !self.local {
            return Ok((true, None));
        }
        for pod in PodRecord::live_by_owner(&self.db, disk.owner_id).await? {
            let references = pod
                .config()
                .map(|c| c.persistent_disk_names().contains(&disk.name))
                .unwrap_or(false);
            if references {
                return Ok((
                    false,
                    Some(format!(
                        "Persistent disk '{}' is referenced by pod '{}'",
                        disk.name, pod.name
                    )),
                ));
            }
        }
        Ok((true, None))
    }

    /// Mark a disk for deletion, returning its companion row.
    ///
    /// The companion reclaims the (name, owner) slot in state `Deleted`,
    /// and every stopped pod referencing the name is rewritten to the new
    /// drive path.
    #[instrument(level = "info", skip(self))]
    pub async fn mark_todelete(&self, disk_id: &str) -> Result<Option<DiskRecord>> {
        let (deletable, reason) = self.drive_can_be_deleted(disk_id).await?;
        if !deletable {
            return Err(Error::Conflict(reason.unwrap_or_else(|| {
                "Persistent disk cannot be deleted".to_owned()
            })));
        }
        let companion = DiskRecord::mark_todelete(&self.db, disk_id).await?;
        if let Some(ref companion) = companion {
            self.update_pods_volumes(companion).await?;
        }
        Ok(companion)
    }

    /// Rewrite stopped pods' volume stanzas to a replacement drive.
    pub async fn update_pods_volumes(&self, new_disk: &DiskRecord) -> Result<()> {
        for pod in PodRecord::live_by_owner(&self.db, new_disk.owner_id).await? {
            let mut config = match pod.config() {
                Ok(config) => config,
                Err(e) => {
                    warn!(pod = %pod.id, error = %e, "skipping pod with corrupt config");
                    continue;
                }
            };
            let references = config
                .volumes_public
                .iter()
                .any(|v| {
                    v.get("persistentDisk").and_then(|pd| pd.get("pdName")).and_then(Value::as_str)
                        == Some(new_disk.name.as_str())
                });
            if !references {
                continue;
            }
            for (volume, public) in config
                .volumes
                .iter_mut()
                .zip(config.volumes_public.iter())
            {
                let matches = public
                    .get("persistentDisk")
                    .and_then(|pd| pd.get("pdName"))
                    .and_then(Value::as_str)
                    == Some(new_disk.name.as_str());
                if !matches {
                    continue;
                }
                if let Some(obj) = volume.as_object_mut() {
                    obj.remove("rbd");
                    obj.remove("awsElasticBlockStore");
                    obj.remove("hostPath");
                }
                self.backend
                    .enrich_volume_info(volume, &new_disk.drive_name, &pod.id);
            }
            PodRecord::set_config(&self.db, pod.id, &config).await?;
        }
        Ok(())
    }

    /// One GC cycle: physically delete every `ToDelete` drive, removing
    /// rows on success and leaving failures for the next cycle.
    #[instrument(level = "info", skip(self))]
    pub async fn gc(&self) -> Result<()> {
        for disk in DiskRecord::todelete(&self.db).await? {
            match self.backend.delete_physical(&disk.drive_name).await {
                Ok(()) => {
                    DiskRecord::delete_row(&self.db, &disk.id).await?;
                    info!(drive = %disk.drive_name, "persistent disk reclaimed");
                }
                Err(e) => {
                    error!(drive = %disk.drive_name, error = %e,
                        "physical delete failed, will retry next cycle");
                }
            }
        }
        Ok(())
    }

    /// Enrich every persistent-disk volume of a pod config in place,
    /// recycling rows and creating the physical drives for rows that do
    /// not have one yet. Returns the drive names for the take step.
    pub async fn prepare_volumes(
        &self,
        pod_id: Uuid,
        owner_id: i32,
        config: &mut crate::pod::PodConfig,
    ) -> Result<Vec<String>> {
        let mut drive_names = Vec::new();
        let publics = config.volumes_public.clone();
        for (volume, public) in config.volumes.iter_mut().zip(publics.iter()) {
            if let Some(pd) = public.get("persistentDisk") {
                let name = pd
                    .get("pdName")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Validation("persistentDisk without pdName".to_owned()))?;
                let size = pd.get("pdSize").and_then(Value::as_i64).unwrap_or(1);
                let record = self.ensure_for_pod(name, owner_id, size).await?;
                if matches!(record.state(), DiskState::Pending | DiskState::Deleted) {
                    self.backend
                        .create_physical(&record.drive_name, record.size)
                        .await?;
                    DiskRecord::set_state(&self.db, &record.id, DiskState::Created).await?;
                }
                if let Some(obj) = volume.as_object_mut() {
                    obj.remove("persistentDisk");
                }
                self.backend
                    .enrich_volume_info(volume, &record.drive_name, &pod_id);
                drive_names.push(record.drive_name);
            } else if let Some(local) = public.get("localStorage") {
                let path = local
                    .get("path")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| {
                        let name = public.get("name").and_then(Value::as_str).unwrap_or("");
                        format!("{}/{}/{}", self.local_prefix, pod_id, name)
                    });
                if let Some(obj) = volume.as_object_mut() {
                    obj.remove("localStorage");
                }
                volume["hostPath"] = json!({ "path": path });
            }
        }
        Ok(drive_names)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::UnmanagedNodes;

    fn config(kind: StorageKind) -> Config {
        Config {
            storage: kind,
            ceph_monitors: vec!["10.0.0.1:6789".to_owned()],
            ..Config::default()
        }
    }

    #[test]
    fn ceph_enriches_with_rbd_stanza() {
        let backend = CephStorage::new(Arc::new(UnmanagedNodes), &config(StorageKind::Ceph));
        let mut volume = json!({"name": "data"});
        backend.enrich_volume_info(&mut volume, "data__SEPID__3", &Uuid::nil());
        assert_eq!(volume["rbd"]["image"], "data__SEPID__3");
        assert_eq!(volume["rbd"]["pool"], "rbd");
        assert_eq!(volume["rbd"]["monitors"][0], "10.0.0.1:6789");
        assert_eq!(volume["rbd"]["fsType"], "xfs");
    }

    #[test]
    fn aws_enriches_with_ebs_stanza() {
        let backend = AwsStorage::new(Arc::new(UnmanagedNodes));
        let mut volume = json!({"name": "data"});
        backend.enrich_volume_info(&mut volume, "vol-12345", &Uuid::nil());
        assert_eq!(volume["awsElasticBlockStore"]["volumeID"], "aws://vol-12345");
    }

    #[test]
    fn local_enriches_with_host_path() {
        let backend = LocalStorage::new(Arc::new(UnmanagedNodes), &config(StorageKind::Local));
        let mut volume = json!({"name": "data"});
        backend.enrich_volume_info(&mut volume, "data__SEPID__3", &Uuid::nil());
        assert_eq!(
            volume["hostPath"]["path"],
            "/var/lib/kuberdock/storage/data__SEPID__3"
        );
    }

    #[test]
    fn backend_selection_follows_config() {
        let runner: Arc<dyn NodeCommandRunner> = Arc::new(UnmanagedNodes);
        let mut volume = json!({"name": "v"});
        storage_backend(&config(StorageKind::Aws), runner.clone())
            .enrich_volume_info(&mut volume, "vol-1", &Uuid::nil());
        assert!(volume.get("awsElasticBlockStore").is_some());
    }
}
