//! Pod rows.
//!
//! A pod's database status only covers the states Kubernetes cannot speak
//! for (stopped, deleted, unpaid, preparing, …). While a pod exists in
//! Kubernetes its live phase wins; the reconciler keeps this mirror fresh.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pod::PodConfig;
use crate::store::{DbPool, Tx};
use crate::{Error, Result};

/// Pod lifecycle states as stored and as projected from Kubernetes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodStatus {
    /// Accepted, waiting for Kubernetes to schedule.
    Pending,
    /// Resources are being prepared (disks, IPs).
    Preparing,
    /// At least one container is running.
    Running,
    /// A stop command is in flight.
    Stopping,
    /// Not present in Kubernetes; the row is authoritative.
    Stopped,
    /// A delete command is in flight.
    Deleting,
    /// Tombstone.
    Deleted,
    /// All containers exited nonzero.
    Failed,
    /// All containers exited zero.
    Succeeded,
    /// Suspended for non-payment.
    Unpaid,
}

impl PodStatus {
    /// The lowercase wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            PodStatus::Pending => "pending",
            PodStatus::Preparing => "preparing",
            PodStatus::Running => "running",
            PodStatus::Stopping => "stopping",
            PodStatus::Stopped => "stopped",
            PodStatus::Deleting => "deleting",
            PodStatus::Deleted => "deleted",
            PodStatus::Failed => "failed",
            PodStatus::Succeeded => "succeeded",
            PodStatus::Unpaid => "unpaid",
        }
    }

    /// Parse the wire form, tolerating unknown values as `Stopped`.
    pub fn parse(value: &str) -> PodStatus {
        match value {
            "pending" => PodStatus::Pending,
            "preparing" => PodStatus::Preparing,
            "running" => PodStatus::Running,
            "stopping" => PodStatus::Stopping,
            "deleting" => PodStatus::Deleting,
            "deleted" => PodStatus::Deleted,
            "failed" => PodStatus::Failed,
            "succeeded" => PodStatus::Succeeded,
            "unpaid" => PodStatus::Unpaid,
            _ => PodStatus::Stopped,
        }
    }
}

/// A pod row.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct PodRecord {
    /// Opaque pod id, also the pod's Kubernetes namespace.
    pub id: Uuid,
    /// Human name, unique per owner among live pods.
    pub name: String,
    /// Owning user.
    pub owner_id: i32,
    /// Kube (compute shape) type.
    pub kube_id: i32,
    /// Predefined-application template, if the pod came from one.
    pub template_id: Option<i32>,
    /// Template version.
    pub template_version_id: Option<i32>,
    /// Template plan name.
    pub template_plan_name: Option<String>,
    /// Canonical configuration blob.
    pub config: serde_json::Value,
    /// Direct-access (SSH) credentials blob.
    pub direct_access: Option<String>,
    /// Database status; see the module docs for when it is authoritative.
    pub status: String,
    /// Suspended-for-non-payment flag.
    pub unpaid: bool,
}

impl PodRecord {
    /// Decode the configuration blob.
    pub fn config(&self) -> Result<PodConfig> {
        serde_json::from_value(self.config.clone())
            .map_err(|e| Error::Internal(format!("corrupt config for pod {}: {}", self.id, e)))
    }

    /// The stored status as an enum.
    pub fn status(&self) -> PodStatus {
        PodStatus::parse(&self.status)
    }

    /// Total kubes over all containers.
    pub fn kubes(&self) -> i64 {
        self.config()
            .map(|c| c.containers.iter().map(|c| c.kubes as i64).sum())
            .unwrap_or(0)
    }

    /// The pod's Kubernetes namespace: its own id.
    pub fn namespace(&self) -> String {
        self.id.to_string()
    }

    /// Whether any volume is node-local storage.
    pub fn has_local_storage(&self) -> bool {
        self.config()
            .map(|c| {
                c.volumes.iter().any(|v| {
                    v.get("hostPath").is_some()
                        || v.get("annotation")
                            .and_then(|a| a.get("localStorage"))
                            .is_some()
                })
            })
            .unwrap_or(false)
    }

    /// The node this pod is pinned to, if local storage or a fixed public
    /// IP forces placement.
    pub fn pinned_node(&self, fixed_ip_pools: bool, has_ip: bool) -> Option<String> {
        let node = self.config().ok().and_then(|c| c.node);
        if self.has_local_storage() || (fixed_ip_pools && has_ip) {
            node
        } else {
            None
        }
    }

    /// Fetch by id, tombstones included.
    pub async fn by_id(pool: &DbPool, id: Uuid) -> Result<PodRecord> {
        sqlx::query_as("SELECT * FROM pods WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("pod {} does not exist", id)))
    }

    /// All live (non-deleted) pods of one owner.
    pub async fn live_by_owner(pool: &DbPool, owner_id: i32) -> Result<Vec<PodRecord>> {
        Ok(
            sqlx::query_as("SELECT * FROM pods WHERE owner_id = $1 AND status != 'deleted'")
                .bind(owner_id)
                .fetch_all(pool)
                .await?,
        )
    }

    /// All live pods.
    pub async fn live(pool: &DbPool) -> Result<Vec<PodRecord>> {
        Ok(sqlx::query_as("SELECT * FROM pods WHERE status != 'deleted'")
            .fetch_all(pool)
            .await?)
    }

    /// Refuse a duplicate (name, owner) pair among live pods.
    pub async fn check_name(pool: &DbPool, name: &str, owner_id: i32) -> Result<()> {
        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM pods WHERE name = $1 AND owner_id = $2 AND status != 'deleted'",
        )
        .bind(name)
        .bind(owner_id)
        .fetch_optional(pool)
        .await?;
        match existing {
            Some(_) => Err(Error::Conflict(format!(
                "Conflict. Pod with name = '{}' already exists. Try another name.",
                name
            ))),
            None => Ok(()),
        }
    }

    /// Insert a new pod row.
    pub async fn insert(pool: &DbPool, record: &PodRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO pods (id, name, owner_id, kube_id, template_id, template_version_id, \
             template_plan_name, config, direct_access, status, unpaid) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(record.owner_id)
        .bind(record.kube_id)
        .bind(record.template_id)
        .bind(record.template_version_id)
        .bind(&record.template_plan_name)
        .bind(&record.config)
        .bind(&record.direct_access)
        .bind(&record.status)
        .bind(record.unpaid)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Persist a status change.
    pub async fn set_status(pool: &DbPool, id: Uuid, status: PodStatus) -> Result<()> {
        sqlx::query("UPDATE pods SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Replace the configuration blob.
    pub async fn set_config(pool: &DbPool, id: Uuid, config: &PodConfig) -> Result<()> {
        sqlx::query("UPDATE pods SET config = $1 WHERE id = $2")
            .bind(serde_json::to_value(config)?)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Rename a pod (metadata `set` command).
    pub async fn set_name(pool: &DbPool, id: Uuid, name: &str) -> Result<()> {
        sqlx::query("UPDATE pods SET name = $1 WHERE id = $2")
            .bind(name)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Store or clear direct-access credentials.
    pub async fn set_direct_access(pool: &DbPool, id: Uuid, value: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE pods SET direct_access = $1 WHERE id = $2")
            .bind(value)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Set the unpaid flag.
    pub async fn set_unpaid(pool: &DbPool, id: Uuid, unpaid: bool) -> Result<()> {
        sqlx::query("UPDATE pods SET unpaid = $1 WHERE id = $2")
            .bind(unpaid)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Tombstone the row: salt the name so the (name, owner) slot frees up
    /// and mark the status deleted. Rows stay while billing references them.
    pub async fn mark_deleted(tx: &mut Tx<'_>, id: Uuid) -> Result<()> {
        let salted = format!("__{}", name_salt());
        sqlx::query("UPDATE pods SET name = name || $1, status = 'deleted' WHERE id = $2")
            .bind(salted)
            .bind(id)
            .execute(tx)
            .await?;
        Ok(())
    }
}

/// Eight random lowercase/digit characters for tombstone names.
fn name_salt() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| *ALPHABET.choose(&mut rng).expect("non-empty alphabet") as char)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_round_trips_through_wire_form() {
        for status in [
            PodStatus::Pending,
            PodStatus::Running,
            PodStatus::Stopped,
            PodStatus::Deleted,
            PodStatus::Unpaid,
        ] {
            assert_eq!(PodStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn unknown_status_becomes_stopped() {
        assert_eq!(PodStatus::parse("weird"), PodStatus::Stopped);
    }

    #[test]
    fn name_salt_shape() {
        let salt = name_salt();
        assert_eq!(salt.len(), 8);
        assert!(salt
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    fn record_with_config(config: serde_json::Value) -> PodRecord {
        PodRecord {
            id: Uuid::new_v4(),
            name: "web".to_owned(),
            owner_id: 3,
            kube_id: 0,
            template_id: None,
            template_version_id: None,
            template_plan_name: None,
            config,
            direct_access: None,
            status: "stopped".to_owned(),
            unpaid: false,
        }
    }

    #[test]
    fn kubes_sums_containers() {
        let record = record_with_config(serde_json::json!({
            "containers": [
                {"name": "a", "image": "nginx", "kubes": 2},
                {"name": "b", "image": "redis"}
            ],
            "restartPolicy": "Always"
        }));
        assert_eq!(record.kubes(), 3);
    }

    #[test]
    fn local_storage_detection() {
        let record = record_with_config(serde_json::json!({
            "containers": [],
            "restartPolicy": "Always",
            "volumes": [
                {"name": "v", "hostPath": {"path": "/var/lib/kuberdock/storage/3/v"}}
            ]
        }));
        assert!(record.has_local_storage());

        let record = record_with_config(serde_json::json!({
            "containers": [],
            "restartPolicy": "Always"
        }));
        assert!(!record.has_local_storage());
    }

    #[test]
    fn pinning_requires_storage_or_fixed_ip() {
        let record = record_with_config(serde_json::json!({
            "containers": [],
            "restartPolicy": "Always",
            "node": "node1.example.com"
        }));
        assert_eq!(record.pinned_node(false, false), None);
        assert_eq!(
            record.pinned_node(true, true),
            Some("node1.example.com".to_owned())
        );
    }
}
