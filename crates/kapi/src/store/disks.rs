//! Persistent-disk rows.
//!
//! A disk has two names: the user-visible `name`, unique per owner, and the
//! physical `drive_name`, globally unique. Deletion swaps the pair around:
//! the dying row keeps its physical drive under a randomized user name
//! while a companion row immediately reclaims the user-visible slot under
//! an incremented physical name.

use serde::Serialize;
use uuid::Uuid;

use crate::pstorage::names;
use crate::store::{DbPool, Tx};
use crate::{Error, Result};

/// Disk lifecycle states, stored as integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[repr(i32)]
pub enum DiskState {
    /// Row exists, physical drive does not yet.
    Pending = 0,
    /// Row and physical drive both exist.
    Created = 1,
    /// Physical drive must be deleted by the GC.
    ToDelete = 2,
    /// Physical drive was deleted (or never created); recreating the disk
    /// flips the row back to `Created`.
    Deleted = 3,
}

impl DiskState {
    /// Decode the stored integer, unknown values mapping to `Pending`.
    pub fn from_i32(value: i32) -> DiskState {
        match value {
            1 => DiskState::Created,
            2 => DiskState::ToDelete,
            3 => DiskState::Deleted,
            _ => DiskState::Pending,
        }
    }
}

/// A persistent-disk row.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct DiskRecord {
    /// Opaque primary key.
    pub id: String,
    /// Globally-unique physical drive name.
    pub drive_name: String,
    /// User-visible name, unique per owner.
    pub name: String,
    /// Owning user.
    pub owner_id: i32,
    /// Size in GB.
    pub size: i64,
    /// The pod this disk is attached to, if any. Exclusive.
    pub pod_id: Option<Uuid>,
    /// Lifecycle state, see [`DiskState`].
    pub state: i32,
    /// Node binding for node-local storage.
    pub node_id: Option<i32>,
}

impl DiskRecord {
    /// Build a fresh row in `Pending` state.
    pub fn new(name: &str, owner_id: i32, size: i64) -> DiskRecord {
        DiskRecord {
            id: Uuid::new_v4().to_simple().to_string(),
            drive_name: names::compose_drive_name(name, owner_id),
            name: name.to_owned(),
            owner_id,
            size,
            pod_id: None,
            state: DiskState::Pending as i32,
            node_id: None,
        }
    }

    /// The state as an enum.
    pub fn state(&self) -> DiskState {
        DiskState::from_i32(self.state)
    }

    /// Whether a pod currently holds this disk.
    pub fn in_use(&self) -> bool {
        self.pod_id.is_some()
    }

    /// Fetch by primary key.
    pub async fn by_id(pool: &DbPool, id: &str) -> Result<DiskRecord> {
        sqlx::query_as("SELECT * FROM persistent_disk WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("persistent disk {} does not exist", id)))
    }

    /// Fetch the live (non-tombstoned) row holding a (name, owner) slot.
    pub async fn by_name_owner(
        pool: &DbPool,
        name: &str,
        owner_id: i32,
    ) -> Result<Option<DiskRecord>> {
        Ok(
            sqlx::query_as("SELECT * FROM persistent_disk WHERE name = $1 AND owner_id = $2")
                .bind(name)
                .bind(owner_id)
                .fetch_optional(pool)
                .await?,
        )
    }

    /// All disks of one owner, GC rows excluded.
    pub async fn by_owner(pool: &DbPool, owner_id: i32) -> Result<Vec<DiskRecord>> {
        Ok(sqlx::query_as(
            "SELECT * FROM persistent_disk WHERE owner_id = $1 AND state != $2 ORDER BY name",
        )
        .bind(owner_id)
        .bind(DiskState::ToDelete as i32)
        .fetch_all(pool)
        .await?)
    }

    /// All disks bound to a node.
    pub async fn by_node(pool: &DbPool, node_id: i32) -> Result<Vec<DiskRecord>> {
        Ok(sqlx::query_as("SELECT * FROM persistent_disk WHERE node_id = $1")
            .bind(node_id)
            .fetch_all(pool)
            .await?)
    }

    /// Insert the row.
    pub async fn insert(pool: &DbPool, record: &DiskRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO persistent_disk (id, drive_name, name, owner_id, size, pod_id, state, node_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&record.id)
        .bind(&record.drive_name)
        .bind(&record.name)
        .bind(record.owner_id)
        .bind(record.size)
        .bind(record.pod_id)
        .bind(record.state)
        .bind(record.node_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Update the lifecycle state.
    pub async fn set_state(pool: &DbPool, id: &str, state: DiskState) -> Result<()> {
        sqlx::query("UPDATE persistent_disk SET state = $1 WHERE id = $2")
            .bind(state as i32)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Remove the row entirely (after a successful physical delete, or to
    /// roll back a failed physical create).
    pub async fn delete_row(pool: &DbPool, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM persistent_disk WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Attach this disk to a pod iff it is currently free.
    pub async fn attach(pool: &DbPool, id: &str, pod_id: Uuid) -> Result<()> {
        let updated =
            sqlx::query("UPDATE persistent_disk SET pod_id = $1 WHERE id = $2 AND pod_id IS NULL")
                .bind(pod_id)
                .bind(id)
                .execute(pool)
                .await?
                .rows_affected();
        if updated == 1 {
            return Ok(());
        }
        let holder: Option<(Uuid,)> =
            sqlx::query_as("SELECT pod_id FROM persistent_disk WHERE id = $1 AND pod_id IS NOT NULL")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        match holder {
            Some((pod,)) => Err(Error::PdIsUsed {
                pod: pod.to_string(),
            }),
            None => Err(Error::NotFound(format!(
                "persistent disk {} does not exist",
                id
            ))),
        }
    }

    /// Lock the named drives and bind the free ones to `pod_id`, but only
    /// if none are bound to a different pod. All-or-nothing.
    ///
    /// Returns the drives now taken and the drives held by other pods.
    pub async fn take(
        tx: &mut Tx<'_>,
        pod_id: Uuid,
        drives: &[String],
    ) -> Result<(Vec<DiskRecord>, Vec<DiskRecord>)> {
        let all: Vec<DiskRecord> =
            sqlx::query_as("SELECT * FROM persistent_disk WHERE drive_name = ANY($1) FOR UPDATE")
                .bind(drives)
                .fetch_all(&mut *tx)
                .await?;

        let taken_by_another: Vec<DiskRecord> = all
            .iter()
            .filter(|d| d.pod_id.is_some() && d.pod_id != Some(pod_id))
            .cloned()
            .collect();
        if !taken_by_another.is_empty() {
            return Ok((vec![], taken_by_another));
        }

        let free: Vec<DiskRecord> = all.into_iter().filter(|d| d.pod_id.is_none()).collect();
        for drive in &free {
            sqlx::query("UPDATE persistent_disk SET pod_id = $1 WHERE id = $2")
                .bind(pod_id)
                .bind(&drive.id)
                .execute(&mut *tx)
                .await?;
        }
        Ok((free, vec![]))
    }

    /// Detach every disk held by a pod.
    pub async fn free(pool: &DbPool, pod_id: Uuid) -> Result<u64> {
        Ok(
            sqlx::query("UPDATE persistent_disk SET pod_id = NULL WHERE pod_id = $1")
                .bind(pod_id)
                .execute(pool)
                .await?
                .rows_affected(),
        )
    }

    /// Pin all of a pod's unbound disks to the node it landed on.
    pub async fn bind_to_node(pool: &DbPool, pod_id: Uuid, node_id: i32) -> Result<()> {
        sqlx::query(
            "UPDATE persistent_disk SET node_id = $1 WHERE pod_id = $2 AND node_id IS NULL",
        )
        .bind(node_id)
        .bind(pod_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Mark an unattached disk for deletion and plant a companion row so the
    /// (name, owner) slot is immediately reusable.
    ///
    /// The dying row keeps its physical drive name (the GC still has to
    /// remove the actual drive) but its user name becomes a random token.
    /// Returns the companion, or `None` when the disk is attached or
    /// already dying.
    pub async fn mark_todelete(pool: &DbPool, id: &str) -> Result<Option<DiskRecord>> {
        let mut tx = pool.begin().await?;
        let pd: Option<DiskRecord> = sqlx::query_as(
            "SELECT * FROM persistent_disk WHERE id = $1 AND pod_id IS NULL FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut tx)
        .await?;
        let pd = match pd {
            Some(pd) if pd.state() != DiskState::ToDelete => pd,
            _ => return Ok(None),
        };

        let base = names::compose_drive_name(&pd.name, pd.owner_id);
        let like_pattern = format!("{}\\_%", base.replace('_', "\\_").replace('%', "\\%"));
        let existing: Vec<(String,)> = sqlx::query_as(
            "SELECT drive_name FROM persistent_disk WHERE drive_name LIKE $1 \
             AND name = $2 AND owner_id = $3 AND state != $4",
        )
        .bind(&like_pattern)
        .bind(&pd.name)
        .bind(pd.owner_id)
        .bind(DiskState::Deleted as i32)
        .fetch_all(&mut tx)
        .await?;
        let new_drive_name =
            names::next_drive_name(&base, existing.iter().map(|(n,)| n.as_str()));

        // Hide the dying row from name lookups.
        sqlx::query("UPDATE persistent_disk SET name = $1, state = $2 WHERE id = $3")
            .bind(Uuid::new_v4().to_simple().to_string())
            .bind(DiskState::ToDelete as i32)
            .bind(&pd.id)
            .execute(&mut tx)
            .await?;

        let companion = DiskRecord {
            id: Uuid::new_v4().to_simple().to_string(),
            drive_name: new_drive_name,
            name: pd.name.clone(),
            owner_id: pd.owner_id,
            size: pd.size,
            pod_id: None,
            state: DiskState::Deleted as i32,
            node_id: None,
        };
        sqlx::query(
            "INSERT INTO persistent_disk (id, drive_name, name, owner_id, size, pod_id, state, node_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&companion.id)
        .bind(&companion.drive_name)
        .bind(&companion.name)
        .bind(companion.owner_id)
        .bind(companion.size)
        .bind(companion.pod_id)
        .bind(companion.state)
        .bind(companion.node_id)
        .execute(&mut tx)
        .await?;
        tx.commit().await?;
        Ok(Some(companion))
    }

    /// All rows awaiting physical deletion.
    pub async fn todelete(pool: &DbPool) -> Result<Vec<DiskRecord>> {
        Ok(sqlx::query_as("SELECT * FROM persistent_disk WHERE state = $1")
            .bind(DiskState::ToDelete as i32)
            .fetch_all(pool)
            .await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_decoding() {
        assert_eq!(DiskState::from_i32(0), DiskState::Pending);
        assert_eq!(DiskState::from_i32(1), DiskState::Created);
        assert_eq!(DiskState::from_i32(2), DiskState::ToDelete);
        assert_eq!(DiskState::from_i32(3), DiskState::Deleted);
        assert_eq!(DiskState::from_i32(42), DiskState::Pending);
    }

    #[test]
    fn new_record_composes_drive_name() {
        let record = DiskRecord::new("data", 7, 2);
        assert_eq!(record.drive_name, "data__SEPID__7");
        assert_eq!(record.state(), DiskState::Pending);
        assert_eq!(record.id.len(), 32);
        assert!(!record.in_use());
    }
}
