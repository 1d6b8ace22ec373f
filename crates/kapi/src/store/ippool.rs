//! IP pool and pod-IP binding rows.
//!
//! A pool row stores only the CIDR, the node binding and the blocked-host
//! set; the arithmetic over hosts and pages is pure code in
//! [`crate::ippool::net`].

use std::collections::BTreeSet;

use serde::Serialize;
use uuid::Uuid;

use crate::store::{DbPool, Tx};
use crate::{Error, Result};

/// An IP pool row, identified by its CIDR.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct PoolRecord {
    /// The CIDR, e.g. `192.168.1.0/24`.
    pub network: String,
    /// IPv6 flag (reserved; allocation is IPv4-only).
    pub ipv6: bool,
    /// JSON array of blocked host integers.
    pub blocked_list: Option<String>,
    /// Node binding for fixed-pool mode.
    pub node_id: Option<i32>,
}

impl PoolRecord {
    /// Decode the blocked set, dropping garbage entries.
    pub fn blocked_set(&self) -> BTreeSet<u32> {
        self.blocked_list
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Vec<u32>>(raw).ok())
            .map(|list| list.into_iter().collect())
            .unwrap_or_default()
    }

    /// Encode a blocked set back into the row form.
    pub fn encode_blocked(set: &BTreeSet<u32>) -> String {
        serde_json::to_string(&set.iter().collect::<Vec<_>>()).expect("set of ints serializes")
    }

    /// All pools, in id (network) order.
    pub async fn all(pool: &DbPool) -> Result<Vec<PoolRecord>> {
        Ok(sqlx::query_as("SELECT * FROM ippool ORDER BY network")
            .fetch_all(pool)
            .await?)
    }

    /// Fetch one pool.
    pub async fn by_network(pool: &DbPool, network: &str) -> Result<Option<PoolRecord>> {
        Ok(sqlx::query_as("SELECT * FROM ippool WHERE network = $1")
            .bind(network)
            .fetch_optional(pool)
            .await?)
    }

    /// Fetch one pool with a row lock, serializing concurrent allocators.
    pub async fn lock(tx: &mut Tx<'_>, network: &str) -> Result<PoolRecord> {
        sqlx::query_as("SELECT * FROM ippool WHERE network = $1 FOR UPDATE")
            .bind(network)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Network '{}' does not exist", network)))
    }

    /// Pools bound to a node (fixed mode).
    pub async fn by_node(pool: &DbPool, node_id: i32) -> Result<Vec<PoolRecord>> {
        Ok(
            sqlx::query_as("SELECT * FROM ippool WHERE node_id = $1 ORDER BY network")
                .bind(node_id)
                .fetch_all(pool)
                .await?,
        )
    }

    /// Insert a pool row.
    pub async fn insert(tx: &mut Tx<'_>, record: &PoolRecord) -> Result<()> {
        sqlx::query("INSERT INTO ippool (network, ipv6, blocked_list, node_id) VALUES ($1, $2, $3, $4)")
            .bind(&record.network)
            .bind(record.ipv6)
            .bind(&record.blocked_list)
            .bind(record.node_id)
            .execute(&mut *tx)
            .await?;
        Ok(())
    }

    /// Replace the blocked set. Callers hold the row lock from
    /// [`Self::lock`], so concurrent editors cannot overwrite each other.
    pub async fn set_blocked(tx: &mut Tx<'_>, network: &str, set: &BTreeSet<u32>) -> Result<()> {
        sqlx::query("UPDATE ippool SET blocked_list = $1 WHERE network = $2")
            .bind(Self::encode_blocked(set))
            .bind(network)
            .execute(&mut *tx)
            .await?;
        Ok(())
    }

    /// Rebind the pool to another node, under the caller's row lock.
    pub async fn set_node(tx: &mut Tx<'_>, network: &str, node_id: Option<i32>) -> Result<()> {
        sqlx::query("UPDATE ippool SET node_id = $1 WHERE network = $2")
            .bind(node_id)
            .bind(network)
            .execute(&mut *tx)
            .await?;
        Ok(())
    }

    /// Drop the pool row.
    pub async fn delete(tx: &mut Tx<'_>, network: &str) -> Result<()> {
        sqlx::query("DELETE FROM ippool WHERE network = $1")
            .bind(network)
            .execute(&mut *tx)
            .await?;
        Ok(())
    }
}

/// A (pod, pool, ip) binding. One row per assigned public IP.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct PodIpRecord {
    /// The pod holding the IP.
    pub pod_id: Uuid,
    /// The pool the IP came from.
    pub network: String,
    /// The IP as a host integer.
    pub ip_address: i64,
}

impl PodIpRecord {
    /// The binding for one pod, if any.
    pub async fn by_pod(pool: &DbPool, pod_id: Uuid) -> Result<Option<PodIpRecord>> {
        Ok(sqlx::query_as("SELECT * FROM podip WHERE pod_id = $1")
            .bind(pod_id)
            .fetch_optional(pool)
            .await?)
    }

    /// The binding holding one IP, if any.
    pub async fn by_ip(pool: &DbPool, ip: u32) -> Result<Option<PodIpRecord>> {
        Ok(sqlx::query_as("SELECT * FROM podip WHERE ip_address = $1")
            .bind(ip as i64)
            .fetch_optional(pool)
            .await?)
    }

    /// All allocations inside one pool.
    pub async fn in_network(pool: &DbPool, network: &str) -> Result<Vec<PodIpRecord>> {
        Ok(sqlx::query_as("SELECT * FROM podip WHERE network = $1")
            .bind(network)
            .fetch_all(pool)
            .await?)
    }

    /// Allocated host integers inside one pool.
    pub async fn allocated_set(pool: &DbPool, network: &str) -> Result<BTreeSet<u32>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT ip_address FROM podip WHERE network = $1")
            .bind(network)
            .fetch_all(pool)
            .await?;
        Ok(rows.into_iter().map(|(ip,)| ip as u32).collect())
    }

    /// Same as [`Self::allocated_set`] but inside an open transaction.
    pub async fn allocated_set_tx(tx: &mut Tx<'_>, network: &str) -> Result<BTreeSet<u32>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT ip_address FROM podip WHERE network = $1")
            .bind(network)
            .fetch_all(&mut *tx)
            .await?;
        Ok(rows.into_iter().map(|(ip,)| ip as u32).collect())
    }

    /// Insert a binding.
    pub async fn insert(tx: &mut Tx<'_>, record: &PodIpRecord) -> Result<()> {
        sqlx::query("INSERT INTO podip (pod_id, network, ip_address) VALUES ($1, $2, $3)")
            .bind(record.pod_id)
            .bind(&record.network)
            .bind(record.ip_address)
            .execute(&mut *tx)
            .await?;
        Ok(())
    }

    /// Release the binding held by a pod.
    pub async fn delete_by_pod(pool: &DbPool, pod_id: Uuid) -> Result<u64> {
        Ok(sqlx::query("DELETE FROM podip WHERE pod_id = $1")
            .bind(pod_id)
            .execute(pool)
            .await?
            .rows_affected())
    }

    /// Release the binding holding an IP.
    pub async fn delete_by_ip(pool: &DbPool, ip: u32) -> Result<u64> {
        Ok(sqlx::query("DELETE FROM podip WHERE ip_address = $1")
            .bind(ip as i64)
            .execute(pool)
            .await?
            .rows_affected())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blocked_set_round_trip() {
        let record = PoolRecord {
            network: "10.0.0.0/24".to_owned(),
            ipv6: false,
            blocked_list: Some("[167772161, 167772162]".to_owned()),
            node_id: None,
        };
        let set = record.blocked_set();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&167772161));
        assert_eq!(PoolRecord::encode_blocked(&set), "[167772161,167772162]");
    }

    #[test]
    fn garbage_blocked_list_is_empty() {
        let record = PoolRecord {
            network: "10.0.0.0/24".to_owned(),
            ipv6: false,
            blocked_list: Some("oops".to_owned()),
            node_id: None,
        };
        assert!(record.blocked_set().is_empty());
    }
}
