//! Cluster node rows.
use serde::Serialize;

use crate::store::DbPool;
use crate::{Error, Result};

/// A node registered with the control plane.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct NodeRecord {
    /// Primary key.
    pub id: i32,
    /// Node IP.
    pub ip: String,
    /// Hostname, unique.
    pub hostname: String,
    /// Kube type served by this node.
    pub kube_id: i32,
    /// Deploy state.
    pub state: String,
}

impl NodeRecord {
    /// Fetch by hostname.
    pub async fn by_hostname(pool: &DbPool, hostname: &str) -> Result<NodeRecord> {
        sqlx::query_as("SELECT * FROM nodes WHERE hostname = $1")
            .bind(hostname)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Node does not exist ({})", hostname)))
    }

    /// Fetch by id.
    pub async fn by_id(pool: &DbPool, id: i32) -> Result<NodeRecord> {
        sqlx::query_as("SELECT * FROM nodes WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("node {} does not exist", id)))
    }

    /// All nodes.
    pub async fn all(pool: &DbPool) -> Result<Vec<NodeRecord>> {
        Ok(sqlx::query_as("SELECT * FROM nodes ORDER BY id")
            .fetch_all(pool)
            .await?)
    }
}
