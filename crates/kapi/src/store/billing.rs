//! The billing shape catalog: kubes, packages and their prices.
use serde::Serialize;

use crate::store::DbPool;
use crate::{Error, Result};

/// The default kube type, always present.
pub const DEFAULT_KUBE_TYPE: i32 = 0;

/// Special kube type for internal-service pods; excluded from billing and
/// public listings, and its pods may run on any node.
pub const INTERNAL_SERVICE_KUBE_TYPE: i32 = -1;

/// A unit of compute billed as a single item.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct Kube {
    /// Kube type id. `-1` is reserved for internal services.
    pub id: i32,
    /// Display name.
    pub name: Option<String>,
    /// CPU cores per kube.
    pub cpu: f64,
    /// CPU unit label.
    pub cpu_units: String,
    /// Memory per kube.
    pub memory: i32,
    /// Memory unit label.
    pub memory_units: String,
    /// Disk per kube.
    pub disk_space: i32,
    /// Disk unit label.
    pub disk_space_units: String,
    /// Included traffic per kube.
    pub included_traffic: i32,
}

impl Kube {
    /// Whether a kube type participates in public listings.
    pub fn is_public(&self) -> bool {
        self.id != INTERNAL_SERVICE_KUBE_TYPE
    }

    /// Internal-service pods may run anywhere; all other kube types bind
    /// pods to nodes labeled with the type.
    pub fn is_node_attachable(kube_type: i32) -> bool {
        kube_type != INTERNAL_SERVICE_KUBE_TYPE
    }

    /// Fetch a kube type by id.
    pub async fn by_id(pool: &DbPool, id: i32) -> Result<Kube> {
        sqlx::query_as("SELECT * FROM kubes WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("kube type {} does not exist", id)))
    }

    /// All kube types visible to users.
    pub async fn public_kubes(pool: &DbPool) -> Result<Vec<Kube>> {
        Ok(sqlx::query_as("SELECT * FROM kubes WHERE id != $1 ORDER BY id")
            .bind(INTERNAL_SERVICE_KUBE_TYPE)
            .fetch_all(pool)
            .await?)
    }

    /// Resource limits for `kubes` kubes of this type, as Kubernetes
    /// quantity strings.
    pub fn to_limits(&self, kubes: i32) -> ResourceLimits {
        let kubes = kubes.max(1);
        ResourceLimits {
            // Sub-core CPU shares are expressed in millicores.
            cpu: format!("{}m", (self.cpu * 1000.0) as i64 * kubes as i64),
            memory: format!("{}Mi", self.memory as i64 * kubes as i64),
        }
    }
}

/// Kubernetes resource quantities derived from a kube count.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResourceLimits {
    /// CPU quantity, e.g. `250m`.
    pub cpu: String,
    /// Memory quantity, e.g. `128Mi`.
    pub memory: String,
}

/// A commercial bundle of kube types with per-package prices.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct Package {
    /// Primary key.
    pub id: i32,
    /// Display name.
    pub name: Option<String>,
    /// Billing currency.
    pub currency: String,
    /// Billing period.
    pub period: String,
    /// Price per public IP.
    pub price_ip: f64,
    /// Price per persistent-storage GB.
    pub price_pstorage: f64,
    /// Price per traffic unit over the included amount.
    pub price_over_traffic: f64,
    /// Ceiling on total kubes per pod, when the package caps it.
    pub kubes_limit: Option<i32>,
}

impl Package {
    /// Fetch a package by id.
    pub async fn by_id(pool: &DbPool, id: i32) -> Result<Package> {
        sqlx::query_as(
            "SELECT id, name, currency, period, price_ip, price_pstorage, price_over_traffic, \
             kubes_limit FROM packages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("package {} does not exist", id)))
    }

    /// Kube type ids this package allows.
    pub async fn allowed_kube_ids(pool: &DbPool, package_id: i32) -> Result<Vec<i32>> {
        let rows: Vec<(i32,)> =
            sqlx::query_as("SELECT kube_id FROM package_kube WHERE package_id = $1 ORDER BY kube_id")
                .bind(package_id)
                .fetch_all(pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn standard_kube() -> Kube {
        Kube {
            id: 0,
            name: Some("Standard".to_owned()),
            cpu: 0.25,
            cpu_units: "Cores".to_owned(),
            memory: 64,
            memory_units: "MB".to_owned(),
            disk_space: 1,
            disk_space_units: "GB".to_owned(),
            included_traffic: 0,
        }
    }

    #[test]
    fn limits_scale_with_kube_count() {
        let kube = standard_kube();
        let limits = kube.to_limits(2);
        assert_eq!(limits.cpu, "500m");
        assert_eq!(limits.memory, "128Mi");
    }

    #[test]
    fn zero_kubes_count_as_one() {
        let limits = standard_kube().to_limits(0);
        assert_eq!(limits.cpu, "250m");
        assert_eq!(limits.memory, "64Mi");
    }

    #[test]
    fn internal_kube_type_is_not_node_attachable() {
        assert!(!Kube::is_node_attachable(INTERNAL_SERVICE_KUBE_TYPE));
        assert!(Kube::is_node_attachable(DEFAULT_KUBE_TYPE));
        assert!(Kube::is_node_attachable(7));
    }
}
