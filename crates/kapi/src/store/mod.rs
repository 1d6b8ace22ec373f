//! The relational storage layer.
//!
//! One module per aggregate, each pairing a `sqlx::FromRow` record with its
//! queries. Multi-row mutations take a [`Tx`] so callers control transaction
//! boundaries; reads take any executor through the pool.

pub mod billing;
pub mod disks;
pub mod images;
pub mod ippool;
pub mod nodes;
pub mod pods;
pub mod timeline;
pub mod users;

use sqlx::postgres::PgPoolOptions;

use crate::config::SystemSettings;
use crate::Result;

/// The shared Postgres pool.
pub type DbPool = sqlx::PgPool;

/// An open transaction.
pub type Tx<'t> = sqlx::Transaction<'t, sqlx::Postgres>;

/// Connect to the database and apply pending migrations.
pub async fn connect(database_url: &str) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| crate::Error::Internal(format!("migration failed: {}", e)))?;
    Ok(pool)
}

/// Read the runtime-editable system settings, falling back to defaults for
/// anything unset.
pub async fn system_settings(pool: &DbPool) -> Result<SystemSettings> {
    let mut settings = SystemSettings::default();
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT name, value FROM system_settings")
            .fetch_all(pool)
            .await?;
    for (name, value) in rows {
        match name.as_str() {
            "max_kubes_per_container" => {
                if let Ok(v) = value.parse() {
                    settings.max_kubes_per_container = v;
                }
            }
            "persistent_disk_max_size" => {
                if let Ok(v) = value.parse() {
                    settings.persistent_disk_max_size = v;
                }
            }
            _ => {}
        }
    }
    Ok(settings)
}
