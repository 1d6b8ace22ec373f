//! User principals.
use serde::Serialize;

use crate::config::KUBERDOCK_INTERNAL_USER;
use crate::store::DbPool;
use crate::{Error, Result};

/// A control-plane user.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct User {
    /// Primary key.
    pub id: i32,
    /// Unique login.
    pub username: String,
    /// Commercial package this user is signed to.
    pub package_id: i32,
    /// Fix-price users may not start or redeploy pods directly; those
    /// operations go through the billing collaborator.
    pub fix_price: bool,
    /// Admins see internal error detail and other users' pods.
    pub is_admin: bool,
    /// Soft-delete flag.
    pub deleted: bool,
}

impl User {
    /// Whether this is the reserved infrastructure principal.
    pub fn is_internal(&self) -> bool {
        self.username == KUBERDOCK_INTERNAL_USER
    }

    /// Fetch by id.
    pub async fn by_id(pool: &DbPool, id: i32) -> Result<User> {
        sqlx::query_as("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {} does not exist", id)))
    }

    /// Fetch by username.
    pub async fn by_username(pool: &DbPool, username: &str) -> Result<User> {
        sqlx::query_as("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {} does not exist", username)))
    }
}
