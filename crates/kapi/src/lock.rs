//! The named exclusive lock, backed by Redis.
//!
//! Commands acquire one lock per pod for their whole duration, so two
//! `start`s on the same pod cannot interleave. A lock may carry a JSON
//! payload describing the operation in flight, and its handle serializes,
//! so a queued job can release a lock acquired by the request handler.
//!
//! Redis loss loses locks but never corrupts authoritative state — the
//! database still guards shared rows with its own row locks.

use std::time::Duration;

use rand::Rng;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{Error, Result};

/// Prefix for all lock keys.
const LOCK_PREFIX: &str = "kd.exclusivelock.";

/// Prefix for lock payload keys.
const PAYLOAD_PREFIX: &str = "kd.exclusivelock-payload.";

/// How often a blocking acquire polls.
const BLOCKING_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Compare-and-delete: release only if we still hold the lock.
const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    redis.call('del', KEYS[2])
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// Set a value preserving any existing TTL; apply the new TTL only when the
/// key has none.
const SET_KEEP_TTL_SCRIPT: &str = r#"
local ttl = redis.call('ttl', KEYS[1])
if ttl <= 0 then
    ttl = tonumber(ARGV[2])
end
if ttl > 0 then
    return redis.call('setex', KEYS[1], ttl, ARGV[1])
else
    return redis.call('set', KEYS[1], ARGV[1])
end
"#;

/// A serializable handle to an acquired lock.
///
/// Ship it to an asynchronous worker and call [`ExclusiveLock::release`]
/// there when the operation completes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockHandle {
    /// Lock name, without prefix.
    pub name: String,
    /// Random token proving ownership.
    pub token: String,
    /// TTL the lock was acquired with, seconds.
    pub ttl: Option<u64>,
}

/// The lock service.
#[derive(Clone)]
pub struct ExclusiveLock {
    redis: ConnectionManager,
}

impl ExclusiveLock {
    /// Build over a shared Redis connection.
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    fn lock_key(name: &str) -> String {
        format!("{}{}", LOCK_PREFIX, name)
    }

    fn payload_key(name: &str) -> String {
        format!("{}{}", PAYLOAD_PREFIX, name)
    }

    /// Try to acquire the lock once. Returns `None` when someone else
    /// holds it.
    pub async fn acquire(
        &self,
        name: &str,
        ttl: Option<Duration>,
        payload: Option<serde_json::Value>,
    ) -> Result<Option<LockHandle>> {
        let token: String = {
            let mut rng = rand::thread_rng();
            (0..20).map(|_| rng.gen_range('a'..='z')).collect()
        };
        let mut conn = self.redis.clone();
        let key = Self::lock_key(name);

        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(&token).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let acquired: Option<String> = cmd.query_async(&mut conn).await?;
        if acquired.is_none() {
            return Ok(None);
        }

        let handle = LockHandle {
            name: name.to_owned(),
            token,
            ttl: ttl.map(|t| t.as_secs()),
        };
        if let Some(payload) = payload {
            self.save_payload(&handle, &payload).await?;
        }
        Ok(Some(handle))
    }

    /// Acquire, waiting for the current holder when necessary.
    pub async fn acquire_blocking(
        &self,
        name: &str,
        ttl: Option<Duration>,
        payload: Option<serde_json::Value>,
    ) -> Result<LockHandle> {
        loop {
            if let Some(handle) = self.acquire(name, ttl, payload.clone()).await? {
                return Ok(handle);
            }
            tokio::time::sleep(BLOCKING_POLL_INTERVAL).await;
        }
    }

    /// Release a lock through its handle.
    ///
    /// A TTL expiry while the holder still runs is a programming error (the
    /// operation outlived its own deadline) and is logged loudly.
    pub async fn release(&self, handle: &LockHandle) -> Result<()> {
        let mut conn = self.redis.clone();
        let released: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::lock_key(&handle.name))
            .key(Self::payload_key(&handle.name))
            .arg(&handle.token)
            .invoke_async(&mut conn)
            .await?;
        if released == 0 {
            error!(
                lock = %handle.name,
                "lock TTL expired while the operation was still running; \
                 another command may have interleaved"
            );
        }
        Ok(())
    }

    /// Whether the named lock is currently held.
    pub async fn is_acquired(&self, name: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(Self::lock_key(name))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    /// Attach or refresh the payload without touching a live TTL.
    pub async fn update_payload(
        &self,
        handle: &LockHandle,
        updates: serde_json::Value,
    ) -> Result<()> {
        let mut payload = self.payload(&handle.name).await?.unwrap_or_else(
            || serde_json::json!({}),
        );
        if let (Some(target), Some(source)) = (payload.as_object_mut(), updates.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        self.save_payload(handle, &payload).await
    }

    /// Read the payload attached to a lock.
    pub async fn payload(&self, name: &str) -> Result<Option<serde_json::Value>> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::payload_key(name))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(|e| {
                Error::Internal(format!("corrupt lock payload for {}: {}", name, e))
            })?)),
            None => Ok(None),
        }
    }

    async fn save_payload(&self, handle: &LockHandle, payload: &serde_json::Value) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: () = redis::Script::new(SET_KEEP_TTL_SCRIPT)
            .key(Self::payload_key(&handle.name))
            .arg(serde_json::to_string(payload)?)
            .arg(handle.ttl.unwrap_or(0))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Remove every lock matching a name prefix. Used by recovery tooling,
    /// never in the normal path.
    pub async fn clean_locks(&self, prefix: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        for pattern in [
            format!("{}{}*", LOCK_PREFIX, prefix),
            format!("{}{}*", PAYLOAD_PREFIX, prefix),
        ] {
            let keys: Vec<String> = redis::cmd("KEYS").arg(pattern).query_async(&mut conn).await?;
            if !keys.is_empty() {
                let _: () = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
            }
        }
        Ok(())
    }
}

/// The lock name guarding all commands of one pod.
pub fn pod_lock_name(pod_id: &uuid::Uuid) -> String {
    format!("pod.{}", pod_id)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_prefixes() {
        assert_eq!(
            ExclusiveLock::lock_key("pod.x"),
            "kd.exclusivelock.pod.x"
        );
        assert_eq!(
            ExclusiveLock::payload_key("pod.x"),
            "kd.exclusivelock-payload.pod.x"
        );
    }

    #[test]
    fn handle_round_trips_through_json() {
        let handle = LockHandle {
            name: "pod.6a811845".to_owned(),
            token: "abcdefghijklmnopqrst".to_owned(),
            ttl: Some(120),
        };
        let raw = serde_json::to_string(&handle).expect("encode");
        let back: LockHandle = serde_json::from_str(&raw).expect("decode");
        assert_eq!(back.name, handle.name);
        assert_eq!(back.token, handle.token);
        assert_eq!(back.ttl, handle.ttl);
    }

    #[test]
    fn pod_lock_names_are_scoped() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            pod_lock_name(&id),
            "pod.00000000-0000-0000-0000-000000000000"
        );
    }
}
