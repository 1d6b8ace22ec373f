//! Server-sent-event fan-out.
//!
//! Change notifications travel through Redis pub/sub channels (`common`
//! for admins, `user_<id>` per owner). Every published event is also
//! recorded in a per-channel Redis hash so a client reconnecting with
//! `Last-Event-Id` replays what it missed. Authentication terminates
//! upstream; this endpoint only speaks the wire format:
//!
//! ```text
//! event:<type>
//! data:<json>
//! id:<n>
//!
//! ```

use std::convert::Infallible;
use std::time::Duration;

use futures::{Stream, StreamExt};
use redis::aio::ConnectionManager;
use tracing::{debug, warn};
use warp::Filter;

use crate::Result;

/// Channel every admin subscribes to.
pub const COMMON_CHANNEL: &str = "common";

/// Hash of recent events per channel, for `Last-Event-Id` replay.
const EVENT_HASH_PREFIX: &str = "SSEEVT";

/// Per-channel id counter.
const EVENT_ID_PREFIX: &str = "SSEEVT_ID";

/// The notification event name pushed when pod state changes.
pub const PULL_PODS_STATE: &str = "pull_pods_state";

/// The notification event name pushed when node state changes.
pub const PULL_NODES_STATE: &str = "pull_nodes_state";

/// The per-user channel name.
pub fn user_channel(user_id: i32) -> String {
    format!("user_{}", user_id)
}

/// Render one SSE message.
fn format_message(eid: Option<i64>, event: &str, data: &str) -> String {
    let mut out = format!("event:{}\n", event);
    for line in data.lines() {
        out.push_str("data:");
        out.push_str(line);
        out.push('\n');
    }
    if data.is_empty() {
        out.push_str("data:\n");
    }
    if let Some(eid) = eid {
        out.push_str(&format!("id:{}\n", eid));
    }
    out.push('\n');
    out
}

/// The keep-alive comment line.
fn keepalive_message() -> &'static str {
    ":\n\n"
}

/// Publisher half: what the reconciler and command handlers call.
#[derive(Clone)]
pub struct EventPublisher {
    conn: ConnectionManager,
}

impl EventPublisher {
    /// Build over a shared Redis connection.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Publish an event on a channel, recording it for replay.
    pub async fn send_event(
        &self,
        channel: &str,
        event: &str,
        data: &serde_json::Value,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let eid: i64 = redis::cmd("INCR")
            .arg(format!("{}:{}", EVENT_ID_PREFIX, channel))
            .query_async(&mut conn)
            .await?;
        let envelope = serde_json::to_string(&serde_json::json!([eid, event, data]))?;
        let _: () = redis::cmd("HSET")
            .arg(format!("{}:{}", EVENT_HASH_PREFIX, channel))
            .arg(eid)
            .arg(&envelope)
            .query_async(&mut conn)
            .await?;
        let _: () = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(&envelope)
            .query_async(&mut conn)
            .await?;
        debug!(%channel, %event, eid, "event published");
        Ok(())
    }
}

/// Decode one stored/published envelope into an SSE message.
fn envelope_to_message(raw: &str) -> Option<String> {
    let decoded: serde_json::Value = serde_json::from_str(raw).ok()?;
    let parts = decoded.as_array()?;
    let eid = parts.first()?.as_i64()?;
    let event = parts.get(1)?.as_str()?.to_owned();
    let data = match parts.get(2)? {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some(format_message(Some(eid), &event, &data))
}

/// Subscriber half: an infinite stream of SSE-formatted chunks for one
/// channel.
///
/// Replays events newer than `last_event_id` from the channel hash, then
/// follows pub/sub, interleaving keep-alive comments whenever the channel
/// stays quiet for the keep-alive interval.
pub fn event_stream(
    redis: redis::Client,
    conn: ConnectionManager,
    channel: String,
    last_event_id: Option<i64>,
    keepalive: Duration,
) -> impl Stream<Item = String> + Send {
    async_stream::stream! {
        // Replay missed events first.
        match last_event_id {
            Some(last_id) => {
                let mut conn = conn.clone();
                let stored: std::collections::HashMap<i64, String> = redis::cmd("HGETALL")
                    .arg(format!("{}:{}", EVENT_HASH_PREFIX, &channel))
                    .query_async(&mut conn)
                    .await
                    .unwrap_or_default();
                let mut replay: Vec<(i64, String)> = stored.into_iter().collect();
                replay.sort_by_key(|(eid, _)| *eid);
                for (eid, raw) in replay {
                    if eid <= last_id {
                        continue;
                    }
                    if let Some(message) = envelope_to_message(&raw) {
                        yield message;
                    }
                }
            }
            None => yield keepalive_message().to_owned(),
        }

        let mut pubsub = match redis.get_async_connection().await {
            Ok(conn) => conn.into_pubsub(),
            Err(e) => {
                warn!(error = %e, "failed to open pub/sub connection");
                return;
            }
        };
        if let Err(e) = pubsub.subscribe(&channel).await {
            warn!(error = %e, %channel, "failed to subscribe");
            return;
        }
        let mut messages = pubsub.on_message();
        loop {
            let next = tokio::time::timeout(keepalive, messages.next()).await;
            match next {
                Ok(Some(message)) => {
                    let raw: String = match message.get_payload() {
                        Ok(raw) => raw,
                        Err(_) => continue,
                    };
                    if let Some(formatted) = envelope_to_message(&raw) {
                        yield formatted;
                    }
                }
                // Subscription dropped; the client will reconnect and replay.
                Ok(None) => return,
                Err(_) => yield keepalive_message().to_owned(),
            }
        }
    }
}

/// The `/stream` route.
///
/// The channel comes from the authenticated principal, resolved upstream
/// and passed in the `x-kuberdock-channel` header (admins get `common`,
/// users their own channel); `Last-Event-Id` resumes a dropped stream.
pub fn routes(
    redis: redis::Client,
    conn: ConnectionManager,
    keepalive: Duration,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::get()
        .and(warp::path("stream"))
        .and(warp::header::optional::<String>("x-kuberdock-channel"))
        .and(warp::header::optional::<i64>("last-event-id"))
        .map(move |channel: Option<String>, last_event_id: Option<i64>| {
            let channel = channel.unwrap_or_else(|| COMMON_CHANNEL.to_owned());
            let stream = event_stream(
                redis.clone(),
                conn.clone(),
                channel,
                last_event_id,
                keepalive,
            )
            .map(|chunk| Ok::<_, Infallible>(hyper::body::Bytes::from(chunk)));
            warp::http::Response::builder()
                .header("content-type", "text/event-stream")
                .header("cache-control", "no-cache")
                .body(hyper::Body::wrap_stream(stream))
        })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn message_format_matches_the_sse_wire_form() {
        let message = format_message(Some(7), "pull_pods_state", "ping");
        assert_eq!(message, "event:pull_pods_state\ndata:ping\nid:7\n\n");
    }

    #[test]
    fn multiline_data_is_split_into_data_lines() {
        let message = format_message(None, "notify", "line1\nline2");
        assert_eq!(message, "event:notify\ndata:line1\ndata:line2\n\n");
    }

    #[test]
    fn envelope_decoding() {
        let message = envelope_to_message(r#"[3, "pull_nodes_state", "ping"]"#).expect("decode");
        assert_eq!(message, "event:pull_nodes_state\ndata:ping\nid:3\n\n");

        // Non-string payloads are re-serialized as JSON.
        let message =
            envelope_to_message(r#"[4, "notify", {"status": "error"}]"#).expect("decode");
        assert!(message.contains("data:{\"status\":\"error\"}"));

        assert!(envelope_to_message("garbage").is_none());
    }

    #[test]
    fn user_channels_are_per_id() {
        assert_eq!(user_channel(42), "user_42");
    }
}
