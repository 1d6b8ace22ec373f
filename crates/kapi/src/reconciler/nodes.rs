//! The nodes watcher: condition-change notifications for admins.

use k8s_openapi::api::core::v1::Node;
use kube::api::WatchEvent;
use kube::ResourceExt;
use serde_json::json;

use crate::reconciler::Reconciler;
use crate::sse::{COMMON_CHANNEL, PULL_NODES_STATE};
use crate::Result;

/// The node's condition vector: each condition's type and status, in
/// order. Any change is worth a ping.
pub(crate) fn node_state_vector(node: &Node) -> String {
    let mut vector: Vec<String> = Vec::new();
    if let Some(conditions) = node.status.as_ref().and_then(|s| s.conditions.as_ref()) {
        for condition in conditions {
            vector.push(condition.type_.clone());
            vector.push(condition.status.clone());
        }
    }
    if vector.is_empty() {
        vector.push(String::new());
    }
    serde_json::to_string(&vector).expect("vector of strings serializes")
}

/// Handle one nodes-stream event.
pub async fn process_event(context: &Reconciler, event: WatchEvent<Node>) -> Result<()> {
    let (node, deleted) = match event {
        WatchEvent::Added(node) | WatchEvent::Modified(node) => (node, false),
        WatchEvent::Deleted(node) => (node, true),
        _ => return Ok(()),
    };

    let key = format!("node_state_{}", node.name());
    let current = node_state_vector(&node);
    let mut redis = context.redis.clone();
    let previous: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut redis).await?;

    match previous {
        None => {
            let _: () = redis::cmd("SET")
                .arg(&key)
                .arg(&current)
                .query_async(&mut redis)
                .await?;
        }
        Some(previous) if previous != current || deleted => {
            let stored = if deleted { "DELETED" } else { current.as_str() };
            let _: () = redis::cmd("SET")
                .arg(&key)
                .arg(stored)
                .query_async(&mut redis)
                .await?;
            context
                .publisher
                .send_event(COMMON_CHANNEL, PULL_NODES_STATE, &json!("ping"))
                .await?;
        }
        Some(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn condition_vector_lists_types_and_statuses() {
        let node: Node = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "node1"},
            "status": {"conditions": [
                {"type": "Ready", "status": "True"},
                {"type": "OutOfDisk", "status": "False"}
            ]}
        }))
        .expect("decode");
        assert_eq!(
            node_state_vector(&node),
            r#"["Ready","True","OutOfDisk","False"]"#
        );
    }

    #[test]
    fn missing_conditions_yield_a_placeholder() {
        let node: Node = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "node1"}
        }))
        .expect("decode");
        assert_eq!(node_state_vector(&node), r#"[""]"#);
    }
}
