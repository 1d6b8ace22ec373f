//! The pods watcher: container timelines, status pings, fs limits.

use std::collections::HashMap;

use chrono::{NaiveDateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod as KubePod};
use kube::api::WatchEvent;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pod::build::POD_UID_LABEL;
use crate::reconciler::Reconciler;
use crate::sse::{user_channel, COMMON_CHANNEL, PULL_PODS_STATE};
use crate::store::disks::DiskRecord;
use crate::store::nodes::NodeRecord;
use crate::store::pods::PodRecord;
use crate::store::timeline::{self, ContainerStateRow, RepairOutcome};
use crate::tasks::Job;
use crate::Result;

/// Strip the `docker://` transport prefix from container/image ids.
fn del_docker_prefix(value: &str) -> &str {
    value.rsplit("docker://").next().unwrap_or(value)
}

/// The state vector used to suppress duplicate notifications: the pod
/// phase followed by each container's readiness.
pub fn pod_state_vector(pod: &KubePod) -> String {
    let mut vector: Vec<serde_json::Value> = Vec::new();
    let status = pod.status.as_ref();
    vector.push(json!(status
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()));
    if let Some(statuses) = status.and_then(|s| s.container_statuses.as_ref()) {
        for container in statuses {
            vector.push(json!(container.ready));
        }
    }
    serde_json::to_string(&vector).expect("vector of scalars serializes")
}

/// Timeline rows derivable from one pod event.
///
/// A row is produced per container state carrying a `startedAt`; the end
/// comes from `finishedAt`, or from `now` when the pod object is being
/// deleted without one.
pub fn timeline_rows(
    pod_id: Uuid,
    kubes_by_container: &HashMap<String, i32>,
    statuses: &[ContainerStatus],
    deleted: bool,
    now: NaiveDateTime,
) -> Vec<ContainerStateRow> {
    let mut rows = Vec::new();
    for status in statuses {
        let docker_id = match status.container_id.as_deref() {
            Some(id) => del_docker_prefix(id).to_owned(),
            None => continue,
        };
        let kubes = kubes_by_container.get(&status.name).copied().unwrap_or(1);
        let state = match status.state.as_ref() {
            Some(state) => state,
            None => continue,
        };

        let (start, mut end) = if let Some(running) = &state.running {
            (running.started_at.as_ref().map(|t| t.0.naive_utc()), None)
        } else if let Some(terminated) = &state.terminated {
            (
                terminated.started_at.as_ref().map(|t| t.0.naive_utc()),
                terminated.finished_at.as_ref().map(|t| t.0.naive_utc()),
            )
        } else {
            (None, None)
        };
        let start = match start {
            Some(start) => start,
            None => continue,
        };
        if end.is_none() && deleted {
            end = Some(now);
        }
        rows.push(ContainerStateRow {
            pod_id,
            container_name: status.name.clone(),
            docker_id,
            kubes,
            start_time: start,
            end_time: end,
        });
    }
    rows
}

/// Handle one pods-stream event.
pub async fn process_event(context: &Reconciler, event: WatchEvent<KubePod>) -> Result<()> {
    let (pod, deleted, modified) = match event {
        WatchEvent::Modified(pod) => (pod, false, true),
        WatchEvent::Deleted(pod) => (pod, true, false),
        WatchEvent::Added(pod) => (pod, false, false),
        _ => return Ok(()),
    };

    let pod_id = match pod
        .labels()
        .get(POD_UID_LABEL)
        .and_then(|raw| Uuid::parse_str(raw).ok())
    {
        Some(pod_id) => pod_id,
        None => {
            debug!(pod = %pod.name(), "pod without our uid label, ignored");
            return Ok(());
        }
    };
    let record = match PodRecord::by_id(&context.db, pod_id).await {
        Ok(record) => record,
        Err(_) => {
            warn!(%pod_id, "event for a pod not registered in the database");
            return Ok(());
        }
    };

    send_status_ping(context, &pod, &record, deleted).await?;

    if modified || deleted {
        update_timeline(context, &pod, &record, deleted).await?;
    }

    if modified {
        pin_local_disks(context, &pod, &record).await?;
        apply_fs_limits(context, &pod, pod_id).await;
    }
    Ok(())
}

/// Once a pod with local storage lands on a node, its disks stay there.
async fn pin_local_disks(context: &Reconciler, pod: &KubePod, record: &PodRecord) -> Result<()> {
    if !record.has_local_storage() {
        return Ok(());
    }
    let hostname = match pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) {
        Some(hostname) => hostname,
        None => return Ok(()),
    };
    match NodeRecord::by_hostname(&context.db, hostname).await {
        Ok(node) => DiskRecord::bind_to_node(&context.db, record.id, node.id).await,
        Err(_) => {
            warn!(%hostname, pod = %record.id, "pod landed on a node we do not track");
            Ok(())
        }
    }
}

/// Publish a `pull_pods_state` ping when the state vector changed.
async fn send_status_ping(
    context: &Reconciler,
    pod: &KubePod,
    record: &PodRecord,
    deleted: bool,
) -> Result<()> {
    let key = format!("pod_state_{}", record.id);
    let current = pod_state_vector(pod);
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
            let ping = json!("ping");
            context
                .publisher
                .send_event(COMMON_CHANNEL, PULL_PODS_STATE, &ping)
                .await?;
            context
                .publisher
                .send_event(&user_channel(record.owner_id), PULL_PODS_STATE, &ping)
                .await?;
        }
        Some(_) => {}
    }
    Ok(())
}

/// Project container statuses into the timeline, scheduling the heavy
/// repair when inline mending is not enough.
async fn update_timeline(
    context: &Reconciler,
    pod: &KubePod,
    record: &PodRecord,
    deleted: bool,
) -> Result<()> {
    let statuses = match pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
    {
        Some(statuses) if !statuses.is_empty() => statuses,
        _ => return Ok(()),
    };

    let kubes_by_container: HashMap<String, i32> = record
        .config()
        .map(|config| {
            config
                .containers
                .iter()
                .map(|c| (c.name.clone(), c.kubes))
                .collect()
        })
        .unwrap_or_default();

    let rows = timeline_rows(
        record.id,
        &kubes_by_container,
        statuses,
        deleted,
        Utc::now().naive_utc(),
    );
    if rows.is_empty() {
        return Ok(());
    }

    let mut tx = context.db.begin().await?;
    let mut needs_repair = false;
    for row in &rows {
        if timeline::upsert(&mut tx, row).await? == RepairOutcome::NeedsHeavyRepair {
            needs_repair = true;
        }
    }
    tx.commit().await?;
    if needs_repair {
        context.jobs.submit(Job::FixPodsTimeline);
    }
    Ok(())
}

/// Push per-container filesystem limits to the host the pod landed on.
async fn apply_fs_limits(context: &Reconciler, pod: &KubePod, pod_id: Uuid) {
    let host = match pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) {
        Some(host) => host,
        None => return,
    };
    let containers: HashMap<String, String> = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .filter_map(|s| {
                    s.container_id
                        .as_deref()
                        .map(|id| (s.name.clone(), del_docker_prefix(id).to_owned()))
                })
                .collect()
        })
        .unwrap_or_default();
    if containers.is_empty() {
        return;
    }
    if let Err(e) = context
        .fs_limits
        .set_limit(host, &pod_id.to_string(), &containers)
        .await
    {
        warn!(error = %e, %host, "fs limit application failed");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::NaiveDate;

    fn status(value: serde_json::Value) -> ContainerStatus {
        serde_json::from_value(value).expect("decode container status")
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd(2016, 5, 1).and_hms(12, 0, 0)
    }

    #[test]
    fn docker_prefix_stripping() {
        assert_eq!(del_docker_prefix("docker://abc123"), "abc123");
        assert_eq!(del_docker_prefix("abc123"), "abc123");
    }

    #[test]
    fn state_vector_tracks_phase_and_readiness() {
        let pod: KubePod = serde_json::from_value(json!({
            "metadata": {"name": "p"},
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    {"name": "web", "ready": true, "image": "nginx", "imageID": "x",
                     "restartCount": 0},
                    {"name": "db", "ready": false, "image": "mysql", "imageID": "y",
                     "restartCount": 0}
                ]
            }
        }))
        .expect("decode");
        assert_eq!(pod_state_vector(&pod), r#"["Running",true,false]"#);
    }

    #[test]
    fn running_container_opens_a_row() {
        let statuses = vec![status(json!({
            "name": "web",
            "ready": true,
            "image": "nginx",
            "imageID": "sha:1",
            "restartCount": 0,
            "containerID": "docker://abc",
            "state": {"running": {"startedAt": "2016-05-01T10:00:00Z"}}
        }))];
        let kubes = HashMap::from([("web".to_owned(), 2)]);
        let rows = timeline_rows(Uuid::nil(), &kubes, &statuses, false, now());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].docker_id, "abc");
        assert_eq!(rows[0].kubes, 2);
        assert_eq!(rows[0].end_time, None);
        assert_eq!(
            rows[0].start_time,
            NaiveDate::from_ymd(2016, 5, 1).and_hms(10, 0, 0)
        );
    }

    #[test]
    fn terminated_container_closes_at_finish_time() {
        let statuses = vec![status(json!({
            "name": "web",
            "ready": false,
            "image": "nginx",
            "imageID": "sha:1",
            "restartCount": 1,
            "containerID": "docker://abc",
            "state": {"terminated": {
                "exitCode": 0,
                "startedAt": "2016-05-01T10:00:00Z",
                "finishedAt": "2016-05-01T11:00:00Z"
            }}
        }))];
        let rows = timeline_rows(Uuid::nil(), &HashMap::new(), &statuses, false, now());
        assert_eq!(
            rows[0].end_time,
            Some(NaiveDate::from_ymd(2016, 5, 1).and_hms(11, 0, 0))
        );
        assert_eq!(rows[0].kubes, 1);
    }

    #[test]
    fn deletion_without_finish_closes_at_now() {
        let statuses = vec![status(json!({
            "name": "web",
            "ready": false,
            "image": "nginx",
            "imageID": "sha:1",
            "restartCount": 0,
            "containerID": "docker://abc",
            "state": {"running": {"startedAt": "2016-05-01T10:00:00Z"}}
        }))];
        let rows = timeline_rows(Uuid::nil(), &HashMap::new(), &statuses, true, now());
        assert_eq!(rows[0].end_time, Some(now()));
    }

    #[test]
    fn waiting_containers_and_missing_ids_produce_nothing() {
        let statuses = vec![
            status(json!({
                "name": "web",
                "ready": false,
                "image": "nginx",
                "imageID": "",
                "restartCount": 0,
                "state": {"waiting": {"reason": "PodInitializing"}}
            })),
            status(json!({
                "name": "db",
                "ready": false,
                "image": "mysql",
                "imageID": "",
                "restartCount": 0,
                "containerID": "docker://def",
                "state": {"waiting": {"reason": "ImagePullBackOff"}}
            })),
        ];
        assert!(timeline_rows(Uuid::nil(), &HashMap::new(), &statuses, false, now()).is_empty());
    }
}
