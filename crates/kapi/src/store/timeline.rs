//! The container-state timeline.
//!
//! Billing reads these rows, so the writer guarantees two invariants per
//! (pod, container): intervals never overlap, and at most one row is open
//! (`end_time IS NULL`). Writes are idempotent upserts keyed by
//! (pod, container, docker id, kube count, start time) — the reconciler may
//! deliver the same Kubernetes event any number of times.

use chrono::NaiveDateTime;
use serde::Serialize;
use uuid::Uuid;

use crate::store::{DbPool, Tx};
use crate::Result;

/// One container run.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct ContainerStateRow {
    /// The pod.
    pub pod_id: Uuid,
    /// Container name within the pod.
    pub container_name: String,
    /// Docker container id, `docker://` prefix stripped.
    pub docker_id: String,
    /// Kube count billed for this run.
    pub kubes: i32,
    /// Run start.
    pub start_time: NaiveDateTime,
    /// Run end; `None` while the container is up.
    pub end_time: Option<NaiveDateTime>,
}

/// What the overlap check decided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepairOutcome {
    /// No earlier overlapping row.
    Clean,
    /// One earlier row was closed at the new start.
    ClosedPrevious,
    /// More than one open/overlapping row: the table needs the heavy
    /// background repair pass.
    NeedsHeavyRepair,
}

/// Decide how to mend earlier rows that overlap a new start.
///
/// Exactly one earlier overlapping row is the normal restart case and is
/// closed in place; more than one means the table is corrupt beyond what an
/// event handler should untangle inline.
pub fn overlap_repair(overlapping: &[ContainerStateRow]) -> RepairOutcome {
    match overlapping.len() {
        0 => RepairOutcome::Clean,
        1 => RepairOutcome::ClosedPrevious,
        _ => RepairOutcome::NeedsHeavyRepair,
    }
}

/// Upsert one observed container run and repair the invariant.
pub async fn upsert(
    tx: &mut Tx<'_>,
    row: &ContainerStateRow,
) -> Result<RepairOutcome> {
    sqlx::query(
        "INSERT INTO container_states \
         (pod_id, container_name, docker_id, kubes, start_time, end_time) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (pod_id, container_name, docker_id, start_time) \
         DO UPDATE SET end_time = EXCLUDED.end_time, kubes = EXCLUDED.kubes",
    )
    .bind(row.pod_id)
    .bind(&row.container_name)
    .bind(&row.docker_id)
    .bind(row.kubes)
    .bind(row.start_time)
    .bind(row.end_time)
    .execute(&mut *tx)
    .await?;

    let overlapping: Vec<ContainerStateRow> = sqlx::query_as(
        "SELECT * FROM container_states \
         WHERE pod_id = $1 AND container_name = $2 AND start_time < $3 \
         AND (end_time > $3 OR end_time IS NULL)",
    )
    .bind(row.pod_id)
    .bind(&row.container_name)
    .bind(row.start_time)
    .fetch_all(&mut *tx)
    .await?;

    let outcome = overlap_repair(&overlapping);
    if outcome == RepairOutcome::ClosedPrevious {
        let prev = &overlapping[0];
        sqlx::query(
            "UPDATE container_states SET end_time = $1 \
             WHERE pod_id = $2 AND container_name = $3 AND docker_id = $4 AND start_time = $5",
        )
        .bind(row.start_time)
        .bind(prev.pod_id)
        .bind(&prev.container_name)
        .bind(&prev.docker_id)
        .bind(prev.start_time)
        .execute(&mut *tx)
        .await?;
    }
    Ok(outcome)
}

/// Close every open row of a pod (used when the pod object disappears
/// without per-container finish times).
pub async fn close_open_rows(pool: &DbPool, pod_id: Uuid, end: NaiveDateTime) -> Result<u64> {
    Ok(sqlx::query(
        "UPDATE container_states SET end_time = $1 WHERE pod_id = $2 AND end_time IS NULL",
    )
    .bind(end)
    .bind(pod_id)
    .execute(pool)
    .await?
    .rows_affected())
}

/// The heavy repair pass: for every (pod, container) with several open
/// rows, keep the newest open and close the others at the newest start.
pub async fn heavy_repair(pool: &DbPool) -> Result<u64> {
    Ok(sqlx::query(
        "UPDATE container_states cs SET end_time = newest.start_time \
         FROM (SELECT pod_id, container_name, MAX(start_time) AS start_time \
               FROM container_states WHERE end_time IS NULL \
               GROUP BY pod_id, container_name HAVING COUNT(*) > 1) newest \
         WHERE cs.pod_id = newest.pod_id \
           AND cs.container_name = newest.container_name \
           AND cs.end_time IS NULL \
           AND cs.start_time < newest.start_time",
    )
    .execute(pool)
    .await?
    .rows_affected())
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::NaiveDate;

    fn row(start_minute: u32, end_minute: Option<u32>) -> ContainerStateRow {
        let at = |m| NaiveDate::from_ymd(2016, 5, 1).and_hms(10, m, 0);
        ContainerStateRow {
            pod_id: Uuid::nil(),
            container_name: "web".to_owned(),
            docker_id: "abc123".to_owned(),
            kubes: 1,
            start_time: at(start_minute),
            end_time: end_minute.map(at),
        }
    }

    #[test]
    fn no_overlap_is_clean() {
        assert_eq!(overlap_repair(&[]), RepairOutcome::Clean);
    }

    #[test]
    fn single_overlap_closes_previous() {
        assert_eq!(
            overlap_repair(&[row(0, None)]),
            RepairOutcome::ClosedPrevious
        );
    }

    #[test]
    fn multiple_overlaps_need_heavy_repair() {
        assert_eq!(
            overlap_repair(&[row(0, None), row(1, None)]),
            RepairOutcome::NeedsHeavyRepair
        );
    }
}
