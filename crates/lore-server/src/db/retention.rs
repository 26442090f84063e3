// crates/lore-server/src/db/retention.rs
// Bounded-retention cleanup: per-project observation cap and the global
// prompt cap, drained by a single background worker.
//
// Writers never block on retention: they offer a job to a bounded channel
// and move on. A full channel drops the job with a log line; the next write
// to the same project re-triggers the cleanup.

use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::log_and_discard;
use super::pool::DatabasePool;

/// Capacity of the cleanup channel.
pub const CLEANUP_QUEUE_CAPACITY: usize = 100;

/// Cadence of the periodic superseded-observation sweep.
const SUPERSEDED_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3600);

/// A unit of background cleanup work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupJob {
    /// Enforce the per-project observation cap.
    ObservationCap { project: String },
    /// Enforce the global prompt cap.
    PromptCap,
}

/// Sender half of the cleanup channel. Cheap to clone.
#[derive(Clone)]
pub struct CleanupQueue {
    tx: mpsc::Sender<CleanupJob>,
}

impl CleanupQueue {
    pub fn new() -> (Self, mpsc::Receiver<CleanupJob>) {
        let (tx, rx) = mpsc::channel(CLEANUP_QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    /// Non-blocking enqueue. A full queue drops the job and logs; a closed
    /// queue (shutdown in progress) is silent.
    pub fn offer(&self, job: CleanupJob) {
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!("[retention] cleanup queue full, dropping {:?}", job);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Callback invoked with (project, deleted observation ids) after a cap
/// cleanup, so external indexes can purge the same rows.
pub type DeletedIdsCallback = Arc<dyn Fn(&str, &[i64]) + Send + Sync>;

/// Delete everything beyond the newest `max` non-archived observations of a
/// project, in one transaction, returning the deleted ids. Dependent
/// conflict/relation/vector rows go in the same transaction; FTS rows go via
/// trigger.
pub fn cleanup_project_sync(
    conn: &Connection,
    project: &str,
    max: usize,
) -> rusqlite::Result<Vec<i64>> {
    let tx = conn.unchecked_transaction()?;

    let victims: Vec<i64> = {
        let mut stmt = tx.prepare(
            "SELECT id FROM observations
             WHERE project = ?1 AND is_archived = 0
             ORDER BY created_at_epoch DESC, id DESC
             LIMIT -1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![project, max as i64], |row| row.get(0))?
            .filter_map(log_and_discard)
            .collect::<Vec<i64>>();
        rows
    };

    if !victims.is_empty() {
        let id_list = victims
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        tx.execute(
            &format!(
                "DELETE FROM observation_conflicts
                 WHERE newer_obs_id IN ({id_list}) OR older_obs_id IN ({id_list})"
            ),
            [],
        )?;
        tx.execute(
            &format!(
                "DELETE FROM observation_relations
                 WHERE source_id IN ({id_list}) OR target_id IN ({id_list})"
            ),
            [],
        )?;
        tx.execute(
            &format!(
                "DELETE FROM vectors
                 WHERE doc_type = 'observation' AND source_row_id IN ({id_list})"
            ),
            [],
        )?;
        tx.execute(
            &format!("DELETE FROM observations WHERE id IN ({id_list})"),
            [],
        )?;
    }

    tx.commit()?;
    Ok(victims)
}

/// Delete all but the newest `cap` prompts. Returns the number deleted.
pub fn cleanup_prompts_sync(conn: &Connection, cap: usize) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM user_prompts WHERE id IN (
             SELECT id FROM user_prompts
             ORDER BY created_at_epoch DESC, id DESC
             LIMIT -1 OFFSET ?1
         )",
        [cap as i64],
    )
}

/// The single background worker draining the cleanup channel. Also runs the
/// periodic superseded-observation sweep on its own timer.
pub struct CleanupWorker {
    pool: Arc<DatabasePool>,
    rx: mpsc::Receiver<CleanupJob>,
    shutdown: watch::Receiver<bool>,
    max_per_project: usize,
    prompt_cap: usize,
    superseded_retention_days: i64,
    on_deleted: Option<DeletedIdsCallback>,
}

impl CleanupWorker {
    pub fn new(
        pool: Arc<DatabasePool>,
        rx: mpsc::Receiver<CleanupJob>,
        shutdown: watch::Receiver<bool>,
        max_per_project: usize,
        prompt_cap: usize,
        superseded_retention_days: i64,
        on_deleted: Option<DeletedIdsCallback>,
    ) -> Self {
        Self {
            pool,
            rx,
            shutdown,
            max_per_project,
            prompt_cap,
            superseded_retention_days,
            on_deleted,
        }
    }

    /// Spawn the worker task. A panic inside the task is contained to the
    /// task; the process stays healthy.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::debug!("[retention] cleanup worker started");
        let mut sweep = tokio::time::interval(SUPERSEDED_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep.tick().await; // the immediate first tick

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *self.shutdown.borrow() {
                        // Drain whatever is already queued before exiting.
                        while let Ok(job) = self.rx.try_recv() {
                            self.handle(job).await;
                        }
                        break;
                    }
                }
                job = self.rx.recv() => match job {
                    Some(job) => self.handle(job).await,
                    None => break,
                },
                _ = sweep.tick() => self.sweep_superseded().await,
            }
        }
        tracing::debug!("[retention] cleanup worker stopped");
    }

    /// Delete superseded observations past the retention window, project by
    /// project.
    async fn sweep_superseded(&self) {
        let projects = self
            .pool
            .try_interact("[retention] superseded project scan", |conn| {
                projects_with_superseded_sync(conn).map_err(Into::into)
            })
            .await
            .unwrap_or_default();

        for project in projects {
            let days = self.superseded_retention_days;
            let project_for_query = project.clone();
            let deleted = self
                .pool
                .try_interact("[retention] superseded sweep", move |conn| {
                    super::conflicts::cleanup_superseded_sync(conn, &project_for_query, days)
                        .map_err(Into::into)
                })
                .await
                .unwrap_or_default();
            if !deleted.is_empty() {
                tracing::info!(
                    "[retention] swept {} superseded observations in {}",
                    deleted.len(),
                    project
                );
                if let Some(ref callback) = self.on_deleted {
                    callback(&project, &deleted);
                }
            }
        }
    }

    async fn handle(&self, job: CleanupJob) {
        match job {
            CleanupJob::ObservationCap { project } => {
                let max = self.max_per_project;
                let project_for_query = project.clone();
                let deleted = self
                    .pool
                    .try_interact("[retention] observation cap cleanup", move |conn| {
                        cleanup_project_sync(conn, &project_for_query, max).map_err(Into::into)
                    })
                    .await
                    .unwrap_or_default();
                if !deleted.is_empty() {
                    tracing::info!(
                        "[retention] deleted {} observations over cap in {}",
                        deleted.len(),
                        project
                    );
                    if let Some(ref callback) = self.on_deleted {
                        callback(&project, &deleted);
                    }
                }
            }
            CleanupJob::PromptCap => {
                let cap = self.prompt_cap;
                let deleted = self
                    .pool
                    .try_interact("[retention] prompt cap cleanup", move |conn| {
                        cleanup_prompts_sync(conn, cap).map_err(Into::into)
                    })
                    .await
                    .unwrap_or(0);
                if deleted > 0 {
                    tracing::info!("[retention] deleted {} prompts over cap", deleted);
                }
            }
        }
    }
}

/// Projects that currently hold superseded observations.
pub fn projects_with_superseded_sync(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT project FROM observations WHERE is_superseded = 1")?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Count non-archived observations in a project (cap invariant probe).
pub fn count_active_observations_sync(conn: &Connection, project: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM observations WHERE project = ?1 AND is_archived = 0",
        [project],
        |row| row.get(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sessions::ensure_session_sync;
    use crate::db::test_support::{seed_observation, setup_test_connection};

    #[test]
    fn cleanup_keeps_newest_and_deletes_rest() {
        let conn = setup_test_connection();
        let session_id = ensure_session_sync(&conn, "s1", "p").unwrap();

        let mut ids = Vec::new();
        for i in 0..8 {
            let id = seed_observation(&conn, session_id, "p", &format!("obs {}", i));
            // Spread creation times so ordering is deterministic
            conn.execute(
                "UPDATE observations SET created_at_epoch = ?1 WHERE id = ?2",
                rusqlite::params![1000 + i as i64, id],
            )
            .unwrap();
            ids.push(id);
        }

        let deleted = cleanup_project_sync(&conn, "p", 5).unwrap();
        assert_eq!(deleted.len(), 3);
        // The three oldest by created_at_epoch are gone
        for id in &ids[..3] {
            assert!(deleted.contains(id));
        }
        assert_eq!(count_active_observations_sync(&conn, "p").unwrap(), 5);

        // Idempotent once under the cap
        assert!(cleanup_project_sync(&conn, "p", 5).unwrap().is_empty());
    }

    #[test]
    fn cleanup_ignores_other_projects_and_archived() {
        let conn = setup_test_connection();
        let session_id = ensure_session_sync(&conn, "s1", "p").unwrap();
        let other_session = ensure_session_sync(&conn, "s2", "q").unwrap();

        for i in 0..4 {
            seed_observation(&conn, session_id, "p", &format!("p obs {}", i));
        }
        let archived = seed_observation(&conn, session_id, "p", "archived");
        crate::db::observations::archive_sync(&conn, archived, "old").unwrap();
        let other = seed_observation(&conn, other_session, "q", "other project");

        let deleted = cleanup_project_sync(&conn, "p", 2).unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(!deleted.contains(&archived));
        assert!(!deleted.contains(&other));
    }

    #[test]
    fn prompt_cleanup_enforces_global_cap() {
        let conn = setup_test_connection();
        for i in 0..12 {
            conn.execute(
                "INSERT INTO user_prompts
                    (session_external_id, prompt_number, prompt_text, created_at_epoch)
                 VALUES ('s', ?1, 'prompt', ?1)",
                [i],
            )
            .unwrap();
        }
        let deleted = cleanup_prompts_sync(&conn, 10).unwrap();
        assert_eq!(deleted, 2);

        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM user_prompts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 10);

        // The oldest two are the ones that went
        let oldest: i64 = conn
            .query_row("SELECT MIN(prompt_number) FROM user_prompts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(oldest, 2);
    }

    #[tokio::test]
    async fn queue_drops_when_full() {
        let (queue, _rx) = CleanupQueue::new();
        // Fill past capacity; offers beyond the cap drop silently
        for i in 0..(CLEANUP_QUEUE_CAPACITY + 20) {
            queue.offer(CleanupJob::ObservationCap {
                project: format!("p{}", i),
            });
        }
        // The writer is never blocked; nothing to assert beyond not hanging.
    }

    #[tokio::test]
    async fn worker_processes_and_drains_on_shutdown() {
        use crate::db::test_support::setup_test_pool;

        let pool = setup_test_pool().await;
        let session_id = pool
            .interact(|conn| ensure_session_sync(conn, "s1", "p").map_err(Into::into))
            .await
            .unwrap();
        pool.interact(move |conn| {
            for i in 0..6 {
                seed_observation(conn, session_id, "p", &format!("obs {}", i));
            }
            Ok(())
        })
        .await
        .unwrap();

        let (queue, rx) = CleanupQueue::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = CleanupWorker::new(pool.clone(), rx, shutdown_rx, 3, 500, 3, None);
        let handle = worker.spawn();

        queue.offer(CleanupJob::ObservationCap {
            project: "p".to_string(),
        });
        // Signal shutdown immediately: the worker must drain the queued job
        // before exiting.
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let count = pool
            .interact(|conn| count_active_observations_sync(conn, "p").map_err(Into::into))
            .await
            .unwrap();
        assert_eq!(count, 3);
    }
}
