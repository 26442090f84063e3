// crates/lore-server/src/db/pool.rs
// Async connection pool using deadpool-sqlite
//
// All database access goes through a closure API:
// - `interact` for internal helpers returning `anyhow::Result`
// - `run_labeled` for public operations: timeout-bounded, and anything
//   slower than 100 ms is logged with its operation label
// - `run_with_retry` for critical writes that must survive SQLITE_BUSY
//
// Closures run on deadpool's blocking thread pool, so they never stall the
// async runtime. Raw SQL the typed layer cannot express (bm25 ranking,
// vec_distance_cosine scans) also goes through these closures.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use deadpool_sqlite::{Config, Hook, HookError, Pool, Runtime};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;

use crate::error::LoreError;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Connections older than this are discarded instead of recycled.
const CONN_MAX_LIFETIME: Duration = Duration::from_secs(3600);

/// Idle connections unused for this long are discarded instead of recycled.
const CONN_MAX_IDLE_TIME: Duration = Duration::from_secs(600);

/// Operations slower than this are logged with their label.
const SLOW_OP_THRESHOLD: Duration = Duration::from_millis(100);

/// Default deadline for a labeled operation.
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Registers sqlite-vec extension globally (once per process).
/// Must be called before any SQLite connections are opened.
static SQLITE_VEC_INIT: Once = Once::new();

#[allow(clippy::missing_transmute_annotations)]
pub(crate) fn ensure_sqlite_vec_registered() {
    SQLITE_VEC_INIT.call_once(|| {
        // SAFETY: sqlite3_vec_init has the signature expected by
        // sqlite3_auto_extension. The transmute converts the fn-pointer to the
        // Option<extern "C" fn()> that sqlite3_auto_extension accepts; the
        // pointer stays valid for the process lifetime since it is a
        // statically-linked symbol.
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite3_vec_init as *const (),
            )));
        }
        tracing::debug!("sqlite-vec extension registered globally");
    });
}

/// Check if a rusqlite error is SQLITE_BUSY or SQLITE_LOCKED.
///
/// SQLITE_BUSY occurs with file-based databases under write contention.
/// SQLITE_LOCKED occurs with shared-cache in-memory databases when another
/// connection holds a write lock on the same table.
fn is_rusqlite_contention(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

/// Check if a LoreError wraps a SQLite contention error.
fn is_lore_contention(err: &LoreError) -> bool {
    match err {
        LoreError::Db(e) => is_rusqlite_contention(e),
        _ => false,
    }
}

/// Retry delays for SQLite contention backoff.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_millis(2000),
];

/// Database pool wrapper with sqlite-vec support and per-connection setup.
pub struct DatabasePool {
    pool: Pool,
    path: Option<PathBuf>,
    /// URI for in-memory databases (used to share state in tests)
    memory_uri: Option<String>,
    max_size: usize,
    /// Cumulative acquisitions that found no idle connection.
    wait_count: AtomicU64,
    /// Cumulative time spent in those acquisitions, in microseconds.
    wait_duration_micros: AtomicU64,
}

/// Whether to use a file path or shared in-memory URI.
enum DbStorage {
    File(PathBuf),
    InMemory,
}

impl DatabasePool {
    /// Open a pooled database at the given path, running schema steps and
    /// warming half the pool.
    pub async fn open(path: &Path, max_conns: usize, embedding_dim: usize) -> Result<Self> {
        Self::open_internal(DbStorage::File(path.to_path_buf()), max_conns, embedding_dim).await
    }

    /// Open a pooled in-memory database.
    ///
    /// Uses a shared cache URI so all connections access the same in-memory
    /// database. Without shared cache every pooled connection would get its
    /// own separate empty database.
    pub async fn open_in_memory(max_conns: usize, embedding_dim: usize) -> Result<Self> {
        Self::open_internal(DbStorage::InMemory, max_conns, embedding_dim).await
    }

    /// Internal constructor shared by both open variants.
    ///
    /// 1. Registers sqlite-vec globally (if not already done)
    /// 2. Takes a pre-migration backup of existing file databases
    /// 3. Builds the pool with setup + lifetime hooks
    /// 4. Runs schema steps on a pooled connection (failure here fails the open)
    /// 5. Warms max_conns/2 connections with parallel pings
    async fn open_internal(
        storage: DbStorage,
        max_conns: usize,
        embedding_dim: usize,
    ) -> Result<Self> {
        ensure_sqlite_vec_registered();

        let (conn_str, path, memory_uri, setup_hook) = match storage {
            DbStorage::File(p) => {
                ensure_parent_directory(&p)?;
                let s = p.to_string_lossy().into_owned();
                let hook = make_file_post_create_hook(p.clone());
                (s, Some(p), None, hook)
            }
            DbStorage::InMemory => {
                let uri = format!("file:memdb_{}?mode=memory&cache=shared", uuid::Uuid::new_v4());
                let hook = make_memory_post_create_hook();
                (uri.clone(), None, Some(uri), hook)
            }
        };

        // Backup before schema steps (file-based DBs only)
        if let Some(ref db_path) = path {
            if let Err(e) = Self::backup_before_migration(db_path) {
                tracing::warn!("Pre-migration backup failed (continuing anyway): {}", e);
            }
        }

        let cfg = Config::new(&conn_str);
        let pool = cfg
            .builder(Runtime::Tokio1)
            .context("Failed to create pool builder")?
            .max_size(max_conns.max(1))
            .post_create(setup_hook)
            .pre_recycle(make_lifetime_hook())
            .build()
            .context("Failed to build connection pool")?;

        let db_pool = Self {
            pool,
            path,
            memory_uri,
            max_size: max_conns.max(1),
            wait_count: AtomicU64::new(0),
            wait_duration_micros: AtomicU64::new(0),
        };

        db_pool.run_migrations(embedding_dim).await?;
        db_pool.warm((max_conns / 2).max(1)).await;

        Ok(db_pool)
    }

    /// Get the memory URI (for sharing state in tests)
    pub fn memory_uri(&self) -> Option<&str> {
        self.memory_uri.as_deref()
    }

    /// Get the database file path (None for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Acquire a connection, tracking wait stats when the pool had no idle
    /// connection at call time.
    async fn get_object(&self) -> Result<deadpool_sqlite::Object> {
        let had_idle = self.pool.status().available > 0;
        let start = Instant::now();
        let obj = self
            .pool
            .get()
            .await
            .context("Failed to get connection from pool")?;
        if !had_idle {
            self.wait_count.fetch_add(1, Ordering::Relaxed);
            self.wait_duration_micros
                .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
        }
        Ok(obj)
    }

    /// Run a closure with a connection from the pool.
    ///
    /// This is the primary internal API. The closure runs on a blocking
    /// thread pool, so it won't block the async runtime.
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.get_object().await?;
        conn.interact(move |conn| f(conn))
            .await
            .map_err(|e| anyhow::anyhow!("interact failed: {e}"))?
    }

    /// Run a closure that may return a rusqlite::Error.
    pub async fn interact_raw<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.interact(move |conn| f(conn).map_err(Into::into)).await
    }

    /// Run a closure on a pooled connection, logging errors but not
    /// propagating. Use for best-effort operations (cleanup kicks, counters).
    pub async fn try_interact<F, R>(&self, label: &str, f: F) -> Option<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let label = label.to_string();
        match self.interact(move |conn| f(conn)).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::debug!("{}: {}", label, e);
                None
            }
        }
    }

    /// Run a labeled operation with the default deadline.
    ///
    /// Every public engine operation comes through here: the whole
    /// acquire-and-execute is bounded by a timeout, and operations slower
    /// than 100 ms are logged with their label.
    pub async fn run_labeled<F, R>(&self, label: &'static str, f: F) -> crate::error::Result<R>
    where
        F: FnOnce(&Connection) -> crate::error::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.run_labeled_timeout(label, DEFAULT_OP_TIMEOUT, f).await
    }

    /// Run a labeled operation with an explicit deadline.
    pub async fn run_labeled_timeout<F, R>(
        &self,
        label: &'static str,
        deadline: Duration,
        f: F,
    ) -> crate::error::Result<R>
    where
        F: FnOnce(&Connection) -> crate::error::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = Instant::now();
        let result = tokio::time::timeout(deadline, async {
            let conn = self
                .get_object()
                .await
                .map_err(|e| LoreError::Other(format!("Failed to get connection: {}", e)))?;
            conn.interact(move |conn| f(conn))
                .await
                .map_err(|e| LoreError::Other(format!("Database error: {}", e)))?
        })
        .await;

        let elapsed = start.elapsed();
        if elapsed > SLOW_OP_THRESHOLD {
            tracing::warn!("[{}] slow operation: {:?}", label, elapsed);
        }

        match result {
            Ok(inner) => inner,
            Err(_) => Err(LoreError::Timeout(label.to_string())),
        }
    }

    /// Like [`run_labeled`](Self::run_labeled) but with retry on SQLite
    /// contention errors.
    ///
    /// Uses backoff (100 ms, 500 ms, 2 s) for up to 3 retries. Use this for
    /// critical writes that must not be lost (observation storage, session
    /// creation). The closure must be `Clone` to support retries. Non-busy
    /// errors fail on the first attempt.
    pub async fn run_with_retry<F, R>(&self, label: &'static str, f: F) -> crate::error::Result<R>
    where
        F: FnOnce(&Connection) -> crate::error::Result<R> + Send + Clone + 'static,
        R: Send + 'static,
    {
        for (attempt, delay) in RETRY_DELAYS.iter().enumerate() {
            let f_clone = f.clone();
            match self.run_labeled(label, f_clone).await {
                Ok(v) => return Ok(v),
                Err(e) if is_lore_contention(&e) => {
                    tracing::warn!(
                        "[{}] SQLite contention on attempt {}/{}, retrying in {:?}",
                        label,
                        attempt + 1,
                        RETRY_DELAYS.len(),
                        delay
                    );
                    tokio::time::sleep(*delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        self.run_labeled(label, f).await
    }

    /// Create a backup of the database before running schema steps.
    /// Uses SQLite's VACUUM INTO for an atomic, consistent backup.
    /// Keeps at most one backup per database (overwrites previous).
    fn backup_before_migration(path: &Path) -> Result<()> {
        let backup_path = path.with_extension("db.pre-migration");

        // Only backup if the source DB file exists (not first run)
        if !path.exists() {
            return Ok(());
        }

        // Open a direct connection for the backup (pool isn't ready yet)
        let conn = rusqlite::Connection::open(path).context("Failed to open DB for backup")?;

        // Remove old backup if it exists (VACUUM INTO fails if target exists)
        let _ = std::fs::remove_file(&backup_path);

        conn.execute("VACUUM INTO ?1", [backup_path.to_string_lossy().as_ref()])
            .context("Failed to create pre-migration backup")?;

        tracing::info!("Created pre-migration backup: {}", backup_path.display());
        Ok(())
    }

    /// Run schema steps. Failure here is fatal: the open fails with it.
    async fn run_migrations(&self, embedding_dim: usize) -> Result<()> {
        self.interact(move |conn| super::schema::run_all_migrations(conn, embedding_dim))
            .await
    }

    /// Warm connections by acquiring, pinging, and releasing in parallel.
    async fn warm(&self, count: usize) {
        let start = Instant::now();
        let acquires = (0..count).map(|_| self.pool.get());
        let objects: Vec<_> = futures::future::join_all(acquires)
            .await
            .into_iter()
            .filter_map(|r| match r {
                Ok(obj) => Some(obj),
                Err(e) => {
                    tracing::debug!("pool warm acquire failed: {}", e);
                    None
                }
            })
            .collect();

        let pings = objects.iter().map(|obj| async {
            let _ = obj
                .interact(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
                .await;
        });
        futures::future::join_all(pings).await;
        tracing::debug!(
            "Warmed {} connections in {:?}",
            objects.len(),
            start.elapsed()
        );
        // Dropping the objects returns them to the pool as idle connections.
    }

    /// Refresh the query planner's statistics.
    pub async fn optimize(&self) -> Result<()> {
        self.interact(|conn| {
            conn.execute_batch("PRAGMA optimize; ANALYZE;")?;
            Ok(())
        })
        .await
    }

    /// Close the pool. Subsequent acquisitions fail.
    pub fn close(&self) {
        self.pool.close();
    }

    /// Get pool status for monitoring.
    pub fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        let in_use = status.size.saturating_sub(status.available);
        PoolStatus {
            max_size: self.max_size,
            open: status.size,
            in_use,
            idle: status.available,
            waiting: status.waiting,
            wait_count: self.wait_count.load(Ordering::Relaxed),
            wait_duration_ms: self.wait_duration_micros.load(Ordering::Relaxed) / 1000,
        }
    }
}

/// Pool status for monitoring.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStatus {
    pub max_size: usize,
    pub open: usize,
    pub in_use: usize,
    pub idle: usize,
    pub waiting: usize,
    pub wait_count: u64,
    pub wait_duration_ms: u64,
}

/// Ensure parent directory exists with secure permissions (0o700 on Unix).
fn ensure_parent_directory(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            let mut perms = std::fs::metadata(parent)?.permissions();
            perms.set_mode(0o700); // rwx------
            std::fs::set_permissions(parent, perms)?;
        }
        #[cfg(not(unix))]
        tracing::debug!(
            "Skipping directory permission restriction on non-Unix platform: {}",
            parent.display()
        );
    }
    Ok(())
}

/// Create a post_create hook for file-based databases.
///
/// Sets up PRAGMAs via `setup_connection` and restricts file permissions to 0o600.
fn make_file_post_create_hook(path: PathBuf) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        let path_for_perms = path.clone();
        Box::pin(async move {
            conn.interact(move |conn| {
                setup_connection(conn)?;

                #[cfg(unix)]
                if let Ok(metadata) = std::fs::metadata(&path_for_perms) {
                    let mut perms = metadata.permissions();
                    perms.set_mode(0o600); // rw-------
                    if let Err(e) = std::fs::set_permissions(&path_for_perms, perms) {
                        tracing::warn!("Failed to set database file permissions to 0600: {}", e);
                    }
                }
                #[cfg(not(unix))]
                tracing::debug!(
                    "Skipping DB file permission restriction on non-Unix platform: {}",
                    path_for_perms.display()
                );

                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| HookError::Message(format!("interact failed: {e}").into()))?
            .map_err(|e| HookError::Message(format!("connection setup failed: {e}").into()))
        })
    })
}

/// Create a post_create hook for in-memory databases.
///
/// Enables foreign keys and busy_timeout (WAL mode is not applicable to
/// in-memory DBs).
fn make_memory_post_create_hook() -> Hook {
    Hook::async_fn(|conn, _metrics| {
        Box::pin(async move {
            conn.interact(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys=ON; \
                     PRAGMA busy_timeout=5000;",
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| HookError::Message(format!("interact failed: {e}").into()))?
            .map_err(|e| HookError::Message(format!("connection setup failed: {e}").into()))
        })
    })
}

/// Create a pre_recycle hook enforcing connection lifetime and idle-time
/// caps. A failed hook discards the connection; deadpool opens a fresh one
/// on demand.
fn make_lifetime_hook() -> Hook {
    Hook::sync_fn(|_conn, metrics| {
        if metrics.age() > CONN_MAX_LIFETIME {
            return Err(HookError::Message("connection exceeded max lifetime".into()));
        }
        if metrics.last_used() > CONN_MAX_IDLE_TIME {
            return Err(HookError::Message("connection exceeded max idle time".into()));
        }
        Ok(())
    })
}

/// Configure a connection after it's created.
/// Called from the post_create hook.
fn setup_connection(conn: &Connection) -> rusqlite::Result<()> {
    // WAL for concurrent readers, foreign key enforcement, busy timeout for
    // write contention (5 s retry window), NORMAL synchronous (safe with WAL).
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; \
         PRAGMA foreign_keys=ON; \
         PRAGMA busy_timeout=5000; \
         PRAGMA synchronous=NORMAL; \
         PRAGMA journal_size_limit=32768;",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_in_memory_shares_state() {
        let pool = DatabasePool::open_in_memory(4, 384)
            .await
            .expect("Failed to open in-memory pool");

        let id = pool
            .interact(|conn| {
                conn.execute(
                    "INSERT INTO sdk_sessions (external_session_id, project, started_at_epoch)
                     VALUES ('s-pool', 'proj', 0)",
                    [],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .expect("Failed to insert");
        assert!(id > 0);

        // Verify from another connection in the pool (tests shared cache)
        let project: String = pool
            .interact(move |conn| {
                conn.query_row(
                    "SELECT project FROM sdk_sessions WHERE id = ?",
                    [id],
                    |row| row.get(0),
                )
                .map_err(Into::into)
            })
            .await
            .expect("Failed to query");
        assert_eq!(project, "proj");
    }

    #[tokio::test]
    async fn pool_status_reports_capacity() {
        let pool = DatabasePool::open_in_memory(6, 384).await.unwrap();
        let status = pool.status();
        assert_eq!(status.max_size, 6);
        assert!(status.open >= 1, "warming should have opened connections");
        assert_eq!(status.in_use, 0);
    }

    #[tokio::test]
    async fn concurrent_writes_succeed() {
        let pool = std::sync::Arc::new(DatabasePool::open_in_memory(8, 384).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.interact(move |conn| {
                    conn.execute(
                        "INSERT INTO sdk_sessions (external_session_id, project, started_at_epoch)
                         VALUES (?, 'proj', 0)",
                        [format!("sess-{i}")],
                    )?;
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().expect("Insert failed");
        }

        let count: i64 = pool
            .interact(|conn| {
                conn.query_row("SELECT COUNT(*) FROM sdk_sessions", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await
            .unwrap();
        assert_eq!(count, 10);
    }

    #[tokio::test]
    async fn run_labeled_propagates_errors() {
        let pool = DatabasePool::open_in_memory(2, 384).await.unwrap();
        let result = pool
            .run_labeled("test_bad_sql", |conn| {
                conn.execute("INSERT INTO nonexistent_table VALUES (1)", [])
                    .map_err(LoreError::from)?;
                Ok(())
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn run_with_retry_fails_fast_on_non_busy_error() {
        let pool = DatabasePool::open_in_memory(2, 384).await.unwrap();
        let result = pool
            .run_with_retry("test_retry", |conn| {
                conn.execute("INSERT INTO nonexistent_table VALUES (1)", [])
                    .map_err(LoreError::from)?;
                Ok(())
            })
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn contention_detection() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy,
                extended_code: 5,
            },
            Some("database is locked".to_string()),
        );
        assert!(is_rusqlite_contention(&busy));
        assert!(is_lore_contention(&LoreError::Db(busy)));

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::ConstraintViolation,
                extended_code: 19,
            },
            Some("UNIQUE constraint failed".to_string()),
        );
        assert!(!is_rusqlite_contention(&constraint));
        assert!(!is_lore_contention(&LoreError::Other(
            "database is locked".to_string()
        )));
    }

    #[test]
    fn backup_before_migration_copies_data() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db_path = dir.path().join("test.db");

        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "CREATE TABLE t (id INTEGER PRIMARY KEY, value TEXT);
                 INSERT INTO t (value) VALUES ('hello');",
            )
            .unwrap();
        }

        DatabasePool::backup_before_migration(&db_path).expect("Backup should succeed");

        let backup_path = db_path.with_extension("db.pre-migration");
        assert!(backup_path.exists());

        let conn = rusqlite::Connection::open(&backup_path).unwrap();
        let value: String = conn
            .query_row("SELECT value FROM t WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(value, "hello");
    }

    #[test]
    fn backup_skips_nonexistent_db() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nonexistent.db");
        DatabasePool::backup_before_migration(&db_path).unwrap();
        assert!(!db_path.with_extension("db.pre-migration").exists());
    }
}
