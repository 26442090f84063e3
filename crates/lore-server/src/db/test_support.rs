// crates/lore-server/src/db/test_support.rs
// Shared test helpers and macros for database tests

use std::sync::Arc;

use lore_types::{ObservationDraft, ObservationType};
use rusqlite::Connection;

use super::pool::DatabasePool;

/// Run a sync database operation in the test pool, unwrapping the result.
///
/// Wraps `pool.interact(move |conn| body).await.unwrap()` into a single
/// expression. The body must return `anyhow::Result<T>` (use
/// `.map_err(Into::into)` for rusqlite errors).
#[allow(unused_macros)]
macro_rules! db {
    ($pool:expr, |$conn:ident| $body:expr) => {
        $pool.interact(move |$conn| $body).await.unwrap()
    };
}

#[allow(unused_imports)]
pub(crate) use db;

/// Create a test pool (in-memory DB at the default test dimension).
pub async fn setup_test_pool() -> Arc<DatabasePool> {
    Arc::new(
        DatabasePool::open_in_memory(8, 384)
            .await
            .expect("Failed to open in-memory pool"),
    )
}

/// Create a sync in-memory connection with all schema steps applied.
/// Use this for sync tests that don't need async pool semantics.
pub fn setup_test_connection() -> Connection {
    super::pool::ensure_sqlite_vec_registered();
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
    super::schema::run_all_migrations(&conn, 384).unwrap();
    conn
}

/// Seed a minimal discovery observation and return its id.
pub fn seed_observation(conn: &Connection, session_id: i64, project: &str, title: &str) -> i64 {
    let draft = ObservationDraft {
        obs_type: Some(ObservationType::Discovery),
        title: Some(title.to_string()),
        ..Default::default()
    };
    super::observations::insert_observation_sync(conn, session_id, project, &draft, None)
        .unwrap()
        .0
}
