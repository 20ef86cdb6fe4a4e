// crates/dossier-server/src/db/pool.rs
// Async connection pool using deadpool-sqlite
//
// All SQL lives in sibling modules as `*_sync` functions over a
// `&Connection`. Callers pick one of two entry points: `read` for
// queries, `write` for anything that mutates. Reads surface errors
// immediately; writes retry SQLite contention, because counter
// increments, message appends and audit rows must not be lost to a
// momentarily busy database. Either way the closure runs on deadpool's
// blocking executor, never on the async runtime.

use anyhow::{Context, Result, anyhow};
use deadpool_sqlite::{Config, Hook, HookError, Runtime};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// Applied to every pooled connection: WAL so readers proceed during a
/// write, enforced foreign keys (message and session cascades depend on
/// them), a 5 s busy handler, and NORMAL fsync which WAL makes durable
/// enough.
const CONNECTION_PRAGMAS: &str = "PRAGMA journal_mode=WAL; \
     PRAGMA foreign_keys=ON; \
     PRAGMA busy_timeout=5000; \
     PRAGMA synchronous=NORMAL;";

/// Attempts a write gets before its contention error surfaces. The gap
/// between attempts starts at `WRITE_RETRY_BASE` and doubles.
const WRITE_ATTEMPTS: u32 = 4;
const WRITE_RETRY_BASE: Duration = Duration::from_millis(60);

/// True when an error chain contains a SQLITE_BUSY or SQLITE_LOCKED
/// failure.
///
/// Contention shows up as BUSY on file databases and LOCKED on
/// shared-cache in-memory ones, and clears once the competing writer
/// commits. Walking the whole chain means a rusqlite failure is found
/// no matter what it was wrapped in along the way; anything without a
/// typed rusqlite cause (including look-alike message strings) does not
/// count.
fn is_contention(err: &anyhow::Error) -> bool {
    use rusqlite::ffi::ErrorCode;
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(f, _))
                if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    })
}

/// Best-effort snapshot of an existing database file before migrations
/// touch it. VACUUM INTO produces a consistent copy even with a live
/// WAL. At most one snapshot per database; each startup overwrites the
/// last.
fn snapshot_existing_db(path: &Path) {
    if !path.exists() {
        return;
    }
    let target = path.with_extension("db.backup");
    let _ = std::fs::remove_file(&target);

    let result = rusqlite::Connection::open(path).and_then(|conn| {
        conn.execute("VACUUM INTO ?1", [target.to_string_lossy().as_ref()])
            .map(|_| ())
    });
    match result {
        Ok(()) => tracing::info!("Database snapshot written to {}", target.display()),
        Err(e) => tracing::warn!("Skipping pre-migration snapshot: {e}"),
    }
}

/// Configure each new pooled connection.
fn connection_hook() -> Hook {
    Hook::async_fn(|conn, _metrics| {
        Box::pin(async move {
            conn.interact(|conn| conn.execute_batch(CONNECTION_PRAGMAS))
                .await
                .map_err(|e| {
                    HookError::Message(format!("connection setup did not run: {e}").into())
                })?
                .map_err(|e| HookError::Message(format!("connection PRAGMAs failed: {e}").into()))
        })
    })
}

/// Database pool with per-connection setup and schema migrations.
pub struct DatabasePool {
    pool: deadpool_sqlite::Pool,
}

impl DatabasePool {
    /// Open a pooled database at the given path, snapshotting any
    /// existing file before migrations run.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        snapshot_existing_db(path);
        Self::build(path.to_string_lossy().into_owned()).await
    }

    /// Open a pooled in-memory database (tests and ephemeral runs).
    ///
    /// The shared-cache URI is what lets every pooled connection see
    /// the same in-memory database; a plain `:memory:` pool would hand
    /// each connection its own empty one.
    pub async fn open_in_memory() -> Result<Self> {
        let uri = format!(
            "file:dossier_mem_{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        );
        Self::build(uri).await
    }

    async fn build(conn_str: String) -> Result<Self> {
        let pool = Config::new(&conn_str)
            .builder(Runtime::Tokio1)
            .context("initializing database pool")?
            .max_size(8)
            .post_create(connection_hook())
            .build()
            .context("building database pool")?;

        let db = Self { pool };
        db.write(|conn| super::schema::run_all_migrations(conn))
            .await
            .context("running schema migrations")?;
        Ok(db)
    }

    /// Run a read-only closure on a pooled connection.
    pub async fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.dispatch(move |conn| f(conn).map_err(anyhow::Error::from))
            .await
    }

    /// Run a mutating closure, retrying contention with doubled
    /// backoff before the error surfaces. The closure must be `Clone`
    /// so it can be re-dispatched.
    pub async fn write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + Clone + 'static,
        R: Send + 'static,
    {
        let mut delay = WRITE_RETRY_BASE;
        for _ in 1..WRITE_ATTEMPTS {
            match self.dispatch(f.clone()).await {
                Err(e) if is_contention(&e) => {
                    tracing::warn!("Database contended, retrying write in {delay:?}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                other => return other,
            }
        }
        self.dispatch(f).await
    }

    /// Hand a closure to deadpool's blocking executor.
    async fn dispatch<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self
            .pool
            .get()
            .await
            .context("no database connection available")?;
        conn.interact(move |conn| f(conn))
            .await
            .map_err(|e| anyhow!("blocking database task failed: {e}"))?
    }

    /// Pool status for monitoring.
    pub fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            size: status.size,
            available: status.available,
            waiting: status.waiting,
        }
    }
}

/// Pool status for monitoring.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub size: usize,
    pub available: usize,
    pub waiting: usize,
}
