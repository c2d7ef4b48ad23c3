use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lease_core::{LeaseError, LeaseRecord, LeaseStore};
use rusqlite::{params, Connection};
use tracing::{debug, instrument};

/// How long a statement waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed lease store.
///
/// Statements run on the blocking thread pool; the connection is guarded by
/// a mutex so one store instance issues one statement at a time.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LeaseError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).map_err(|e| {
            LeaseError::Store(format!("Failed to open SQLite database {}: {}", path.display(), e))
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| LeaseError::Store(format!("Failed to set busy timeout: {}", e)))?;
        debug!("Opened SQLite lease store at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Open a private in-memory database, visible to this instance only.
    pub fn open_in_memory() -> Result<Self, LeaseError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            LeaseError::Store(format!("Failed to open in-memory SQLite database: {}", e))
        })?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Database file backing this store, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T, LeaseError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut *guard)
        })
        .await
        .map_err(|e| LeaseError::Store(format!("SQLite task for {} failed: {}", op, e)))?
        .map_err(|e| LeaseError::Store(format!("SQLite {} failed: {}", op, e)))
    }
}

#[async_trait]
impl LeaseStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    #[instrument(skip(self), level = "debug")]
    async fn ensure_schema(&self) -> Result<(), LeaseError> {
        self.with_conn("create table", |conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS leases (lease VARCHAR PRIMARY KEY, owner VARCHAR, expiration BIGINT)",
                [],
            )
            .map(|_| ())
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn drop_schema(&self) -> Result<(), LeaseError> {
        self.with_conn("drop table", |conn| {
            conn.execute("DROP TABLE IF EXISTS leases", []).map(|_| ())
        })
        .await
    }

    async fn reference_time(&self) -> Result<i64, LeaseError> {
        self.with_conn("read clock", |conn| {
            conn.query_row(
                "SELECT CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)",
                [],
                |row| row.get(0),
            )
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_expired(&self, now: i64) -> Result<u64, LeaseError> {
        self.with_conn("delete expired", move |conn| {
            conn.execute("DELETE FROM leases WHERE ?1 > expiration", params![now])
                .map(|n| n as u64)
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn refresh_owned(&self, owner: &str, expiration: i64) -> Result<u64, LeaseError> {
        let owner = owner.to_string();
        self.with_conn("refresh", move |conn| {
            conn.execute(
                "UPDATE leases SET expiration = ?1 WHERE owner = ?2",
                params![expiration, owner],
            )
            .map(|n| n as u64)
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn claim_absent(
        &self,
        names: &[String],
        owner: &str,
        expiration: i64,
    ) -> Result<(), LeaseError> {
        let names = names.to_vec();
        let owner = owner.to_string();
        self.with_conn("claim", move |conn| {
            let tx = conn.transaction()?;
            {
                let mut insert = tx.prepare(
                    "INSERT OR IGNORE INTO leases (lease, owner, expiration) VALUES (?1, ?2, ?3)",
                )?;
                for name in &names {
                    insert.execute(params![name, owner, expiration])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn select_owned(&self, owner: &str) -> Result<Vec<String>, LeaseError> {
        let owner = owner.to_string();
        self.with_conn("select owned", move |conn| {
            let mut stmt = conn.prepare("SELECT lease FROM leases WHERE owner = ?1")?;
            let rows = stmt.query_map(params![owner], |row| row.get(0))?;
            rows.collect()
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_owned(&self, name: &str, owner: &str) -> Result<bool, LeaseError> {
        let name = name.to_string();
        let owner = owner.to_string();
        self.with_conn("delete owned", move |conn| {
            conn.execute(
                "DELETE FROM leases WHERE lease = ?1 AND owner = ?2",
                params![name, owner],
            )
            .map(|n| n > 0)
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<LeaseRecord>, LeaseError> {
        self.with_conn("list", |conn| {
            let mut stmt = conn.prepare("SELECT lease, owner, expiration FROM leases")?;
            let rows = stmt.query_map([], |row| {
                Ok(LeaseRecord {
                    name: row.get(0)?,
                    owner: row.get(1)?,
                    expiration: row.get(2)?,
                })
            })?;
            rows.collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lease_core::{Clock, LeaseConfig, LeaseEvent, LeaseHandle, LeaseManager, SystemClock};
    use tempfile::TempDir;

    fn setup() -> (SqliteStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteStore::open(temp_dir.path().join("leases.db")).unwrap();
        (store, temp_dir)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn wait_for(handle: &LeaseHandle, acquired: bool, within: Duration) -> bool {
        let mut state = handle.subscribe();
        let reached = matches!(
            tokio::time::timeout(within, state.wait_for(|v| *v == acquired)).await,
            Ok(Ok(_))
        );
        reached
    }

    #[tokio::test]
    async fn schema_creation_is_idempotent() {
        let (store, _temp) = setup();
        store.ensure_schema().await.unwrap();
        store.ensure_schema().await.unwrap();
        assert!(store.list_all().await.unwrap().is_empty());

        store.drop_schema().await.unwrap();
        assert!(store.list_all().await.is_err());
    }

    #[tokio::test]
    async fn reference_time_tracks_system_clock() {
        let store = SqliteStore::open_in_memory().unwrap();
        let db_now = store.reference_time().await.unwrap();
        let local_now = SystemClock.now_millis();
        assert!((db_now - local_now).abs() < 1_000, "{} vs {}", db_now, local_now);
    }

    #[tokio::test]
    async fn claim_skips_names_that_already_have_a_row() {
        let (store, _temp) = setup();
        store.ensure_schema().await.unwrap();

        store.claim_absent(&names(&["a"]), "owner-1", 1_000).await.unwrap();
        store
            .claim_absent(&names(&["a", "b"]), "owner-2", 2_000)
            .await
            .unwrap();

        let mut all = store.list_all().await.unwrap();
        all.sort_by(|x, y| x.name.cmp(&y.name));
        assert_eq!(
            all,
            vec![
                LeaseRecord {
                    name: "a".into(),
                    owner: "owner-1".into(),
                    expiration: 1_000
                },
                LeaseRecord {
                    name: "b".into(),
                    owner: "owner-2".into(),
                    expiration: 2_000
                },
            ]
        );
    }

    #[tokio::test]
    async fn expiry_refresh_and_owned_delete() {
        let (store, _temp) = setup();
        store.ensure_schema().await.unwrap();
        store.claim_absent(&names(&["a", "b"]), "mine", 100).await.unwrap();
        store.claim_absent(&names(&["c"]), "theirs", 50).await.unwrap();

        assert_eq!(store.refresh_owned("mine", 500).await.unwrap(), 2);
        assert_eq!(store.delete_expired(100).await.unwrap(), 1);

        let mut owned = store.select_owned("mine").await.unwrap();
        owned.sort();
        assert_eq!(owned, names(&["a", "b"]));
        assert!(store.select_owned("theirs").await.unwrap().is_empty());

        assert!(!store.delete_owned("a", "theirs").await.unwrap());
        assert!(store.delete_owned("a", "mine").await.unwrap());
        assert_eq!(store.select_owned("mine").await.unwrap(), names(&["b"]));
    }

    #[tokio::test]
    async fn two_managers_share_one_database() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("shared.db");
        let config = LeaseConfig::with_lease_duration(Duration::from_millis(800));

        let manager1 = LeaseManager::new(Arc::new(SqliteStore::open(&path).unwrap()), config.clone());
        let manager2 = LeaseManager::new(Arc::new(SqliteStore::open(&path).unwrap()), config);
        manager1.start().await.unwrap();
        manager2.start().await.unwrap();

        let lease1 = manager1.create("a", |_: &LeaseEvent| {}).unwrap();
        assert!(wait_for(&lease1, true, Duration::from_secs(2)).await);

        let lease2 = manager2.create("a", |_: &LeaseEvent| {}).unwrap();
        assert!(!wait_for(&lease2, true, Duration::from_millis(1_200)).await);

        let all = manager2.all_leases().await.unwrap();
        assert_eq!(all.get("a").map(String::as_str), Some(manager1.owner_id()));

        lease1.release();
        assert!(wait_for(&lease1, false, Duration::from_secs(1)).await);
        assert!(wait_for(&lease2, true, Duration::from_secs(2)).await);

        manager1.stop();
        manager2.stop();
    }
}
