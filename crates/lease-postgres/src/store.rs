use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lease_core::{LeaseError, LeaseRecord, LeaseStore};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, instrument, warn};

use crate::dialect::Dialect;
use crate::tls::{build_connector, TlsMode};

/// Bound on connecting and on each statement unless configured otherwise.
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lease store on PostgreSQL or CockroachDB.
///
/// Holds a single client. When the connection drops, the next operation
/// reconnects; the failed one surfaces as [`LeaseError::Store`] and the
/// maintenance cycle retries on its next tick. A statement that outlives the
/// timeout also fails, and the connection it ran on is replaced, since a
/// silently dropped TCP connection never reports itself closed.
pub struct PostgresStore {
    url: String,
    tls: TlsMode,
    dialect: Dialect,
    statement_timeout: Duration,
    client: Mutex<Arc<Client>>,
    stale: AtomicBool,
}

impl PostgresStore {
    /// Connect to `url` and identify the engine behind it.
    ///
    /// # Errors
    /// [`LeaseError::UnsupportedStore`] if the server is neither PostgreSQL
    /// nor CockroachDB, [`LeaseError::Store`] if it cannot be reached.
    pub async fn connect(url: &str, tls: TlsMode) -> Result<Self, LeaseError> {
        Self::connect_with_timeout(url, tls, DEFAULT_STATEMENT_TIMEOUT).await
    }

    /// Like [`connect`](Self::connect), bounding the connect and every later
    /// statement by `statement_timeout`.
    ///
    /// Keep it well below a quarter lease duration so a dead connection is
    /// replaced before held leases have to be given up.
    pub async fn connect_with_timeout(
        url: &str,
        tls: TlsMode,
        statement_timeout: Duration,
    ) -> Result<Self, LeaseError> {
        let client = open(url, tls, statement_timeout).await?;
        let version: String = timeout(statement_timeout, client.query_one("SELECT version()", &[]))
            .await
            .map_err(|_| timed_out("read server version", statement_timeout))?
            .and_then(|row| row.try_get(0))
            .map_err(|e| store_error("read server version", e))?;
        let dialect = Dialect::from_version(&version)?;
        info!("Connected to {} lease store (tls: {})", dialect.label(), tls);
        debug!("Server version: {}", version);

        Ok(Self {
            url: url.to_string(),
            tls,
            dialect,
            statement_timeout,
            client: Mutex::new(Arc::new(client)),
            stale: AtomicBool::new(false),
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn client(&self) -> Result<Arc<Client>, LeaseError> {
        let mut current = self.client.lock().await;
        if current.is_closed() || self.stale.load(Ordering::Acquire) {
            warn!("Lease store connection lost, reconnecting");
            *current = Arc::new(open(&self.url, self.tls, self.statement_timeout).await?);
            self.stale.store(false, Ordering::Release);
        }
        Ok(current.clone())
    }

    /// Run one statement against the current client within the timeout.
    async fn run<T, F, Fut>(&self, op: &'static str, statement: F) -> Result<T, LeaseError>
    where
        F: FnOnce(Arc<Client>) -> Fut,
        Fut: Future<Output = Result<T, tokio_postgres::Error>>,
    {
        let client = self.client().await?;
        match timeout(self.statement_timeout, statement(client)).await {
            Ok(result) => result.map_err(|e| store_error(op, e)),
            Err(_) => {
                self.stale.store(true, Ordering::Release);
                Err(timed_out(op, self.statement_timeout))
            }
        }
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The URL may carry credentials.
        f.debug_struct("PostgresStore")
            .field("dialect", &self.dialect)
            .field("tls", &self.tls)
            .field("statement_timeout", &self.statement_timeout)
            .finish_non_exhaustive()
    }
}

async fn open(url: &str, tls: TlsMode, limit: Duration) -> Result<Client, LeaseError> {
    match build_connector(tls)? {
        Some(connector) => {
            let (client, connection) = timeout(limit, tokio_postgres::connect(url, connector))
                .await
                .map_err(|_| timed_out("connect", limit))?
                .map_err(|e| store_error("connect", e))?;
            spawn_connection(connection);
            Ok(client)
        }
        None => {
            let (client, connection) = timeout(limit, tokio_postgres::connect(url, NoTls))
                .await
                .map_err(|_| timed_out("connect", limit))?
                .map_err(|e| store_error("connect", e))?;
            spawn_connection(connection);
            Ok(client)
        }
    }
}

fn spawn_connection<T>(connection: T)
where
    T: Future<Output = Result<(), tokio_postgres::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "PostgreSQL connection error");
        }
    });
}

fn store_error(op: &str, e: tokio_postgres::Error) -> LeaseError {
    LeaseError::Store(format!("PostgreSQL {} failed: {}", op, e))
}

fn timed_out(op: &str, limit: Duration) -> LeaseError {
    LeaseError::Store(format!("PostgreSQL {} timed out after {:?}", op, limit))
}

#[async_trait]
impl LeaseStore for PostgresStore {
    fn name(&self) -> &'static str {
        self.dialect.label()
    }

    #[instrument(skip(self), level = "debug")]
    async fn ensure_schema(&self) -> Result<(), LeaseError> {
        self.run("create table", |client| async move {
            client
                .batch_execute(
                    "CREATE TABLE IF NOT EXISTS leases (lease VARCHAR PRIMARY KEY, owner VARCHAR, expiration BIGINT)",
                )
                .await
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn drop_schema(&self) -> Result<(), LeaseError> {
        self.run("drop table", |client| async move {
            client.batch_execute("DROP TABLE IF EXISTS leases").await
        })
        .await
    }

    async fn reference_time(&self) -> Result<i64, LeaseError> {
        let [preferred, fallback] = self.dialect.clock_queries();
        match self
            .run("read clock", |client| async move {
                client
                    .query_one(preferred, &[])
                    .await
                    .and_then(|row| row.try_get(0))
            })
            .await
        {
            Ok(now) => Ok(now),
            Err(e) => {
                debug!("Clock query failed ({}), trying fallback", e);
                self.run("read clock", |client| async move {
                    client
                        .query_one(fallback, &[])
                        .await
                        .and_then(|row| row.try_get(0))
                })
                .await
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_expired(&self, now: i64) -> Result<u64, LeaseError> {
        self.run("delete expired", |client| async move {
            client
                .execute("DELETE FROM leases WHERE $1 > expiration", &[&now])
                .await
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn refresh_owned(&self, owner: &str, expiration: i64) -> Result<u64, LeaseError> {
        self.run("refresh", |client| async move {
            client
                .execute(
                    "UPDATE leases SET expiration = $1 WHERE owner = $2",
                    &[&expiration, &owner],
                )
                .await
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
        self.run("claim", |client| async move {
            client
                .execute(
                    "INSERT INTO leases (lease, owner, expiration) \
                     SELECT name, $2, $3 FROM unnest($1::VARCHAR[]) AS name \
                     ON CONFLICT (lease) DO NOTHING",
                    &[&names, &owner, &expiration],
                )
                .await
                .map(|_| ())
        })
        .await
    }

    async fn select_owned(&self, owner: &str) -> Result<Vec<String>, LeaseError> {
        self.run("select owned", |client| async move {
            client
                .query("SELECT lease FROM leases WHERE owner = $1", &[&owner])
                .await
                .and_then(|rows| {
                    rows.iter()
                        .map(|row| row.try_get(0))
                        .collect::<Result<Vec<String>, _>>()
                })
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_owned(&self, name: &str, owner: &str) -> Result<bool, LeaseError> {
        self.run("delete owned", |client| async move {
            client
                .execute(
                    "DELETE FROM leases WHERE lease = $1 AND owner = $2",
                    &[&name, &owner],
                )
                .await
                .map(|n| n > 0)
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<LeaseRecord>, LeaseError> {
        self.run("list", |client| async move {
            client
                .query("SELECT lease, owner, expiration FROM leases", &[])
                .await
                .and_then(|rows| {
                    rows.iter()
                        .map(|row| -> Result<LeaseRecord, tokio_postgres::Error> {
                            Ok(LeaseRecord {
                                name: row.try_get(0)?,
                                owner: row.try_get(1)?,
                                expiration: row.try_get(2)?,
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()
                })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lease_core::{Clock, LeaseConfig, LeaseEvent, LeaseHandle, LeaseManager, SystemClock};

    /// Live tests run only against a database named by this variable.
    const URL_VAR: &str = "LEASE_TEST_POSTGRES_URL";

    async fn live_store() -> Option<PostgresStore> {
        let url = std::env::var(URL_VAR).ok()?;
        Some(PostgresStore::connect(&url, TlsMode::Disable).await.unwrap())
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
    async fn connect_gives_up_on_a_server_that_never_answers() {
        // Accepts TCP connections and then stays silent, like a black-holed
        // database host.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let url = format!("postgres://lease@{}:{}/leases", addr.ip(), addr.port());
        let started = std::time::Instant::now();
        let err = PostgresStore::connect_with_timeout(
            &url,
            TlsMode::Disable,
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, LeaseError::Store(ref msg) if msg.contains("timed out")));
        assert!(started.elapsed() < Duration::from_secs(5));
        server.abort();
    }

    // Statements and managers share the one `leases` table, so the live
    // checks run sequentially inside a single test.
    #[tokio::test]
    async fn live_store_operations_and_hand_off() {
        let Some(store) = live_store().await else {
            eprintln!("{} not set, skipping live PostgreSQL test", URL_VAR);
            return;
        };

        store.drop_schema().await.unwrap();
        store.ensure_schema().await.unwrap();
        store.ensure_schema().await.unwrap();

        let db_now = store.reference_time().await.unwrap();
        assert!((db_now - SystemClock.now_millis()).abs() < 5_000);

        store.claim_absent(&names(&["a"]), "owner-1", 100).await.unwrap();
        store
            .claim_absent(&names(&["a", "b"]), "owner-2", 50)
            .await
            .unwrap();
        assert_eq!(store.select_owned("owner-1").await.unwrap(), names(&["a"]));
        assert_eq!(store.select_owned("owner-2").await.unwrap(), names(&["b"]));

        assert_eq!(store.refresh_owned("owner-1", 500).await.unwrap(), 1);
        assert_eq!(store.delete_expired(100).await.unwrap(), 1);
        assert!(!store.delete_owned("a", "owner-2").await.unwrap());
        assert!(store.delete_owned("a", "owner-1").await.unwrap());
        assert!(store.list_all().await.unwrap().is_empty());

        let store = Arc::new(store);
        let config = LeaseConfig::with_lease_duration(Duration::from_millis(800));
        let manager1 = LeaseManager::new(store.clone(), config.clone());
        let manager2 = LeaseManager::new(store.clone(), config);
        manager1.start().await.unwrap();
        manager2.start().await.unwrap();

        let lease1 = manager1.create("live", |_: &LeaseEvent| {}).unwrap();
        assert!(wait_for(&lease1, true, Duration::from_secs(2)).await);
        let lease2 = manager2.create("live", |_: &LeaseEvent| {}).unwrap();
        assert!(!wait_for(&lease2, true, Duration::from_millis(1_200)).await);

        lease1.release();
        assert!(wait_for(&lease2, true, Duration::from_secs(2)).await);

        manager1.stop();
        manager2.stop();
        store.drop_schema().await.unwrap();
    }
}
