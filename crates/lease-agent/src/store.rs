use std::fmt;
use std::sync::Arc;

use lease_core::{LeaseError, LeaseStore, MemoryStore};
use lease_postgres::PostgresStore;
use lease_sqlite::SqliteStore;
use tracing::debug;

use crate::config::Config;

/// Store location parsed from a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreUrl<'a> {
    /// Full connection URL, handed to the driver unchanged
    Postgres(&'a str),
    /// Database file, or `:memory:`
    Sqlite(&'a str),
}

impl<'a> StoreUrl<'a> {
    pub fn parse(url: &'a str) -> Result<Self, LeaseError> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return Ok(Self::Postgres(url));
        }
        if let Some(rest) = url.strip_prefix("sqlite:") {
            let path = rest.strip_prefix("//").unwrap_or(rest);
            if path.is_empty() {
                return Err(LeaseError::InvalidConfig(format!(
                    "SQLite store URL has no path: {}",
                    url
                )));
            }
            return Ok(Self::Sqlite(path));
        }
        let scheme = url.split_once(':').map_or(url, |(scheme, _)| scheme);
        Err(LeaseError::UnsupportedStore(format!(
            "no lease store for URL scheme '{}'",
            scheme
        )))
    }
}

impl fmt::Display for StoreUrl<'_> {
    // Never print the PostgreSQL URL: it may carry a password.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreUrl::Postgres(_) => write!(f, "postgres"),
            StoreUrl::Sqlite(path) => write!(f, "sqlite ({})", path),
        }
    }
}

/// Open the store the agent coordinates through.
pub async fn open_store(config: &Config) -> Result<Arc<dyn LeaseStore>, LeaseError> {
    if !config.leases_enabled {
        debug!("Leases are disabled, not opening a store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let url = config.store_url.as_deref().ok_or_else(|| {
        LeaseError::InvalidConfig("a store URL is required when leases are enabled".to_string())
    })?;

    match StoreUrl::parse(url)? {
        StoreUrl::Postgres(url) => {
            // A hung statement must fail well before held leases are at risk.
            let statement_timeout = config.lease_config().grace() / 2;
            let store =
                PostgresStore::connect_with_timeout(url, config.tls_mode, statement_timeout).await?;
            Ok(Arc::new(store))
        }
        StoreUrl::Sqlite(":memory:") => Ok(Arc::new(SqliteStore::open_in_memory()?)),
        StoreUrl::Sqlite(path) => Ok(Arc::new(SqliteStore::open(path)?)),
    }
}
