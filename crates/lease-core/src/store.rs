use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LeaseError;

/// A row of the shared `leases` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Lease name (primary key)
    pub name: String,
    /// Owner id of the manager that claimed it
    pub owner: String,
    /// Epoch milliseconds after which any participant may delete the row
    pub expiration: i64,
}

/// Shared relational store acting as the sole arbiter of lease ownership.
///
/// Implementations translate a small set of logical operations into
/// engine-specific statements. Only `claim_absent` needs genuine per-engine
/// idiom knowledge: it must be a silent no-op for names that already have a
/// row, so exactly one participant wins each free name.
///
/// Timestamps are epoch milliseconds computed by the caller from its local
/// clock; `reference_time` is the only operation reading the store's clock.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Dialect label used in logs (e.g. `postgresql`, `sqlite`).
    fn name(&self) -> &'static str;

    /// Create the lease table if it does not exist.
    async fn ensure_schema(&self) -> Result<(), LeaseError>;

    /// Drop the lease table.
    async fn drop_schema(&self) -> Result<(), LeaseError>;

    /// Current time according to the store, in epoch milliseconds.
    async fn reference_time(&self) -> Result<i64, LeaseError>;

    /// Delete rows of any owner whose expiration lies before `now`.
    ///
    /// # Returns
    /// Number of rows deleted
    async fn delete_expired(&self, now: i64) -> Result<u64, LeaseError>;

    /// Move the expiration of every row owned by `owner` to `expiration`.
    async fn refresh_owned(&self, owner: &str, expiration: i64) -> Result<u64, LeaseError>;

    /// Insert a row for each name that has none, in a single round trip.
    ///
    /// Names that already have a row (whoever owns it) are skipped silently.
    async fn claim_absent(
        &self,
        names: &[String],
        owner: &str,
        expiration: i64,
    ) -> Result<(), LeaseError>;

    /// Names of every row currently owned by `owner`.
    async fn select_owned(&self, owner: &str) -> Result<Vec<String>, LeaseError>;

    /// Delete the row for `name` only if `owner` still owns it.
    ///
    /// # Returns
    /// Whether a row was deleted
    async fn delete_owned(&self, name: &str, owner: &str) -> Result<bool, LeaseError>;

    /// Every row of the table, for diagnostics.
    async fn list_all(&self) -> Result<Vec<LeaseRecord>, LeaseError>;
}
