use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::clock::{Clock, SystemClock};
use crate::error::LeaseError;
use crate::store::{LeaseRecord, LeaseStore};

/// Process-local lease store.
///
/// Shares the exact claim semantics of the SQL adapters, but only among
/// managers holding the same instance. Used when leases are disabled and
/// in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// lease name -> (owner, expiration)
    rows: DashMap<String, (String, i64)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a row directly, bypassing the claim semantics.
    pub fn put(&self, record: LeaseRecord) {
        self.rows
            .insert(record.name, (record.owner, record.expiration));
    }

    /// Read one row.
    pub fn get(&self, name: &str) -> Option<LeaseRecord> {
        self.rows.get(name).map(|row| LeaseRecord {
            name: name.to_string(),
            owner: row.0.clone(),
            expiration: row.1,
        })
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ensure_schema(&self) -> Result<(), LeaseError> {
        Ok(())
    }

    async fn drop_schema(&self) -> Result<(), LeaseError> {
        self.rows.clear();
        Ok(())
    }

    async fn reference_time(&self) -> Result<i64, LeaseError> {
        Ok(SystemClock.now_millis())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_expired(&self, now: i64) -> Result<u64, LeaseError> {
        let before = self.rows.len();
        self.rows.retain(|_, (_, expiration)| *expiration >= now);
        Ok(before.saturating_sub(self.rows.len()) as u64)
    }

    #[instrument(skip(self), level = "debug")]
    async fn refresh_owned(&self, owner: &str, expiration: i64) -> Result<u64, LeaseError> {
        let mut refreshed = 0;
        for mut row in self.rows.iter_mut() {
            if row.0 == owner {
                row.1 = expiration;
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }

    #[instrument(skip(self), level = "debug")]
    async fn claim_absent(
        &self,
        names: &[String],
        owner: &str,
        expiration: i64,
    ) -> Result<(), LeaseError> {
        for name in names {
            self.rows
                .entry(name.clone())
                .or_insert_with(|| (owner.to_string(), expiration));
        }
        debug!("Attempted {} claims for {}", names.len(), owner);
        Ok(())
    }

    async fn select_owned(&self, owner: &str) -> Result<Vec<String>, LeaseError> {
        Ok(self
            .rows
            .iter()
            .filter(|row| row.value().0 == owner)
            .map(|row| row.key().clone())
            .collect())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_owned(&self, name: &str, owner: &str) -> Result<bool, LeaseError> {
        Ok(self
            .rows
            .remove_if(name, |_, (row_owner, _)| row_owner == owner)
            .is_some())
    }

    async fn list_all(&self) -> Result<Vec<LeaseRecord>, LeaseError> {
        Ok(self
            .rows
            .iter()
            .map(|row| LeaseRecord {
                name: row.key().clone(),
                owner: row.value().0.clone(),
                expiration: row.value().1,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn claim_is_first_writer_wins() {
        let store = MemoryStore::new();
        store.claim_absent(&names(&["a"]), "owner-1", 100).await.unwrap();
        store.claim_absent(&names(&["a", "b"]), "owner-2", 200).await.unwrap();

        assert_eq!(store.get("a").unwrap().owner, "owner-1");
        assert_eq!(store.get("a").unwrap().expiration, 100);
        assert_eq!(store.get("b").unwrap().owner, "owner-2");
    }

    #[tokio::test]
    async fn delete_expired_spares_rows_expiring_now() {
        let store = MemoryStore::new();
        store.claim_absent(&names(&["old"]), "o", 99).await.unwrap();
        store.claim_absent(&names(&["edge"]), "o", 100).await.unwrap();
        store.claim_absent(&names(&["new"]), "o", 500).await.unwrap();

        assert_eq!(store.delete_expired(100).await.unwrap(), 1);
        assert!(store.get("old").is_none());
        assert!(store.get("edge").is_some());
        assert!(store.get("new").is_some());
    }

    #[tokio::test]
    async fn refresh_and_delete_only_touch_own_rows() {
        let store = MemoryStore::new();
        store.claim_absent(&names(&["a"]), "mine", 10).await.unwrap();
        store.claim_absent(&names(&["b"]), "theirs", 10).await.unwrap();

        assert_eq!(store.refresh_owned("mine", 1_000).await.unwrap(), 1);
        assert_eq!(store.get("a").unwrap().expiration, 1_000);
        assert_eq!(store.get("b").unwrap().expiration, 10);

        assert!(!store.delete_owned("b", "mine").await.unwrap());
        assert!(store.delete_owned("a", "mine").await.unwrap());
        assert_eq!(store.select_owned("mine").await.unwrap(), Vec::<String>::new());
        assert_eq!(store.select_owned("theirs").await.unwrap(), names(&["b"]));
    }

    #[tokio::test]
    async fn list_all_reports_every_row() {
        let store = MemoryStore::new();
        store.claim_absent(&names(&["a", "b"]), "o", 10).await.unwrap();
        let mut all = store.list_all().await.unwrap();
        all.sort_by(|x, y| x.name.cmp(&y.name));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "a");

        store.drop_schema().await.unwrap();
        assert!(store.list_all().await.unwrap().is_empty());
    }
}
