use lease_core::LeaseError;

/// Engines speaking the PostgreSQL wire protocol that can host the lease table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    PostgreSql,
    CockroachDb,
}

impl Dialect {
    /// Identify the engine from the output of `SELECT version()`.
    pub fn from_version(version: &str) -> Result<Self, LeaseError> {
        if version.contains("CockroachDB") {
            Ok(Self::CockroachDb)
        } else if version.starts_with("PostgreSQL") {
            Ok(Self::PostgreSql)
        } else {
            Err(LeaseError::UnsupportedStore(version.to_string()))
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Dialect::PostgreSql => "postgresql",
            Dialect::CockroachDb => "cockroachdb",
        }
    }

    /// Server clock queries in epoch milliseconds, preferred one first.
    ///
    /// CockroachDB rejects `extract(epoch ..)` on some versions, PostgreSQL
    /// rejects the decimal cast of a timestamp.
    pub(crate) fn clock_queries(&self) -> [&'static str; 2] {
        const POSTGRES: &str = "SELECT (extract(epoch from now()) * 1000)::BIGINT";
        const COCKROACH: &str = "SELECT (now()::DECIMAL * 1000)::BIGINT";
        match self {
            Dialect::PostgreSql => [POSTGRES, COCKROACH],
            Dialect::CockroachDb => [COCKROACH, POSTGRES],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_engine_from_version_banner() {
        assert_eq!(
            Dialect::from_version("PostgreSQL 16.2 on x86_64-pc-linux-gnu, compiled by gcc").unwrap(),
            Dialect::PostgreSql
        );
        assert_eq!(
            Dialect::from_version("CockroachDB CCL v23.1.11 (x86_64-pc-linux-gnu, built 2023/10/02)")
                .unwrap(),
            Dialect::CockroachDb
        );
    }

    #[test]
    fn rejects_unknown_engines() {
        let err = Dialect::from_version("MySQL 8.0.36").unwrap_err();
        assert!(err.is_startup_fatal());
        assert!(matches!(err, LeaseError::UnsupportedStore(ref v) if v.contains("MySQL")));
    }

    #[test]
    fn clock_query_order_follows_dialect() {
        assert!(Dialect::PostgreSql.clock_queries()[0].contains("extract"));
        assert!(Dialect::CockroachDb.clock_queries()[0].contains("DECIMAL"));
        assert_eq!(Dialect::CockroachDb.label(), "cockroachdb");
    }
}
