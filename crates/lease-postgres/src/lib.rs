//! PostgreSQL and CockroachDB lease store.
//!
//! Both engines share the wire protocol and the `ON CONFLICT DO NOTHING`
//! claim; they differ in how the server clock is read.

mod dialect;
mod store;
mod tls;

pub use dialect::Dialect;
pub use store::{PostgresStore, DEFAULT_STATEMENT_TIMEOUT};
pub use tls::TlsMode;
