use std::time::Duration;

use clap::Parser;
use lease_core::LeaseConfig;
use lease_postgres::TlsMode;

/// Configuration for the lease agent.
#[derive(Parser, Debug, Clone)]
#[command(name = "lease-agent")]
#[command(about = "Hold named leases against a shared SQL store")]
pub struct Config {
    /// Store URL: postgres://..., postgresql://... or sqlite:<path> (sqlite::memory: for a private database)
    #[arg(long, env = "LEASE_STORE_URL")]
    pub store_url: Option<String>,

    /// Time a claimed lease stays valid without a refresh, in milliseconds
    #[arg(long, default_value = "60000", env = "LEASE_DURATION_MS")]
    pub lease_duration_ms: u64,

    /// When false, leases are granted locally without coordinating with peers
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "LEASES_ENABLED"
    )]
    pub leases_enabled: bool,

    /// TLS mode for PostgreSQL: disable, require or verify-full
    #[arg(long, default_value = "disable", env = "LEASE_STORE_TLS")]
    pub tls_mode: TlsMode,

    /// Lease names to hold (repeatable or comma separated)
    #[arg(long = "lease", value_delimiter = ',', env = "LEASE_NAMES")]
    pub leases: Vec<String>,

    /// Seconds between lease table snapshots in the log (0 disables)
    #[arg(long, default_value = "30", env = "LEASE_REPORT_INTERVAL")]
    pub report_interval_secs: u64,
}

impl Config {
    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            lease_duration: Duration::from_millis(self.lease_duration_ms),
            enabled: self.leases_enabled,
        }
    }

    /// Snapshot period, or `None` when reporting is off.
    pub fn report_interval(&self) -> Option<Duration> {
        (self.report_interval_secs > 0).then(|| Duration::from_secs(self.report_interval_secs))
    }
}
