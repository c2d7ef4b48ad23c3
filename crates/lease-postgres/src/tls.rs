use std::fmt;
use std::str::FromStr;

use lease_core::LeaseError;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;

/// TLS policy for the store connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlsMode {
    #[default]
    Disable,
    /// Encrypt, but accept any certificate
    Require,
    /// Encrypt and verify certificate chain and host name
    VerifyFull,
}

impl FromStr for TlsMode {
    type Err = LeaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "disable" => Ok(Self::Disable),
            "require" => Ok(Self::Require),
            "verify-full" => Ok(Self::VerifyFull),
            other => Err(LeaseError::InvalidConfig(format!(
                "unknown TLS mode '{}' (expected disable, require or verify-full)",
                other
            ))),
        }
    }
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsMode::Disable => write!(f, "disable"),
            TlsMode::Require => write!(f, "require"),
            TlsMode::VerifyFull => write!(f, "verify-full"),
        }
    }
}

/// Connector for `mode`, or `None` for plaintext connections.
pub(crate) fn build_connector(mode: TlsMode) -> Result<Option<MakeTlsConnector>, LeaseError> {
    let connector = match mode {
        TlsMode::Disable => return Ok(None),
        TlsMode::Require => TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build(),
        TlsMode::VerifyFull => TlsConnector::builder().build(),
    }
    .map_err(|e| {
        LeaseError::InvalidConfig(format!("failed to build TLS connector for {}: {}", mode, e))
    })?;
    Ok(Some(MakeTlsConnector::new(connector)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_modes_case_insensitively() {
        assert_eq!("disable".parse::<TlsMode>().unwrap(), TlsMode::Disable);
        assert_eq!("Require".parse::<TlsMode>().unwrap(), TlsMode::Require);
        assert_eq!("VERIFY-FULL".parse::<TlsMode>().unwrap(), TlsMode::VerifyFull);
        assert!(matches!(
            "verify-ca".parse::<TlsMode>(),
            Err(LeaseError::InvalidConfig(_))
        ));
    }

    #[test]
    fn display_round_trips_through_parse() {
        for mode in [TlsMode::Disable, TlsMode::Require, TlsMode::VerifyFull] {
            assert_eq!(mode.to_string().parse::<TlsMode>().unwrap(), mode);
        }
    }

    #[test]
    fn only_encrypted_modes_build_a_connector() {
        assert!(build_connector(TlsMode::Disable).unwrap().is_none());
        assert!(build_connector(TlsMode::Require).unwrap().is_some());
        assert!(build_connector(TlsMode::VerifyFull).unwrap().is_some());
    }
}
