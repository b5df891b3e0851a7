//! Application configuration loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use rust_decimal::Decimal;

use crate::errors::{Result, SubsidyError};

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database URL or file path
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Currency units paid per verified kilogram
    pub subsidy_rate: Decimal,
    /// Estimated production recorded for every newly registered project
    pub default_estimated_production: Decimal,
    /// Upper bound on pooled SQLite connections
    pub max_connections: u32,
    /// How long (in seconds) a call waits on a held SQLite lock before failing
    pub busy_timeout_secs: u64,
    /// Directory holding uploaded supporting documents
    pub upload_dir: PathBuf,
    /// Largest accepted document, in bytes
    pub max_upload_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./subsidy.db".to_string()),
            api_port: env_var("API_PORT")
                .unwrap_or_else(|_| "3002".to_string())
                .parse()
                .map_err(|_| SubsidyError::Config("Invalid API_PORT".to_string()))?,
            subsidy_rate: parse_positive_decimal(
                "SUBSIDY_RATE",
                &env_var("SUBSIDY_RATE").unwrap_or_else(|_| "2.5".to_string()),
            )?,
            default_estimated_production: parse_positive_decimal(
                "DEFAULT_ESTIMATED_PRODUCTION",
                &env_var("DEFAULT_ESTIMATED_PRODUCTION").unwrap_or_else(|_| "100000".to_string()),
            )?,
            max_connections: env_var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| SubsidyError::Config("Invalid DB_MAX_CONNECTIONS".to_string()))?,
            busy_timeout_secs: env_var("DB_BUSY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| SubsidyError::Config("Invalid DB_BUSY_TIMEOUT_SECS".to_string()))?,
            upload_dir: env_var("UPLOAD_DIR")
                .unwrap_or_else(|_| "./uploads".to_string())
                .into(),
            max_upload_bytes: env_var("MAX_UPLOAD_BYTES")
                .unwrap_or_else(|_| (16 * 1024 * 1024).to_string())
                .parse()
                .map_err(|_| SubsidyError::Config("Invalid MAX_UPLOAD_BYTES".to_string()))?,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| SubsidyError::Config(format!("Missing env var: {key}")))
}

fn parse_positive_decimal(key: &str, raw: &str) -> Result<Decimal> {
    let value = Decimal::from_str(raw.trim())
        .map_err(|_| SubsidyError::Config(format!("Invalid {key}: {raw:?}")))?;
    if value <= Decimal::ZERO {
        return Err(SubsidyError::Config(format!("{key} must be positive")));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_rate_exactly() {
        let rate = parse_positive_decimal("SUBSIDY_RATE", "2.5").unwrap();
        assert_eq!(rate, Decimal::new(25, 1));
    }

    #[test]
    fn rejects_non_positive_and_garbage_rates() {
        assert!(matches!(
            parse_positive_decimal("SUBSIDY_RATE", "0"),
            Err(SubsidyError::Config(_))
        ));
        assert!(matches!(
            parse_positive_decimal("SUBSIDY_RATE", "-1.25"),
            Err(SubsidyError::Config(_))
        ));
        assert!(matches!(
            parse_positive_decimal("SUBSIDY_RATE", "two fifty"),
            Err(SubsidyError::Config(_))
        ));
    }
}
