//! Connection handling and bulk table I/O against the relational reference store.

mod memory;
mod postgres;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use polars::prelude::{DataFrame, PolarsError};
use thiserror::Error;
use tracing::{info, warn};

use crate::secrets::{Credential, SecretError, SecretResolver};

pub use memory::MemoryTableStore;
pub use postgres::PgTableStore;

pub const PRODUCTS_TABLE: &str = "products";
pub const STORES_TABLE: &str = "stores";
pub const DEFAULT_PORT: u16 = 5432;

const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection parameter invalid: {0}")]
    ConnectionParameterInvalid(String),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("timed out after {0:?} connecting to the reference store")]
    ConnectTimeout(Duration),

    #[error("polars operation failed: {0}")]
    Polars(#[from] PolarsError),

    #[error("table {0} does not exist in the reference store")]
    MissingTable(String),

    #[error("table {table} cannot be written: {reason}")]
    InvalidRows { table: String, reason: String },

    #[error("write to {table} aborted after {rows_written} rows: {reason}")]
    WriteAborted {
        table: String,
        rows_written: usize,
        reason: String,
    },
}

/// Where the reference store lives. The credential is resolved separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceStoreSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
}

impl ReferenceStoreSettings {
    /// `host:port` as it appears in logs and health reports.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Fixed driver tuning shared by every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverParams {
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,
    pub login_timeout: Duration,
    pub statement_cache_entries: usize,
    pub statement_cache_size_mib: usize,
    pub prepare_threshold: u32,
}

impl Default for DriverParams {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            socket_timeout: Duration::from_secs(60),
            login_timeout: Duration::from_secs(30),
            statement_cache_entries: 256,
            statement_cache_size_mib: 5,
            prepare_threshold: 0,
        }
    }
}

impl DriverParams {
    /// Driver properties in the form a JDBC-style driver expects them.
    pub fn as_properties(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("connectTimeout", self.connect_timeout.as_secs().to_string()),
            ("socketTimeout", self.socket_timeout.as_secs().to_string()),
            ("loginTimeout", self.login_timeout.as_secs().to_string()),
            ("prepareThreshold", self.prepare_threshold.to_string()),
            (
                "preparedStatementCacheQueries",
                self.statement_cache_entries.to_string(),
            ),
            (
                "preparedStatementCacheSizeMiB",
                self.statement_cache_size_mib.to_string(),
            ),
        ])
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub credential: Credential,
    pub driver: DriverParams,
}

impl ConnectionDescriptor {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connection URL without the credential, safe to log.
    pub fn url(&self) -> String {
        format!("postgres://{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Reference tables are only ever replaced wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Overwrite,
}

/// Storage collaborator for reference tables.
///
/// `replace_table` must be atomic: when it returns an error, readers still see the
/// table exactly as it was before the call.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn replace_table(
        &self,
        descriptor: &ConnectionDescriptor,
        table: &str,
        rows: &DataFrame,
    ) -> Result<usize, StoreError>;

    async fn read_table(
        &self,
        descriptor: &ConnectionDescriptor,
        table: &str,
    ) -> Result<DataFrame, StoreError>;

    /// Drop pooled connections. Called once at the end of every run.
    async fn release(&self) {}
}

pub struct ReferenceStoreClient {
    settings: ReferenceStoreSettings,
    driver: DriverParams,
    resolver: Arc<SecretResolver>,
    store: Arc<dyn TableStore>,
}

impl ReferenceStoreClient {
    pub fn new(
        settings: ReferenceStoreSettings,
        resolver: Arc<SecretResolver>,
        store: Arc<dyn TableStore>,
    ) -> Self {
        Self {
            settings,
            driver: DriverParams::default(),
            resolver,
            store,
        }
    }

    pub fn settings(&self) -> &ReferenceStoreSettings {
        &self.settings
    }

    pub fn store(&self) -> Arc<dyn TableStore> {
        Arc::clone(&self.store)
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.settings.host.trim().is_empty() {
            missing.push("host");
        }
        if self.settings.port == 0 {
            missing.push("port");
        }
        if self.settings.database.trim().is_empty() {
            missing.push("database");
        }
        if self.settings.user.trim().is_empty() {
            missing.push("user");
        }
        missing
    }

    pub async fn build_connection_descriptor(&self) -> Result<ConnectionDescriptor, StoreError> {
        let missing = self.missing_fields();
        if !missing.is_empty() {
            return Err(StoreError::ConnectionParameterInvalid(format!(
                "missing required connection parameters: {}",
                missing.join(", ")
            )));
        }

        let credential = self.resolver.resolve().await?;
        if credential.is_empty() {
            return Err(StoreError::ConnectionParameterInvalid(
                "resolved credential is empty".to_string(),
            ));
        }

        Ok(ConnectionDescriptor {
            host: self.settings.host.clone(),
            port: self.settings.port,
            database: self.settings.database.clone(),
            user: self.settings.user.clone(),
            credential,
            driver: self.driver.clone(),
        })
    }

    /// `Ok(false)` for incomplete parameters or an unavailable credential; other
    /// resolver failures propagate.
    pub async fn health_check(&self) -> Result<bool, StoreError> {
        let missing = self.missing_fields();
        if !missing.is_empty() {
            warn!(missing = ?missing, "reference store parameters incomplete");
            return Ok(false);
        }

        match self.resolver.resolve().await {
            Ok(credential) if credential.is_empty() => {
                warn!("reference store credential resolved to an empty value");
                Ok(false)
            }
            Ok(_) => {
                info!(
                    endpoint = %self.settings.endpoint(),
                    database = %self.settings.database,
                    "reference store parameters validated"
                );
                Ok(true)
            }
            Err(err @ SecretError::CredentialUnavailable { .. }) => {
                warn!("reference store credential unavailable: {err}");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn bulk_write(
        &self,
        table: &str,
        rows: &DataFrame,
        mode: WriteMode,
    ) -> Result<usize, StoreError> {
        validate_identifier(table)?;
        let descriptor = self.build_connection_descriptor().await?;
        match mode {
            WriteMode::Overwrite => {
                let written = self.store.replace_table(&descriptor, table, rows).await?;
                info!(table, rows = written, url = %descriptor.url(), "replaced reference table");
                Ok(written)
            }
        }
    }

    pub async fn bulk_read(&self, table: &str) -> Result<DataFrame, StoreError> {
        validate_identifier(table)?;
        let descriptor = self.build_connection_descriptor().await?;
        let frame = self.store.read_table(&descriptor, table).await?;
        info!(table, rows = frame.height(), "read reference table");
        Ok(frame)
    }
}

pub(crate) fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let invalid = |reason: String| StoreError::ConnectionParameterInvalid(reason);

    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(invalid("table name must not be empty".to_string()));
    };
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(invalid(format!(
            "identifier '{name}' exceeds {MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(invalid(format!(
            "identifier '{name}' must start with a letter or underscore"
        )));
    }
    if let Some(bad) = chars.find(|ch| !ch.is_ascii_alphanumeric() && *ch != '_') {
        return Err(invalid(format!(
            "identifier '{name}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_properties_match_fixed_tuning() {
        let props = DriverParams::default().as_properties();
        assert_eq!(props["connectTimeout"], "60");
        assert_eq!(props["socketTimeout"], "60");
        assert_eq!(props["loginTimeout"], "30");
        assert_eq!(props["preparedStatementCacheQueries"], "256");
        assert_eq!(props["preparedStatementCacheSizeMiB"], "5");
        assert_eq!(props["prepareThreshold"], "0");
    }

    #[test]
    fn endpoint_joins_host_and_port() {
        let settings = ReferenceStoreSettings {
            host: "10.0.0.5".into(),
            port: 6543,
            database: "sales".into(),
            user: "etl".into(),
        };
        assert_eq!(settings.endpoint(), "10.0.0.5:6543");
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_identifier("products").is_ok());
        assert!(validate_identifier("_staging_1").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1products").is_err());
        assert!(validate_identifier("products; DROP TABLE stores").is_err());
        assert!(validate_identifier(&"x".repeat(64)).is_err());
    }
}
