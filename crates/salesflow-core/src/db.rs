use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tracing::info;

use crate::reference_store::{ConnectionDescriptor, StoreError};

/// Open a connection pool for the reference store.
///
/// The driver's login timeout bounds each connection acquisition, the socket
/// timeout becomes the server-side `statement_timeout`, and the connect timeout
/// caps establishing the pool as a whole.
pub async fn connect(descriptor: &ConnectionDescriptor) -> Result<PgPool, StoreError> {
    let driver = &descriptor.driver;
    let options = PgConnectOptions::new()
        .host(&descriptor.host)
        .port(descriptor.port)
        .database(&descriptor.database)
        .username(&descriptor.user)
        .password(descriptor.credential.expose())
        .statement_cache_capacity(driver.statement_cache_entries)
        .options([(
            "statement_timeout",
            driver.socket_timeout.as_millis().to_string(),
        )]);

    let pending = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(driver.login_timeout)
        .connect_with(options);

    let pool = tokio::time::timeout(driver.connect_timeout, pending)
        .await
        .map_err(|_| StoreError::ConnectTimeout(driver.connect_timeout))??;

    info!(url = %descriptor.url(), "reference store pool established");
    Ok(pool)
}
