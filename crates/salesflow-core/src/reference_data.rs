//! Refreshes the product and store dimension tables from their raw files.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use polars::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::reference_store::{
    ReferenceStoreClient, StoreError, WriteMode, PRODUCTS_TABLE, STORES_TABLE,
};

#[derive(Debug, Error)]
pub enum RefreshCause {
    #[error("could not open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: PolarsError,
    },
    #[error("{path} has no header columns")]
    NoColumns { path: PathBuf },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("failed to refresh reference table {table}: {source}")]
    RefreshFailed {
        table: String,
        #[source]
        source: RefreshCause,
    },
    #[error("failed to read reference table {table}: {source}")]
    ReadFailed {
        table: String,
        #[source]
        source: StoreError,
    },
}

/// Raw dimension files for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionFiles {
    pub products: PathBuf,
    pub stores: PathBuf,
}

impl DimensionFiles {
    /// The well-known layout under a data root: `reference_data/{products,stores}.csv`.
    pub fn under(root: &Path) -> Self {
        let base = root.join("reference_data");
        Self {
            products: base.join("products.csv"),
            stores: base.join("stores.csv"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub products_rows: usize,
    pub stores_rows: usize,
}

#[derive(Debug, Clone)]
pub struct ReferenceTables {
    pub products: DataFrame,
    pub stores: DataFrame,
}

/// Read a dimension file with header-derived column names and every value kept
/// as text.
pub fn read_dimension_file(path: &Path) -> Result<DataFrame, RefreshCause> {
    let file = File::open(path).map_err(|source| RefreshCause::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let frame = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .into_reader_with_file_handle(file)
        .finish()
        .map_err(|source| RefreshCause::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    if frame.width() == 0 {
        return Err(RefreshCause::NoColumns {
            path: path.to_path_buf(),
        });
    }
    Ok(frame)
}

pub struct ReferenceDataLoader {
    client: Arc<ReferenceStoreClient>,
}

impl ReferenceDataLoader {
    pub fn new(client: Arc<ReferenceStoreClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ReferenceStoreClient {
        &self.client
    }

    /// Replace both reference tables with the contents of the raw files,
    /// products first. Stops at the first table that fails.
    pub async fn refresh(&self, files: &DimensionFiles) -> Result<RefreshSummary, ReferenceError> {
        info!("refreshing reference tables");
        let products_rows = self.refresh_table(PRODUCTS_TABLE, &files.products).await?;
        let stores_rows = self.refresh_table(STORES_TABLE, &files.stores).await?;
        info!(products_rows, stores_rows, "reference tables refreshed");

        Ok(RefreshSummary {
            products_rows,
            stores_rows,
        })
    }

    async fn refresh_table(&self, table: &str, path: &Path) -> Result<usize, ReferenceError> {
        let failed = |source: RefreshCause| ReferenceError::RefreshFailed {
            table: table.to_string(),
            source,
        };

        info!(table, path = %path.display(), "loading dimension file");
        let frame = read_dimension_file(path).map_err(failed)?;
        self.client
            .bulk_write(table, &frame, WriteMode::Overwrite)
            .await
            .map_err(|err| failed(err.into()))
    }

    pub async fn read_back(&self) -> Result<ReferenceTables, ReferenceError> {
        let products = self.read_table(PRODUCTS_TABLE).await?;
        let stores = self.read_table(STORES_TABLE).await?;
        Ok(ReferenceTables { products, stores })
    }

    async fn read_table(&self, table: &str) -> Result<DataFrame, ReferenceError> {
        self.client
            .bulk_read(table)
            .await
            .map_err(|source| ReferenceError::ReadFailed {
                table: table.to_string(),
                source,
            })
    }
}
