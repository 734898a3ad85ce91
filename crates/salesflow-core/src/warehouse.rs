//! Publishes aggregate views as Parquet tables in the analytical warehouse.

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use polars::prelude::*;
use salesflow_bucket::{BucketError, BucketStore};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

pub const DAILY_SALES_TABLE: &str = "daily_sales_summary";
pub const PRODUCT_PERFORMANCE_TABLE: &str = "product_performance";
pub const STORE_PERFORMANCE_TABLE: &str = "store_performance";

const PARQUET_CONTENT_TYPE: &str = "application/vnd.apache.parquet";

#[derive(Debug, Error)]
pub enum PublishCause {
    #[error("failed to encode parquet: {0}")]
    Encode(#[from] PolarsError),
    #[error(transparent)]
    Bucket(#[from] BucketError),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to publish warehouse table {table}: {source}")]
    Failed {
        table: String,
        #[source]
        source: PublishCause,
    },
}

impl PublishError {
    pub fn table(&self) -> &str {
        match self {
            Self::Failed { table, .. } => table,
        }
    }
}

/// Warehouse coordinates: tables live under `<project>/<dataset>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseTarget {
    pub project_id: String,
    pub dataset: String,
}

impl WarehouseTarget {
    pub fn new(project_id: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            dataset: dataset.into(),
        }
    }

    pub fn table_key(&self, table: &str) -> String {
        format!("{}/{}/{}.parquet", self.project_id, self.dataset, table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedTable {
    pub table: String,
    pub key: String,
    pub rows: usize,
    pub bytes: usize,
    pub content_hash: String,
}

pub struct WarehousePublisher {
    bucket: Arc<dyn BucketStore>,
    target: WarehouseTarget,
}

impl WarehousePublisher {
    pub fn new(bucket: Arc<dyn BucketStore>, target: WarehouseTarget) -> Self {
        Self { bucket, target }
    }

    pub fn target(&self) -> &WarehouseTarget {
        &self.target
    }

    /// Replace `table` with the full contents of `view`.
    pub async fn publish(&self, view: &DataFrame, table: &str) -> Result<PublishedTable, PublishError> {
        let failed = |source: PublishCause| PublishError::Failed {
            table: table.to_string(),
            source,
        };

        let encoded = encode_parquet(view).map_err(|err| failed(err.into()))?;
        let content_hash = blake3::hash(&encoded).to_hex().to_string();
        let size = encoded.len();
        let key = self.target.table_key(table);

        self.bucket
            .put_object(&key, Bytes::from(encoded), PARQUET_CONTENT_TYPE)
            .await
            .map_err(|err| failed(err.into()))?;

        info!(
            table,
            rows = view.height(),
            bytes = size,
            hash = %content_hash,
            location = %self.bucket.describe(),
            "published warehouse table"
        );
        Ok(PublishedTable {
            table: table.to_string(),
            key,
            rows: view.height(),
            bytes: size,
            content_hash,
        })
    }

    /// Read a published table back.
    pub async fn fetch(&self, table: &str) -> Result<DataFrame, PublishError> {
        let failed = |source: PublishCause| PublishError::Failed {
            table: table.to_string(),
            source,
        };
        let bytes = self
            .bucket
            .get_object(&self.target.table_key(table))
            .await
            .map_err(|err| failed(err.into()))?;
        ParquetReader::new(Cursor::new(bytes.to_vec()))
            .finish()
            .map_err(|err| failed(err.into()))
    }
}

fn encode_parquet(df: &DataFrame) -> PolarsResult<Vec<u8>> {
    let mut buffer = Vec::new();
    {
        let mut cursor = Cursor::new(&mut buffer);
        let mut clone = df.clone();
        ParquetWriter::new(&mut cursor)
            .with_compression(ParquetCompression::Zstd(None))
            .with_statistics(StatisticsOptions::default())
            .finish(&mut clone)?;
    }
    Ok(buffer)
}
