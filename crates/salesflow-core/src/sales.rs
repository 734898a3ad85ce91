//! Reads the raw sales transaction file.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use polars::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub const TRANSACTION_COLUMNS: [&str; 7] = [
    "transaction_id",
    "product_id",
    "store_id",
    "quantity",
    "unit_price",
    "transaction_date",
    "customer_id",
];

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("could not open transaction file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse transaction file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: PolarsError,
    },
}

/// Fields that failed type coercion and were nulled instead of rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchemaViolations {
    pub quantity: u64,
    pub unit_price: u64,
}

impl SchemaViolations {
    pub fn total(&self) -> u64 {
        self.quantity + self.unit_price
    }
}

#[derive(Clone)]
pub struct TransactionBatch {
    pub frame: LazyFrame,
    pub rows: usize,
    pub violations: SchemaViolations,
}

impl fmt::Debug for TransactionBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionBatch")
            .field("rows", &self.rows)
            .field("violations", &self.violations)
            .finish_non_exhaustive()
    }
}

/// The sales file location under a data root.
pub fn sales_file_under(root: &Path) -> PathBuf {
    root.join("sales_data").join("sales_data.csv")
}

fn raw_schema() -> Schema {
    Schema::from_iter(
        TRANSACTION_COLUMNS
            .iter()
            .map(|name| (PlSmallStr::from(*name), DataType::String)),
    )
}

/// Typed projection of the raw text columns. Casts are non-strict: a value that
/// does not parse becomes null.
fn typed_columns() -> [Expr; 7] {
    [
        col("transaction_id"),
        col("product_id"),
        col("store_id"),
        col("quantity").cast(DataType::Int32),
        col("unit_price").cast(DataType::Float64),
        col("transaction_date"),
        col("customer_id"),
    ]
}

fn nulled_by_cast(name: &str, dtype: DataType) -> Expr {
    col(name)
        .is_not_null()
        .and(col(name).cast(dtype).is_null())
        .sum()
        .cast(DataType::Int64)
        .alias(name)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionDataReader;

impl TransactionDataReader {
    pub fn new() -> Self {
        Self
    }

    /// Read the transaction file against the fixed seven-column schema. Extra
    /// trailing fields are dropped and invalid UTF-8 is replaced, so a malformed
    /// row never aborts the read.
    pub fn read(&self, path: &Path) -> Result<LazyFrame, ReadError> {
        Ok(self.read_batch(path)?.frame)
    }

    /// Like [`read`](Self::read), also reporting row count and nulled fields.
    pub fn read_batch(&self, path: &Path) -> Result<TransactionBatch, ReadError> {
        let parse_error = |source: PolarsError| ReadError::Parse {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(|source| ReadError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let raw = CsvReadOptions::default()
            .with_has_header(true)
            .with_schema(Some(Arc::new(raw_schema())))
            .with_ignore_errors(true)
            .with_parse_options(
                CsvParseOptions::default()
                    .with_truncate_ragged_lines(true)
                    .with_encoding(CsvEncoding::LossyUtf8),
            )
            .into_reader_with_file_handle(file)
            .finish()
            .map_err(parse_error)?;

        let counts = raw
            .clone()
            .lazy()
            .select([
                nulled_by_cast("quantity", DataType::Int32),
                nulled_by_cast("unit_price", DataType::Float64),
            ])
            .collect()
            .map_err(parse_error)?;
        let count_of = |name: &str| -> Result<u64, ReadError> {
            let value = counts
                .column(name)
                .and_then(|column| column.i64().map(|values| values.get(0)))
                .map_err(parse_error)?;
            Ok(value.unwrap_or(0).max(0) as u64)
        };
        let violations = SchemaViolations {
            quantity: count_of("quantity")?,
            unit_price: count_of("unit_price")?,
        };

        let rows = raw.height();
        info!(path = %path.display(), rows, "read transaction file");
        if violations.total() > 0 {
            warn!(
                quantity = violations.quantity,
                unit_price = violations.unit_price,
                "transaction fields failed type coercion and were nulled"
            );
        }

        Ok(TransactionBatch {
            frame: raw.lazy().select(typed_columns()),
            rows,
            violations,
        })
    }
}
