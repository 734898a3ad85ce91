use async_trait::async_trait;
use pg_escape::quote_identifier;
use polars::prelude::{Column, DataFrame, DataType, NamedFrom, Series};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tokio::sync::OnceCell;
use tracing::debug;

use super::{ConnectionDescriptor, StoreError, TableStore};
use crate::db;

// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

/// Postgres-backed reference tables. Every column is stored as `TEXT`.
#[derive(Debug, Default)]
pub struct PgTableStore {
    pool: OnceCell<PgPool>,
}

impl PgTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse an existing pool instead of connecting from a descriptor.
    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool: OnceCell::new_with(Some(pool)),
        }
    }

    async fn pool(&self, descriptor: &ConnectionDescriptor) -> Result<&PgPool, StoreError> {
        self.pool
            .get_or_try_init(|| db::connect(descriptor))
            .await
    }
}

type TextColumn = (String, Vec<Option<String>>);

fn text_columns(rows: &DataFrame) -> Result<Vec<TextColumn>, StoreError> {
    rows.get_columns()
        .iter()
        .map(|column| {
            let as_text = column.cast(&DataType::String)?;
            let values = as_text
                .str()?
                .into_iter()
                .map(|value| value.map(str::to_string))
                .collect();
            Ok((column.name().to_string(), values))
        })
        .collect()
}

#[async_trait]
impl TableStore for PgTableStore {
    async fn replace_table(
        &self,
        descriptor: &ConnectionDescriptor,
        table: &str,
        rows: &DataFrame,
    ) -> Result<usize, StoreError> {
        if rows.width() == 0 {
            return Err(StoreError::InvalidRows {
                table: table.to_string(),
                reason: "row set has no columns".to_string(),
            });
        }

        let columns = text_columns(rows)?;
        let height = rows.height();
        let table_ident = quote_identifier(table);
        let column_idents: Vec<String> = columns
            .iter()
            .map(|(name, _)| quote_identifier(name).into_owned())
            .collect();
        let column_defs = column_idents
            .iter()
            .map(|ident| format!("{ident} TEXT"))
            .collect::<Vec<_>>()
            .join(", ");
        let column_list = column_idents.join(", ");

        let pool = self.pool(descriptor).await?;

        // DDL is transactional in Postgres: until COMMIT, readers keep seeing the
        // previous table, and a failure anywhere rolls the whole swap back.
        let mut tx = pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {table_ident}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("CREATE TABLE {table_ident} ({column_defs})"))
            .execute(&mut *tx)
            .await?;

        let chunk_rows = (MAX_BIND_PARAMS / columns.len()).max(1);
        let mut start = 0;
        while start < height {
            let end = (start + chunk_rows).min(height);
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {table_ident} ({column_list}) "));
            builder.push_values(start..end, |mut row, idx| {
                for (_, values) in &columns {
                    row.push_bind(values[idx].clone());
                }
            });
            builder.build().execute(&mut *tx).await?;
            debug!(table, from = start, to = end, "inserted reference rows");
            start = end;
        }

        tx.commit().await?;
        Ok(height)
    }

    async fn read_table(
        &self,
        descriptor: &ConnectionDescriptor,
        table: &str,
    ) -> Result<DataFrame, StoreError> {
        let pool = self.pool(descriptor).await?;

        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT column_name::text
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(pool)
        .await?;

        if names.is_empty() {
            return Err(StoreError::MissingTable(table.to_string()));
        }

        let select_list = names
            .iter()
            .map(|name| {
                let ident = quote_identifier(name);
                format!("{ident}::text AS {ident}")
            })
            .collect::<Vec<_>>()
            .join(", ");
        // ctid follows insertion order for a freshly loaded table, which keeps
        // "last row wins" meaningful downstream.
        let query = format!(
            "SELECT {select_list} FROM {} ORDER BY ctid",
            quote_identifier(table)
        );
        let records = sqlx::query(&query).fetch_all(pool).await?;

        let mut values: Vec<Vec<Option<String>>> =
            vec![Vec::with_capacity(records.len()); names.len()];
        for record in &records {
            for (idx, column) in values.iter_mut().enumerate() {
                column.push(record.try_get::<Option<String>, _>(idx)?);
            }
        }

        let columns: Vec<Column> = names
            .iter()
            .zip(values)
            .map(|(name, column)| Series::new(name.as_str().into(), column).into())
            .collect();
        Ok(DataFrame::new(columns)?)
    }

    async fn release(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
            debug!("closed reference store pool");
        }
    }
}
