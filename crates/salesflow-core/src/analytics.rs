//! Enrichment of transactions with reference dimensions and the three aggregate views.
//!
//! All grouping is done by the dataframe engine, so the results do not depend on
//! input row order or on how many worker threads polars uses. Every view is sorted
//! by its grouping keys with nulls last, which keeps reruns byte-identical.

use polars::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

const PRODUCT_MATCH: &str = "__product_matched";
const STORE_MATCH: &str = "__store_matched";
const REVENUE_TOLERANCE: f64 = 1e-6;

pub const PRODUCT_ATTRIBUTES: [&str; 2] = ["product_name", "category"];
pub const STORE_ATTRIBUTES: [&str; 2] = ["store_name", "store_location"];

pub const DAILY_SALES_KEYS: [&str; 4] = [
    "transaction_date",
    "store_id",
    "store_name",
    "store_location",
];
pub const PRODUCT_PERFORMANCE_KEYS: [&str; 3] = ["product_id", "product_name", "category"];
pub const STORE_PERFORMANCE_KEYS: [&str; 3] = ["store_id", "store_name", "store_location"];

const ENRICHED_COLUMNS: [&str; 12] = [
    "transaction_id",
    "product_id",
    "store_id",
    "quantity",
    "unit_price",
    "transaction_date",
    "customer_id",
    "total_amount",
    "product_name",
    "category",
    "store_name",
    "store_location",
];

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("polars operation failed: {0}")]
    Polars(#[from] PolarsError),

    #[error("{frame} frame has no {column} column")]
    MissingColumn {
        frame: &'static str,
        column: &'static str,
    },

    #[error("transform invariant violated: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, TransformError>;

/// Transactions joined with both dimensions, plus how many rows found no match.
#[derive(Debug, Clone)]
pub struct Enrichment {
    pub frame: DataFrame,
    pub stats: MatchStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchStats {
    pub transaction_rows: usize,
    pub unmatched_products: usize,
    pub unmatched_stores: usize,
    /// Rows missing either dimension.
    pub unmatched_any: usize,
}

impl MatchStats {
    pub fn unmatched_ratio(&self) -> f64 {
        if self.transaction_rows == 0 {
            0.0
        } else {
            self.unmatched_any as f64 / self.transaction_rows as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalyticsViews {
    pub daily_sales: DataFrame,
    pub product_performance: DataFrame,
    pub store_performance: DataFrame,
    pub stats: MatchStats,
}

#[derive(Debug, Clone)]
pub struct AnalyticsTransformer {
    max_unmatched_ratio: f64,
}

impl Default for AnalyticsTransformer {
    fn default() -> Self {
        Self {
            max_unmatched_ratio: 1.0,
        }
    }
}

impl AnalyticsTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the run when more than `ratio` of transactions miss a dimension match.
    /// `1.0` disables the check.
    pub fn with_max_unmatched_ratio(mut self, ratio: f64) -> Self {
        self.max_unmatched_ratio = ratio;
        self
    }

    pub fn max_unmatched_ratio(&self) -> f64 {
        self.max_unmatched_ratio
    }

    pub fn transform(
        &self,
        transactions: LazyFrame,
        products: LazyFrame,
        stores: LazyFrame,
    ) -> Result<AnalyticsViews> {
        let enrichment = self.enrich(transactions, products, stores)?;
        let enriched = enrichment.frame.clone().lazy();

        let daily_sales = daily_sales_summary(enriched.clone()).collect()?;
        let product_performance = product_performance(enriched.clone()).collect()?;
        let store_performance = store_performance(enriched).collect()?;

        let views = AnalyticsViews {
            daily_sales,
            product_performance,
            store_performance,
            stats: enrichment.stats,
        };
        self.verify_invariants(&enrichment, &views)?;

        info!(
            transactions = enrichment.stats.transaction_rows,
            daily_rows = views.daily_sales.height(),
            product_rows = views.product_performance.height(),
            store_rows = views.store_performance.height(),
            "computed analytics views"
        );
        Ok(views)
    }

    /// Left-join transactions to products on `product_id`, then to stores on
    /// `store_id`. Unmatched dimension fields are null.
    pub fn enrich(
        &self,
        transactions: LazyFrame,
        products: LazyFrame,
        stores: LazyFrame,
    ) -> Result<Enrichment> {
        let transactions = normalize_transactions(transactions).collect()?;
        let transaction_rows = transactions.height();

        let products = prepare_dimension(
            products.collect()?,
            "products",
            "product_id",
            &PRODUCT_ATTRIBUTES,
            PRODUCT_MATCH,
        )?;
        let stores = prepare_dimension(
            stores.collect()?,
            "stores",
            "store_id",
            &STORE_ATTRIBUTES,
            STORE_MATCH,
        )?;

        let joined = transactions
            .lazy()
            .join(
                products,
                [col("product_id")],
                [col("product_id")],
                JoinArgs::new(JoinType::Left),
            )
            .join(
                stores,
                [col("store_id")],
                [col("store_id")],
                JoinArgs::new(JoinType::Left),
            )
            .collect()?;

        let product_missing = joined.column(PRODUCT_MATCH)?.is_null();
        let store_missing = joined.column(STORE_MATCH)?.is_null();
        let unmatched_products = product_missing.num_trues();
        let unmatched_stores = store_missing.num_trues();
        let unmatched_any = (&product_missing | &store_missing).num_trues();

        let frame = joined.select(ENRICHED_COLUMNS)?;
        let stats = MatchStats {
            transaction_rows,
            unmatched_products,
            unmatched_stores,
            unmatched_any,
        };
        debug!(?stats, "enriched transactions");
        Ok(Enrichment { frame, stats })
    }

    /// Check the properties every run must satisfy before anything is published.
    pub fn verify_invariants(&self, enrichment: &Enrichment, views: &AnalyticsViews) -> Result<()> {
        let stats = &enrichment.stats;
        if enrichment.frame.height() != stats.transaction_rows {
            return Err(TransformError::InvariantViolation(format!(
                "enrichment produced {} rows from {} transactions",
                enrichment.frame.height(),
                stats.transaction_rows
            )));
        }

        let expected = float_sum(&enrichment.frame, "total_amount")?;
        for (view, column, frame) in [
            ("daily_sales_summary", "daily_revenue", &views.daily_sales),
            ("product_performance", "total_revenue", &views.product_performance),
            ("store_performance", "total_revenue", &views.store_performance),
        ] {
            let actual = float_sum(frame, column)?;
            if (actual - expected).abs() > REVENUE_TOLERANCE * expected.abs().max(1.0) {
                return Err(TransformError::InvariantViolation(format!(
                    "{view}.{column} sums to {actual}, transactions sum to {expected}"
                )));
            }
        }

        let ratio = stats.unmatched_ratio();
        if ratio > self.max_unmatched_ratio {
            return Err(TransformError::InvariantViolation(format!(
                "{} of {} transactions have no product or store match ({ratio:.4} > {:.4})",
                stats.unmatched_any, stats.transaction_rows, self.max_unmatched_ratio
            )));
        }
        Ok(())
    }
}

/// Highest-revenue rows of a view, nulls last, ties in view order.
pub fn top_by_revenue(view: &DataFrame, revenue_column: &str, n: usize) -> Result<DataFrame> {
    let limit = IdxSize::try_from(n).unwrap_or(IdxSize::MAX);
    Ok(view
        .clone()
        .lazy()
        .sort(
            [revenue_column],
            SortMultipleOptions::default()
                .with_order_descending(true)
                .with_nulls_last(true)
                .with_maintain_order(true),
        )
        .limit(limit)
        .collect()?)
}

fn float_sum(frame: &DataFrame, column: &str) -> Result<f64> {
    let values = frame.column(column)?.cast(&DataType::Float64)?;
    Ok(values.f64()?.sum().unwrap_or(0.0))
}

fn normalize_transactions(transactions: LazyFrame) -> LazyFrame {
    let date_format = StrptimeOptions {
        format: Some("%Y-%m-%d".into()),
        strict: false,
        ..Default::default()
    };

    transactions
        .select([
            col("transaction_id").cast(DataType::String),
            col("product_id").cast(DataType::String),
            col("store_id").cast(DataType::String),
            col("quantity").cast(DataType::Int64),
            col("unit_price").cast(DataType::Float64),
            col("transaction_date")
                .cast(DataType::String)
                .str()
                .to_date(date_format),
            col("customer_id").cast(DataType::String),
        ])
        .with_column(
            (col("quantity").cast(DataType::Float64) * col("unit_price")).alias("total_amount"),
        )
}

/// Reduce a dimension to its key and fixed attributes, one row per key with the
/// last occurrence winning. Attributes the file does not carry become null text.
fn prepare_dimension(
    mut frame: DataFrame,
    name: &'static str,
    key: &'static str,
    attributes: &[&'static str],
    marker: &'static str,
) -> Result<LazyFrame> {
    if frame.column(key).is_err() {
        return Err(TransformError::MissingColumn { frame: name, column: key });
    }
    for attribute in attributes {
        if frame.column(attribute).is_err() {
            debug!(dimension = name, attribute, "dimension attribute absent, filling nulls");
            frame.with_column(Series::full_null(
                (*attribute).into(),
                frame.height(),
                &DataType::String,
            ))?;
        }
    }

    let mut projection = vec![col(key).cast(DataType::String)];
    projection.extend(attributes.iter().map(|a| col(*a).cast(DataType::String)));

    let mut latest: Vec<Expr> = attributes.iter().map(|a| col(*a).last()).collect();
    latest.push(col(marker).last());

    Ok(frame
        .lazy()
        .select(projection)
        .with_column(lit(true).alias(marker))
        .group_by_stable([col(key)])
        .agg(latest))
}

fn daily_sales_summary(enriched: LazyFrame) -> LazyFrame {
    enriched
        .group_by(DAILY_SALES_KEYS.map(col))
        .agg([
            col("total_amount").sum().alias("daily_revenue"),
            col("quantity").sum().cast(DataType::Int64).alias("daily_quantity"),
            count_distinct("transaction_id").alias("daily_transactions"),
            count_distinct("customer_id").alias("unique_customers"),
        ])
        .sort(DAILY_SALES_KEYS, by_keys())
}

fn product_performance(enriched: LazyFrame) -> LazyFrame {
    enriched
        .group_by(PRODUCT_PERFORMANCE_KEYS.map(col))
        .agg([
            col("total_amount").sum().alias("total_revenue"),
            col("quantity").sum().cast(DataType::Int64).alias("total_quantity_sold"),
            col("unit_price").mean().alias("avg_unit_price"),
            count_distinct("store_id").alias("stores_sold_in"),
        ])
        .sort(PRODUCT_PERFORMANCE_KEYS, by_keys())
}

fn store_performance(enriched: LazyFrame) -> LazyFrame {
    enriched
        .group_by(STORE_PERFORMANCE_KEYS.map(col))
        .agg([
            col("total_amount").sum().alias("total_revenue"),
            col("quantity").sum().cast(DataType::Int64).alias("total_items_sold"),
            count_distinct("product_id").alias("unique_products"),
            count_distinct("customer_id").alias("unique_customers"),
        ])
        .sort(STORE_PERFORMANCE_KEYS, by_keys())
}

// COUNT(DISTINCT x): nulls are not a value.
fn count_distinct(name: &str) -> Expr {
    col(name).drop_nulls().n_unique().cast(DataType::Int64)
}

fn by_keys() -> SortMultipleOptions {
    SortMultipleOptions::default()
        .with_nulls_last(true)
        .with_maintain_order(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_keeps_last_row_per_key() -> Result<()> {
        let products = df!(
            "product_id" => ["p1", "p2", "p1"],
            "product_name" => ["Old", "Other", "New"],
            "category" => ["A", "B", "C"],
            "unit_price" => ["1.0", "2.0", "3.0"],
        )?;
        let prepared = prepare_dimension(
            products,
            "products",
            "product_id",
            &PRODUCT_ATTRIBUTES,
            PRODUCT_MATCH,
        )?
        .collect()?;

        assert_eq!(prepared.height(), 2);
        assert!(prepared.column("unit_price").is_err());
        let p1 = prepared
            .lazy()
            .filter(col("product_id").eq(lit("p1")))
            .collect()?;
        assert_eq!(p1.column("product_name")?.str()?.get(0), Some("New"));
        Ok(())
    }

    #[test]
    fn missing_attribute_becomes_null_column() -> Result<()> {
        let stores = df!("store_id" => ["s1"], "store_name" => ["North"])?;
        let prepared =
            prepare_dimension(stores, "stores", "store_id", &STORE_ATTRIBUTES, STORE_MATCH)?
                .collect()?;
        let location = prepared.column("store_location")?;
        assert_eq!(location.dtype(), &DataType::String);
        assert_eq!(location.null_count(), 1);
        Ok(())
    }

    #[test]
    fn dimension_without_key_is_rejected() {
        let frame = df!("name" => ["x"]).expect("frame");
        let result =
            prepare_dimension(frame, "products", "product_id", &PRODUCT_ATTRIBUTES, PRODUCT_MATCH);
        assert!(matches!(
            result,
            Err(TransformError::MissingColumn { column: "product_id", .. })
        ));
    }

    #[test]
    fn top_by_revenue_orders_descending_with_nulls_last() -> Result<()> {
        let view = df!(
            "product_id" => ["a", "b", "c", "d"],
            "total_revenue" => [Some(5.0), None, Some(9.0), Some(1.0)],
        )?;
        let top = top_by_revenue(&view, "total_revenue", 3)?;
        let ids: Vec<_> = top.column("product_id")?.str()?.into_iter().flatten().collect();
        assert_eq!(ids, vec!["c", "a", "d"]);
        Ok(())
    }
}
