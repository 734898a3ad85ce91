//! Sequences one pipeline run and owns top-level failure reporting.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use polars::prelude::{DataFrame, IntoLazy};
use salesflow_bucket::{BucketStore, LocalBucketStore, S3BucketStore};
use serde::Serialize;
use thiserror::Error;
use tokio::task;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::analytics::{top_by_revenue, AnalyticsTransformer, AnalyticsViews, MatchStats};
use crate::config::{PipelineConfig, WarehouseBackend};
use crate::error::PipelineError;
use crate::reference_data::{DimensionFiles, ReferenceDataLoader, RefreshSummary};
use crate::reference_store::{PgTableStore, ReferenceStoreClient, TableStore};
use crate::sales::{sales_file_under, SchemaViolations, TransactionDataReader};
use crate::secrets::SecretResolver;
use crate::warehouse::{
    PublishedTable, WarehousePublisher, DAILY_SALES_TABLE, PRODUCT_PERFORMANCE_TABLE,
    STORE_PERFORMANCE_TABLE,
};

const TOP_N: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    ReadInputs,
    SetupReferenceData,
    ReadReferenceData,
    Transform,
    Publish,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::ReadInputs => "read_inputs",
            Stage::SetupReferenceData => "setup_reference_data",
            Stage::ReadReferenceData => "read_reference_data",
            Stage::Transform => "transform",
            Stage::Publish => "publish",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("pipeline failed during {stage}: {source}")]
pub struct DriverError {
    pub stage: Stage,
    #[source]
    pub source: PipelineError,
}

impl DriverError {
    pub fn code(&self) -> &'static str {
        self.source.code()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub environment: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub transaction_rows: usize,
    pub schema_violations: SchemaViolations,
    pub reference: RefreshSummary,
    pub matching: MatchStats,
    pub published: Vec<PublishedTable>,
    pub stages: Vec<Stage>,
}

/// Keeps the reference store's connections alive for one run.
///
/// Call [`release`](Self::release) on every exit path. Dropping an unreleased session
/// schedules the release on the current runtime and logs a warning.
pub struct ComputeSession {
    store: Option<Arc<dyn TableStore>>,
}

impl ComputeSession {
    pub fn open(store: Arc<dyn TableStore>) -> Self {
        info!("compute session opened");
        Self { store: Some(store) }
    }

    pub async fn release(mut self) {
        if let Some(store) = self.store.take() {
            store.release().await;
            info!("compute session released");
        }
    }
}

impl Drop for ComputeSession {
    fn drop(&mut self) {
        if let Some(store) = self.store.take() {
            warn!("compute session dropped without release");
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { store.release().await });
                }
                Err(_) => warn!("no runtime available to release compute session"),
            }
        }
    }
}

/// The stage currently executing, plus every stage entered so far.
struct Progress {
    current: Stage,
    visited: Vec<Stage>,
}

impl Progress {
    fn new() -> Self {
        Self {
            current: Stage::Init,
            visited: vec![Stage::Init],
        }
    }

    fn enter(&mut self, next: Stage) {
        info!(from = %self.current, to = %next, "pipeline stage transition");
        self.current = next;
        self.visited.push(next);
    }
}

/// Build the reference store client from configuration, backed by Postgres.
pub fn reference_client(config: &PipelineConfig) -> ReferenceStoreClient {
    let resolver = Arc::new(SecretResolver::with_default_providers(config.secret_ref()));
    ReferenceStoreClient::new(
        config.reference_settings(),
        resolver,
        Arc::new(PgTableStore::new()),
    )
}

pub async fn warehouse_bucket(
    backend: &WarehouseBackend,
) -> Result<Arc<dyn BucketStore>, PipelineError> {
    Ok(match backend {
        WarehouseBackend::Local(root) => Arc::new(LocalBucketStore::new(root.clone())),
        WarehouseBackend::S3(settings) => {
            Arc::new(S3BucketStore::new(settings.clone()).await?)
        }
    })
}

pub struct PipelineDriver {
    environment: String,
    sales_file: PathBuf,
    dimension_files: DimensionFiles,
    reader: TransactionDataReader,
    loader: ReferenceDataLoader,
    transformer: AnalyticsTransformer,
    publisher: WarehousePublisher,
}

impl PipelineDriver {
    /// A driver reading its raw files from the standard layout under `data_root`.
    pub fn new(
        environment: impl Into<String>,
        data_root: &Path,
        client: Arc<ReferenceStoreClient>,
        publisher: WarehousePublisher,
    ) -> Self {
        Self {
            environment: environment.into(),
            sales_file: sales_file_under(data_root),
            dimension_files: DimensionFiles::under(data_root),
            reader: TransactionDataReader::new(),
            loader: ReferenceDataLoader::new(client),
            transformer: AnalyticsTransformer::new(),
            publisher,
        }
    }

    pub async fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let bucket = warehouse_bucket(&config.warehouse).await?;
        let publisher = WarehousePublisher::new(bucket, config.warehouse_target());
        let driver = Self::new(
            config.environment.clone(),
            &config.data_root,
            Arc::new(reference_client(config)),
            publisher,
        )
        .with_transformer(
            AnalyticsTransformer::new().with_max_unmatched_ratio(config.max_unmatched_ratio),
        );
        Ok(driver)
    }

    pub fn with_transformer(mut self, transformer: AnalyticsTransformer) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Execute one full run. The first failure aborts the run and is returned with
    /// the stage it happened in; the compute session is released either way.
    pub async fn run(&self) -> Result<RunReport, DriverError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("pipeline_run", %run_id, environment = %self.environment);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunReport, DriverError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut progress = Progress::new();

        let session = ComputeSession::open(self.loader.client().store());
        let outcome = self.execute(&mut progress).await;
        session.release().await;

        match outcome {
            Ok(completed) => {
                progress.enter(Stage::Done);
                let report = RunReport {
                    run_id,
                    environment: self.environment.clone(),
                    started_at,
                    finished_at: Utc::now(),
                    elapsed_ms: clock.elapsed().as_millis() as u64,
                    transaction_rows: completed.transaction_rows,
                    schema_violations: completed.violations,
                    reference: completed.reference,
                    matching: completed.matching,
                    published: completed.published,
                    stages: progress.visited,
                };
                info!(elapsed_ms = report.elapsed_ms, "pipeline run completed");
                Ok(report)
            }
            Err(source) => {
                let stage = progress.current;
                progress.enter(Stage::Failed);
                error!(%stage, code = source.code(), error = %source, "pipeline run failed");
                Err(DriverError { stage, source })
            }
        }
    }

    async fn execute(&self, progress: &mut Progress) -> Result<Completed, PipelineError> {
        progress.enter(Stage::ReadInputs);
        let reader = self.reader;
        let sales_file = self.sales_file.clone();
        let batch = task::spawn_blocking(move || reader.read_batch(&sales_file)).await??;

        progress.enter(Stage::SetupReferenceData);
        let client = self.loader.client();
        if !client.health_check().await? {
            // Surface the underlying parameter or credential failure when there is one.
            client.build_connection_descriptor().await?;
            return Err(PipelineError::HealthCheckFailed {
                endpoint: client.settings().endpoint(),
            });
        }
        let reference = self.loader.refresh(&self.dimension_files).await?;

        progress.enter(Stage::ReadReferenceData);
        let tables = self.loader.read_back().await?;

        progress.enter(Stage::Transform);
        let transformer = self.transformer.clone();
        let transactions = batch.frame;
        let views = task::spawn_blocking(move || {
            transformer.transform(transactions, tables.products.lazy(), tables.stores.lazy())
        })
        .await??;

        progress.enter(Stage::Publish);
        let mut published = Vec::with_capacity(3);
        for (table, view) in [
            (DAILY_SALES_TABLE, &views.daily_sales),
            (PRODUCT_PERFORMANCE_TABLE, &views.product_performance),
            (STORE_PERFORMANCE_TABLE, &views.store_performance),
        ] {
            published.push(self.publisher.publish(view, table).await?);
        }
        log_top_performers(&views);

        Ok(Completed {
            transaction_rows: batch.rows,
            violations: batch.violations,
            reference,
            matching: views.stats,
            published,
        })
    }
}

struct Completed {
    transaction_rows: usize,
    violations: SchemaViolations,
    reference: RefreshSummary,
    matching: MatchStats,
    published: Vec<PublishedTable>,
}

fn log_top_performers(views: &AnalyticsViews) {
    let top = |view: &DataFrame| top_by_revenue(view, "total_revenue", TOP_N);
    match top(&views.product_performance) {
        Ok(frame) => info!("top {TOP_N} products by revenue:\n{frame}"),
        Err(err) => warn!("could not rank products: {err}"),
    }
    match top(&views.store_performance) {
        Ok(frame) => info!("top {TOP_N} stores by revenue:\n{frame}"),
        Err(err) => warn!("could not rank stores: {err}"),
    }
}
