use salesflow_bucket::BucketError;
use thiserror::Error;

use crate::analytics::TransformError;
use crate::config::ConfigError;
use crate::reference_data::{RefreshCause, ReferenceError};
use crate::reference_store::StoreError;
use crate::sales::ReadError;
use crate::secrets::SecretError;
use crate::warehouse::PublishError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("warehouse backend unavailable: {0}")]
    Warehouse(#[from] BucketError),

    #[error("reference store at {endpoint} failed its health check")]
    HealthCheckFailed { endpoint: String },

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl PipelineError {
    /// Stable machine-readable name of the failure class.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration_invalid",
            Self::Secret(_) => "credential_unavailable",
            Self::Store(err) => store_code(err),
            Self::Reference(ReferenceError::RefreshFailed { source, .. }) => match source {
                RefreshCause::Store(err) if is_connection_problem(err) => store_code(err),
                _ => "reference_refresh_failed",
            },
            Self::Reference(ReferenceError::ReadFailed { source, .. }) => {
                if is_connection_problem(source) {
                    store_code(source)
                } else {
                    "reference_read_failed"
                }
            }
            Self::Read(_) => "transaction_read_failed",
            Self::Transform(TransformError::InvariantViolation(_)) => {
                "transform_invariant_violation"
            }
            Self::Transform(_) => "transform_failed",
            Self::Publish(_) => "publish_failed",
            Self::Warehouse(_) => "configuration_invalid",
            Self::HealthCheckFailed { .. } => "connection_parameter_invalid",
            Self::Task(_) => "internal",
        }
    }
}

fn is_connection_problem(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::Secret(_) | StoreError::ConnectionParameterInvalid(_)
    )
}

fn store_code(err: &StoreError) -> &'static str {
    match err {
        StoreError::Secret(_) => "credential_unavailable",
        StoreError::ConnectionParameterInvalid(_) => "connection_parameter_invalid",
        _ => "reference_store_failed",
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
