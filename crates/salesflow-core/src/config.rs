//! Pipeline configuration read from the process environment.

use std::path::PathBuf;

use salesflow_bucket::S3Config;
use thiserror::Error;

use crate::reference_data::DimensionFiles;
use crate::reference_store::{ReferenceStoreSettings, DEFAULT_PORT};
use crate::sales::sales_file_under;
use crate::secrets::SecretRef;
use crate::warehouse::WarehouseTarget;

const REQUIRED: [&str; 8] = [
    "SALESFLOW_PROJECT_ID",
    "SALESFLOW_REGION",
    "SALESFLOW_DATA_ROOT",
    "CLOUDSQL_IP",
    "DATABASE_NAME",
    "DATABASE_USER",
    "BIGQUERY_DATASET",
    "SQL_PASSWORD_SECRET",
];

const DEFAULT_ENVIRONMENT: &str = "dev";
const DEFAULT_WAREHOUSE_ROOT: &str = "warehouse";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WarehouseBackend {
    Local(PathBuf),
    S3(S3Config),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub project_id: String,
    pub region: String,
    pub data_root: PathBuf,
    pub environment: String,
    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    pub password_secret: String,
    pub dataset: String,
    pub max_unmatched_ratio: f64,
    pub warehouse: WarehouseBackend,
}

impl PipelineConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source. Blank values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let missing: Vec<&'static str> = REQUIRED
            .iter()
            .copied()
            .filter(|key| get(key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(vec![key]));

        let db_port = match get("DATABASE_PORT") {
            Some(raw) => match raw.parse::<u16>() {
                Ok(0) | Err(_) => {
                    return Err(ConfigError::Invalid {
                        var: "DATABASE_PORT",
                        message: format!("'{raw}' is not a TCP port"),
                    })
                }
                Ok(port) => port,
            },
            None => DEFAULT_PORT,
        };

        let max_unmatched_ratio = match get("SALESFLOW_MAX_UNMATCHED_RATIO") {
            Some(raw) => match raw.parse::<f64>() {
                Ok(ratio) if (0.0..=1.0).contains(&ratio) => ratio,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "SALESFLOW_MAX_UNMATCHED_RATIO",
                        message: format!("'{raw}' is not a ratio between 0 and 1"),
                    })
                }
            },
            None => 1.0,
        };

        let warehouse = match get("SALESFLOW_WAREHOUSE_KIND").as_deref() {
            None | Some("local") => WarehouseBackend::Local(PathBuf::from(
                get("SALESFLOW_WAREHOUSE_ROOT").unwrap_or_else(|| DEFAULT_WAREHOUSE_ROOT.into()),
            )),
            Some("s3") => WarehouseBackend::S3(S3Config {
                bucket: get("S3_BUCKET").ok_or(ConfigError::Missing(vec!["S3_BUCKET"]))?,
                region: get("S3_REGION").unwrap_or_else(|| "us-east-1".into()),
                prefix: get("S3_PREFIX"),
                endpoint: get("S3_ENDPOINT_URL"),
                access_key_id: get("S3_ACCESS_KEY_ID"),
                secret_access_key: get("S3_SECRET_ACCESS_KEY"),
                force_path_style: get("S3_FORCE_PATH_STYLE")
                    .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                    .unwrap_or(false),
            }),
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "SALESFLOW_WAREHOUSE_KIND",
                    message: format!("unknown warehouse kind '{other}', expected local or s3"),
                })
            }
        };

        Ok(Self {
            project_id: required("SALESFLOW_PROJECT_ID")?,
            region: required("SALESFLOW_REGION")?,
            data_root: PathBuf::from(required("SALESFLOW_DATA_ROOT")?),
            environment: get("ENVIRONMENT").unwrap_or_else(|| DEFAULT_ENVIRONMENT.into()),
            db_host: required("CLOUDSQL_IP")?,
            db_port,
            db_name: required("DATABASE_NAME")?,
            db_user: required("DATABASE_USER")?,
            password_secret: required("SQL_PASSWORD_SECRET")?,
            dataset: required("BIGQUERY_DATASET")?,
            max_unmatched_ratio,
            warehouse,
        })
    }

    pub fn reference_settings(&self) -> ReferenceStoreSettings {
        ReferenceStoreSettings {
            host: self.db_host.clone(),
            port: self.db_port,
            database: self.db_name.clone(),
            user: self.db_user.clone(),
        }
    }

    pub fn secret_ref(&self) -> SecretRef {
        SecretRef::new(&self.password_secret, &self.project_id)
    }

    pub fn dimension_files(&self) -> DimensionFiles {
        DimensionFiles::under(&self.data_root)
    }

    pub fn sales_file(&self) -> PathBuf {
        sales_file_under(&self.data_root)
    }

    pub fn warehouse_target(&self) -> WarehouseTarget {
        WarehouseTarget::new(&self.project_id, &self.dataset)
    }
}
