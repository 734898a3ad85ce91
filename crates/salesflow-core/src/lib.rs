pub mod analytics;
pub mod config;
pub mod db;
pub mod driver;
pub mod error;
pub mod reference_data;
pub mod reference_store;
pub mod sales;
pub mod secrets;
pub mod warehouse;

pub use config::PipelineConfig;
pub use driver::{DriverError, PipelineDriver, RunReport, Stage};
pub use error::{PipelineError, Result};
