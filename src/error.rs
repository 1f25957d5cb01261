use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CatalogError {
    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("errors found while processing dates: {0}")]
    #[diagnostic(help("dates are YYYY-MM-DD; ranges are two dates separated by ':'"))]
    InvalidDateSpec(String),

    #[error("errors found while processing sensor paths: {0}")]
    #[diagnostic(help("sensor paths are comma separated <sensor>=<path> pairs"))]
    InvalidSensorPaths(String),

    #[error("no sensors were specified")]
    MissingSensors,

    #[error("missing required setting: {0}")]
    MissingSetting(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("trait database request failed: {0}")]
    TraitDbHttp(String),

    #[error("trait database returned status {status}: {message}")]
    TraitDbStatus { status: u16, message: String },

    #[error("BrAPI request failed: {0}")]
    BrapiHttp(String),

    #[error("BrAPI returned status {status}: {message}")]
    BrapiStatus { status: u16, message: String },

    #[error("storage request failed: {0}")]
    StorageHttp(String),

    #[error("storage service returned status {status}: {message}")]
    StorageStatus { status: u16, message: String },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("transfer task {task_id} did not finish within {seconds}s")]
    TransferTimeout { task_id: String, seconds: u64 },

    #[error("unable to convert WKT to a geometry: {0}")]
    InvalidGeometry(String),

    #[error("unable to find matching cultivars for sites: {0}")]
    MissingCultivar(String),

    #[error("no seasons were found for the requested dates")]
    NoSeasons,

    #[error("unable to resolve sidecar through reference file: {0}")]
    SidecarReference(String),

    #[error("malformed JSON in {path}: {message}")]
    MalformedJson { path: String, message: String },

    #[error("missing expected key '{key}' in {context}")]
    MissingKey { key: String, context: String },

    #[error("unable to match file {0} to a plot")]
    #[diagnostic(help(
        "no site of the file's season has a sitename equal to one of the path segments"
    ))]
    PlotNotMatched(String),

    #[error("no weather coverage for file {0}")]
    NoWeatherCoverage(String),

    #[error("inverted weather bracket for file {file}: start index {start} > finish index {finish}")]
    InvertedBracket {
        file: String,
        start: usize,
        finish: usize,
    },

    #[error("CSV import failed: {0}")]
    Csv(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl CatalogError {
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            CatalogError::InvalidDate(_)
                | CatalogError::InvalidDateSpec(_)
                | CatalogError::InvalidSensorPaths(_)
                | CatalogError::MissingSensors
                | CatalogError::MissingSetting(_)
                | CatalogError::ConfigRead(_)
                | CatalogError::ConfigParse(_)
        )
    }

    pub fn is_correlation_error(&self) -> bool {
        matches!(
            self,
            CatalogError::PlotNotMatched(_)
                | CatalogError::NoWeatherCoverage(_)
                | CatalogError::InvertedBracket { .. }
                | CatalogError::MissingCultivar(_)
        )
    }
}

impl From<rusqlite::Error> for CatalogError {
    fn from(err: rusqlite::Error) -> Self {
        CatalogError::Database(err.to_string())
    }
}
