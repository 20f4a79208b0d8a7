use std::path::PathBuf;

use chrono::NaiveDate;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("missing config file {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("feed request failed for {location}: {message}")]
    FeedHttp { location: String, message: String },

    #[error("feed {location} returned status {status}: {message}")]
    FeedStatus {
        location: String,
        status: u16,
        message: String,
    },

    #[error("malformed feed {feed}: {message}")]
    MalformedFeed { feed: String, message: String },

    #[error("reference table {location}: {message}")]
    Reference { location: String, message: String },

    #[error("backfill cardinality violated for {entity}: expected {expected} rows, found {found}")]
    #[diagnostic(help("duplicate or missing dates after reindexing point at an entity-resolution bug"))]
    BackfillCardinality {
        entity: String,
        expected: usize,
        found: usize,
        duplicate: Option<NaiveDate>,
    },

    #[error("no observations to process: {0}")]
    EmptyDataset(String),

    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),

    #[error("failed to encode output: {0}")]
    Encode(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl PipelineError {
    pub fn malformed(feed: &str, message: impl Into<String>) -> Self {
        PipelineError::MalformedFeed {
            feed: feed.to_string(),
            message: message.into(),
        }
    }
}
