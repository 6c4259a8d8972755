use std::path::PathBuf;

use thiserror::Error;

/// Problems with the configuration document. Always fatal, raised before
/// any region is attempted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config {path:?}: {message}")]
    Load { path: PathBuf, message: String },
    #[error("field #{index} is missing `{field}`")]
    MissingField { index: usize, field: &'static str },
    #[error("duplicate output key `{0}` in fields")]
    DuplicateOutputKey(String),
    #[error("duplicate ACS variable `{0}` in fields")]
    DuplicateVariable(String),
    #[error("output key `{0}` is reserved for geography columns")]
    ReservedOutputKey(String),
    #[error("no fields declared")]
    NoFields,
    #[error("unknown field type `{0}` (expected int, float or text)")]
    UnknownType(String),
    #[error("invalid region code `{0}` (expected 2 digits)")]
    InvalidRegion(String),
    #[error("duplicate region code `{0}`")]
    DuplicateRegion(String),
    #[error("region `{0}` is not in the catalog")]
    UnknownRegion(String),
    #[error("region catalog is empty")]
    EmptyCatalog,
    #[error("attrs_filename_template `{0}` must contain {{state}}")]
    FilenameTemplate(String),
    #[error("invalid value for `{field}`: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Region-level fetch failure. Either terminal on first sight or the result
/// of exhausting retries.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited (HTTP 429)")]
    RateLimited,
    #[error("server error (HTTP {status})")]
    Server { status: u16 },
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<FetchError> },
}

impl FetchError {
    /// Network errors, 429 and 5xx are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Transport(_) | FetchError::RateLimited | FetchError::Server { .. }
        )
    }
}

/// One unusable data row. The row is skipped, the region carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("row has {got} columns, header has {expected}")]
    ColumnCount { expected: usize, got: usize },
    #[error("missing `{0}` value")]
    MissingKey(&'static str),
    #[error("invalid `{column}` value {value:?}")]
    InvalidKey { column: &'static str, value: String },
    #[error("row state {got} does not match region {expected}")]
    RegionMismatch { expected: String, got: String },
    #[error("duplicate join key {0}")]
    DuplicateKey(String),
}

impl RowError {
    /// Stable tag used to tally skipped rows in the manifest.
    pub fn kind(&self) -> &'static str {
        match self {
            RowError::ColumnCount { .. } => "column_count",
            RowError::MissingKey(_) => "missing_key",
            RowError::InvalidKey { .. } => "invalid_key",
            RowError::RegionMismatch { .. } => "region_mismatch",
            RowError::DuplicateKey(_) => "duplicate_key",
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to write {path:?}: {source}")]
pub struct WriteError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Anything that fails a whole region.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("worker aborted: {0}")]
    Aborted(String),
}

impl RegionError {
    pub fn stage(&self) -> &'static str {
        match self {
            RegionError::Fetch(_) => "fetch",
            RegionError::Write(_) => "write",
            RegionError::Aborted(_) => "task",
        }
    }
}
