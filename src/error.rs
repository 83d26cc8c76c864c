//! Error types shared by the coordination, lifecycle and tool layers.

use thiserror::Error;

/// Failure reading or writing a persisted state file.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file contains invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Viewer web server startup and coordination errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A sibling instance of this program already serves the port. Not fatal:
    /// the caller keeps going and shares the sibling's server.
    #[error("{}", duplicate_message(.port))]
    DuplicateInstanceOnSamePort { port: Option<u16> },

    #[error("port {port} is already in use by another service on this machine")]
    PortInUseByAnotherService { port: u16 },

    #[error("failed to bind viewer web server on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

fn duplicate_message(port: &Option<u16>) -> String {
    match port {
        Some(port) => format!("another viewer web server instance is already running on port {port}"),
        None => "another viewer web server instance is starting and potentially using the same port".to_string(),
    }
}

impl ServerError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::DuplicateInstanceOnSamePort { .. })
    }
}

/// Errors surfaced to the agent by the dataset tools.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("no datasets have been uploaded in this session")]
    NoDatasets,

    #[error("dataset '{name}' not found. Available datasets: {available:?}")]
    DatasetNotFound { name: String, available: Vec<String> },

    #[error("invalid JSON in Vega-Lite specification: {0}")]
    InvalidSpecJson(#[source] serde_json::Error),

    #[error("failed to send the visualization for the '{name}' dataset to viewer web server: {source}")]
    Delivery {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("the viewer web server returned status {status} when processing the visualization for the '{name}' dataset: {body}")]
    Rejected {
        name: String,
        status: u16,
        body: String,
    },
}
