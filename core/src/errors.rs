use thiserror::Error;

use crate::model::SeriesId;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("Destination error: {0}")]
    Sink(#[from] SinkError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {path}: {error}")]
    LoadFailed {
        path: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Controller unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Controller rejected credentials (HTTP {status})")]
    AuthFailed { status: u16 },

    #[error("Series {id} not found on controller")]
    SeriesNotFound { id: SeriesId },
}

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Malformed payload: {reason}")]
    Malformed { reason: String },
}

#[derive(Error, Debug)]
pub enum SinkError {
    /// The destination refused the batch; `accepted` points of it were stored.
    #[error("Write rejected after {accepted} points: {reason}")]
    Rejected { accepted: usize, reason: String },

    #[error("Destination unavailable: {reason}")]
    Unavailable { reason: String },
}

pub type Result<T> = std::result::Result<T, ImportError>;

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Invalid {
            message: err.to_string(),
        }
    }
}

impl From<quick_xml::Error> for PayloadError {
    fn from(err: quick_xml::Error) -> Self {
        PayloadError::Malformed {
            reason: format!("XML parsing error: {}", err),
        }
    }
}

impl ImportError {
    /// Errors that make every remaining series fail the same way.
    pub fn is_systemic(&self) -> bool {
        match self {
            ImportError::Controller(ControllerError::Unavailable { .. }) => true,
            ImportError::Controller(ControllerError::AuthFailed { .. }) => true,
            ImportError::Sink(SinkError::Unavailable { .. }) => true,
            ImportError::Config(_) => true,
            _ => false,
        }
    }

    /// Errors scoped to one series; the run continues with the next one.
    pub fn should_skip_series(&self) -> bool {
        match self {
            ImportError::Controller(ControllerError::SeriesNotFound { .. }) => true,
            ImportError::Payload(PayloadError::Malformed { .. }) => true,
            _ => false,
        }
    }
}
