use std::time::Duration;

use thiserror::Error;
use voxscale_core::http::HttpError;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("queue not found: {0}")]
    NotFound(String),

    #[error("scrape timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid reading: {0}")]
    InvalidReading(String),
}

impl From<HttpError> for MonitorError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Timeout(d) => MonitorError::Timeout(d),
            HttpError::Status { status: 404, uri } => MonitorError::NotFound(uri),
            HttpError::Decode(reason) => MonitorError::InvalidReading(reason),
            other => MonitorError::SourceUnavailable(other.to_string()),
        }
    }
}

pub type MonitorResult<T> = Result<T, MonitorError>;
