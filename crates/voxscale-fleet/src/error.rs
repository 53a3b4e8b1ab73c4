use thiserror::Error;
use voxscale_core::http::HttpError;
use voxscale_state::StateError;

#[derive(Debug, Error)]
pub enum FleetError {
    /// The provider refused the capacity change (quota, capacity, limits).
    #[error("capacity change rejected: {0}")]
    ApplyRejected(String),

    #[error("fleet API unavailable: {0}")]
    Unavailable(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("fallback consumer error: {0}")]
    Fallback(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl From<HttpError> for FleetError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Status { status: 404, uri } => FleetError::InstanceNotFound(uri),
            HttpError::Status { status, uri } if (400..500).contains(&status) => {
                FleetError::ApplyRejected(format!("{uri} returned status {status}"))
            }
            other => FleetError::Unavailable(other.to_string()),
        }
    }
}

pub type FleetResult<T> = Result<T, FleetError>;
