use thiserror::Error;

use telemesh_core_types::{Status, StatusCode};

/// Errors the service surfaces to the transport instead of a response.
/// Everything else (denials, quota exhaustion) travels inside the response
/// status.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("startup: {0}")]
    Startup(String),
}

impl ServiceError {
    pub fn status(&self) -> Status {
        match self {
            ServiceError::InvalidArgument(message) => {
                Status::new(StatusCode::InvalidArgument, message.clone())
            }
            ServiceError::Internal(message) | ServiceError::Startup(message) => {
                Status::new(StatusCode::Internal, message.clone())
            }
        }
    }
}
