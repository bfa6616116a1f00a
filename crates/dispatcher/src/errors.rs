use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum DispatchError {
    #[error("internal: {0}")]
    Internal(String),

    #[error("request canceled")]
    Canceled,
}

impl DispatchError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}
