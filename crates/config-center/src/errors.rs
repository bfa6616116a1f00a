use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),

    #[error("parse error in {path}: {detail}")]
    Parse { path: String, detail: String },

    #[error("resource not found")]
    NotFound,
}
