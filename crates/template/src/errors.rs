use thiserror::Error;

use telemesh_attr::ValueType;
use telemesh_expr::ExprError;

/// Failure while inferring an instance's types against the vocabulary.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InferError {
    #[error("expression for field {field} cannot be empty")]
    EmptyExpression { field: String },

    #[error("error type checking for field {field}: evaluated expression type {inferred} want {want}")]
    TypeCheck {
        field: String,
        inferred: ValueType,
        want: ValueType,
    },

    #[error("error type checking for field {field}: {source}")]
    Expr {
        field: String,
        source: ExprError,
    },
}

/// Error surfaced by an adapter handler or builder.
#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct AdapterError {
    pub message: String,
}

impl AdapterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
