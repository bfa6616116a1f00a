use thiserror::Error;

use telemesh_attr::ValueType;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExprError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("type error: {0}")]
    Type(String),

    #[error("unresolved attribute {0}")]
    UnresolvedAttribute(String),

    #[error("expected {expected}, got {actual}")]
    TypeMismatch {
        expected: ValueType,
        actual: ValueType,
    },

    #[error("divide by zero")]
    DivideByZero,

    #[error("malformed argument to {builtin}: {detail}")]
    MalformedArg { builtin: String, detail: String },

    #[error("program compiled against vocabulary {program} but current vocabulary is {current}")]
    StaleProgram { program: u64, current: u64 },
}
