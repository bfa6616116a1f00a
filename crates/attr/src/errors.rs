use thiserror::Error;

use crate::value::ValueType;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AttrError {
    #[error("malformed wire attributes: {0}")]
    MalformedWire(String),

    #[error("global word index {index} exceeds known list of {known} words")]
    UnknownWord { index: i32, known: usize },

    #[error("attribute '{name}' declared {declared} but value is {actual}")]
    TypeMismatch {
        name: String,
        declared: ValueType,
        actual: ValueType,
    },

    #[error("attribute '{name}' declared more than once across manifests")]
    DuplicateAttribute { name: String },

    #[error("bag is read-only")]
    ReadOnly,
}
