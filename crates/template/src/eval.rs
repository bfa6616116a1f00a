//! Shared helpers for template materializers: evaluate a compiled field
//! program and coerce the result into the instance's static field type.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use telemesh_attr::{AttributeBag, AttributeValue, ValueType};
use telemesh_expr::{Evaluator, ExprError, Program};

use crate::errors::InferError;

/// The signature handed to `infer_type`: expression text in, inferred result
/// type out.
pub type TypeEvalFn<'a> = dyn Fn(&str) -> Result<ValueType, ExprError> + 'a;

/// The signature handed to `compile_fields`: expression text in, compiled
/// program out. The planner binds this to the candidate vocabulary so
/// recipes are never compiled against state that may not publish.
pub type CompileFn<'a> = dyn Fn(&str) -> Result<Arc<Program>, ExprError> + 'a;

pub fn require_nonempty(field: &str, text: &str) -> Result<(), InferError> {
    if text.trim().is_empty() {
        return Err(InferError::EmptyExpression {
            field: field.to_string(),
        });
    }
    Ok(())
}

pub fn infer_field(
    field: &str,
    text: &str,
    type_of: &TypeEvalFn<'_>,
) -> Result<ValueType, InferError> {
    require_nonempty(field, text)?;
    type_of(text).map_err(|source| InferError::Expr {
        field: field.to_string(),
        source,
    })
}

pub fn infer_static_field(
    field: &str,
    text: &str,
    want: ValueType,
    type_of: &TypeEvalFn<'_>,
) -> Result<(), InferError> {
    let inferred = infer_field(field, text, type_of)?;
    if inferred != want {
        return Err(InferError::TypeCheck {
            field: field.to_string(),
            inferred,
            want,
        });
    }
    Ok(())
}

pub fn eval_value(
    evaluator: &Evaluator,
    program: &Program,
    bag: &AttributeBag,
) -> Result<AttributeValue, ExprError> {
    evaluator.eval_program(program, bag)
}

pub fn eval_string(
    evaluator: &Evaluator,
    program: &Program,
    bag: &AttributeBag,
) -> Result<String, ExprError> {
    match evaluator.eval_program(program, bag)? {
        AttributeValue::String(s) => Ok(s),
        AttributeValue::Int64(v) => Ok(v.to_string()),
        other => Err(mismatch(ValueType::String, &other)),
    }
}

pub fn eval_int64(
    evaluator: &Evaluator,
    program: &Program,
    bag: &AttributeBag,
) -> Result<i64, ExprError> {
    match evaluator.eval_program(program, bag)? {
        AttributeValue::Int64(v) => Ok(v),
        other => Err(mismatch(ValueType::Int64, &other)),
    }
}

pub fn eval_bool(
    evaluator: &Evaluator,
    program: &Program,
    bag: &AttributeBag,
) -> Result<bool, ExprError> {
    match evaluator.eval_program(program, bag)? {
        AttributeValue::Bool(v) => Ok(v),
        other => Err(mismatch(ValueType::Bool, &other)),
    }
}

pub fn eval_double(
    evaluator: &Evaluator,
    program: &Program,
    bag: &AttributeBag,
) -> Result<f64, ExprError> {
    match evaluator.eval_program(program, bag)? {
        AttributeValue::Double(v) => Ok(v),
        other => Err(mismatch(ValueType::Double, &other)),
    }
}

pub fn eval_timestamp(
    evaluator: &Evaluator,
    program: &Program,
    bag: &AttributeBag,
) -> Result<DateTime<Utc>, ExprError> {
    match evaluator.eval_program(program, bag)? {
        AttributeValue::Timestamp(v) => Ok(v),
        other => Err(mismatch(ValueType::Timestamp, &other)),
    }
}

pub fn eval_duration(
    evaluator: &Evaluator,
    program: &Program,
    bag: &AttributeBag,
) -> Result<Duration, ExprError> {
    match evaluator.eval_program(program, bag)? {
        AttributeValue::Duration(v) => Ok(v),
        other => Err(mismatch(ValueType::Duration, &other)),
    }
}

fn mismatch(expected: ValueType, actual: &AttributeValue) -> ExprError {
    ExprError::TypeMismatch {
        expected,
        actual: actual.value_type(),
    }
}
