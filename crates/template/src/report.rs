//! Report template: one telemetry record per instance, delivered to the
//! handler as a batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use telemesh_attr::{AttributeBag, AttributeValue, ValueType};
use telemesh_expr::{Evaluator, ExprError, Program};

use crate::errors::InferError;
use crate::eval;

/// Configured expression per instance field.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct InstanceParam {
    pub value: String,
    pub dimensions: BTreeMap<String, String>,
    pub int64_primitive: String,
    pub bool_primitive: String,
    pub double_primitive: String,
    pub string_primitive: String,
    pub timestamp: String,
    pub duration: String,
}

/// Inferred types delivered to the handler builder before construction.
#[derive(Clone, Debug, PartialEq)]
pub struct Type {
    pub value: ValueType,
    pub dimensions: BTreeMap<String, ValueType>,
}

/// Fully materialized record handed to `handle_report`.
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub name: String,
    pub value: AttributeValue,
    pub dimensions: BTreeMap<String, AttributeValue>,
    pub int64_primitive: i64,
    pub bool_primitive: bool,
    pub double_primitive: f64,
    pub string_primitive: String,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
}

pub fn infer_type(
    param: &InstanceParam,
    type_of: &eval::TypeEvalFn<'_>,
) -> Result<Type, InferError> {
    let value = eval::infer_field("value", &param.value, type_of)?;
    let mut dimensions = BTreeMap::new();
    for (key, expression) in &param.dimensions {
        let field = format!("dimensions[{key}]");
        dimensions.insert(key.clone(), eval::infer_field(&field, expression, type_of)?);
    }
    eval::infer_static_field(
        "int64_primitive",
        &param.int64_primitive,
        ValueType::Int64,
        type_of,
    )?;
    eval::infer_static_field(
        "bool_primitive",
        &param.bool_primitive,
        ValueType::Bool,
        type_of,
    )?;
    eval::infer_static_field(
        "double_primitive",
        &param.double_primitive,
        ValueType::Double,
        type_of,
    )?;
    eval::infer_static_field(
        "string_primitive",
        &param.string_primitive,
        ValueType::String,
        type_of,
    )?;
    eval::infer_static_field("timestamp", &param.timestamp, ValueType::Timestamp, type_of)?;
    eval::infer_static_field("duration", &param.duration, ValueType::Duration, type_of)?;
    Ok(Type { value, dimensions })
}

/// Per-field programs compiled once at table-build time.
#[derive(Clone)]
pub struct Recipe {
    pub name: String,
    pub value: Arc<Program>,
    pub dimensions: BTreeMap<String, Arc<Program>>,
    pub int64_primitive: Arc<Program>,
    pub bool_primitive: Arc<Program>,
    pub double_primitive: Arc<Program>,
    pub string_primitive: Arc<Program>,
    pub timestamp: Arc<Program>,
    pub duration: Arc<Program>,
}

pub fn compile_fields(
    name: &str,
    param: &InstanceParam,
    compile: &eval::CompileFn<'_>,
) -> Result<Recipe, ExprError> {
    let mut dimensions = BTreeMap::new();
    for (key, expression) in &param.dimensions {
        dimensions.insert(key.clone(), compile(expression)?);
    }
    Ok(Recipe {
        name: name.to_string(),
        value: compile(&param.value)?,
        dimensions,
        int64_primitive: compile(&param.int64_primitive)?,
        bool_primitive: compile(&param.bool_primitive)?,
        double_primitive: compile(&param.double_primitive)?,
        string_primitive: compile(&param.string_primitive)?,
        timestamp: compile(&param.timestamp)?,
        duration: compile(&param.duration)?,
    })
}

pub fn materialize(
    recipe: &Recipe,
    bag: &AttributeBag,
    evaluator: &Evaluator,
) -> Result<Instance, ExprError> {
    let mut dimensions = BTreeMap::new();
    for (key, program) in &recipe.dimensions {
        dimensions.insert(key.clone(), eval::eval_value(evaluator, program, bag)?);
    }
    Ok(Instance {
        name: recipe.name.clone(),
        value: eval::eval_value(evaluator, &recipe.value, bag)?,
        dimensions,
        int64_primitive: eval::eval_int64(evaluator, &recipe.int64_primitive, bag)?,
        bool_primitive: eval::eval_bool(evaluator, &recipe.bool_primitive, bag)?,
        double_primitive: eval::eval_double(evaluator, &recipe.double_primitive, bag)?,
        string_primitive: eval::eval_string(evaluator, &recipe.string_primitive, bag)?,
        timestamp: eval::eval_timestamp(evaluator, &recipe.timestamp, bag)?,
        duration: eval::eval_duration(evaluator, &recipe.duration, bag)?,
    })
}
