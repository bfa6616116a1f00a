//! Quota template: dimensioned allocation requests. The dispatcher forwards
//! deduplication ids untouched; coalescing is the adapter's business.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use telemesh_attr::{AttributeBag, AttributeValue, ValueType};
use telemesh_expr::{Evaluator, ExprError, Program};

use crate::errors::InferError;
use crate::eval;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceParam {
    pub dimensions: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Type {
    pub dimensions: BTreeMap<String, ValueType>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub name: String,
    pub dimensions: BTreeMap<String, AttributeValue>,
}

pub fn infer_type(
    param: &InstanceParam,
    type_of: &eval::TypeEvalFn<'_>,
) -> Result<Type, InferError> {
    let mut dimensions = BTreeMap::new();
    for (key, expression) in &param.dimensions {
        let field = format!("dimensions[{key}]");
        dimensions.insert(key.clone(), eval::infer_field(&field, expression, type_of)?);
    }
    Ok(Type { dimensions })
}

#[derive(Clone)]
pub struct Recipe {
    pub name: String,
    pub dimensions: BTreeMap<String, Arc<Program>>,
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
        dimensions,
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
        dimensions,
    })
}
