//! Attribute-generator template: produces derived attributes merged into the
//! request bag during the preprocess phase.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use telemesh_attr::{AttributeBag, AttributeValue, ValueType};
use telemesh_expr::{Evaluator, ExprError, Program};

use crate::errors::InferError;
use crate::eval;

/// Output attribute name → source expression.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceParam {
    pub attributes: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Type {
    pub attributes: BTreeMap<String, ValueType>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub name: String,
    pub attributes: BTreeMap<String, AttributeValue>,
}

pub fn infer_type(
    param: &InstanceParam,
    type_of: &eval::TypeEvalFn<'_>,
) -> Result<Type, InferError> {
    let mut attributes = BTreeMap::new();
    for (name, expression) in &param.attributes {
        let field = format!("attributes[{name}]");
        attributes.insert(name.clone(), eval::infer_field(&field, expression, type_of)?);
    }
    Ok(Type { attributes })
}

#[derive(Clone)]
pub struct Recipe {
    pub name: String,
    pub attributes: BTreeMap<String, Arc<Program>>,
}

pub fn compile_fields(
    name: &str,
    param: &InstanceParam,
    compile: &eval::CompileFn<'_>,
) -> Result<Recipe, ExprError> {
    let mut attributes = BTreeMap::new();
    for (attribute, expression) in &param.attributes {
        attributes.insert(attribute.clone(), compile(expression)?);
    }
    Ok(Recipe {
        name: name.to_string(),
        attributes,
    })
}

pub fn materialize(
    recipe: &Recipe,
    bag: &AttributeBag,
    evaluator: &Evaluator,
) -> Result<Instance, ExprError> {
    let mut attributes = BTreeMap::new();
    for (name, program) in &recipe.attributes {
        attributes.insert(name.clone(), eval::eval_value(evaluator, program, bag)?);
    }
    Ok(Instance {
        name: recipe.name.clone(),
        attributes,
    })
}
