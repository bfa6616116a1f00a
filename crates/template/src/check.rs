//! Check template: a precondition probe carrying an opaque expression value
//! plus a string map.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use telemesh_attr::{AttributeBag, ValueType};
use telemesh_expr::{Evaluator, ExprError, Program};

use crate::errors::InferError;
use crate::eval;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct InstanceParam {
    pub check_expression: String,
    pub string_map: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Type {
    pub string_map: BTreeMap<String, ValueType>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub name: String,
    pub check_expression: String,
    pub string_map: BTreeMap<String, String>,
}

pub fn infer_type(
    param: &InstanceParam,
    type_of: &eval::TypeEvalFn<'_>,
) -> Result<Type, InferError> {
    eval::infer_static_field(
        "check_expression",
        &param.check_expression,
        ValueType::String,
        type_of,
    )?;
    let mut string_map = BTreeMap::new();
    for (key, expression) in &param.string_map {
        let field = format!("string_map[{key}]");
        eval::infer_static_field(&field, expression, ValueType::String, type_of)?;
        string_map.insert(key.clone(), ValueType::String);
    }
    Ok(Type { string_map })
}

#[derive(Clone)]
pub struct Recipe {
    pub name: String,
    pub check_expression: Arc<Program>,
    pub string_map: BTreeMap<String, Arc<Program>>,
}

pub fn compile_fields(
    name: &str,
    param: &InstanceParam,
    compile: &eval::CompileFn<'_>,
) -> Result<Recipe, ExprError> {
    let mut string_map = BTreeMap::new();
    for (key, expression) in &param.string_map {
        string_map.insert(key.clone(), compile(expression)?);
    }
    Ok(Recipe {
        name: name.to_string(),
        check_expression: compile(&param.check_expression)?,
        string_map,
    })
}

pub fn materialize(
    recipe: &Recipe,
    bag: &AttributeBag,
    evaluator: &Evaluator,
) -> Result<Instance, ExprError> {
    let mut string_map = BTreeMap::new();
    for (key, program) in &recipe.string_map {
        string_map.insert(key.clone(), eval::eval_string(evaluator, program, bag)?);
    }
    Ok(Instance {
        name: recipe.name.clone(),
        check_expression: eval::eval_string(evaluator, &recipe.check_expression, bag)?,
        string_map,
    })
}
