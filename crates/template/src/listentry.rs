//! Listentry template: membership probes against list-shaped adapters
//! (whitelists, denials).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use telemesh_attr::{AttributeBag, ValueType};
use telemesh_expr::{Evaluator, ExprError, Program};

use crate::errors::InferError;
use crate::eval;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceParam {
    pub value: String,
}

/// Listentry has no dynamically typed fields; the type descriptor exists so
/// builders get a uniform `set_*_types` call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Type;

#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub name: String,
    pub value: String,
}

pub fn infer_type(
    param: &InstanceParam,
    type_of: &eval::TypeEvalFn<'_>,
) -> Result<Type, InferError> {
    eval::infer_static_field("value", &param.value, ValueType::String, type_of)?;
    Ok(Type)
}

#[derive(Clone)]
pub struct Recipe {
    pub name: String,
    pub value: Arc<Program>,
}

pub fn compile_fields(
    name: &str,
    param: &InstanceParam,
    compile: &eval::CompileFn<'_>,
) -> Result<Recipe, ExprError> {
    Ok(Recipe {
        name: name.to_string(),
        value: compile(&param.value)?,
    })
}

pub fn materialize(
    recipe: &Recipe,
    bag: &AttributeBag,
    evaluator: &Evaluator,
) -> Result<Instance, ExprError> {
    Ok(Instance {
        name: recipe.name.clone(),
        value: eval::eval_string(evaluator, &recipe.value, bag)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_must_be_string() {
        let param = InstanceParam {
            value: "source.int64".into(),
        };
        let int_types = |_: &str| Ok(ValueType::Int64);
        let err = infer_type(&param, &int_types).unwrap_err();
        assert!(matches!(err, InferError::TypeCheck { .. }));
    }
}
